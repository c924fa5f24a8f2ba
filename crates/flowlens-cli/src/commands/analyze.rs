use std::collections::BTreeMap;
use std::sync::Arc;

use flowlens_core::{
    AnalysisEvent, AnalysisPipeline, AnalysisReport, ApiClient, ClientConfig, EventBus,
    MemorySink, Orchestrator, RunOptions, RunOutcome,
};
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use crate::cli::AnalyzeArgs;
use crate::error::CliError;

use super::{CommandResult, EVENT_CAPACITY};

pub async fn run(
    args: &AnalyzeArgs,
    client: ApiClient,
    config: &ClientConfig,
) -> Result<CommandResult, CliError> {
    let pipeline = AnalysisPipeline::new(
        client,
        Arc::new(MemorySink::new()),
        EventBus::new(EVENT_CAPACITY),
    );
    let orchestrator = Orchestrator::new(pipeline, &config.batch);
    let listener = tokio::spawn(follow(orchestrator.subscribe()));
    let options = RunOptions {
        force_refresh: args.force_refresh,
    };

    if let [ticker] = args.tickers.as_slice() {
        let outcome = orchestrator.start_with(ticker, options).await;
        listener.abort();
        return single_result(outcome?);
    }

    let max_concurrent = args.max_concurrent.unwrap_or(config.batch.max_concurrent);
    let outcomes = orchestrator
        .run_batch_with(&args.tickers, max_concurrent, options)
        .await;
    let reports = listener.await.unwrap_or_default();
    let failures = outcomes.values().filter(|ok| !**ok).count();

    Ok(CommandResult::new(
        json!({
            "outcomes": outcomes,
            "reports": reports,
        }),
        failures,
    ))
}

fn single_result(outcome: RunOutcome) -> Result<CommandResult, CliError> {
    let data = match outcome {
        RunOutcome::Completed(report) => json!({
            "status": "completed",
            "report": serde_json::to_value(&report)?,
        }),
        RunOutcome::Failed(message) => json!({
            "status": "failed",
            "error": message,
        }),
        RunOutcome::Cancelled => json!({ "status": "cancelled" }),
    };
    let failures = usize::from(data["status"] != "completed");
    Ok(CommandResult::new(data, failures))
}

/// Log progress to stderr and collect published reports until the batch ends.
async fn follow(
    mut receiver: broadcast::Receiver<AnalysisEvent>,
) -> BTreeMap<String, AnalysisReport> {
    let mut reports = BTreeMap::new();
    loop {
        match receiver.recv().await {
            Ok(AnalysisEvent::Progress { entity, progress }) => {
                info!(
                    entity = %entity,
                    step = %progress.current_step,
                    percent = progress.progress_percent,
                    "progress"
                );
            }
            Ok(AnalysisEvent::Result { entity, report }) => {
                reports.insert(entity.to_string(), *report);
            }
            Ok(AnalysisEvent::Failed { entity, message }) => {
                warn!(entity = %entity, %message, "analysis failed");
            }
            Ok(AnalysisEvent::BatchCompleted { total, succeeded }) => {
                info!(total, succeeded, "batch finished");
                break;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "event listener fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
    reports
}
