use std::collections::BTreeMap;
use std::sync::Arc;

use flowlens_core::{
    dataset, AnalysisPipeline, ApiClient, ClientConfig, EventBus, MemorySink, Orchestrator,
};
use serde_json::{json, Value};

use crate::cli::RefreshArgs;
use crate::error::CliError;

use super::{CommandResult, EVENT_CAPACITY};

pub async fn run(
    args: &RefreshArgs,
    client: ApiClient,
    config: &ClientConfig,
) -> Result<CommandResult, CliError> {
    let sink = Arc::new(MemorySink::new());
    let pipeline = AnalysisPipeline::new(client, sink.clone(), EventBus::new(EVENT_CAPACITY));
    let orchestrator = Orchestrator::new(pipeline, &config.batch);

    let outcomes = orchestrator.refresh_snapshots(&args.tickers).await;

    let snapshots: BTreeMap<&str, Value> = outcomes
        .keys()
        .filter_map(|ticker| {
            sink.get(ticker, dataset::STOCK_INFO)
                .map(|payload| (ticker.as_str(), payload))
        })
        .collect();
    let failures = outcomes.values().filter(|ok| !**ok).count();

    Ok(CommandResult::new(
        json!({
            "outcomes": outcomes,
            "snapshots": snapshots,
        }),
        failures,
    ))
}
