//! Per-entity analysis pipeline.
//!
//! A run executes a fixed list of fetch steps followed by the derived-analysis
//! and publish steps. Cancellation is polled before each step; a step that has
//! started always runs to completion.
//!
//! | # | Step | Dataset | Failure |
//! |---|------|---------|---------|
//! | 1 | Fetching stock information | `stock_info` | aborts the run |
//! | 2 | Fetching earnings data | `earnings_data` | recorded, run continues |
//! | 3 | Fetching options flow | `options_flow` | recorded, run continues |
//! | 4 | Fetching insider trades | `insider_trades` | recorded, run continues |
//! | 5 | Performing analysis | `analysis_results` | n/a |
//! | 6 | Saving results | n/a | sink failures are logged |

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::api_client::{ApiClient, ApiResult};
use crate::cache::CacheMode;
use crate::endpoints::{
    dataset, earnings_calendar_request, insider_trades_request, options_flow_request,
    stock_info_request, DEFAULT_EARNINGS_LIMIT, DEFAULT_INSIDER_LIMIT, DEFAULT_OPTIONS_FLOW_LIMIT,
};
use crate::entity::EntityKey;
use crate::events::{AnalysisEvent, AnalysisProgress, EventBus, ProgressSink};
use crate::sink::PersistenceSink;
use crate::PipelineError;

pub const ANALYSIS_STEP: &str = "Performing analysis";
pub const PUBLISH_STEP: &str = "Saving results";

pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = ApiResult> + Send + 'a>>;
pub type FetchFn = for<'a> fn(&'a ApiClient, &'a EntityKey, CacheMode) -> FetchFuture<'a>;

/// One upstream fetch in the pipeline.
#[derive(Clone, Copy)]
pub struct FetchStep {
    pub label: &'static str,
    pub dataset: &'static str,
    pub mandatory: bool,
    pub fetch: FetchFn,
}

impl Debug for FetchStep {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchStep")
            .field("label", &self.label)
            .field("dataset", &self.dataset)
            .field("mandatory", &self.mandatory)
            .finish_non_exhaustive()
    }
}

pub const FETCH_STEPS: [FetchStep; 4] = [
    FetchStep {
        label: "Fetching stock information",
        dataset: dataset::STOCK_INFO,
        mandatory: true,
        fetch: fetch_stock_info,
    },
    FetchStep {
        label: "Fetching earnings data",
        dataset: dataset::EARNINGS,
        mandatory: false,
        fetch: fetch_earnings,
    },
    FetchStep {
        label: "Fetching options flow",
        dataset: dataset::OPTIONS_FLOW,
        mandatory: false,
        fetch: fetch_options_flow,
    },
    FetchStep {
        label: "Fetching insider trades",
        dataset: dataset::INSIDER_TRADES,
        mandatory: false,
        fetch: fetch_insider_trades,
    },
];

/// Fetch steps plus analysis and publish.
pub const TOTAL_STEPS: usize = FETCH_STEPS.len() + 2;

fn fetch_stock_info<'a>(
    client: &'a ApiClient,
    entity: &'a EntityKey,
    mode: CacheMode,
) -> FetchFuture<'a> {
    Box::pin(client.request(stock_info_request(entity.as_str()).with_cache_mode(mode)))
}

fn fetch_earnings<'a>(
    client: &'a ApiClient,
    _entity: &'a EntityKey,
    mode: CacheMode,
) -> FetchFuture<'a> {
    Box::pin(client.request(earnings_calendar_request(None, DEFAULT_EARNINGS_LIMIT).with_cache_mode(mode)))
}

fn fetch_options_flow<'a>(
    client: &'a ApiClient,
    entity: &'a EntityKey,
    mode: CacheMode,
) -> FetchFuture<'a> {
    Box::pin(client.request(
        options_flow_request(entity.as_str(), None, DEFAULT_OPTIONS_FLOW_LIMIT).with_cache_mode(mode),
    ))
}

fn fetch_insider_trades<'a>(
    client: &'a ApiClient,
    entity: &'a EntityKey,
    mode: CacheMode,
) -> FetchFuture<'a> {
    Box::pin(client.request(
        insider_trades_request(entity.as_str(), DEFAULT_INSIDER_LIMIT).with_cache_mode(mode),
    ))
}

/// Per-run switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Skip cached reads and store the fresh responses.
    pub force_refresh: bool,
}

impl RunOptions {
    pub const fn cache_mode(self) -> CacheMode {
        if self.force_refresh {
            CacheMode::Refresh
        } else {
            CacheMode::Use
        }
    }
}

/// Cooperative cancellation flag shared between the orchestrator and one run.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when this call flipped the flag.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Owns the progress record of one run and reports every change.
pub struct ProgressTracker {
    entity: EntityKey,
    progress: AnalysisProgress,
    sink: Arc<dyn ProgressSink>,
}

impl ProgressTracker {
    pub fn new(entity: EntityKey, total_steps: usize, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            entity,
            progress: AnalysisProgress::new(total_steps),
            sink,
        }
    }

    pub fn entity(&self) -> &EntityKey {
        &self.entity
    }

    pub fn snapshot(&self) -> &AnalysisProgress {
        &self.progress
    }

    pub fn update(&mut self, change: impl FnOnce(&mut AnalysisProgress)) {
        change(&mut self.progress);
        self.sink.record(&self.entity, &self.progress);
    }
}

/// Computes the derived analysis from the gathered datasets.
pub trait Analyzer: Send + Sync {
    fn analyze(&self, entity: &EntityKey, datasets: &BTreeMap<String, Option<Value>>) -> Value;
}

/// Reports which datasets are present and how many records each holds.
#[derive(Debug, Default, Clone, Copy)]
pub struct DatasetSummaryAnalyzer;

impl Analyzer for DatasetSummaryAnalyzer {
    fn analyze(&self, entity: &EntityKey, datasets: &BTreeMap<String, Option<Value>>) -> Value {
        let mut present = Vec::new();
        let mut missing = Vec::new();
        let mut record_counts = serde_json::Map::new();

        for (name, payload) in datasets {
            match payload {
                Some(payload) => {
                    present.push(name.clone());
                    if let Some(count) = record_count(payload) {
                        record_counts.insert(name.clone(), json!(count));
                    }
                }
                None => missing.push(name.clone()),
            }
        }

        json!({
            "entity": entity.as_str(),
            "datasets_present": present,
            "datasets_missing": missing,
            "record_counts": record_counts,
        })
    }
}

fn record_count(payload: &Value) -> Option<usize> {
    match payload {
        Value::Array(items) => Some(items.len()),
        Value::Object(map) => map.get("data").and_then(Value::as_array).map(Vec::len),
        _ => None,
    }
}

/// Aggregate of one completed run. Absent datasets are kept as `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub entity: EntityKey,
    pub datasets: BTreeMap<String, Option<Value>>,
    /// Optional steps that failed, by dataset name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub step_errors: BTreeMap<String, String>,
    pub analysis: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Completed(Box<AnalysisReport>),
    Cancelled,
}

pub struct AnalysisPipeline {
    client: ApiClient,
    sink: Arc<dyn PersistenceSink>,
    analyzer: Arc<dyn Analyzer>,
    events: EventBus,
}

impl Debug for AnalysisPipeline {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalysisPipeline")
            .field("client", &self.client)
            .field("steps", &TOTAL_STEPS)
            .finish_non_exhaustive()
    }
}

impl AnalysisPipeline {
    pub fn new(client: ApiClient, sink: Arc<dyn PersistenceSink>, events: EventBus) -> Self {
        Self {
            client,
            sink,
            analyzer: Arc::new(DatasetSummaryAnalyzer),
            events,
        }
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn sink(&self) -> &Arc<dyn PersistenceSink> {
        &self.sink
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Drive one run to a terminal status, which is recorded on `tracker`.
    pub async fn run(
        &self,
        entity: &EntityKey,
        options: RunOptions,
        cancel: &CancellationToken,
        tracker: &mut ProgressTracker,
    ) -> Result<PipelineOutcome, PipelineError> {
        let outcome = self.execute(entity, options, cancel, tracker).await;
        match &outcome {
            Ok(PipelineOutcome::Completed(_)) => tracker.update(AnalysisProgress::mark_completed),
            Ok(PipelineOutcome::Cancelled) => {
                info!(entity = %entity, "analysis cancelled");
                tracker.update(AnalysisProgress::mark_cancelled);
            }
            Err(error) => {
                warn!(entity = %entity, error = %error, "analysis failed");
                let message = error.to_string();
                tracker.update(|progress| progress.mark_failed(message));
            }
        }
        outcome
    }

    async fn execute(
        &self,
        entity: &EntityKey,
        options: RunOptions,
        cancel: &CancellationToken,
        tracker: &mut ProgressTracker,
    ) -> Result<PipelineOutcome, PipelineError> {
        let mode = options.cache_mode();
        let mut datasets: BTreeMap<String, Option<Value>> = BTreeMap::new();
        let mut step_errors = BTreeMap::new();

        for step in &FETCH_STEPS {
            if cancel.is_cancelled() {
                return Ok(PipelineOutcome::Cancelled);
            }
            tracker.update(|progress| progress.begin_step(step.label));

            let result = (step.fetch)(&self.client, entity, mode).await;
            if result.is_success() {
                debug!(entity = %entity, dataset = step.dataset, cached = result.is_cached(), "step fetched");
                datasets.insert(step.dataset.to_owned(), result.into_payload());
            } else {
                let message = result
                    .error_message()
                    .unwrap_or("unknown failure")
                    .to_owned();
                if step.mandatory {
                    return Err(PipelineError::MandatoryStep {
                        step: step.dataset,
                        message,
                    });
                }
                warn!(
                    entity = %entity,
                    dataset = step.dataset,
                    code = result.error_kind().map(|kind| kind.code()),
                    %message,
                    "optional step failed"
                );
                datasets.insert(step.dataset.to_owned(), None);
                step_errors.insert(step.dataset.to_owned(), message);
            }

            tracker.update(|progress| progress.complete_step(step.label));
        }

        if cancel.is_cancelled() {
            return Ok(PipelineOutcome::Cancelled);
        }
        tracker.update(|progress| progress.begin_step(ANALYSIS_STEP));
        let analysis = self.analyzer.analyze(entity, &datasets);
        tracker.update(|progress| progress.complete_step(ANALYSIS_STEP));

        if cancel.is_cancelled() {
            return Ok(PipelineOutcome::Cancelled);
        }
        tracker.update(|progress| progress.begin_step(PUBLISH_STEP));
        let report = AnalysisReport {
            entity: entity.clone(),
            datasets,
            step_errors,
            analysis,
        };
        self.persist(&report).await;
        self.events.publish(AnalysisEvent::Result {
            entity: entity.clone(),
            report: Box::new(report.clone()),
        });
        tracker.update(|progress| progress.complete_step(PUBLISH_STEP));

        Ok(PipelineOutcome::Completed(Box::new(report)))
    }

    async fn persist(&self, report: &AnalysisReport) {
        let present = report
            .datasets
            .iter()
            .filter_map(|(name, payload)| payload.as_ref().map(|payload| (name.as_str(), payload)));
        let writes = present.chain(std::iter::once((dataset::ANALYSIS, &report.analysis)));

        for (name, payload) in writes {
            if !self.sink.upsert(&report.entity, name, payload).await {
                warn!(entity = %report.entity, dataset = name, "failed to persist dataset");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::config::ClientConfig;
    use crate::credentials::NoCredentials;
    use crate::events::AnalysisStatus;
    use crate::http_client::{HttpError, HttpResponse, ScriptedHttpClient};
    use crate::events::AnalysisEvent;
    use crate::sink::{MemorySink, PersistenceSink, SinkFuture};

    /// Rejects every write and counts the attempts.
    #[derive(Default)]
    struct RejectingSink {
        attempts: Mutex<usize>,
    }

    impl PersistenceSink for RejectingSink {
        fn upsert<'a>(
            &'a self,
            _entity: &'a EntityKey,
            _dataset: &'a str,
            _payload: &'a Value,
        ) -> SinkFuture<'a> {
            *self.attempts.lock().expect("lock") += 1;
            Box::pin(async { false })
        }
    }

    #[derive(Default)]
    struct RecordingProgress {
        seen: Mutex<Vec<AnalysisProgress>>,
    }

    impl ProgressSink for RecordingProgress {
        fn record(&self, _entity: &EntityKey, progress: &AnalysisProgress) {
            self.seen.lock().expect("lock").push(progress.clone());
        }
    }

    fn client(http: Arc<ScriptedHttpClient>) -> ApiClient {
        let mut config = ClientConfig::default();
        config.api.rate_limit_per_second = 0.0;
        ApiClient::builder(config)
            .http_client(http)
            .credentials(Arc::new(NoCredentials))
            .build()
            .expect("client")
    }

    fn key(raw: &str) -> EntityKey {
        EntityKey::parse(raw).expect("valid key")
    }

    #[test]
    fn summary_counts_arrays_and_data_arrays() {
        let mut datasets = BTreeMap::new();
        datasets.insert(String::from("stock_info"), Some(json!({"name": "Apple"})));
        datasets.insert(String::from("options_flow"), Some(json!([1, 2, 3])));
        datasets.insert(String::from("insider_trades"), Some(json!({"data": [1]})));
        datasets.insert(String::from("earnings_data"), None);

        let summary = DatasetSummaryAnalyzer.analyze(&key("AAPL"), &datasets);

        assert_eq!(summary["datasets_missing"], json!(["earnings_data"]));
        assert_eq!(summary["record_counts"]["options_flow"], 3);
        assert_eq!(summary["record_counts"]["insider_trades"], 1);
        assert!(summary["record_counts"].get("stock_info").is_none());
    }

    #[test]
    fn cancellation_token_reports_first_cancel_only() {
        let token = CancellationToken::new();
        let shared = token.clone();
        assert!(!token.is_cancelled());
        assert!(shared.cancel());
        assert!(!token.cancel());
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn optional_failure_is_recorded_and_run_completes() {
        let http = Arc::new(
            ScriptedHttpClient::new()
                .with_rule("/info", Ok(HttpResponse::ok_json(r#"{"ticker":"AAPL"}"#)))
                .with_rule("/options-flow", Err(HttpError::connect("reset")))
                .with_rule("/earnings", Ok(HttpResponse::ok_json("[]")))
                .with_rule("/insider", Ok(HttpResponse::ok_json(r#"{"data":[{},{}]}"#))),
        );
        let sink = Arc::new(MemorySink::new());
        let pipeline = AnalysisPipeline::new(client(http), sink.clone(), EventBus::new(64));
        let recorder = Arc::new(RecordingProgress::default());
        let entity = key("AAPL");
        let mut tracker = ProgressTracker::new(entity.clone(), TOTAL_STEPS, recorder.clone());

        let outcome = pipeline
            .run(&entity, RunOptions::default(), &CancellationToken::new(), &mut tracker)
            .await
            .expect("optional failures do not fail the run");

        let PipelineOutcome::Completed(report) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(report.datasets.get("options_flow"), Some(&None));
        assert!(report.step_errors.contains_key("options_flow"));
        assert_eq!(tracker.snapshot().status, AnalysisStatus::Completed);
        assert_eq!(tracker.snapshot().completed_steps, TOTAL_STEPS);
        assert!(sink.get("AAPL", "stock_info").is_some());
        assert!(sink.get("AAPL", "options_flow").is_none());
        assert!(sink.get("AAPL", "analysis_results").is_some());

        let seen = recorder.seen.lock().expect("lock");
        let counts: Vec<usize> = seen.iter().map(|p| p.completed_steps).collect();
        assert!(counts.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[tokio::test]
    async fn rejected_sink_writes_do_not_fail_the_run() {
        let http = Arc::new(
            ScriptedHttpClient::new().with_rule("/", Ok(HttpResponse::ok_json(r#"{"data":[]}"#))),
        );
        let sink = Arc::new(RejectingSink::default());
        let pipeline = AnalysisPipeline::new(client(http), sink.clone(), EventBus::new(64));
        let mut events = pipeline.events().subscribe();
        let entity = key("MSFT");
        let mut tracker = ProgressTracker::new(entity.clone(), TOTAL_STEPS, Arc::new(EventBus::new(8)));

        let outcome = pipeline
            .run(&entity, RunOptions::default(), &CancellationToken::new(), &mut tracker)
            .await
            .expect("sink failures are logged, not raised");

        assert!(matches!(outcome, PipelineOutcome::Completed(_)));
        assert_eq!(tracker.snapshot().status, AnalysisStatus::Completed);
        assert_eq!(tracker.snapshot().completed_steps, TOTAL_STEPS);
        // four datasets plus the analysis summary
        assert_eq!(*sink.attempts.lock().expect("lock"), 5);
        assert!(matches!(
            events.try_recv(),
            Ok(AnalysisEvent::Result { entity, .. }) if entity.as_str() == "MSFT"
        ));
    }

    #[tokio::test]
    async fn mandatory_failure_aborts_before_optional_steps() {
        let http = Arc::new(
            ScriptedHttpClient::new().with_rule("/info", Ok(HttpResponse::new(404, "unknown ticker"))),
        );
        let pipeline =
            AnalysisPipeline::new(client(Arc::clone(&http)), Arc::new(MemorySink::new()), EventBus::new(8));
        let entity = key("ZZZZ");
        let mut tracker = ProgressTracker::new(entity.clone(), TOTAL_STEPS, Arc::new(EventBus::new(8)));

        let error = pipeline
            .run(&entity, RunOptions::default(), &CancellationToken::new(), &mut tracker)
            .await
            .expect_err("stock info is mandatory");

        assert!(matches!(error, PipelineError::MandatoryStep { step: "stock_info", .. }));
        assert_eq!(http.dispatch_count(), 1);
        assert_eq!(tracker.snapshot().status, AnalysisStatus::Error);
        assert!(tracker
            .snapshot()
            .error_message
            .as_deref()
            .is_some_and(|message| message.contains("unknown ticker")));
    }

    #[tokio::test]
    async fn pre_cancelled_run_dispatches_nothing() {
        let http = Arc::new(ScriptedHttpClient::new());
        let pipeline =
            AnalysisPipeline::new(client(Arc::clone(&http)), Arc::new(MemorySink::new()), EventBus::new(8));
        let entity = key("MSFT");
        let mut tracker = ProgressTracker::new(entity.clone(), TOTAL_STEPS, Arc::new(EventBus::new(8)));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = pipeline
            .run(&entity, RunOptions::default(), &cancel, &mut tracker)
            .await
            .expect("cancellation is not an error");

        assert_eq!(outcome, PipelineOutcome::Cancelled);
        assert_eq!(http.dispatch_count(), 0);
        assert_eq!(tracker.snapshot().status, AnalysisStatus::Cancelled);
    }

    #[tokio::test]
    async fn force_refresh_skips_cached_reads() {
        let http = Arc::new(ScriptedHttpClient::new());
        let pipeline =
            AnalysisPipeline::new(client(Arc::clone(&http)), Arc::new(MemorySink::new()), EventBus::new(64));
        let entity = key("NVDA");

        for options in [RunOptions::default(), RunOptions::default(), RunOptions { force_refresh: true }] {
            let mut tracker = ProgressTracker::new(entity.clone(), TOTAL_STEPS, Arc::new(EventBus::new(8)));
            pipeline
                .run(&entity, options, &CancellationToken::new(), &mut tracker)
                .await
                .expect("run");
        }

        let fetches = FETCH_STEPS.len();
        assert_eq!(http.dispatch_count(), fetches * 2, "second run is served from cache");
    }
}
