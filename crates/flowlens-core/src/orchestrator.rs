//! Runs analysis pipelines, at most one per entity at a time.
//!
//! The active-run registry and the progress map live behind a single lock that is
//! never held across an `.await`. A run's registry entry is removed by a drop
//! guard, so it disappears even when the run panics or its future is dropped.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, Semaphore};
use tracing::{error, info, warn};

use crate::cache::CacheMode;
use crate::config::BatchConfig;
use crate::endpoints::dataset;
use crate::entity::EntityKey;
use crate::events::{AnalysisEvent, AnalysisProgress, AnalysisStatus, EventBus, ProgressSink};
use crate::pipeline::{
    AnalysisPipeline, AnalysisReport, CancellationToken, PipelineOutcome, ProgressTracker,
    RunOptions, TOTAL_STEPS,
};
use crate::OrchestratorError;

/// How a started run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(Box<AnalysisReport>),
    Failed(String),
    Cancelled,
}

impl RunOutcome {
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

#[derive(Debug)]
struct ActiveRun {
    id: u64,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct RunState {
    active: HashMap<EntityKey, ActiveRun>,
    progress: HashMap<EntityKey, AnalysisProgress>,
}

#[derive(Debug, Default)]
struct SharedState {
    state: Mutex<RunState>,
}

impl SharedState {
    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Stores each progress snapshot and forwards it to the bus.
struct ProgressBoard {
    shared: Arc<SharedState>,
    events: EventBus,
}

impl ProgressSink for ProgressBoard {
    fn record(&self, entity: &EntityKey, progress: &AnalysisProgress) {
        self.shared
            .lock()
            .progress
            .insert(entity.clone(), progress.clone());
        self.events.record(entity, progress);
    }
}

/// Unregisters a run when dropped.
struct Registration {
    shared: Arc<SharedState>,
    entity: EntityKey,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if state
            .active
            .get(&self.entity)
            .is_some_and(|run| run.id == self.id)
        {
            state.active.remove(&self.entity);
        }
        if let Some(progress) = state.progress.get_mut(&self.entity) {
            if progress.status == AnalysisStatus::Running {
                progress.mark_failed("analysis aborted before reaching a terminal state");
            }
        }
    }
}

/// Cheaply cloneable; clones share the registry, progress map and pipeline.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    pipeline: Arc<AnalysisPipeline>,
    shared: Arc<SharedState>,
    next_run_id: Arc<AtomicU64>,
    refresh_limit: usize,
}

impl Orchestrator {
    pub fn new(pipeline: AnalysisPipeline, batch: &BatchConfig) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            shared: Arc::new(SharedState::default()),
            next_run_id: Arc::new(AtomicU64::new(0)),
            refresh_limit: batch.refresh_limit,
        }
    }

    pub fn pipeline(&self) -> &AnalysisPipeline {
        &self.pipeline
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AnalysisEvent> {
        self.pipeline.events().subscribe()
    }

    pub async fn start(&self, entity: &str) -> Result<RunOutcome, OrchestratorError> {
        self.start_with(entity, RunOptions::default()).await
    }

    /// Run the pipeline for `entity`, failing fast if a run is already registered.
    pub async fn start_with(
        &self,
        entity: &str,
        options: RunOptions,
    ) -> Result<RunOutcome, OrchestratorError> {
        let entity = EntityKey::parse(entity)?;
        let (registration, cancel) = self.register(&entity)?;

        let board: Arc<dyn ProgressSink> = Arc::new(ProgressBoard {
            shared: Arc::clone(&self.shared),
            events: self.pipeline.events().clone(),
        });
        let mut tracker = ProgressTracker::new(entity.clone(), TOTAL_STEPS, board);
        tracker.update(AnalysisProgress::mark_running);
        info!(entity = %entity, force_refresh = options.force_refresh, "analysis started");

        let result = self
            .pipeline
            .run(&entity, options, &cancel, &mut tracker)
            .await;
        drop(registration);

        let outcome = match result {
            Ok(PipelineOutcome::Completed(report)) => {
                info!(entity = %entity, "analysis completed");
                RunOutcome::Completed(report)
            }
            Ok(PipelineOutcome::Cancelled) => RunOutcome::Cancelled,
            Err(failure) => {
                let message = failure.to_string();
                self.pipeline.events().publish(AnalysisEvent::Failed {
                    entity: entity.clone(),
                    message: message.clone(),
                });
                RunOutcome::Failed(message)
            }
        };
        Ok(outcome)
    }

    fn register(
        &self,
        entity: &EntityKey,
    ) -> Result<(Registration, CancellationToken), OrchestratorError> {
        let id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();

        let mut state = self.shared.lock();
        if state.active.contains_key(entity) {
            warn!(entity = %entity, "analysis already running");
            return Err(OrchestratorError::AlreadyRunning(entity.to_string()));
        }
        state.active.insert(
            entity.clone(),
            ActiveRun {
                id,
                cancel: cancel.clone(),
            },
        );
        state
            .progress
            .insert(entity.clone(), AnalysisProgress::new(TOTAL_STEPS));
        drop(state);

        let registration = Registration {
            shared: Arc::clone(&self.shared),
            entity: entity.clone(),
            id,
        };
        Ok((registration, cancel))
    }

    /// Signal cancellation to a registered run. Returns `false` for unknown keys.
    pub fn cancel(&self, entity: &str) -> bool {
        let Ok(entity) = EntityKey::parse(entity) else {
            return false;
        };
        let state = self.shared.lock();
        match state.active.get(&entity) {
            Some(run) => {
                run.cancel.cancel();
                info!(entity = %entity, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Cancel every registered run, returning how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let state = self.shared.lock();
        for run in state.active.values() {
            run.cancel.cancel();
        }
        let count = state.active.len();
        if count > 0 {
            info!(count, "cancelled all active analyses");
        }
        count
    }

    pub fn active_runs(&self) -> Vec<EntityKey> {
        let mut keys: Vec<EntityKey> = self.shared.lock().active.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn progress(&self, entity: &str) -> Option<AnalysisProgress> {
        let entity = EntityKey::parse(entity).ok()?;
        self.shared.lock().progress.get(&entity).cloned()
    }

    /// Start every key with at most `max_concurrent` runs executing at once.
    ///
    /// Keys are normalized and deduplicated; invalid keys and every kind of
    /// failure are reported as `false` in the returned map.
    pub async fn run_batch<S: AsRef<str>>(
        &self,
        keys: &[S],
        max_concurrent: usize,
    ) -> BTreeMap<String, bool> {
        self.run_batch_with(keys, max_concurrent, RunOptions::default())
            .await
    }

    pub async fn run_batch_with<S: AsRef<str>>(
        &self,
        keys: &[S],
        max_concurrent: usize,
        options: RunOptions,
    ) -> BTreeMap<String, bool> {
        let gate = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let mut results = BTreeMap::new();
        let mut tasks = Vec::new();

        for raw in keys {
            let raw = raw.as_ref();
            let entity = match EntityKey::parse(raw) {
                Ok(entity) => entity,
                Err(invalid) => {
                    warn!(key = raw, error = %invalid, "skipping invalid key in batch");
                    results.insert(raw.trim().to_ascii_uppercase(), false);
                    continue;
                }
            };
            if results.contains_key(entity.as_str()) {
                continue;
            }
            results.insert(entity.to_string(), false);

            let orchestrator = self.clone();
            let gate = Arc::clone(&gate);
            let key = entity.clone();
            let task = tokio::spawn(async move {
                let Ok(_permit) = gate.acquire_owned().await else {
                    return false;
                };
                match orchestrator.start_with(key.as_str(), options).await {
                    Ok(outcome) => outcome.is_success(),
                    Err(rejected) => {
                        warn!(entity = %key, error = %rejected, "batch entry rejected");
                        false
                    }
                }
            });
            tasks.push((entity, task));
        }

        for (entity, task) in tasks {
            let succeeded = match task.await {
                Ok(succeeded) => succeeded,
                Err(join_error) => {
                    error!(entity = %entity, error = %join_error, "batch task failed");
                    false
                }
            };
            results.insert(entity.to_string(), succeeded);
        }

        let succeeded = results.values().filter(|ok| **ok).count();
        info!(total = results.len(), succeeded, "batch completed");
        self.pipeline.events().publish(AnalysisEvent::BatchCompleted {
            total: results.len(),
            succeeded,
        });
        results
    }

    /// Refresh stock info for up to the configured number of keys and persist it.
    pub async fn refresh_snapshots<S: AsRef<str>>(&self, keys: &[S]) -> BTreeMap<String, bool> {
        let mut tickers: Vec<String> = Vec::new();
        for raw in keys {
            match EntityKey::parse(raw.as_ref()) {
                Ok(entity) if !tickers.iter().any(|t| t == entity.as_str()) => {
                    tickers.push(entity.into());
                }
                Ok(_) => {}
                Err(invalid) => {
                    warn!(key = raw.as_ref(), error = %invalid, "skipping invalid key in refresh");
                }
            }
        }
        tickers.truncate(self.refresh_limit);

        let fetched = self
            .pipeline
            .client()
            .multiple_stock_data(&tickers, CacheMode::Use)
            .await;

        let mut results = BTreeMap::new();
        for ticker in tickers {
            let stored = match fetched.get(&ticker) {
                Some(result) if result.is_success() => {
                    self.store_snapshot(&ticker, result.payload()).await
                }
                Some(result) => {
                    warn!(
                        entity = %ticker,
                        code = result.error_kind().map(|kind| kind.code()),
                        "snapshot refresh failed"
                    );
                    false
                }
                None => false,
            };
            results.insert(ticker, stored);
        }
        results
    }

    async fn store_snapshot(&self, ticker: &str, payload: Option<&serde_json::Value>) -> bool {
        let (Ok(entity), Some(payload)) = (EntityKey::parse(ticker), payload) else {
            return false;
        };
        let stored = self
            .pipeline
            .sink()
            .upsert(&entity, dataset::STOCK_INFO, payload)
            .await;
        if !stored {
            warn!(entity = %entity, "failed to persist snapshot");
        }
        stored
    }
}
