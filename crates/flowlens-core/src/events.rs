//! Progress records and the publish/subscribe bus consumers listen on.
//!
//! | Event | Description |
//! |-------|-------------|
//! | `progress` | A pipeline changed its [`AnalysisProgress`] |
//! | `result` | A pipeline published its final report |
//! | `failed` | A pipeline ended on a mandatory-step failure |
//! | `batch_completed` | A batch run finished |
//!
//! Delivery is fire-and-forget: publishing never blocks and lagging subscribers
//! miss events instead of slowing producers down.

use serde::{Serialize, Serializer};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::broadcast;

use crate::entity::EntityKey;
use crate::pipeline::AnalysisReport;

/// Lifecycle of one analysis run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Idle,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl AnalysisStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }
}

/// Progress of one run for one entity. A new record replaces the old one on every run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisProgress {
    pub status: AnalysisStatus,
    pub current_step: String,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub progress_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(serialize_with = "serialize_rfc3339")]
    pub started_at: OffsetDateTime,
}

impl AnalysisProgress {
    pub fn new(total_steps: usize) -> Self {
        Self {
            status: AnalysisStatus::Idle,
            current_step: String::from("Idle"),
            completed_steps: 0,
            total_steps,
            progress_percent: 0.0,
            error_message: None,
            started_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn mark_running(&mut self) {
        self.status = AnalysisStatus::Running;
        self.current_step = String::from("Initializing analysis");
    }

    pub fn begin_step(&mut self, name: &str) {
        self.current_step = name.to_owned();
    }

    pub fn complete_step(&mut self, name: &str) {
        self.completed_steps = (self.completed_steps + 1).min(self.total_steps);
        self.current_step = name.to_owned();
        self.progress_percent = percent(self.completed_steps, self.total_steps);
    }

    pub fn mark_completed(&mut self) {
        self.status = AnalysisStatus::Completed;
        self.current_step = String::from("Analysis completed");
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.status = AnalysisStatus::Error;
        self.current_step = String::from("Analysis failed");
        self.error_message = Some(message.into());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = AnalysisStatus::Cancelled;
        self.current_step = String::from("Analysis cancelled");
    }
}

fn percent(completed: usize, total: usize) -> f64 {
    if total == 0 {
        return 100.0;
    }
    completed as f64 / total as f64 * 100.0
}

fn serialize_rfc3339<S: Serializer>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
    let formatted = value
        .format(&Rfc3339)
        .map_err(serde::ser::Error::custom)?;
    serializer.serialize_str(&formatted)
}

/// Everything the core announces to its consumers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnalysisEvent {
    Progress {
        entity: EntityKey,
        progress: AnalysisProgress,
    },
    Result {
        entity: EntityKey,
        report: Box<AnalysisReport>,
    },
    Failed {
        entity: EntityKey,
        message: String,
    },
    BatchCompleted {
        total: usize,
        succeeded: usize,
    },
}

/// Broadcast bus fanning events out to every subscriber.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AnalysisEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AnalysisEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: AnalysisEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}

/// Receives every progress change a pipeline makes.
pub trait ProgressSink: Send + Sync {
    fn record(&self, entity: &EntityKey, progress: &AnalysisProgress);
}

impl ProgressSink for EventBus {
    fn record(&self, entity: &EntityKey, progress: &AnalysisProgress) {
        self.publish(AnalysisEvent::Progress {
            entity: entity.clone(),
            progress: progress.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_tracks_completed_over_total() {
        let mut progress = AnalysisProgress::new(6);
        assert_eq!(progress.status, AnalysisStatus::Idle);

        progress.mark_running();
        progress.complete_step("one");
        progress.complete_step("two");
        progress.complete_step("three");

        assert_eq!(progress.completed_steps, 3);
        assert_eq!(progress.current_step, "three");
        assert!((progress.progress_percent - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn completed_steps_never_exceed_total() {
        let mut progress = AnalysisProgress::new(1);
        progress.complete_step("a");
        progress.complete_step("b");
        assert_eq!(progress.completed_steps, 1);
        assert!((progress.progress_percent - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn failure_keeps_message_and_terminal_status() {
        let mut progress = AnalysisProgress::new(6);
        progress.mark_running();
        progress.mark_failed("stock info unavailable");

        assert!(progress.status.is_terminal());
        assert_eq!(progress.error_message.as_deref(), Some("stock info unavailable"));
    }

    #[test]
    fn progress_serializes_with_rfc3339_start_time() {
        let progress = AnalysisProgress::new(6);
        let json = serde_json::to_value(&progress).expect("serializable");
        assert_eq!(json["status"], "idle");
        assert!(json["started_at"].as_str().is_some_and(|ts| ts.contains('T')));
        assert!(json.get("error_message").is_none());
    }

    #[tokio::test]
    async fn subscribers_receive_published_progress() {
        let bus = EventBus::new(8);
        let mut receiver = bus.subscribe();
        let entity = EntityKey::parse("AAPL").expect("valid");

        bus.record(&entity, &AnalysisProgress::new(6));

        match receiver.recv().await.expect("event") {
            AnalysisEvent::Progress { entity: got, progress } => {
                assert_eq!(got, entity);
                assert_eq!(progress.total_steps, 6);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        let bus = EventBus::new(1);
        bus.publish(AnalysisEvent::BatchCompleted {
            total: 0,
            succeeded: 0,
        });
    }
}
