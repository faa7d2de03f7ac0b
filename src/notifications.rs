use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{PipelineStep, RunCounters, RunStatus};

/// Something subscribers may want to know about a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    StageCompleted {
        run_id: Uuid,
        step: PipelineStep,
        counters: RunCounters,
    },
    RunFinalized {
        run_id: Uuid,
        status: RunStatus,
        counters: RunCounters,
        error_message: Option<String>,
    },
    WatchdogAction {
        run_id: Uuid,
        action: String,
        reason: String,
    },
}

impl PipelineEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            PipelineEvent::StageCompleted { run_id, .. }
            | PipelineEvent::RunFinalized { run_id, .. }
            | PipelineEvent::WatchdogAction { run_id, .. } => *run_id,
        }
    }
}

/// Fire-and-forget fan-out of pipeline events.
///
/// Publishing never fails or blocks: with no subscribers the event is dropped,
/// and slow subscribers lose the oldest events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: PipelineEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("No event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Logs every event; spawned by the server so notifications are visible
/// without an external consumer.
pub async fn log_events(mut receiver: broadcast::Receiver<PipelineEvent>) {
    loop {
        match receiver.recv().await {
            Ok(PipelineEvent::RunFinalized {
                run_id,
                status,
                counters,
                error_message,
            }) => {
                tracing::info!(
                    run_id = %run_id,
                    status = %status,
                    created = counters.created_quantity,
                    error = ?error_message,
                    "📣 Run finalized"
                );
            }
            Ok(PipelineEvent::StageCompleted { run_id, step, .. }) => {
                tracing::debug!(run_id = %run_id, step = %step, "📣 Stage completed");
            }
            Ok(PipelineEvent::WatchdogAction {
                run_id,
                action,
                reason,
            }) => {
                tracing::warn!(run_id = %run_id, action = %action, "📣 Watchdog: {}", reason);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Event logger lagged, {} events skipped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
