//! Stuck-run watchdog.
//!
//! A run whose heartbeat (`updated_at`) is older than the timeout while still
//! in a live phase is either re-queued (while recoveries remain) or finalized
//! from its counters: progress → `partial`, nothing created → `failed`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::PipelineSettings;
use crate::errors::AppError;
use crate::models::{ExtractionRun, LogLevel, PipelineStep, RunStatus};
use crate::notifications::PipelineEvent;
use crate::queue::{JobKind, JobQueue, StageJob};
use crate::tracker::RunTracker;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalizedRun {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub stale_runs: usize,
    pub requeued: Vec<Uuid>,
    pub finalized: Vec<FinalizedRun>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.stale_runs == 0
    }
}

pub struct Watchdog {
    tracker: RunTracker,
    queue: JobQueue,
    settings: PipelineSettings,
}

impl Watchdog {
    pub fn new(tracker: RunTracker, queue: JobQueue, settings: PipelineSettings) -> Self {
        Self {
            tracker,
            queue,
            settings,
        }
    }

    /// One pass over the stale runs as of `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, AppError> {
        let timeout = chrono::Duration::from_std(self.settings.watchdog_timeout)
            .map_err(|e| AppError::InternalError(format!("invalid watchdog timeout: {}", e)))?;
        let stale = self.tracker.store().list_stale_runs(now - timeout).await?;
        let mut report = SweepReport {
            stale_runs: stale.len(),
            ..SweepReport::default()
        };

        for run in stale {
            let idle_minutes = (now - run.updated_at).num_minutes();
            let stalled = format!("stalled for {} minutes in phase {}", idle_minutes, run.status);

            match JobKind::for_status(run.status) {
                Some(kind) if run.watchdog_recoveries < self.settings.watchdog_max_recoveries => {
                    self.requeue(&run, kind, &stalled).await?;
                    report.requeued.push(run.id);
                }
                _ => {
                    if let Some(finalized) = self.finalize(&run, &stalled).await? {
                        report.finalized.push(finalized);
                    }
                }
            }
        }

        if !report.is_empty() {
            tracing::info!(
                stale = report.stale_runs,
                requeued = report.requeued.len(),
                finalized = report.finalized.len(),
                "Watchdog sweep finished"
            );
        }
        Ok(report)
    }

    async fn requeue(
        &self,
        run: &ExtractionRun,
        kind: JobKind,
        stalled: &str,
    ) -> Result<(), AppError> {
        let updated = self.tracker.store().record_recovery(run.id).await?;
        self.queue.enqueue(StageJob::new(run.id, kind))?;

        let reason = format!(
            "{}, re-queued (recovery {}/{})",
            stalled, updated.watchdog_recoveries, self.settings.watchdog_max_recoveries
        );
        tracing::warn!(run_id = %run.id, "🐕 Watchdog: {}", reason);
        self.tracker
            .log(run.id, PipelineStep::Watchdog, LogLevel::Warning, reason.clone())
            .await;
        self.tracker.events().publish(PipelineEvent::WatchdogAction {
            run_id: run.id,
            action: "requeue".to_string(),
            reason,
        });
        Ok(())
    }

    async fn finalize(
        &self,
        run: &ExtractionRun,
        stalled: &str,
    ) -> Result<Option<FinalizedRun>, AppError> {
        let finished = match self.tracker.finalize_if_live(run.id, stalled).await {
            Ok(Some(finished)) => finished,
            // A worker finished the run between the scan and now.
            Ok(None) => return Ok(None),
            Err(AppError::Conflict(msg)) => {
                tracing::debug!(run_id = %run.id, "Watchdog skipped run: {}", msg);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        tracing::warn!(
            run_id = %run.id,
            status = %finished.status,
            created = finished.counters.created_quantity,
            "🐕 Watchdog finalized run: {}",
            stalled
        );
        self.tracker
            .log_with_details(
                run.id,
                PipelineStep::Watchdog,
                LogLevel::Warning,
                format!("Run {} by watchdog: {}", finished.status, stalled),
                json!({
                    "previous_status": run.status.as_str(),
                    "created_quantity": finished.counters.created_quantity,
                }),
            )
            .await;
        self.tracker.events().publish(PipelineEvent::WatchdogAction {
            run_id: run.id,
            action: "finalize".to_string(),
            reason: stalled.to_string(),
        });

        Ok(Some(FinalizedRun {
            run_id: run.id,
            status: finished.status,
            reason: stalled.to_string(),
        }))
    }

    /// Sweeps every `watchdog_interval` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.watchdog_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            "🐕 Watchdog started (interval {:?}, timeout {:?})",
            self.settings.watchdog_interval,
            self.settings.watchdog_timeout
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.sweep(Utc::now()).await {
                tracing::error!("Watchdog sweep failed: {}", e);
            }
        }
        tracing::info!("Watchdog stopped");
    }
}
