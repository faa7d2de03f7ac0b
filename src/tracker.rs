use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{
    ExtractionConfig, ExtractionLogEntry, ExtractionRun, LogLevel, PipelineStep, RunCounters,
    RunStatus,
};
use crate::notifications::{EventBus, PipelineEvent};
use crate::store::RunStore;

/// Terminal status a run earns from its counters.
///
/// - `created >= target` → completed
/// - `0 < created < target` → partial
/// - nothing created → failed, with `reason` as the error message
pub fn final_status(run: &ExtractionRun, reason: &str) -> (RunStatus, Option<String>) {
    let created = run.counters.created_quantity;
    if created >= run.target_quantity {
        (RunStatus::Completed, None)
    } else if created > 0 {
        (RunStatus::Partial, None)
    } else {
        (RunStatus::Failed, Some(format!("no leads created: {}", reason)))
    }
}

/// Owns run lifecycle bookkeeping: transitions, counters, logs and events.
#[derive(Clone)]
pub struct RunTracker {
    store: Arc<dyn RunStore>,
    events: EventBus,
}

impl RunTracker {
    pub fn new(store: Arc<dyn RunStore>, events: EventBus) -> Self {
        Self { store, events }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub async fn load_config(&self, config_id: Uuid) -> Result<ExtractionConfig, AppError> {
        self.store
            .get_config(config_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Extraction config {} not found", config_id)))
    }

    pub async fn load_run(&self, run_id: Uuid) -> Result<ExtractionRun, AppError> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Run {} not found", run_id)))
    }

    /// Creates a pending run for `config`, honouring the workspace limit.
    pub async fn create_run(
        &self,
        config: &ExtractionConfig,
        max_active: i64,
    ) -> Result<ExtractionRun, AppError> {
        let run = ExtractionRun::new(config, Utc::now());
        self.store.create_run(&run, max_active).await?;
        tracing::info!(
            run_id = %run.id,
            config_id = %config.id,
            workspace_id = %config.workspace_id,
            "Created extraction run (target {})",
            run.target_quantity
        );
        self.log(
            run.id,
            PipelineStep::Start,
            LogLevel::Info,
            format!(
                "Run created for '{}' ({} in {}), target {}",
                config.name, config.search_term, config.location, config.target_quantity
            ),
        )
        .await;
        Ok(run)
    }

    pub async fn transition(
        &self,
        run_id: Uuid,
        next: RunStatus,
    ) -> Result<ExtractionRun, AppError> {
        let run = self.store.transition_run(run_id, next, None).await?;
        tracing::info!(run_id = %run_id, status = %next, "Run phase changed");
        Ok(run)
    }

    pub async fn add_counters(
        &self,
        run_id: Uuid,
        delta: RunCounters,
    ) -> Result<ExtractionRun, AppError> {
        self.store.add_counters(run_id, delta).await
    }

    pub async fn is_cancel_requested(&self, run_id: Uuid) -> Result<bool, AppError> {
        Ok(self.load_run(run_id).await?.cancel_requested)
    }

    pub async fn request_cancel(&self, run_id: Uuid) -> Result<ExtractionRun, AppError> {
        let run = self.store.request_cancel(run_id).await?;
        if run.cancel_requested {
            self.log(
                run_id,
                PipelineStep::Finalize,
                LogLevel::Warning,
                "Cancellation requested",
            )
            .await;
        }
        Ok(run)
    }

    /// Finalizes the run from its counters (completed / partial / failed).
    ///
    /// A run that is already terminal is returned unchanged.
    pub async fn finalize(&self, run_id: Uuid, reason: &str) -> Result<ExtractionRun, AppError> {
        match self.finalize_if_live(run_id, reason).await? {
            Some(run) => Ok(run),
            None => self.load_run(run_id).await,
        }
    }

    /// Like [`RunTracker::finalize`], but `None` when the run had already finished.
    pub async fn finalize_if_live(
        &self,
        run_id: Uuid,
        reason: &str,
    ) -> Result<Option<ExtractionRun>, AppError> {
        let run = self.load_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(None);
        }
        let (status, error_message) = final_status(&run, reason);
        self.finish(run_id, status, error_message, reason)
            .await
            .map(Some)
    }

    /// Fails the run immediately (run-level fatal error).
    pub async fn fail(&self, run_id: Uuid, message: &str) -> Result<ExtractionRun, AppError> {
        self.finish(
            run_id,
            RunStatus::Failed,
            Some(message.to_string()),
            message,
        )
        .await
    }

    pub async fn cancel(&self, run_id: Uuid) -> Result<ExtractionRun, AppError> {
        self.finish(run_id, RunStatus::Cancelled, None, "cancelled by request")
            .await
    }

    async fn finish(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error_message: Option<String>,
        reason: &str,
    ) -> Result<ExtractionRun, AppError> {
        let run = self
            .store
            .transition_run(run_id, status, error_message.clone())
            .await?;

        let level = match status {
            RunStatus::Completed => LogLevel::Success,
            RunStatus::Partial | RunStatus::Cancelled => LogLevel::Warning,
            _ => LogLevel::Error,
        };
        tracing::info!(
            run_id = %run_id,
            status = %status,
            created = run.counters.created_quantity,
            target = run.target_quantity,
            "✓ Run finalized: {}",
            reason
        );
        self.log_with_details(
            run_id,
            PipelineStep::Finalize,
            level,
            format!(
                "Run {}: {} of {} leads created ({})",
                status, run.counters.created_quantity, run.target_quantity, reason
            ),
            json!({
                "status": status.as_str(),
                "counters": run.counters,
                "error_message": error_message,
            }),
        )
        .await;
        self.events.publish(PipelineEvent::RunFinalized {
            run_id,
            status,
            counters: run.counters,
            error_message: run.error_message.clone(),
        });
        Ok(run)
    }

    /// Appends a user-facing log line. Logging failures never break the pipeline.
    pub async fn log(
        &self,
        run_id: Uuid,
        step: PipelineStep,
        level: LogLevel,
        message: impl Into<String>,
    ) {
        self.log_with_details(run_id, step, level, message, serde_json::Value::Null)
            .await;
    }

    pub async fn log_with_details(
        &self,
        run_id: Uuid,
        step: PipelineStep,
        level: LogLevel,
        message: impl Into<String>,
        details: serde_json::Value,
    ) {
        let entry = ExtractionLogEntry::new(run_id, step, level, message).with_details(details);
        if let Err(e) = self.store.append_log(&entry).await {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to write extraction log");
        }
    }
}
