//! Stage orchestration.
//!
//! Every run advances through jobs on the [`JobQueue`]: a job loads the run,
//! executes one stage and enqueues the next one. Jobs for the same run are
//! serialized by a per-run lock, so different runs proceed concurrently while
//! one run never has two stages in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::PipelineSettings;
use crate::discovery::DiscoveryStage;
use crate::enrichment::EnrichmentStage;
use crate::errors::{AppError, ErrorClass};
use crate::migration::MigrationStage;
use crate::models::{
    ExtractionConfig, ExtractionRun, LogLevel, PipelineStep, RunStatus, StagingRecord,
};
use crate::notifications::{EventBus, PipelineEvent};
use crate::queue::{JobKind, JobQueue, JobReceiver, StageJob};
use crate::services::{EnrichmentProviders, SearchSources};
use crate::store::{CrmDirectory, RunStore, StagingStore};
use crate::tracker::RunTracker;

/// The three storage seams, usually backed by one store.
#[derive(Clone)]
pub struct Stores {
    pub runs: Arc<dyn RunStore>,
    pub staging: Arc<dyn StagingStore>,
    pub directory: Arc<dyn CrmDirectory>,
}

impl Stores {
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: RunStore + StagingStore + CrmDirectory + 'static,
    {
        Self {
            runs: store.clone(),
            staging: store.clone(),
            directory: store,
        }
    }
}

pub struct Pipeline {
    tracker: RunTracker,
    staging: Arc<dyn StagingStore>,
    directory: Arc<dyn CrmDirectory>,
    discovery: DiscoveryStage,
    enrichment: EnrichmentStage,
    migration: MigrationStage,
    queue: JobQueue,
    settings: PipelineSettings,
    run_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl Pipeline {
    pub fn new(
        stores: Stores,
        sources: SearchSources,
        providers: EnrichmentProviders,
        events: EventBus,
        settings: PipelineSettings,
        queue: JobQueue,
    ) -> Self {
        let tracker = RunTracker::new(stores.runs.clone(), events);
        Self {
            discovery: DiscoveryStage::new(
                tracker.clone(),
                stores.staging.clone(),
                sources,
                settings.clone(),
            ),
            enrichment: EnrichmentStage::new(
                tracker.clone(),
                stores.staging.clone(),
                providers,
                settings.clone(),
            ),
            migration: MigrationStage::new(
                tracker.clone(),
                stores.staging.clone(),
                settings.clone(),
            ),
            tracker,
            staging: stores.staging,
            directory: stores.directory,
            queue,
            settings,
            run_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn tracker(&self) -> &RunTracker {
        &self.tracker
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub async fn list_staging(&self, run_id: Uuid) -> Result<Vec<StagingRecord>, AppError> {
        self.tracker.load_run(run_id).await?;
        self.staging.list_staging(run_id).await
    }

    /// Creates a run for `config_id` and queues its first job.
    pub async fn start_run(&self, config_id: Uuid) -> Result<ExtractionRun, AppError> {
        let config = self.tracker.load_config(config_id).await?;
        let run = self
            .tracker
            .create_run(&config, self.settings.max_active_runs_per_workspace)
            .await?;
        self.queue.enqueue(StageJob::new(run.id, JobKind::Start))?;
        Ok(run)
    }

    /// Flags the run for cancellation; the next stage boundary honours it.
    pub async fn request_cancel(&self, run_id: Uuid) -> Result<ExtractionRun, AppError> {
        self.tracker.request_cancel(run_id).await
    }

    /// Processes a job, turning failures into retries or run finalization.
    pub async fn handle(&self, job: StageJob) {
        if let Err(e) = self.process(job).await {
            self.on_job_error(job, e).await;
        }
    }

    /// Processes queued jobs until the queue is empty.
    pub async fn drain(&self, receiver: &mut JobReceiver) {
        while let Ok(job) = receiver.try_recv() {
            self.handle(job).await;
        }
    }

    /// Spawns `worker_count` stage workers sharing `receiver`.
    pub fn spawn_workers(
        self: &Arc<Self>,
        receiver: JobReceiver,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        (0..self.settings.worker_count.max(1))
            .map(|worker| {
                let pipeline = Arc::clone(self);
                let receiver = Arc::clone(&receiver);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    tracing::info!(worker, "Stage worker started");
                    loop {
                        let job = tokio::select! {
                            _ = shutdown.cancelled() => break,
                            job = async { receiver.lock().await.recv().await } => job,
                        };
                        let Some(job) = job else {
                            break;
                        };
                        pipeline.handle(job).await;
                    }
                    tracing::info!(worker, "Stage worker stopped");
                })
            })
            .collect()
    }

    async fn process(&self, job: StageJob) -> Result<(), AppError> {
        let lock = self.run_lock(job.run_id)?;
        let _guard = lock.lock().await;

        let run = self.tracker.load_run(job.run_id).await?;
        if run.status.is_terminal() {
            tracing::debug!(run_id = %run.id, kind = %job.kind, "Run already finished, dropping job");
            self.release_lock(run.id);
            return Ok(());
        }
        if run.cancel_requested {
            self.tracker.cancel(run.id).await?;
            self.release_lock(run.id);
            return Ok(());
        }
        if JobKind::for_status(run.status) != Some(job.kind) {
            tracing::debug!(
                run_id = %run.id,
                kind = %job.kind,
                status = %run.status,
                "Stale job for current phase, dropping"
            );
            return Ok(());
        }

        let config = self
            .tracker
            .load_config(run.config_id)
            .await
            .map_err(|e| match e {
                AppError::NotFound(msg) => AppError::RunFatal(msg),
                other => other,
            })?;

        tracing::info!(run_id = %run.id, kind = %job.kind, attempt = job.attempt, "Processing job");
        match job.kind {
            JobKind::Start => self.start(&run, &config).await?,
            JobKind::Discover => self.discover(&run, &config).await?,
            JobKind::Enrich => self.enrich(&run, &config).await?,
            JobKind::Migrate => self.migrate(&run, &config).await?,
        }

        if self.tracker.load_run(run.id).await?.status.is_terminal() {
            self.release_lock(run.id);
        }
        Ok(())
    }

    async fn start(&self, run: &ExtractionRun, config: &ExtractionConfig) -> Result<(), AppError> {
        config.validate()?;
        if !self
            .directory
            .destination_exists(config.workspace_id, config.funnel_id, config.column_id)
            .await?
        {
            return Err(AppError::RunFatal(format!(
                "destination funnel {} / column {} not found",
                config.funnel_id, config.column_id
            )));
        }

        self.tracker.transition(run.id, RunStatus::Discovering).await?;
        self.tracker
            .log(
                run.id,
                PipelineStep::Start,
                LogLevel::Info,
                format!("Searching {} for '{}'", config.source, config.search_term),
            )
            .await;
        self.queue.enqueue(StageJob::new(run.id, JobKind::Discover))
    }

    async fn discover(&self, run: &ExtractionRun, config: &ExtractionConfig) -> Result<(), AppError> {
        self.discovery.run(run, config).await?;
        let run = self.stage_completed(run.id, PipelineStep::Discovery).await?;
        if run.status.is_terminal() || self.cancel_if_requested(run.id).await? {
            return Ok(());
        }

        self.tracker.transition(run.id, RunStatus::Enriching).await?;
        self.queue.enqueue(StageJob::new(run.id, JobKind::Enrich))
    }

    async fn enrich(&self, run: &ExtractionRun, config: &ExtractionConfig) -> Result<(), AppError> {
        let report = self.enrichment.run(run, config).await?;
        let run = self.stage_completed(run.id, PipelineStep::Enrichment).await?;
        if run.status.is_terminal() {
            return Ok(());
        }
        if report.cancelled && self.cancel_if_requested(run.id).await? {
            return Ok(());
        }

        self.tracker.transition(run.id, RunStatus::Migrating).await?;
        self.queue.enqueue(StageJob::new(run.id, JobKind::Migrate))
    }

    /// Migrates, then decides where the run goes next: done, more migration,
    /// back to discovery, or finalization when the source has nothing left.
    async fn migrate(&self, run: &ExtractionRun, config: &ExtractionConfig) -> Result<(), AppError> {
        let report = self.migration.run(run.id, config).await?;
        let run = self.stage_completed(run.id, PipelineStep::Migration).await?;
        if run.status.is_terminal() {
            tracing::info!(run_id = %run.id, status = %run.status, "Run finished during migration");
            return Ok(());
        }
        if self.cancel_if_requested(run.id).await? {
            return Ok(());
        }

        if report.capacity_left == 0 {
            self.tracker.finalize(run.id, "target reached").await?;
        } else if report.eligible_left > 0 {
            self.queue.enqueue(StageJob::new(run.id, JobKind::Migrate))?;
        } else if run.source_exhausted {
            self.tracker.finalize(run.id, "source exhausted").await?;
        } else if run.counters.pages_consumed >= i64::from(self.discovery.page_budget(config)) {
            self.tracker.finalize(run.id, "page budget consumed").await?;
        } else {
            tracing::info!(
                run_id = %run.id,
                "No eligible records left, {} leads still needed: fetching more pages",
                report.capacity_left
            );
            self.tracker.transition(run.id, RunStatus::Discovering).await?;
            self.tracker
                .log(
                    run.id,
                    PipelineStep::Migration,
                    LogLevel::Info,
                    format!(
                        "{} leads still needed, searching further pages",
                        report.capacity_left
                    ),
                )
                .await;
            self.queue.enqueue(StageJob::new(run.id, JobKind::Discover))?;
        }
        Ok(())
    }

    async fn stage_completed(
        &self,
        run_id: Uuid,
        step: PipelineStep,
    ) -> Result<ExtractionRun, AppError> {
        let run = self.tracker.load_run(run_id).await?;
        self.tracker.events().publish(PipelineEvent::StageCompleted {
            run_id,
            step,
            counters: run.counters,
        });
        Ok(run)
    }

    async fn cancel_if_requested(&self, run_id: Uuid) -> Result<bool, AppError> {
        if self.tracker.is_cancel_requested(run_id).await? {
            self.tracker.cancel(run_id).await?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn on_job_error(&self, job: StageJob, error: AppError) {
        let run_id = job.run_id;
        let outcome = match error.class() {
            ErrorClass::Transient if job.attempt < self.settings.job_max_attempts => {
                let delay = self.settings.retry_policy().delay_for(job.attempt);
                tracing::warn!(
                    run_id = %run_id,
                    kind = %job.kind,
                    "⚠ Job failed (attempt {}/{}), retrying in {:?}: {}",
                    job.attempt,
                    self.settings.job_max_attempts,
                    delay,
                    error
                );
                self.tracker
                    .log(
                        run_id,
                        job.kind.step(),
                        LogLevel::Warning,
                        format!("Temporary failure, retrying: {}", error.sanitized()),
                    )
                    .await;
                self.queue.enqueue_after(job.retry(), delay)
            }
            ErrorClass::RunFatal => {
                tracing::error!(run_id = %run_id, kind = %job.kind, "✗ Run-fatal error: {}", error);
                self.tracker
                    .fail(run_id, &error.sanitized())
                    .await
                    .map(|_| ())
            }
            _ => {
                tracing::error!(run_id = %run_id, kind = %job.kind, "✗ Job failed: {}", error);
                self.tracker
                    .log(
                        run_id,
                        job.kind.step(),
                        LogLevel::Error,
                        format!("{} stage failed: {}", job.kind, error.sanitized()),
                    )
                    .await;
                self.tracker
                    .finalize(run_id, &format!("{} stage failed", job.kind))
                    .await
                    .map(|_| ())
            }
        };

        if let Err(e) = outcome {
            tracing::error!(run_id = %run_id, "Failed to handle job error: {}", e);
        }
    }

    fn run_lock(&self, run_id: Uuid) -> Result<Arc<tokio::sync::Mutex<()>>, AppError> {
        let mut locks = self
            .run_locks
            .lock()
            .map_err(|_| AppError::InternalError("run lock table poisoned".to_string()))?;
        Ok(locks.entry(run_id).or_default().clone())
    }

    /// Drops the run's lock entry. Jobs already waiting keep the old mutex,
    /// so only call this once the run is terminal and later jobs are no-ops.
    fn release_lock(&self, run_id: Uuid) {
        if let Ok(mut locks) = self.run_locks.lock() {
            locks.remove(&run_id);
        }
    }
}
