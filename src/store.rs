//! Storage seams for the pipeline.
//!
//! Every method that guards an invariant (status CAS, dedup insert, capped
//! migration) must be atomic in the implementation: the stages rely on it
//! when several workers touch the same run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{
    ExtractionConfig, ExtractionLogEntry, ExtractionRun, InsertOutcome, MigrationOutcome, NewLead,
    RunCounters, RunStatus, SearchProgress, StagingRecord,
};

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn get_config(&self, config_id: Uuid) -> Result<Option<ExtractionConfig>, AppError>;

    /// Inserts a pending run unless the workspace already has `max_active` non-terminal runs.
    async fn create_run(&self, run: &ExtractionRun, max_active: i64) -> Result<(), AppError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<ExtractionRun>, AppError>;

    /// Moves the run to `next` if its current status allows it.
    ///
    /// Fails with `Conflict` when the edge is not allowed (including terminal runs).
    async fn transition_run(
        &self,
        run_id: Uuid,
        next: RunStatus,
        error_message: Option<String>,
    ) -> Result<ExtractionRun, AppError>;

    /// Adds `delta` to the counters and refreshes the heartbeat.
    async fn add_counters(&self, run_id: Uuid, delta: RunCounters)
        -> Result<ExtractionRun, AppError>;

    /// Records discovery progress on the run.
    async fn record_pages(
        &self,
        run_id: Uuid,
        current_page: u32,
        source_exhausted: bool,
    ) -> Result<(), AppError>;

    /// Replaces the run's sub-location list.
    async fn save_search_segments(&self, run_id: Uuid, segments: &[String])
        -> Result<(), AppError>;

    async fn request_cancel(&self, run_id: Uuid) -> Result<ExtractionRun, AppError>;

    /// Refreshes the heartbeat and counts a watchdog recovery.
    async fn record_recovery(&self, run_id: Uuid) -> Result<ExtractionRun, AppError>;

    /// Non-terminal runs whose heartbeat is older than `cutoff`.
    async fn list_stale_runs(&self, cutoff: DateTime<Utc>) -> Result<Vec<ExtractionRun>, AppError>;

    async fn append_log(&self, entry: &ExtractionLogEntry) -> Result<(), AppError>;

    async fn list_logs(&self, run_id: Uuid) -> Result<Vec<ExtractionLogEntry>, AppError>;

    async fn get_search_progress(
        &self,
        workspace_id: Uuid,
        query_hash: &str,
    ) -> Result<Option<SearchProgress>, AppError>;

    async fn save_search_progress(&self, progress: &SearchProgress) -> Result<(), AppError>;
}

#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Inserts unless `(workspace_id, deduplication_hash)` already exists.
    async fn insert_staging(&self, record: &StagingRecord) -> Result<InsertOutcome, AppError>;

    async fn get_staging(&self, staging_id: Uuid) -> Result<Option<StagingRecord>, AppError>;

    /// Records of the run still waiting for enrichment, oldest first.
    async fn list_pending_enrichment(
        &self,
        run_id: Uuid,
        limit: usize,
    ) -> Result<Vec<StagingRecord>, AppError>;

    /// Persists a record; rejects backwards status moves and changed migration linkage.
    async fn update_staging(&self, record: &StagingRecord) -> Result<(), AppError>;

    /// `should_migrate = true AND migrated_at IS NULL`, oldest first.
    async fn list_migration_candidates(
        &self,
        run_id: Uuid,
        limit: i64,
    ) -> Result<Vec<StagingRecord>, AppError>;

    async fn count_migration_candidates(&self, run_id: Uuid) -> Result<i64, AppError>;

    async fn list_staging(&self, run_id: Uuid) -> Result<Vec<StagingRecord>, AppError>;

    /// Inserts the lead, stamps the staging record and bumps `created_quantity`
    /// as one unit, guarded by `migrated_at IS NULL` and `created < target`.
    async fn migrate_record(
        &self,
        run_id: Uuid,
        staging_id: Uuid,
        lead: &NewLead,
    ) -> Result<MigrationOutcome, AppError>;
}

/// CRM pipeline metadata consulted before a run starts.
#[async_trait]
pub trait CrmDirectory: Send + Sync {
    async fn destination_exists(
        &self,
        workspace_id: Uuid,
        funnel_id: Uuid,
        column_id: Uuid,
    ) -> Result<bool, AppError>;
}
