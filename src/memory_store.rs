//! In-process store: an arena of staging records addressed by id, plus run,
//! log and progress tables, all behind one mutex so every operation is atomic.
//!
//! Used when no database is configured and by the test suite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{
    ExtractionConfig, ExtractionLogEntry, ExtractionRun, ExtractionStatus, InsertOutcome,
    MigrationOutcome, NewLead, RunCounters, RunStatus, SearchProgress, StagingRecord,
};
use crate::store::{CrmDirectory, RunStore, StagingStore};

/// Lead as stored by the in-memory CRM table.
#[derive(Debug, Clone)]
pub struct StoredLead {
    pub id: Uuid,
    pub lead: NewLead,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    configs: HashMap<Uuid, ExtractionConfig>,
    runs: HashMap<Uuid, ExtractionRun>,
    staging: Vec<StagingRecord>,
    staging_index: HashMap<Uuid, usize>,
    dedup: HashSet<(Uuid, String)>,
    progress: HashMap<(Uuid, String), SearchProgress>,
    logs: Vec<ExtractionLogEntry>,
    leads: Vec<StoredLead>,
    destinations: HashSet<(Uuid, Uuid, Uuid)>,
}

impl Inner {
    fn run_mut(&mut self, run_id: Uuid) -> Result<&mut ExtractionRun, AppError> {
        self.runs
            .get_mut(&run_id)
            .ok_or_else(|| AppError::NotFound(format!("Run {} not found", run_id)))
    }

    fn staging_mut(&mut self, staging_id: Uuid) -> Result<&mut StagingRecord, AppError> {
        let idx = *self
            .staging_index
            .get(&staging_id)
            .ok_or_else(|| AppError::NotFound(format!("Staging record {} not found", staging_id)))?;
        Ok(&mut self.staging[idx])
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, AppError> {
        self.inner
            .lock()
            .map_err(|_| AppError::InternalError("memory store lock poisoned".to_string()))
    }

    /// Registers an extraction config (configs are managed outside the pipeline).
    pub fn insert_config(&self, config: ExtractionConfig) -> Result<(), AppError> {
        self.lock()?.configs.insert(config.id, config);
        Ok(())
    }

    /// Registers a funnel column as a valid migration destination.
    pub fn add_destination(
        &self,
        workspace_id: Uuid,
        funnel_id: Uuid,
        column_id: Uuid,
    ) -> Result<(), AppError> {
        self.lock()?
            .destinations
            .insert((workspace_id, funnel_id, column_id));
        Ok(())
    }

    pub fn leads(&self) -> Result<Vec<StoredLead>, AppError> {
        Ok(self.lock()?.leads.clone())
    }

    /// Overwrites a run's heartbeat; lets callers simulate a stalled worker.
    pub fn set_heartbeat(&self, run_id: Uuid, at: DateTime<Utc>) -> Result<(), AppError> {
        self.lock()?.run_mut(run_id)?.updated_at = at;
        Ok(())
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn get_config(&self, config_id: Uuid) -> Result<Option<ExtractionConfig>, AppError> {
        Ok(self.lock()?.configs.get(&config_id).cloned())
    }

    async fn create_run(&self, run: &ExtractionRun, max_active: i64) -> Result<(), AppError> {
        let mut inner = self.lock()?;
        let active = inner
            .runs
            .values()
            .filter(|r| r.workspace_id == run.workspace_id && !r.status.is_terminal())
            .count() as i64;
        if active >= max_active {
            return Err(AppError::Conflict(format!(
                "workspace {} already has {} active runs",
                run.workspace_id, active
            )));
        }
        inner.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<ExtractionRun>, AppError> {
        Ok(self.lock()?.runs.get(&run_id).cloned())
    }

    async fn transition_run(
        &self,
        run_id: Uuid,
        next: RunStatus,
        error_message: Option<String>,
    ) -> Result<ExtractionRun, AppError> {
        let mut inner = self.lock()?;
        let run = inner.run_mut(run_id)?;
        run.apply_transition(next, error_message, Utc::now())?;
        Ok(run.clone())
    }

    async fn add_counters(
        &self,
        run_id: Uuid,
        delta: RunCounters,
    ) -> Result<ExtractionRun, AppError> {
        let mut inner = self.lock()?;
        let run = inner.run_mut(run_id)?;
        run.counters.add(&delta);
        run.updated_at = Utc::now();
        Ok(run.clone())
    }

    async fn record_pages(
        &self,
        run_id: Uuid,
        current_page: u32,
        source_exhausted: bool,
    ) -> Result<(), AppError> {
        let mut inner = self.lock()?;
        let run = inner.run_mut(run_id)?;
        run.current_page = run.current_page.max(current_page);
        run.source_exhausted |= source_exhausted;
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn save_search_segments(
        &self,
        run_id: Uuid,
        segments: &[String],
    ) -> Result<(), AppError> {
        let mut inner = self.lock()?;
        let run = inner.run_mut(run_id)?;
        run.search_segments = segments.to_vec();
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn request_cancel(&self, run_id: Uuid) -> Result<ExtractionRun, AppError> {
        let mut inner = self.lock()?;
        let run = inner.run_mut(run_id)?;
        if !run.status.is_terminal() {
            run.cancel_requested = true;
            run.updated_at = Utc::now();
        }
        Ok(run.clone())
    }

    async fn record_recovery(&self, run_id: Uuid) -> Result<ExtractionRun, AppError> {
        let mut inner = self.lock()?;
        let run = inner.run_mut(run_id)?;
        run.watchdog_recoveries += 1;
        run.updated_at = Utc::now();
        Ok(run.clone())
    }

    async fn list_stale_runs(&self, cutoff: DateTime<Utc>) -> Result<Vec<ExtractionRun>, AppError> {
        let inner = self.lock()?;
        let mut stale: Vec<ExtractionRun> = inner
            .runs
            .values()
            .filter(|r| !r.status.is_terminal() && r.updated_at < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|r| r.updated_at);
        Ok(stale)
    }

    async fn append_log(&self, entry: &ExtractionLogEntry) -> Result<(), AppError> {
        self.lock()?.logs.push(entry.clone());
        Ok(())
    }

    async fn list_logs(&self, run_id: Uuid) -> Result<Vec<ExtractionLogEntry>, AppError> {
        Ok(self
            .lock()?
            .logs
            .iter()
            .filter(|l| l.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn get_search_progress(
        &self,
        workspace_id: Uuid,
        query_hash: &str,
    ) -> Result<Option<SearchProgress>, AppError> {
        Ok(self
            .lock()?
            .progress
            .get(&(workspace_id, query_hash.to_string()))
            .cloned())
    }

    async fn save_search_progress(&self, progress: &SearchProgress) -> Result<(), AppError> {
        let mut inner = self.lock()?;
        let key = (progress.workspace_id, progress.query_hash.clone());
        let merged = match inner.progress.get(&key) {
            Some(existing) => SearchProgress {
                last_page: existing.last_page.max(progress.last_page),
                exhausted: existing.exhausted || progress.exhausted,
                ..progress.clone()
            },
            None => progress.clone(),
        };
        inner.progress.insert(key, merged);
        Ok(())
    }
}

#[async_trait]
impl StagingStore for MemoryStore {
    async fn insert_staging(&self, record: &StagingRecord) -> Result<InsertOutcome, AppError> {
        let mut inner = self.lock()?;
        let key = (record.workspace_id, record.deduplication_hash.clone());
        if !inner.dedup.insert(key) {
            return Ok(InsertOutcome::Duplicate);
        }
        let idx = inner.staging.len();
        inner.staging.push(record.clone());
        inner.staging_index.insert(record.id, idx);
        Ok(InsertOutcome::Inserted(record.id))
    }

    async fn get_staging(&self, staging_id: Uuid) -> Result<Option<StagingRecord>, AppError> {
        let inner = self.lock()?;
        Ok(inner
            .staging_index
            .get(&staging_id)
            .map(|idx| inner.staging[*idx].clone()))
    }

    async fn list_pending_enrichment(
        &self,
        run_id: Uuid,
        limit: usize,
    ) -> Result<Vec<StagingRecord>, AppError> {
        Ok(self
            .lock()?
            .staging
            .iter()
            .filter(|r| r.run_id == run_id && !r.status_enrichment.is_terminal())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_staging(&self, record: &StagingRecord) -> Result<(), AppError> {
        let mut inner = self.lock()?;
        let current = inner.staging_mut(record.id)?;
        current.check_update(record)?;
        let mut updated = record.clone();
        updated.updated_at = Utc::now();
        *current = updated;
        Ok(())
    }

    async fn list_migration_candidates(
        &self,
        run_id: Uuid,
        limit: i64,
    ) -> Result<Vec<StagingRecord>, AppError> {
        Ok(self
            .lock()?
            .staging
            .iter()
            .filter(|r| r.run_id == run_id && r.is_migration_candidate())
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn count_migration_candidates(&self, run_id: Uuid) -> Result<i64, AppError> {
        Ok(self
            .lock()?
            .staging
            .iter()
            .filter(|r| r.run_id == run_id && r.is_migration_candidate())
            .count() as i64)
    }

    async fn list_staging(&self, run_id: Uuid) -> Result<Vec<StagingRecord>, AppError> {
        Ok(self
            .lock()?
            .staging
            .iter()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn migrate_record(
        &self,
        run_id: Uuid,
        staging_id: Uuid,
        lead: &NewLead,
    ) -> Result<MigrationOutcome, AppError> {
        let mut inner = self.lock()?;

        if inner.staging_mut(staging_id)?.migrated_at.is_some() {
            return Ok(MigrationOutcome::AlreadyMigrated);
        }
        let run = inner.run_mut(run_id)?;
        if run.status.is_terminal() || run.cancel_requested {
            return Ok(MigrationOutcome::RunClosed);
        }
        if run.counters.created_quantity >= run.target_quantity {
            return Ok(MigrationOutcome::CapacityReached);
        }

        let now = Utc::now();
        let lead_id = Uuid::new_v4();
        run.counters.created_quantity += 1;
        run.updated_at = now;

        let record = inner.staging_mut(staging_id)?;
        record.migrated_lead_id = Some(lead_id);
        record.migrated_at = Some(now);
        record.status_extraction = ExtractionStatus::Migrated;
        record.updated_at = now;

        inner.leads.push(StoredLead {
            id: lead_id,
            lead: lead.clone(),
            created_at: now,
        });
        Ok(MigrationOutcome::Migrated(lead_id))
    }
}

#[async_trait]
impl CrmDirectory for MemoryStore {
    async fn destination_exists(
        &self,
        workspace_id: Uuid,
        funnel_id: Uuid,
        column_id: Uuid,
    ) -> Result<bool, AppError> {
        Ok(self
            .lock()?
            .destinations
            .contains(&(workspace_id, funnel_id, column_id)))
    }
}
