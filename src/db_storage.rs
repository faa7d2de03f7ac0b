//! Postgres implementation of the storage seams.
//!
//! Status changes lock the row (`FOR UPDATE`) and validate the edge with the
//! same state machine the in-memory store uses. Staging dedup relies on the
//! `(workspace_id, deduplication_hash)` unique index, and migration runs the
//! lead insert, the staging stamp and the counter bump in one transaction
//! while holding the run row, so a finished or cancelling run gets no leads.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{
    CnpjSearchFilters, ContactChannels, EnrichmentData, ExtractionConfig, ExtractionLogEntry,
    ExtractionRun, ExtractionStatus, InsertOutcome, MigrationOutcome, NewLead, PhaseTransition,
    QualificationFilters, RunCounters, RunStatus, SearchProgress, SourcePayload, StagingRecord,
};
use crate::store::{CrmDirectory, RunStore, StagingStore};

const RUN_COLUMNS: &str = r#"
    id, config_id, workspace_id, source, status, target_quantity,
    found_quantity, created_quantity, filtered_quantity, duplicates_skipped,
    pages_consumed, enrichment_failed, current_page, source_exhausted,
    cancel_requested, watchdog_recoveries, error_message, created_at,
    started_at, updated_at, finished_at, phase_history, search_segments
"#;

const STAGING_COLUMNS: &str = r#"
    id, run_id, workspace_id, deduplication_hash, client_name, payload,
    contacts, enrichment, cnpj_normalized, domain, status_extraction,
    status_enrichment, enrichment_attempts, enrichment_error, should_migrate,
    filter_reason, migrated_lead_id, migrated_at, created_at, updated_at
"#;

#[derive(sqlx::FromRow)]
struct ConfigRow {
    id: Uuid,
    workspace_id: Uuid,
    name: String,
    source: String,
    search_term: String,
    location: String,
    target_quantity: i64,
    filters: Json<QualificationFilters>,
    funnel_id: Uuid,
    column_id: Uuid,
    schedule: Option<String>,
    max_pages: Option<i32>,
    cnpj_filters: Option<Json<CnpjSearchFilters>>,
}

impl TryFrom<ConfigRow> for ExtractionConfig {
    type Error = AppError;

    fn try_from(row: ConfigRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            workspace_id: row.workspace_id,
            name: row.name,
            source: row.source.parse()?,
            search_term: row.search_term,
            location: row.location,
            target_quantity: row.target_quantity,
            filters: row.filters.0,
            funnel_id: row.funnel_id,
            column_id: row.column_id,
            schedule: row.schedule,
            max_pages: row.max_pages.and_then(|p| u32::try_from(p).ok()),
            cnpj_filters: row.cnpj_filters.map(|f| f.0),
        })
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    config_id: Uuid,
    workspace_id: Uuid,
    source: String,
    status: String,
    target_quantity: i64,
    found_quantity: i64,
    created_quantity: i64,
    filtered_quantity: i64,
    duplicates_skipped: i64,
    pages_consumed: i64,
    enrichment_failed: i64,
    current_page: i32,
    source_exhausted: bool,
    cancel_requested: bool,
    watchdog_recoveries: i32,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    phase_history: Json<Vec<PhaseTransition>>,
    search_segments: Json<Vec<String>>,
}

impl TryFrom<RunRow> for ExtractionRun {
    type Error = AppError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            config_id: row.config_id,
            workspace_id: row.workspace_id,
            source: row.source.parse()?,
            status: row.status.parse()?,
            target_quantity: row.target_quantity,
            counters: RunCounters {
                found_quantity: row.found_quantity,
                created_quantity: row.created_quantity,
                filtered_quantity: row.filtered_quantity,
                duplicates_skipped: row.duplicates_skipped,
                pages_consumed: row.pages_consumed,
                enrichment_failed: row.enrichment_failed,
            },
            current_page: u32::try_from(row.current_page).unwrap_or(0),
            source_exhausted: row.source_exhausted,
            cancel_requested: row.cancel_requested,
            watchdog_recoveries: row.watchdog_recoveries,
            error_message: row.error_message,
            created_at: row.created_at,
            started_at: row.started_at,
            updated_at: row.updated_at,
            finished_at: row.finished_at,
            phase_history: row.phase_history.0,
            search_segments: row.search_segments.0,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StagingRow {
    id: Uuid,
    run_id: Uuid,
    workspace_id: Uuid,
    deduplication_hash: String,
    client_name: String,
    payload: Json<SourcePayload>,
    contacts: Json<ContactChannels>,
    enrichment: Json<EnrichmentData>,
    cnpj_normalized: Option<String>,
    domain: Option<String>,
    status_extraction: String,
    status_enrichment: String,
    enrichment_attempts: i32,
    enrichment_error: Option<String>,
    should_migrate: Option<bool>,
    filter_reason: Option<String>,
    migrated_lead_id: Option<Uuid>,
    migrated_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<StagingRow> for StagingRecord {
    type Error = AppError;

    fn try_from(row: StagingRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            run_id: row.run_id,
            workspace_id: row.workspace_id,
            deduplication_hash: row.deduplication_hash,
            client_name: row.client_name,
            payload: row.payload.0,
            contacts: row.contacts.0,
            enrichment: row.enrichment.0,
            cnpj_normalized: row.cnpj_normalized,
            domain: row.domain,
            status_extraction: row.status_extraction.parse()?,
            status_enrichment: row.status_enrichment.parse()?,
            enrichment_attempts: row.enrichment_attempts,
            enrichment_error: row.enrichment_error,
            should_migrate: row.should_migrate,
            filter_reason: row.filter_reason,
            migrated_lead_id: row.migrated_lead_id,
            migrated_at: row.migrated_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    id: Uuid,
    run_id: Uuid,
    step: String,
    level: String,
    message: String,
    details: Json<serde_json::Value>,
    created_at: DateTime<Utc>,
}

fn page_to_db(page: u32) -> i32 {
    i32::try_from(page).unwrap_or(i32::MAX)
}

fn live_statuses() -> Vec<String> {
    RunStatus::ALL
        .iter()
        .filter(|s| !s.is_terminal())
        .map(|s| s.as_str().to_string())
        .collect()
}

/// Storage backed by the lead extraction tables.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn lock_run(
        tx: &mut Transaction<'_, Postgres>,
        run_id: Uuid,
    ) -> Result<ExtractionRun, AppError> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM lead_extraction_runs WHERE id = $1 FOR UPDATE",
            RUN_COLUMNS
        ))
        .bind(run_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Run {} not found", run_id)))?;
        row.try_into()
    }

    async fn fetch_run_returning(
        &self,
        query: &str,
        run_id: Uuid,
    ) -> Result<ExtractionRun, AppError> {
        sqlx::query_as::<_, RunRow>(query)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Run {} not found", run_id)))?
            .try_into()
    }
}

#[async_trait]
impl RunStore for PgStore {
    async fn get_config(&self, config_id: Uuid) -> Result<Option<ExtractionConfig>, AppError> {
        let row = sqlx::query_as::<_, ConfigRow>(
            r#"
            SELECT id, workspace_id, name, source, search_term, location, target_quantity,
                   filters, funnel_id, column_id, schedule, max_pages, cnpj_filters
            FROM lead_extractions
            WHERE id = $1
            "#,
        )
        .bind(config_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ExtractionConfig::try_from).transpose()
    }

    async fn create_run(&self, run: &ExtractionRun, max_active: i64) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        // Serializes run creation per workspace for the rest of the transaction.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(run.workspace_id.to_string())
            .execute(&mut *tx)
            .await?;

        let (active,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM lead_extraction_runs WHERE workspace_id = $1 AND status = ANY($2)",
        )
        .bind(run.workspace_id)
        .bind(live_statuses())
        .fetch_one(&mut *tx)
        .await?;
        if active >= max_active {
            return Err(AppError::Conflict(format!(
                "workspace {} already has {} active runs",
                run.workspace_id, active
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO lead_extraction_runs (
                id, config_id, workspace_id, source, status, target_quantity,
                current_page, source_exhausted, cancel_requested, watchdog_recoveries,
                created_at, updated_at, phase_history
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(run.id)
        .bind(run.config_id)
        .bind(run.workspace_id)
        .bind(run.source.as_str())
        .bind(run.status.as_str())
        .bind(run.target_quantity)
        .bind(page_to_db(run.current_page))
        .bind(run.source_exhausted)
        .bind(run.cancel_requested)
        .bind(run.watchdog_recoveries)
        .bind(run.created_at)
        .bind(run.updated_at)
        .bind(Json(&run.phase_history))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<ExtractionRun>, AppError> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM lead_extraction_runs WHERE id = $1",
            RUN_COLUMNS
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ExtractionRun::try_from).transpose()
    }

    async fn transition_run(
        &self,
        run_id: Uuid,
        next: RunStatus,
        error_message: Option<String>,
    ) -> Result<ExtractionRun, AppError> {
        let mut tx = self.pool.begin().await?;
        let mut run = Self::lock_run(&mut tx, run_id).await?;
        run.apply_transition(next, error_message, Utc::now())?;

        sqlx::query(
            r#"
            UPDATE lead_extraction_runs
            SET status = $2,
                error_message = $3,
                started_at = $4,
                finished_at = $5,
                updated_at = $6,
                phase_history = $7
            WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(&run.error_message)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.updated_at)
        .bind(Json(&run.phase_history))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(run)
    }

    async fn add_counters(
        &self,
        run_id: Uuid,
        delta: RunCounters,
    ) -> Result<ExtractionRun, AppError> {
        sqlx::query_as::<_, RunRow>(&format!(
            r#"
            UPDATE lead_extraction_runs
            SET found_quantity = found_quantity + $2,
                created_quantity = created_quantity + $3,
                filtered_quantity = filtered_quantity + $4,
                duplicates_skipped = duplicates_skipped + $5,
                pages_consumed = pages_consumed + $6,
                enrichment_failed = enrichment_failed + $7,
                updated_at = now()
            WHERE id = $1
            RETURNING {}
            "#,
            RUN_COLUMNS
        ))
        .bind(run_id)
        .bind(delta.found_quantity)
        .bind(delta.created_quantity)
        .bind(delta.filtered_quantity)
        .bind(delta.duplicates_skipped)
        .bind(delta.pages_consumed)
        .bind(delta.enrichment_failed)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Run {} not found", run_id)))?
        .try_into()
    }

    async fn record_pages(
        &self,
        run_id: Uuid,
        current_page: u32,
        source_exhausted: bool,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE lead_extraction_runs
            SET current_page = GREATEST(current_page, $2),
                source_exhausted = source_exhausted OR $3,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(page_to_db(current_page))
        .bind(source_exhausted)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Run {} not found", run_id)));
        }
        Ok(())
    }

    async fn save_search_segments(
        &self,
        run_id: Uuid,
        segments: &[String],
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE lead_extraction_runs SET search_segments = $2, updated_at = now() WHERE id = $1",
        )
        .bind(run_id)
        .bind(Json(segments))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Run {} not found", run_id)));
        }
        Ok(())
    }

    async fn request_cancel(&self, run_id: Uuid) -> Result<ExtractionRun, AppError> {
        sqlx::query(
            r#"
            UPDATE lead_extraction_runs
            SET cancel_requested = true, updated_at = now()
            WHERE id = $1 AND status = ANY($2)
            "#,
        )
        .bind(run_id)
        .bind(live_statuses())
        .execute(&self.pool)
        .await?;
        self.get_run(run_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Run {} not found", run_id)))
    }

    async fn record_recovery(&self, run_id: Uuid) -> Result<ExtractionRun, AppError> {
        self.fetch_run_returning(
            &format!(
                r#"
                UPDATE lead_extraction_runs
                SET watchdog_recoveries = watchdog_recoveries + 1, updated_at = now()
                WHERE id = $1
                RETURNING {}
                "#,
                RUN_COLUMNS
            ),
            run_id,
        )
        .await
    }

    async fn list_stale_runs(&self, cutoff: DateTime<Utc>) -> Result<Vec<ExtractionRun>, AppError> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            r#"
            SELECT {} FROM lead_extraction_runs
            WHERE status = ANY($1) AND updated_at < $2
            ORDER BY updated_at
            "#,
            RUN_COLUMNS
        ))
        .bind(live_statuses())
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ExtractionRun::try_from).collect()
    }

    async fn append_log(&self, entry: &ExtractionLogEntry) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO extraction_logs (id, run_id, step, step_number, level, message, details, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(entry.id)
        .bind(entry.run_id)
        .bind(entry.step.as_str())
        .bind(entry.step.number())
        .bind(entry.level.as_str())
        .bind(&entry.message)
        .bind(Json(&entry.details))
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_logs(&self, run_id: Uuid) -> Result<Vec<ExtractionLogEntry>, AppError> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT id, run_id, step, level, message, details, created_at
            FROM extraction_logs
            WHERE run_id = $1
            ORDER BY created_at, step_number
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<ExtractionLogEntry, AppError> {
                Ok(ExtractionLogEntry {
                    id: row.id,
                    run_id: row.run_id,
                    step: row.step.parse()?,
                    level: row.level.parse()?,
                    message: row.message,
                    details: row.details.0,
                    created_at: row.created_at,
                })
            })
            .collect()
    }

    async fn get_search_progress(
        &self,
        workspace_id: Uuid,
        query_hash: &str,
    ) -> Result<Option<SearchProgress>, AppError> {
        let row: Option<(i32, bool, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT last_page, exhausted, updated_at
            FROM search_progress
            WHERE workspace_id = $1 AND query_hash = $2
            "#,
        )
        .bind(workspace_id)
        .bind(query_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(last_page, exhausted, updated_at)| SearchProgress {
            workspace_id,
            query_hash: query_hash.to_string(),
            last_page: u32::try_from(last_page).unwrap_or(0),
            exhausted,
            updated_at,
        }))
    }

    async fn save_search_progress(&self, progress: &SearchProgress) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO search_progress (workspace_id, query_hash, last_page, exhausted, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (workspace_id, query_hash) DO UPDATE
            SET last_page = GREATEST(search_progress.last_page, EXCLUDED.last_page),
                exhausted = search_progress.exhausted OR EXCLUDED.exhausted,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(progress.workspace_id)
        .bind(&progress.query_hash)
        .bind(page_to_db(progress.last_page))
        .bind(progress.exhausted)
        .bind(progress.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl StagingStore for PgStore {
    async fn insert_staging(&self, record: &StagingRecord) -> Result<InsertOutcome, AppError> {
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO lead_extraction_staging (
                id, run_id, workspace_id, deduplication_hash, client_name, payload,
                contacts, enrichment, cnpj_normalized, domain, status_extraction,
                status_enrichment, enrichment_attempts, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (workspace_id, deduplication_hash) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(record.id)
        .bind(record.run_id)
        .bind(record.workspace_id)
        .bind(&record.deduplication_hash)
        .bind(&record.client_name)
        .bind(Json(&record.payload))
        .bind(Json(&record.contacts))
        .bind(Json(&record.enrichment))
        .bind(&record.cnpj_normalized)
        .bind(&record.domain)
        .bind(record.status_extraction.as_str())
        .bind(record.status_enrichment.as_str())
        .bind(record.enrichment_attempts)
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match inserted {
            Some((id,)) => InsertOutcome::Inserted(id),
            None => InsertOutcome::Duplicate,
        })
    }

    async fn get_staging(&self, staging_id: Uuid) -> Result<Option<StagingRecord>, AppError> {
        let row = sqlx::query_as::<_, StagingRow>(&format!(
            "SELECT {} FROM lead_extraction_staging WHERE id = $1",
            STAGING_COLUMNS
        ))
        .bind(staging_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(StagingRecord::try_from).transpose()
    }

    async fn list_pending_enrichment(
        &self,
        run_id: Uuid,
        limit: usize,
    ) -> Result<Vec<StagingRecord>, AppError> {
        let rows = sqlx::query_as::<_, StagingRow>(&format!(
            r#"
            SELECT {} FROM lead_extraction_staging
            WHERE run_id = $1 AND status_enrichment IN ('pending', 'in_progress')
            ORDER BY created_at
            LIMIT $2
            "#,
            STAGING_COLUMNS
        ))
        .bind(run_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(StagingRecord::try_from).collect()
    }

    async fn update_staging(&self, record: &StagingRecord) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        let current: StagingRecord = sqlx::query_as::<_, StagingRow>(&format!(
            "SELECT {} FROM lead_extraction_staging WHERE id = $1 FOR UPDATE",
            STAGING_COLUMNS
        ))
        .bind(record.id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Staging record {} not found", record.id)))?
        .try_into()?;
        current.check_update(record)?;

        sqlx::query(
            r#"
            UPDATE lead_extraction_staging
            SET client_name = $2,
                contacts = $3,
                enrichment = $4,
                cnpj_normalized = $5,
                domain = $6,
                status_extraction = $7,
                status_enrichment = $8,
                enrichment_attempts = $9,
                enrichment_error = $10,
                should_migrate = $11,
                filter_reason = $12,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(record.id)
        .bind(&record.client_name)
        .bind(Json(&record.contacts))
        .bind(Json(&record.enrichment))
        .bind(&record.cnpj_normalized)
        .bind(&record.domain)
        .bind(record.status_extraction.as_str())
        .bind(record.status_enrichment.as_str())
        .bind(record.enrichment_attempts)
        .bind(&record.enrichment_error)
        .bind(record.should_migrate)
        .bind(&record.filter_reason)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn list_migration_candidates(
        &self,
        run_id: Uuid,
        limit: i64,
    ) -> Result<Vec<StagingRecord>, AppError> {
        let rows = sqlx::query_as::<_, StagingRow>(&format!(
            r#"
            SELECT {} FROM lead_extraction_staging
            WHERE run_id = $1 AND should_migrate = true AND migrated_at IS NULL
            ORDER BY created_at
            LIMIT $2
            "#,
            STAGING_COLUMNS
        ))
        .bind(run_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(StagingRecord::try_from).collect()
    }

    async fn count_migration_candidates(&self, run_id: Uuid) -> Result<i64, AppError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM lead_extraction_staging
            WHERE run_id = $1 AND should_migrate = true AND migrated_at IS NULL
            "#,
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn list_staging(&self, run_id: Uuid) -> Result<Vec<StagingRecord>, AppError> {
        let rows = sqlx::query_as::<_, StagingRow>(&format!(
            "SELECT {} FROM lead_extraction_staging WHERE run_id = $1 ORDER BY created_at",
            STAGING_COLUMNS
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(StagingRecord::try_from).collect()
    }

    async fn migrate_record(
        &self,
        run_id: Uuid,
        staging_id: Uuid,
        lead: &NewLead,
    ) -> Result<MigrationOutcome, AppError> {
        let mut tx = self.pool.begin().await?;

        // Lock order: staging row, then run row.
        let (migrated_at,): (Option<DateTime<Utc>>,) = sqlx::query_as(
            "SELECT migrated_at FROM lead_extraction_staging WHERE id = $1 FOR UPDATE",
        )
        .bind(staging_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Staging record {} not found", staging_id)))?;
        if migrated_at.is_some() {
            return Ok(MigrationOutcome::AlreadyMigrated);
        }

        let run = Self::lock_run(&mut tx, run_id).await?;
        if run.status.is_terminal() || run.cancel_requested {
            return Ok(MigrationOutcome::RunClosed);
        }
        if run.counters.created_quantity >= run.target_quantity {
            return Ok(MigrationOutcome::CapacityReached);
        }

        let (lead_id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO leads (
                workspace_id, funnel_id, column_id, client_name, phone, email,
                company, source_run_id, custom_fields
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(lead.workspace_id)
        .bind(lead.funnel_id)
        .bind(lead.column_id)
        .bind(&lead.client_name)
        .bind(&lead.phone)
        .bind(&lead.email)
        .bind(&lead.company)
        .bind(lead.source_run_id)
        .bind(Json(&lead.custom_fields))
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE lead_extraction_staging
            SET migrated_lead_id = $2,
                migrated_at = now(),
                status_extraction = $3,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(staging_id)
        .bind(lead_id)
        .bind(ExtractionStatus::Migrated.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE lead_extraction_runs
            SET created_quantity = created_quantity + 1, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(MigrationOutcome::Migrated(lead_id))
    }
}

#[async_trait]
impl CrmDirectory for PgStore {
    async fn destination_exists(
        &self,
        workspace_id: Uuid,
        funnel_id: Uuid,
        column_id: Uuid,
    ) -> Result<bool, AppError> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM funnel_columns c
                JOIN funnels f ON f.id = c.funnel_id
                WHERE f.workspace_id = $1 AND f.id = $2 AND c.id = $3
            )
            "#,
        )
        .bind(workspace_id)
        .bind(funnel_id)
        .bind(column_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}
