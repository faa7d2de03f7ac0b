use crate::errors::AppError;
use crate::models::{ExtractionLogEntry, ExtractionRun, StagingRecord};
use crate::pipeline::Pipeline;
use crate::watchdog::{SweepReport, Watchdog};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Stage orchestrator; handlers only enqueue and read.
    pub pipeline: Arc<Pipeline>,
    /// Watchdog, for on-demand sweeps.
    pub watchdog: Arc<Watchdog>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct StartRunRequest {
    pub config_id: Uuid,
}

/// Run progress as exposed to pollers.
#[derive(Debug, Serialize, ToSchema)]
pub struct RunView {
    pub id: Uuid,
    pub config_id: Uuid,
    pub workspace_id: Uuid,
    pub source: String,
    pub status: String,
    pub target_quantity: i64,
    pub found_quantity: i64,
    pub created_quantity: i64,
    pub filtered_quantity: i64,
    pub duplicates_skipped: i64,
    pub pages_consumed: i64,
    pub enrichment_failed: i64,
    pub current_page: u32,
    pub source_exhausted: bool,
    pub cancel_requested: bool,
    pub watchdog_recoveries: i32,
    /// Sub-locations searched after the base location ran dry.
    pub search_segments: Vec<String>,
    /// `created / target` as a percentage.
    pub progress_percent: f64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<ExtractionRun> for RunView {
    fn from(run: ExtractionRun) -> Self {
        let progress_percent = if run.target_quantity > 0 {
            (run.counters.created_quantity as f64 / run.target_quantity as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
        Self {
            id: run.id,
            config_id: run.config_id,
            workspace_id: run.workspace_id,
            source: run.source.to_string(),
            status: run.status.to_string(),
            target_quantity: run.target_quantity,
            found_quantity: run.counters.found_quantity,
            created_quantity: run.counters.created_quantity,
            filtered_quantity: run.counters.filtered_quantity,
            duplicates_skipped: run.counters.duplicates_skipped,
            pages_consumed: run.counters.pages_consumed,
            enrichment_failed: run.counters.enrichment_failed,
            current_page: run.current_page,
            source_exhausted: run.source_exhausted,
            cancel_requested: run.cancel_requested,
            watchdog_recoveries: run.watchdog_recoveries,
            search_segments: run.search_segments,
            progress_percent,
            error_message: run.error_message,
            created_at: run.created_at,
            started_at: run.started_at,
            updated_at: run.updated_at,
            finished_at: run.finished_at,
        }
    }
}

/// One staging record, flattened for diagnostics.
#[derive(Debug, Serialize, ToSchema)]
pub struct StagingSummary {
    pub id: Uuid,
    pub client_name: String,
    pub status_extraction: String,
    pub status_enrichment: String,
    pub phone: Option<String>,
    pub phone_source: Option<String>,
    pub email: Option<String>,
    pub email_source: Option<String>,
    pub website: Option<String>,
    pub website_source: Option<String>,
    pub cnpj: Option<String>,
    pub should_migrate: Option<bool>,
    pub filter_reason: Option<String>,
    pub enrichment_error: Option<String>,
    pub migrated_lead_id: Option<Uuid>,
}

impl From<StagingRecord> for StagingSummary {
    fn from(record: StagingRecord) -> Self {
        let split = |value: Option<crate::models::SourcedValue>| match value {
            Some(v) => (Some(v.value), Some(v.source.to_string())),
            None => (None, None),
        };
        let (phone, phone_source) = split(record.contacts.phone);
        let (email, email_source) = split(record.contacts.email);
        let (website, website_source) = split(record.contacts.website);
        Self {
            id: record.id,
            client_name: record.client_name,
            status_extraction: record.status_extraction.to_string(),
            status_enrichment: record.status_enrichment.to_string(),
            phone,
            phone_source,
            email,
            email_source,
            website,
            website_source,
            cnpj: record.cnpj_normalized,
            should_migrate: record.should_migrate,
            filter_reason: record.filter_reason,
            enrichment_error: record.enrichment_error,
            migrated_lead_id: record.migrated_lead_id,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LogView {
    pub id: Uuid,
    pub step: String,
    pub step_number: i32,
    pub level: String,
    pub message: String,
    #[schema(value_type = Object)]
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl From<ExtractionLogEntry> for LogView {
    fn from(entry: ExtractionLogEntry) -> Self {
        Self {
            id: entry.id,
            step: entry.step.to_string(),
            step_number: entry.step.number(),
            level: entry.level.to_string(),
            message: entry.message,
            details: entry.details,
            created_at: entry.created_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FinalizedRunView {
    pub run_id: Uuid,
    pub status: String,
    pub reason: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SweepView {
    pub stale_runs: usize,
    pub requeued: Vec<Uuid>,
    pub finalized: Vec<FinalizedRunView>,
}

impl From<SweepReport> for SweepView {
    fn from(report: SweepReport) -> Self {
        Self {
            stale_runs: report.stale_runs,
            requeued: report.requeued,
            finalized: report
                .finalized
                .into_iter()
                .map(|f| FinalizedRunView {
                    run_id: f.run_id,
                    status: f.status.to_string(),
                    reason: f.reason,
                })
                .collect(),
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(health, start_run, get_run, cancel_run, list_staging, list_logs, sweep_watchdog),
    components(schemas(
        StartRunRequest,
        RunView,
        StagingSummary,
        LogView,
        SweepView,
        FinalizedRunView
    )),
    tags((name = "lead-extraction", description = "Lead extraction runs"))
)]
pub struct ApiDoc;

/// Routes under `/api/v1`, without middleware.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/runs", post(start_run))
        .route("/api/v1/runs/:id", get(get_run))
        .route("/api/v1/runs/:id/cancel", post(cancel_run))
        .route("/api/v1/runs/:id/staging", get(list_staging))
        .route("/api/v1/runs/:id/logs", get(list_logs))
        .route("/api/v1/watchdog/sweep", post(sweep_watchdog))
}

/// Health check endpoint.
///
/// Returns the service status, version, and health information.
///
/// # Returns
///
/// * `(StatusCode, Json<serde_json::Value>)` - HTTP 200 OK with health status JSON.
#[utoipa::path(get, path = "/health", tag = "lead-extraction", responses((status = 200, description = "Service is up")))]
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "rust-lead-extraction",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// POST /api/v1/runs
///
/// Creates a run for an extraction config and queues it. The run executes in
/// the background; poll `GET /api/v1/runs/{id}` for progress.
///
/// # Arguments
///
/// * `state` - The application state.
/// * `request` - Body carrying the config id.
///
/// # Returns
///
/// * `Result<(StatusCode, Json<RunView>), AppError>` - 202 with the pending run, 404 for an
///   unknown config, 409 when the workspace is at its active-run limit.
#[utoipa::path(
    post,
    path = "/api/v1/runs",
    tag = "lead-extraction",
    request_body = StartRunRequest,
    responses(
        (status = 202, description = "Run queued", body = RunView),
        (status = 404, description = "Config not found"),
        (status = 409, description = "Too many active runs for the workspace")
    )
)]
pub async fn start_run(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartRunRequest>,
) -> Result<(StatusCode, Json<RunView>), AppError> {
    tracing::info!("POST /runs - config_id: {}", request.config_id);
    let run = state.pipeline.start_run(request.config_id).await?;
    Ok((StatusCode::ACCEPTED, Json(run.into())))
}

/// GET /api/v1/runs/:id
#[utoipa::path(
    get,
    path = "/api/v1/runs/{id}",
    tag = "lead-extraction",
    params(("id" = Uuid, Path, description = "Run id")),
    responses(
        (status = 200, description = "Run progress", body = RunView),
        (status = 404, description = "Run not found")
    )
)]
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<RunView>, AppError> {
    let run = state.pipeline.tracker().load_run(id).await?;
    Ok(Json(run.into()))
}

/// POST /api/v1/runs/:id/cancel
///
/// Requests cooperative cancellation. The run moves to `cancelled` at the
/// next stage boundary; a finished run is returned unchanged.
#[utoipa::path(
    post,
    path = "/api/v1/runs/{id}/cancel",
    tag = "lead-extraction",
    params(("id" = Uuid, Path, description = "Run id")),
    responses(
        (status = 202, description = "Cancellation requested", body = RunView),
        (status = 404, description = "Run not found")
    )
)]
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<RunView>), AppError> {
    tracing::info!("POST /runs/{}/cancel", id);
    let run = state.pipeline.request_cancel(id).await?;
    Ok((StatusCode::ACCEPTED, Json(run.into())))
}

/// GET /api/v1/runs/:id/staging
#[utoipa::path(
    get,
    path = "/api/v1/runs/{id}/staging",
    tag = "lead-extraction",
    params(("id" = Uuid, Path, description = "Run id")),
    responses(
        (status = 200, description = "Staging records of the run", body = [StagingSummary]),
        (status = 404, description = "Run not found")
    )
)]
pub async fn list_staging(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<StagingSummary>>, AppError> {
    let records = state.pipeline.list_staging(id).await?;
    Ok(Json(records.into_iter().map(StagingSummary::from).collect()))
}

/// GET /api/v1/runs/:id/logs
#[utoipa::path(
    get,
    path = "/api/v1/runs/{id}/logs",
    tag = "lead-extraction",
    params(("id" = Uuid, Path, description = "Run id")),
    responses(
        (status = 200, description = "Extraction log of the run", body = [LogView]),
        (status = 404, description = "Run not found")
    )
)]
pub async fn list_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<LogView>>, AppError> {
    let tracker = state.pipeline.tracker();
    tracker.load_run(id).await?;
    let logs = tracker.store().list_logs(id).await?;
    Ok(Json(logs.into_iter().map(LogView::from).collect()))
}

/// POST /api/v1/watchdog/sweep
///
/// Runs one watchdog pass immediately.
#[utoipa::path(
    post,
    path = "/api/v1/watchdog/sweep",
    tag = "lead-extraction",
    responses((status = 200, description = "Sweep report", body = SweepView))
)]
pub async fn sweep_watchdog(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SweepView>, AppError> {
    let report = state.watchdog.sweep(Utc::now()).await?;
    Ok(Json(report.into()))
}

/// GET /api-docs/openapi.json
pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
