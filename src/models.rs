//! Domain records shared by the stages, the stores and the HTTP layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::errors::AppError;

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum stored as text.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = AppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(AppError::MalformedData(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

// ============ Extraction configuration ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    GoogleMaps,
    Cnpj,
    Instagram,
}

text_enum!(SourceType {
    GoogleMaps => "google_maps",
    Cnpj => "cnpj",
    Instagram => "instagram",
});

/// Qualification criteria. Every active criterion must hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualificationFilters {
    pub require_website: bool,
    pub require_phone: bool,
    pub require_email: bool,
    /// Active when set and greater than zero.
    pub min_reviews: Option<i64>,
    /// Active when set and greater than zero.
    pub min_rating: Option<f64>,
}

/// Extra search parameters for the CNPJ registry source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CnpjSearchFilters {
    pub uf: Option<String>,
    pub municipio: Option<String>,
    pub cnae: Option<String>,
    pub only_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub name: String,
    pub source: SourceType,
    pub search_term: String,
    pub location: String,
    pub target_quantity: i64,
    #[serde(default)]
    pub filters: QualificationFilters,
    pub funnel_id: Uuid,
    pub column_id: Uuid,
    /// Cron expression owned by the scheduler; informational here.
    #[serde(default)]
    pub schedule: Option<String>,
    /// Page budget override for runs of this config.
    #[serde(default)]
    pub max_pages: Option<u32>,
    #[serde(default)]
    pub cnpj_filters: Option<CnpjSearchFilters>,
}

impl ExtractionConfig {
    /// Validates what a run needs before it can start.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.target_quantity <= 0 {
            return Err(AppError::RunFatal(format!(
                "target_quantity must be positive, got {}",
                self.target_quantity
            )));
        }
        if self.source != SourceType::Cnpj && self.search_term.trim().is_empty() {
            return Err(AppError::RunFatal("search_term is empty".to_string()));
        }
        if let Some(rating) = self.filters.min_rating {
            if !(0.0..=5.0).contains(&rating) {
                return Err(AppError::RunFatal(format!(
                    "min_rating must be between 0 and 5, got {}",
                    rating
                )));
            }
        }
        Ok(())
    }
}

// ============ Runs ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Discovering,
    Enriching,
    Migrating,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

text_enum!(RunStatus {
    Pending => "pending",
    Discovering => "discovering",
    Enriching => "enriching",
    Migrating => "migrating",
    Completed => "completed",
    Partial => "partial",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl RunStatus {
    pub const ALL: [RunStatus; 8] = [
        RunStatus::Pending,
        RunStatus::Discovering,
        RunStatus::Enriching,
        RunStatus::Migrating,
        RunStatus::Completed,
        RunStatus::Partial,
        RunStatus::Failed,
        RunStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Partial | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Allowed edges of the run state machine.
    ///
    /// `migrating -> discovering` is the loop taken when migration still has
    /// capacity but no eligible records left. Any live run may be finalized;
    /// the tracker only picks `completed` once the target is met.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (*self, next),
            (Pending, Discovering)
                | (Discovering, Enriching)
                | (Enriching, Migrating)
                | (Migrating, Discovering)
                | (_, Completed)
                | (_, Partial)
                | (_, Failed)
                | (_, Cancelled)
        )
    }

    /// Every status that may move to `next`.
    pub fn predecessors(next: RunStatus) -> Vec<RunStatus> {
        Self::ALL
            .iter()
            .copied()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }
}

/// Progress counters. Also used as a delta for atomic increments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub found_quantity: i64,
    pub created_quantity: i64,
    pub filtered_quantity: i64,
    pub duplicates_skipped: i64,
    pub pages_consumed: i64,
    pub enrichment_failed: i64,
}

impl RunCounters {
    pub fn add(&mut self, delta: &RunCounters) {
        self.found_quantity += delta.found_quantity;
        self.created_quantity += delta.created_quantity;
        self.filtered_quantity += delta.filtered_quantity;
        self.duplicates_skipped += delta.duplicates_skipped;
        self.pages_consumed += delta.pages_consumed;
        self.enrichment_failed += delta.enrichment_failed;
    }

    pub fn is_zero(&self) -> bool {
        *self == RunCounters::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub status: RunStatus,
    pub at: DateTime<Utc>,
}

/// One execution of an extraction config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionRun {
    pub id: Uuid,
    pub config_id: Uuid,
    pub workspace_id: Uuid,
    pub source: SourceType,
    pub status: RunStatus,
    pub target_quantity: i64,
    pub counters: RunCounters,
    /// Last page fetched from the source, across resumptions.
    pub current_page: u32,
    pub source_exhausted: bool,
    pub cancel_requested: bool,
    pub watchdog_recoveries: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Heartbeat: bumped on every transition and counter change.
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub phase_history: Vec<PhaseTransition>,
    /// Sub-locations searched after the base location ran dry, in search order.
    #[serde(default)]
    pub search_segments: Vec<String>,
}

impl ExtractionRun {
    pub fn new(config: &ExtractionConfig, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            config_id: config.id,
            workspace_id: config.workspace_id,
            source: config.source,
            status: RunStatus::Pending,
            target_quantity: config.target_quantity,
            counters: RunCounters::default(),
            current_page: 0,
            source_exhausted: false,
            cancel_requested: false,
            watchdog_recoveries: 0,
            error_message: None,
            created_at: now,
            started_at: None,
            updated_at: now,
            finished_at: None,
            phase_history: vec![PhaseTransition {
                status: RunStatus::Pending,
                at: now,
            }],
            search_segments: Vec::new(),
        }
    }

    pub fn remaining_capacity(&self) -> i64 {
        (self.target_quantity - self.counters.created_quantity).max(0)
    }

    /// Applies a validated transition in place, stamping timestamps.
    pub fn apply_transition(
        &mut self,
        next: RunStatus,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::Conflict(format!(
                "run {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        if self.started_at.is_none() && next != RunStatus::Pending {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        if error_message.is_some() {
            self.error_message = error_message;
        }
        self.status = next;
        self.updated_at = now;
        self.phase_history.push(PhaseTransition { status: next, at: now });
        Ok(())
    }
}

// ============ Source payloads ============

/// A Google Maps place as returned by the Serper places endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapsPlace {
    #[serde(default)]
    pub cid: Option<String>,
    pub title: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub rating_count: Option<i64>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default, alias = "type")]
    pub category: Option<String>,
}

/// A company record from the CNPJ registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CnpjCompany {
    /// 14 digits, no punctuation.
    pub cnpj: String,
    #[serde(default)]
    pub razao_social: Option<String>,
    #[serde(default)]
    pub nome_fantasia: Option<String>,
    #[serde(default)]
    pub situacao: Option<String>,
    #[serde(default)]
    pub porte: Option<String>,
    #[serde(default)]
    pub capital_social: Option<f64>,
    #[serde(default)]
    pub cnae_principal: Option<String>,
    #[serde(default)]
    pub data_abertura: Option<String>,
    #[serde(default)]
    pub municipio: Option<String>,
    #[serde(default)]
    pub uf: Option<String>,
    #[serde(default)]
    pub phones: Vec<String>,
    #[serde(default)]
    pub emails: Vec<String>,
    /// Which registry answered (`cnpja`, `brasilapi`, or the search source).
    #[serde(default)]
    pub provider: Option<String>,
}

impl CnpjCompany {
    pub fn display_name(&self) -> &str {
        self.nome_fantasia
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .or(self.razao_social.as_deref())
            .unwrap_or(&self.cnpj)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstagramProfile {
    pub username: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub biography: Option<String>,
    #[serde(default)]
    pub external_url: Option<String>,
    #[serde(default)]
    pub followers: Option<i64>,
    pub profile_url: String,
}

/// Raw search result, tagged by the source that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", content = "data", rename_all = "snake_case")]
pub enum SourcePayload {
    GoogleMaps(MapsPlace),
    Cnpj(CnpjCompany),
    Instagram(InstagramProfile),
}

impl SourcePayload {
    pub fn source_type(&self) -> SourceType {
        match self {
            SourcePayload::GoogleMaps(_) => SourceType::GoogleMaps,
            SourcePayload::Cnpj(_) => SourceType::Cnpj,
            SourcePayload::Instagram(_) => SourceType::Instagram,
        }
    }

    /// Provenance tag for contact data read straight off the listing.
    pub fn listing_source(&self) -> DataSource {
        match self {
            SourcePayload::GoogleMaps(_) => DataSource::GoogleMaps,
            SourcePayload::Cnpj(_) => DataSource::CnpjRegistry,
            SourcePayload::Instagram(_) => DataSource::Instagram,
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            SourcePayload::GoogleMaps(place) => place.title.trim().to_string(),
            SourcePayload::Cnpj(company) => company.display_name().trim().to_string(),
            SourcePayload::Instagram(profile) => profile
                .full_name
                .as_deref()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or(&profile.username)
                .trim()
                .to_string(),
        }
    }

    pub fn rating(&self) -> Option<f64> {
        match self {
            SourcePayload::GoogleMaps(place) => place.rating,
            _ => None,
        }
    }

    pub fn review_count(&self) -> Option<i64> {
        match self {
            SourcePayload::GoogleMaps(place) => place.rating_count,
            _ => None,
        }
    }

    pub fn website(&self) -> Option<&str> {
        match self {
            SourcePayload::GoogleMaps(place) => place.website.as_deref(),
            SourcePayload::Cnpj(_) => None,
            SourcePayload::Instagram(profile) => profile.external_url.as_deref(),
        }
    }

    pub fn cnpj(&self) -> Option<&str> {
        match self {
            SourcePayload::Cnpj(company) => Some(company.cnpj.as_str()),
            _ => None,
        }
    }
}

// ============ Staging ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Discovered,
    Enriched,
    Filtered,
    Migrated,
}

text_enum!(ExtractionStatus {
    Discovered => "discovered",
    Enriched => "enriched",
    Filtered => "filtered",
    Migrated => "migrated",
});

impl ExtractionStatus {
    fn rank(&self) -> u8 {
        match self {
            ExtractionStatus::Discovered => 0,
            ExtractionStatus::Enriched => 1,
            ExtractionStatus::Filtered => 2,
            ExtractionStatus::Migrated => 3,
        }
    }

    /// True when `next` does not move backwards.
    pub fn allows(&self, next: ExtractionStatus) -> bool {
        next.rank() >= self.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    Pending,
    InProgress,
    Completed,
    /// Nothing to look up for this record.
    Skipped,
    /// A lookup exhausted its retries or returned unusable data.
    Failed,
}

text_enum!(EnrichmentStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
    Skipped => "skipped",
    Failed => "failed",
});

impl EnrichmentStatus {
    fn rank(&self) -> u8 {
        match self {
            EnrichmentStatus::Pending => 0,
            EnrichmentStatus::InProgress => 1,
            EnrichmentStatus::Completed | EnrichmentStatus::Skipped | EnrichmentStatus::Failed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    /// True when `next` is the same status or strictly further along.
    pub fn allows(&self, next: EnrichmentStatus) -> bool {
        *self == next || next.rank() > self.rank()
    }
}

/// Provenance of a consolidated contact field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    CnpjRegistry,
    GoogleMaps,
    WebsiteScrape,
    Instagram,
    Whois,
}

text_enum!(DataSource {
    CnpjRegistry => "cnpj_registry",
    GoogleMaps => "google_maps",
    WebsiteScrape => "website_scrape",
    Instagram => "instagram",
    Whois => "whois",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcedValue {
    pub value: String,
    pub source: DataSource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactChannels {
    pub phone: Option<SourcedValue>,
    pub email: Option<SourcedValue>,
    pub website: Option<SourcedValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WhoisData {
    pub domain: String,
    #[serde(default)]
    pub owner: Option<String>,
    /// Raw owner document (CNPJ or CPF) as published by registro.br.
    #[serde(default)]
    pub owner_document: Option<String>,
    #[serde(default)]
    pub phones: Vec<String>,
    #[serde(default)]
    pub emails: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapedContacts {
    pub url: String,
    #[serde(default)]
    pub phones: Vec<String>,
    #[serde(default)]
    pub emails: Vec<String>,
    #[serde(default)]
    pub whatsapp: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhatsappCheck {
    pub phone: String,
    pub has_whatsapp: bool,
}

/// Secondary lookups gathered during enrichment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentData {
    pub whois: Option<WhoisData>,
    pub cnpj: Option<CnpjCompany>,
    pub website: Option<ScrapedContacts>,
    pub whatsapp: Option<WhatsappCheck>,
}

/// Intermediate record for one discovered result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub workspace_id: Uuid,
    pub deduplication_hash: String,
    pub client_name: String,
    pub payload: SourcePayload,
    pub contacts: ContactChannels,
    pub enrichment: EnrichmentData,
    pub cnpj_normalized: Option<String>,
    pub domain: Option<String>,
    pub status_extraction: ExtractionStatus,
    pub status_enrichment: EnrichmentStatus,
    pub enrichment_attempts: i32,
    pub enrichment_error: Option<String>,
    pub should_migrate: Option<bool>,
    pub filter_reason: Option<String>,
    pub migrated_lead_id: Option<Uuid>,
    pub migrated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StagingRecord {
    pub fn discovered(
        run: &ExtractionRun,
        payload: SourcePayload,
        deduplication_hash: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id: run.id,
            workspace_id: run.workspace_id,
            deduplication_hash,
            client_name: payload.display_name(),
            payload,
            contacts: ContactChannels::default(),
            enrichment: EnrichmentData::default(),
            cnpj_normalized: None,
            domain: None,
            status_extraction: ExtractionStatus::Discovered,
            status_enrichment: EnrichmentStatus::Pending,
            enrichment_attempts: 0,
            enrichment_error: None,
            should_migrate: None,
            filter_reason: None,
            migrated_lead_id: None,
            migrated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_migrated(&self) -> bool {
        self.migrated_at.is_some()
    }

    /// Eligible for migration: filter passed and not migrated yet.
    pub fn is_migration_candidate(&self) -> bool {
        self.should_migrate == Some(true) && self.migrated_at.is_none()
    }

    /// Checks that `next` keeps statuses monotonic and migration linkage immutable.
    pub fn check_update(&self, next: &StagingRecord) -> Result<(), AppError> {
        if !self.status_extraction.allows(next.status_extraction) {
            return Err(AppError::InternalError(format!(
                "staging {} extraction status cannot move from {} to {}",
                self.id, self.status_extraction, next.status_extraction
            )));
        }
        if !self.status_enrichment.allows(next.status_enrichment) {
            return Err(AppError::InternalError(format!(
                "staging {} enrichment status cannot move from {} to {}",
                self.id, self.status_enrichment, next.status_enrichment
            )));
        }
        if self.migrated_at.is_some()
            && (next.migrated_at != self.migrated_at || next.migrated_lead_id != self.migrated_lead_id)
        {
            return Err(AppError::InternalError(format!(
                "staging {} migration linkage is immutable",
                self.id
            )));
        }
        Ok(())
    }
}

/// Result of inserting a staging record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Uuid),
    /// The workspace already holds a record with this hash.
    Duplicate,
}

// ============ CRM leads ============

/// Lead handed to the CRM pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLead {
    pub workspace_id: Uuid,
    pub funnel_id: Uuid,
    pub column_id: Uuid,
    pub client_name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub company: Option<String>,
    pub source_run_id: Uuid,
    pub custom_fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    Migrated(Uuid),
    /// `migrated_at` was already set; nothing written.
    AlreadyMigrated,
    /// The run reached its target; nothing written.
    CapacityReached,
    /// The run is finished or being cancelled; nothing written.
    RunClosed,
}

// ============ Search progress & logs ============

/// How far a query has been paged for a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchProgress {
    pub workspace_id: Uuid,
    pub query_hash: String,
    pub last_page: u32,
    pub exhausted: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Start,
    Discovery,
    Enrichment,
    Filter,
    Migration,
    Finalize,
    Watchdog,
}

text_enum!(PipelineStep {
    Start => "start",
    Discovery => "discovery",
    Enrichment => "enrichment",
    Filter => "filter",
    Migration => "migration",
    Finalize => "finalize",
    Watchdog => "watchdog",
});

impl PipelineStep {
    pub fn number(&self) -> i32 {
        match self {
            PipelineStep::Start => 1,
            PipelineStep::Discovery => 2,
            PipelineStep::Enrichment => 3,
            PipelineStep::Filter => 4,
            PipelineStep::Migration => 5,
            PipelineStep::Finalize => 6,
            PipelineStep::Watchdog => 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

text_enum!(LogLevel {
    Info => "info",
    Success => "success",
    Warning => "warning",
    Error => "error",
});

/// User-facing diagnostic line attached to a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionLogEntry {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step: PipelineStep,
    pub level: LogLevel,
    pub message: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl ExtractionLogEntry {
    pub fn new(run_id: Uuid, step: PipelineStep, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            step,
            level,
            message: message.into(),
            details: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_machine_edges() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Discovering));
        assert!(RunStatus::Migrating.can_transition_to(RunStatus::Discovering));
        assert!(RunStatus::Enriching.can_transition_to(RunStatus::Partial));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Enriching));
        assert!(!RunStatus::Discovering.can_transition_to(RunStatus::Migrating));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Cancelled.can_transition_to(RunStatus::Discovering));
    }

    #[test]
    fn test_predecessors_of_discovering() {
        assert_eq!(
            RunStatus::predecessors(RunStatus::Discovering),
            vec![RunStatus::Pending, RunStatus::Migrating]
        );
        assert_eq!(RunStatus::predecessors(RunStatus::Completed).len(), 4);
    }

    #[test]
    fn test_enrichment_status_never_moves_back() {
        assert!(EnrichmentStatus::Pending.allows(EnrichmentStatus::InProgress));
        assert!(EnrichmentStatus::InProgress.allows(EnrichmentStatus::Failed));
        assert!(!EnrichmentStatus::Completed.allows(EnrichmentStatus::Pending));
        assert!(!EnrichmentStatus::Skipped.allows(EnrichmentStatus::Completed));
        assert!(EnrichmentStatus::Skipped.allows(EnrichmentStatus::Skipped));
    }

    #[test]
    fn test_text_enum_round_trip_and_unknown_value() {
        assert_eq!("in_progress".parse::<EnrichmentStatus>().unwrap(), EnrichmentStatus::InProgress);
        assert_eq!(DataSource::CnpjRegistry.to_string(), "cnpj_registry");
        assert!("exploded".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_payload_tagging() {
        let payload = SourcePayload::Instagram(InstagramProfile {
            username: "padaria".into(),
            profile_url: "https://instagram.com/padaria".into(),
            ..Default::default()
        });
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["source"], "instagram");
        assert_eq!(value["data"]["username"], "padaria");
    }
}
