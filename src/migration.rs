//! Migration stage: moves qualified staging records into CRM leads.

use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::PipelineSettings;
use crate::errors::AppError;
use crate::models::{
    ExtractionConfig, LogLevel, MigrationOutcome, NewLead, PipelineStep, SourcePayload,
    StagingRecord,
};
use crate::normalize::format_cnpj;
use crate::store::StagingStore;
use crate::tracker::RunTracker;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MigrationReport {
    pub migrated: i64,
    pub already_migrated: i64,
    /// `target - created` after this pass.
    pub capacity_left: i64,
    /// Qualified records still waiting for migration.
    pub eligible_left: i64,
    /// The run finished or was flagged for cancellation during the pass.
    pub run_closed: bool,
}

/// Lead for a staging record, with provenance and source extras as custom fields.
pub fn build_lead(record: &StagingRecord, config: &ExtractionConfig) -> NewLead {
    let mut custom_fields = BTreeMap::new();
    custom_fields.insert("extraction_source".to_string(), config.source.to_string());

    if let Some(phone) = &record.contacts.phone {
        custom_fields.insert("phone_source".to_string(), phone.source.to_string());
    }
    if let Some(email) = &record.contacts.email {
        custom_fields.insert("email_source".to_string(), email.source.to_string());
    }
    if let Some(website) = &record.contacts.website {
        custom_fields.insert("website".to_string(), website.value.clone());
        custom_fields.insert("website_source".to_string(), website.source.to_string());
    }
    if let Some(check) = &record.enrichment.whatsapp {
        custom_fields.insert("has_whatsapp".to_string(), check.has_whatsapp.to_string());
    }

    let mut company = None;
    match &record.payload {
        SourcePayload::GoogleMaps(place) => {
            if let Some(rating) = place.rating {
                custom_fields.insert("rating".to_string(), rating.to_string());
            }
            if let Some(reviews) = place.rating_count {
                custom_fields.insert("reviews".to_string(), reviews.to_string());
            }
            if let Some(category) = &place.category {
                custom_fields.insert("category".to_string(), category.clone());
            }
            if let Some(address) = &place.address {
                custom_fields.insert("address".to_string(), address.clone());
            }
            company = Some(place.title.clone());
        }
        SourcePayload::Cnpj(found) => {
            company = found.razao_social.clone();
            if let Some(cnae) = &found.cnae_principal {
                custom_fields.insert("cnae".to_string(), cnae.clone());
            }
        }
        SourcePayload::Instagram(profile) => {
            custom_fields.insert("instagram".to_string(), format!("@{}", profile.username));
            custom_fields.insert("instagram_url".to_string(), profile.profile_url.clone());
            if let Some(followers) = profile.followers {
                custom_fields.insert("followers".to_string(), followers.to_string());
            }
        }
    }

    if let Some(cnpj) = &record.cnpj_normalized {
        custom_fields.insert("cnpj".to_string(), format_cnpj(cnpj));
    }
    if let Some(registry) = &record.enrichment.cnpj {
        if let Some(razao) = &registry.razao_social {
            custom_fields.insert("razao_social".to_string(), razao.clone());
            company = Some(razao.clone());
        }
        if let Some(situacao) = &registry.situacao {
            custom_fields.insert("situacao_cadastral".to_string(), situacao.clone());
        }
        if let Some(porte) = &registry.porte {
            custom_fields.insert("porte".to_string(), porte.clone());
        }
    }

    NewLead {
        workspace_id: record.workspace_id,
        funnel_id: config.funnel_id,
        column_id: config.column_id,
        client_name: record.client_name.clone(),
        phone: record.contacts.phone.as_ref().map(|p| p.value.clone()),
        email: record.contacts.email.as_ref().map(|e| e.value.clone()),
        company,
        source_run_id: record.run_id,
        custom_fields,
    }
}

pub struct MigrationStage {
    tracker: RunTracker,
    staging: Arc<dyn StagingStore>,
    settings: PipelineSettings,
}

impl MigrationStage {
    pub fn new(
        tracker: RunTracker,
        staging: Arc<dyn StagingStore>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            tracker,
            staging,
            settings,
        }
    }

    /// Migrates qualified records of `run_id` until the target is met, the
    /// candidates run out, the run closes or the batch allowance for this
    /// pass is spent.
    ///
    /// Callers must not run two passes for the same run at once; the store
    /// still refuses to overshoot the target if they do.
    pub async fn run(
        &self,
        run_id: Uuid,
        config: &ExtractionConfig,
    ) -> Result<MigrationReport, AppError> {
        let mut report = MigrationReport::default();

        'batches: for batch_number in 1..=self.settings.max_migration_batches.max(1) {
            let run = self.tracker.load_run(run_id).await?;
            if run.status.is_terminal() || run.cancel_requested {
                report.run_closed = true;
                break;
            }
            let capacity = run.remaining_capacity();
            if capacity == 0 {
                break;
            }

            let limit = self.settings.migration_batch_size.min(capacity);
            let candidates = self
                .staging
                .list_migration_candidates(run_id, limit)
                .await?;
            if candidates.is_empty() {
                break;
            }
            tracing::info!(
                run_id = %run_id,
                "Migration batch {}: {} candidates (capacity {})",
                batch_number,
                candidates.len(),
                capacity
            );

            for record in &candidates {
                let lead = build_lead(record, config);
                match self.staging.migrate_record(run_id, record.id, &lead).await? {
                    MigrationOutcome::Migrated(lead_id) => {
                        report.migrated += 1;
                        tracing::debug!(
                            run_id = %run_id,
                            staging_id = %record.id,
                            lead_id = %lead_id,
                            "✓ Migrated '{}'",
                            record.client_name
                        );
                    }
                    MigrationOutcome::AlreadyMigrated => report.already_migrated += 1,
                    MigrationOutcome::CapacityReached => break 'batches,
                    MigrationOutcome::RunClosed => {
                        tracing::info!(run_id = %run_id, "Run closed during migration, stopping");
                        report.run_closed = true;
                        break 'batches;
                    }
                }
            }
        }

        let run = self.tracker.load_run(run_id).await?;
        report.capacity_left = run.remaining_capacity();
        report.eligible_left = self.staging.count_migration_candidates(run_id).await?;

        self.tracker
            .log_with_details(
                run_id,
                PipelineStep::Migration,
                if report.migrated > 0 {
                    LogLevel::Success
                } else {
                    LogLevel::Info
                },
                format!(
                    "Migrated {} leads ({} of {} created)",
                    report.migrated, run.counters.created_quantity, run.target_quantity
                ),
                json!(report),
            )
            .await;

        Ok(report)
    }
}
