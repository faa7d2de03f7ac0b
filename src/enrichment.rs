//! Enrichment stage: secondary lookups, consolidation and qualification.
//!
//! For each pending staging record of a run:
//! 1. WHOIS (registro.br domains), website scrape and CNPJ registry lookups run concurrently
//! 2. A CNPJ found in the WHOIS owner document triggers a follow-up registry lookup
//! 3. Contact fields are consolidated by source priority
//! 4. The consolidated phone is checked for WhatsApp
//! 5. The qualification filter decides `should_migrate`

use futures::stream::{self, StreamExt};
use moka::future::Cache;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::{guarded, ProviderBreakers};
use crate::config::PipelineSettings;
use crate::consolidation::consolidate;
use crate::errors::{AppError, ErrorClass};
use crate::filter::evaluate;
use crate::models::{
    CnpjCompany, EnrichmentStatus, ExtractionConfig, ExtractionRun, ExtractionStatus, LogLevel,
    PipelineStep, RunCounters, ScrapedContacts, StagingRecord, WhatsappCheck, WhoisData,
};
use crate::normalize::{extract_cnpj_from_text, is_br_domain};
use crate::retry::retry_with_backoff;
use crate::services::EnrichmentProviders;
use crate::store::StagingStore;
use crate::tracker::RunTracker;

/// Lookup results keyed by domain or CNPJ. `None` values cache "not found".
#[derive(Clone)]
pub struct LookupCaches {
    pub whois: Cache<String, Option<WhoisData>>,
    pub website: Cache<String, Option<ScrapedContacts>>,
    pub cnpj: Cache<String, Option<CnpjCompany>>,
}

impl LookupCaches {
    pub fn new(ttl: Duration) -> Self {
        Self {
            whois: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
            website: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
            cnpj: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(ttl)
                .build(),
        }
    }
}

/// Counts for one enrichment pass over a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnrichmentReport {
    pub processed: i64,
    pub completed: i64,
    pub skipped: i64,
    pub failed: i64,
    pub qualified: i64,
    pub filtered_out: i64,
    /// Set when the run was cancelled; in-flight results were discarded.
    pub cancelled: bool,
}

pub struct EnrichmentStage {
    tracker: RunTracker,
    staging: Arc<dyn StagingStore>,
    providers: EnrichmentProviders,
    breakers: ProviderBreakers,
    caches: LookupCaches,
    settings: PipelineSettings,
}

impl EnrichmentStage {
    pub fn new(
        tracker: RunTracker,
        staging: Arc<dyn StagingStore>,
        providers: EnrichmentProviders,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            tracker,
            staging,
            providers,
            breakers: ProviderBreakers::new(),
            caches: LookupCaches::new(settings.lookup_cache_ttl),
            settings,
        }
    }

    /// Enriches and qualifies every pending record of `run`.
    ///
    /// Records are processed in batches with bounded concurrency; cancellation
    /// is checked before each batch and again before its results are saved.
    pub async fn run(
        &self,
        run: &ExtractionRun,
        config: &ExtractionConfig,
    ) -> Result<EnrichmentReport, AppError> {
        let mut report = EnrichmentReport::default();
        let batch_size = self.settings.enrichment_batch_size.max(1);
        let concurrency = self.settings.enrichment_concurrency.max(1);

        loop {
            if self.tracker.is_cancel_requested(run.id).await? {
                report.cancelled = true;
                break;
            }

            let batch = self
                .staging
                .list_pending_enrichment(run.id, batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }
            tracing::info!(
                run_id = %run.id,
                "Enriching batch of {} records (concurrency {})",
                batch.len(),
                concurrency
            );

            let outcomes: Vec<Result<StagingRecord, AppError>> = stream::iter(batch)
                .map(|record| self.enrich_record(record))
                .buffer_unordered(concurrency)
                .collect()
                .await;

            if self.tracker.is_cancel_requested(run.id).await? {
                tracing::info!(run_id = %run.id, "Run cancelled mid-batch, discarding enrichment results");
                report.cancelled = true;
                break;
            }

            let mut delta = RunCounters::default();
            for outcome in outcomes {
                let mut record = outcome?;
                report.processed += 1;
                match record.status_enrichment {
                    EnrichmentStatus::Completed => report.completed += 1,
                    EnrichmentStatus::Skipped => report.skipped += 1,
                    _ => {
                        report.failed += 1;
                        delta.enrichment_failed += 1;
                    }
                }

                let verdict = evaluate(&record, &config.filters);
                record.should_migrate = Some(verdict.passes);
                record.filter_reason = Some(verdict.reason);
                record.status_extraction = ExtractionStatus::Filtered;
                self.staging.update_staging(&record).await?;

                if verdict.passes {
                    report.qualified += 1;
                } else {
                    report.filtered_out += 1;
                    delta.filtered_quantity += 1;
                }
            }
            if !delta.is_zero() {
                self.tracker.add_counters(run.id, delta).await?;
            }
        }

        self.tracker
            .log_with_details(
                run.id,
                PipelineStep::Enrichment,
                if report.failed > 0 {
                    LogLevel::Warning
                } else {
                    LogLevel::Success
                },
                format!(
                    "Enriched {} records: {} completed, {} skipped, {} failed",
                    report.processed, report.completed, report.skipped, report.failed
                ),
                json!(report),
            )
            .await;
        self.tracker
            .log(
                run.id,
                PipelineStep::Filter,
                LogLevel::Info,
                format!(
                    "{} records qualified, {} filtered out",
                    report.qualified, report.filtered_out
                ),
            )
            .await;

        Ok(report)
    }

    /// Runs the lookups for one record and consolidates the result.
    ///
    /// Lookup failures mark the record failed but keep whatever data the
    /// other lookups returned. Store errors and run-fatal provider errors
    /// (rejected credentials) propagate.
    async fn enrich_record(&self, mut record: StagingRecord) -> Result<StagingRecord, AppError> {
        record.status_enrichment = EnrichmentStatus::InProgress;
        record.enrichment_attempts += 1;
        self.staging.update_staging(&record).await?;

        let whois_domain = record
            .domain
            .clone()
            .filter(|d| is_br_domain(d) && self.providers.whois.is_some());
        let scrape_url = record
            .domain
            .as_ref()
            .and(record.payload.website())
            .filter(|_| self.providers.website.is_some())
            .map(str::to_string);
        let known_cnpj = record
            .cnpj_normalized
            .clone()
            .filter(|_| self.providers.cnpj.is_some());

        let (whois, website, cnpj) = tokio::join!(
            async {
                match &whois_domain {
                    Some(domain) => Some(self.lookup_whois(domain).await),
                    None => None,
                }
            },
            async {
                match &scrape_url {
                    Some(url) => Some(self.scrape_website(url).await),
                    None => None,
                }
            },
            async {
                match &known_cnpj {
                    Some(cnpj) => Some(self.lookup_cnpj(cnpj).await),
                    None => None,
                }
            },
        );

        let mut found_data = false;
        let mut errors: Vec<(&'static str, AppError)> = Vec::new();

        match whois {
            Some(Ok(Some(data))) => {
                found_data = true;
                record.enrichment.whois = Some(data);
            }
            Some(Err(e)) => errors.push(("whois", e)),
            _ => {}
        }
        match website {
            Some(Ok(Some(data))) => {
                found_data = true;
                record.enrichment.website = Some(data);
            }
            Some(Err(e)) => errors.push(("website", e)),
            _ => {}
        }
        match cnpj {
            Some(Ok(Some(company))) => {
                found_data = true;
                record.enrichment.cnpj = Some(company);
            }
            Some(Err(e)) => errors.push(("cnpj", e)),
            _ => {}
        }

        // The WHOIS owner of a .br domain is often the company's CNPJ.
        if record.cnpj_normalized.is_none() && self.providers.cnpj.is_some() {
            let owner_cnpj = record
                .enrichment
                .whois
                .as_ref()
                .and_then(|w| w.owner_document.as_deref())
                .and_then(extract_cnpj_from_text);
            if let Some(cnpj) = owner_cnpj {
                tracing::debug!(staging_id = %record.id, "CNPJ {} found in WHOIS owner", cnpj);
                record.cnpj_normalized = Some(cnpj.clone());
                match self.lookup_cnpj(&cnpj).await {
                    Ok(Some(company)) => {
                        found_data = true;
                        record.enrichment.cnpj = Some(company);
                    }
                    Ok(None) => {}
                    Err(e) => errors.push(("cnpj", e)),
                }
            }
        }

        record.contacts = consolidate(&record);

        if let (Some(validator), Some(phone)) =
            (&self.providers.whatsapp, record.contacts.phone.clone())
        {
            let policy = self.settings.retry_policy();
            let label = format!("whatsapp check {}", phone.value);
            let checked = retry_with_backoff(&policy, &label, || {
                guarded(
                    &self.breakers.whatsapp,
                    "whatsapp",
                    validator.has_whatsapp(&phone.value),
                )
            })
            .await;
            match checked {
                Ok(has_whatsapp) => {
                    found_data = true;
                    record.enrichment.whatsapp = Some(WhatsappCheck {
                        phone: phone.value.clone(),
                        has_whatsapp,
                    });
                }
                Err(e) => errors.push(("whatsapp", e)),
            }
        }

        if let Some((_, fatal)) = errors
            .iter()
            .find(|(_, e)| e.class() == ErrorClass::RunFatal)
        {
            return Err(fatal.clone());
        }

        record.status_extraction = ExtractionStatus::Enriched;
        if errors.is_empty() {
            record.enrichment_error = None;
            record.status_enrichment = if found_data {
                EnrichmentStatus::Completed
            } else {
                EnrichmentStatus::Skipped
            };
        } else {
            let reason = errors
                .iter()
                .map(|(provider, e)| format!("{}: {}", provider, e.sanitized()))
                .collect::<Vec<_>>()
                .join("; ");
            tracing::warn!(
                run_id = %record.run_id,
                staging_id = %record.id,
                "⚠ Enrichment failed for '{}': {}",
                record.client_name,
                reason
            );
            self.tracker
                .log_with_details(
                    record.run_id,
                    PipelineStep::Enrichment,
                    LogLevel::Warning,
                    format!("Enrichment failed for '{}'", record.client_name),
                    json!({ "staging_id": record.id, "reason": reason }),
                )
                .await;
            record.enrichment_error = Some(reason);
            record.status_enrichment = EnrichmentStatus::Failed;
        }

        Ok(record)
    }

    async fn lookup_whois(&self, domain: &str) -> Result<Option<WhoisData>, AppError> {
        let Some(provider) = &self.providers.whois else {
            return Ok(None);
        };
        if let Some(cached) = self.caches.whois.get(domain).await {
            tracing::debug!("✓ WHOIS cache hit for {}", domain);
            return Ok(cached);
        }

        let policy = self.settings.retry_policy();
        let label = format!("whois {}", domain);
        let result = retry_with_backoff(&policy, &label, || {
            guarded(&self.breakers.whois, "whois", provider.lookup(domain))
        })
        .await?;
        self.caches
            .whois
            .insert(domain.to_string(), result.clone())
            .await;
        Ok(result)
    }

    async fn scrape_website(&self, url: &str) -> Result<Option<ScrapedContacts>, AppError> {
        let Some(provider) = &self.providers.website else {
            return Ok(None);
        };
        if let Some(cached) = self.caches.website.get(url).await {
            return Ok(cached);
        }

        let policy = self.settings.retry_policy();
        let label = format!("scrape {}", url);
        let result = retry_with_backoff(&policy, &label, || {
            guarded(&self.breakers.website, "website", provider.scrape(url))
        })
        .await?;
        self.caches
            .website
            .insert(url.to_string(), result.clone())
            .await;
        Ok(result)
    }

    async fn lookup_cnpj(&self, cnpj: &str) -> Result<Option<CnpjCompany>, AppError> {
        let Some(provider) = &self.providers.cnpj else {
            return Ok(None);
        };
        if let Some(cached) = self.caches.cnpj.get(cnpj).await {
            tracing::debug!("✓ CNPJ cache hit for {}", cnpj);
            return Ok(cached);
        }

        let policy = self.settings.retry_policy();
        let label = format!("cnpj {}", cnpj);
        let result = retry_with_backoff(&policy, &label, || {
            guarded(&self.breakers.cnpj, "cnpj", provider.lookup(cnpj))
        })
        .await?;
        self.caches
            .cnpj
            .insert(cnpj.to_string(), result.clone())
            .await;
        Ok(result)
    }
}
