//! Discovery stage: pages through a search source and stages new candidates.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

use crate::config::PipelineSettings;
use crate::errors::AppError;
use crate::hashing::{deduplication_hash, query_hash};
use crate::location::{clean_sub_locations, neighborhood_of, parse_location};
use crate::models::{
    ExtractionConfig, ExtractionRun, InsertOutcome, LogLevel, PipelineStep, RunCounters,
    SearchProgress, SourcePayload, SourceType, StagingRecord,
};
use crate::normalize::{business_domain, normalize_cnpj};
use crate::retry::retry_with_backoff;
use crate::services::{SearchPage, SearchRequest, SearchSources};
use crate::store::StagingStore;
use crate::tracker::RunTracker;

/// Outcome of one discovery round.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiscoveryReport {
    pub pages_fetched: u32,
    pub inserted: i64,
    pub duplicates: i64,
    /// Results dropped because they carried no usable identity.
    pub malformed: i64,
    pub source_exhausted: bool,
    pub budget_consumed: bool,
}

/// Pages needed to cover `remaining` leads at `per_page` results a page.
pub fn pages_for(remaining: i64, per_page: u32) -> u32 {
    if remaining <= 0 {
        return 0;
    }
    let per_page = i64::from(per_page.max(1));
    ((remaining + per_page - 1) / per_page) as u32
}

/// Leads one sub-location is expected to yield.
const LEADS_PER_SUB_LOCATION: usize = 15;
const MIN_SUB_LOCATIONS: usize = 5;

/// A search the round can page through: the base location or a sub-location.
#[derive(Debug, Clone)]
struct SearchTarget {
    request: SearchRequest,
    query_hash: String,
    /// Sub-locations stop after this many pages.
    page_cap: Option<u32>,
}

pub struct DiscoveryStage {
    tracker: RunTracker,
    staging: Arc<dyn StagingStore>,
    sources: SearchSources,
    settings: PipelineSettings,
}

impl DiscoveryStage {
    pub fn new(
        tracker: RunTracker,
        staging: Arc<dyn StagingStore>,
        sources: SearchSources,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            tracker,
            staging,
            sources,
            settings,
        }
    }

    /// Page budget for a run of `config`.
    pub fn page_budget(&self, config: &ExtractionConfig) -> u32 {
        config.max_pages.unwrap_or(self.settings.max_pages_per_run)
    }

    /// Runs one discovery round for `run`.
    ///
    /// Fetches enough pages to cover the remaining capacity (bounded by the
    /// page budget), resuming after the last page this workspace fetched for
    /// the same query. When the base location runs dry the round moves on to
    /// the run's sub-locations, asking the location expander for some if the
    /// run has none yet. The source counts as exhausted only once every
    /// search is. Stops early when the run is cancelled.
    pub async fn run(
        &self,
        run: &ExtractionRun,
        config: &ExtractionConfig,
    ) -> Result<DiscoveryReport, AppError> {
        let source = self.sources.get(config.source).ok_or_else(|| {
            AppError::RunFatal(format!("no search source configured for {}", config.source))
        })?;
        let store = self.tracker.store();
        let mut report = DiscoveryReport::default();

        let budget = self.page_budget(config);
        let consumed = u32::try_from(run.counters.pages_consumed).unwrap_or(u32::MAX);
        let budget_left = budget.saturating_sub(consumed);
        let mut pages_left = pages_for(run.remaining_capacity(), self.settings.results_per_page)
            .max(1)
            .min(budget_left);

        let mut segments = run.search_segments.clone();
        let mut targets: Vec<SearchTarget> = std::iter::once(self.base_target(config))
            .chain(segments.iter().map(|s| self.sub_location_target(config, s)))
            .collect();
        let mut expanded = false;
        let mut last_page = run.current_page;
        let policy = self.settings.retry_policy();
        let mut index = 0;

        tracing::info!(
            run_id = %run.id,
            source = %config.source,
            "Discovery round: up to {} pages over {} searches (budget left {})",
            pages_left,
            targets.len(),
            budget_left
        );

        'targets: loop {
            if index == targets.len() {
                if expanded || pages_left == 0 {
                    report.source_exhausted = true;
                    break;
                }
                expanded = true;
                let added = self.expand(run, config, &mut segments).await?;
                if added.is_empty() {
                    report.source_exhausted = true;
                    break;
                }
                targets.extend(added.iter().map(|s| self.sub_location_target(config, s)));
                continue;
            }
            let target = &targets[index];

            let progress = store
                .get_search_progress(run.workspace_id, &target.query_hash)
                .await?;
            let resume_after = progress.as_ref().map(|p| p.last_page).unwrap_or(0);
            let capped = target.page_cap.is_some_and(|cap| resume_after >= cap);
            if progress.as_ref().is_some_and(|p| p.exhausted) || capped {
                if capped && progress.as_ref().is_some_and(|p| !p.exhausted) {
                    self.save_progress(run, target, resume_after, true).await?;
                }
                tracing::debug!(
                    run_id = %run.id,
                    location = %target.request.location,
                    "Search already exhausted, skipping"
                );
                index += 1;
                continue;
            }
            if pages_left == 0 {
                break;
            }

            let mut page = resume_after + 1;
            let mut target_exhausted = false;
            while pages_left > 0 {
                if target.page_cap.is_some_and(|cap| page > cap) {
                    target_exhausted = true;
                    break;
                }
                if self.tracker.is_cancel_requested(run.id).await? {
                    tracing::info!(run_id = %run.id, "Cancellation requested, stopping discovery");
                    break 'targets;
                }

                let label = format!("{} page {}", config.source, page);
                let request = &target.request;
                let result =
                    retry_with_backoff(&policy, &label, || source.fetch_page(request, page))
                        .await?;
                let payloads = match result {
                    SearchPage::Exhausted => {
                        target_exhausted = true;
                        break;
                    }
                    SearchPage::Results(payloads) => payloads,
                };

                let delta = self.stage_page(run, config, payloads, &mut report).await?;
                report.pages_fetched += 1;
                pages_left -= 1;
                last_page = page;

                self.tracker.add_counters(run.id, delta).await?;
                store.record_pages(run.id, page, false).await?;
                self.save_progress(run, target, page, false).await?;
                page += 1;
            }

            if !target_exhausted {
                break;
            }
            self.save_progress(run, target, page - 1, true).await?;
            tracing::info!(
                run_id = %run.id,
                "Search for '{}' in '{}' exhausted after page {}",
                target.request.search_term,
                target.request.location,
                page - 1
            );
            index += 1;
        }

        if report.source_exhausted {
            store.record_pages(run.id, last_page, true).await?;
            if report.pages_fetched == 0 {
                self.tracker
                    .log(
                        run.id,
                        PipelineStep::Discovery,
                        LogLevel::Warning,
                        "Search already exhausted for this query, no new pages fetched",
                    )
                    .await;
            }
        }
        report.budget_consumed = consumed.saturating_add(report.pages_fetched) >= budget;

        let level = if report.inserted > 0 {
            LogLevel::Success
        } else {
            LogLevel::Info
        };
        self.tracker
            .log_with_details(
                run.id,
                PipelineStep::Discovery,
                level,
                format!(
                    "Fetched {} pages: {} new, {} duplicates{}",
                    report.pages_fetched,
                    report.inserted,
                    report.duplicates,
                    if report.source_exhausted {
                        ", source exhausted"
                    } else {
                        ""
                    }
                ),
                json!(report),
            )
            .await;

        Ok(report)
    }

    fn base_target(&self, config: &ExtractionConfig) -> SearchTarget {
        SearchTarget {
            query_hash: query_hash(
                config.source,
                &config.search_term,
                &config.location,
                config.cnpj_filters.as_ref(),
            ),
            request: SearchRequest {
                search_term: config.search_term.clone(),
                location: config.location.clone(),
                cnpj_filters: config.cnpj_filters.clone(),
                page_size: self.settings.results_per_page,
            },
            page_cap: None,
        }
    }

    /// Search for `"{term} {neighborhood}"` in the sub-location.
    fn sub_location_target(&self, config: &ExtractionConfig, sub_location: &str) -> SearchTarget {
        let search_term = format!("{} {}", config.search_term, neighborhood_of(sub_location));
        SearchTarget {
            query_hash: query_hash(
                config.source,
                &search_term,
                sub_location,
                config.cnpj_filters.as_ref(),
            ),
            request: SearchRequest {
                search_term,
                location: sub_location.to_string(),
                cnpj_filters: config.cnpj_filters.clone(),
                page_size: self.settings.results_per_page,
            },
            page_cap: Some(self.settings.max_pages_per_sub_location.max(1)),
        }
    }

    async fn save_progress(
        &self,
        run: &ExtractionRun,
        target: &SearchTarget,
        last_page: u32,
        exhausted: bool,
    ) -> Result<(), AppError> {
        self.tracker
            .store()
            .save_search_progress(&SearchProgress {
                workspace_id: run.workspace_id,
                query_hash: target.query_hash.clone(),
                last_page,
                exhausted,
                updated_at: Utc::now(),
            })
            .await
    }

    /// Asks the location expander for sub-locations of the config's location
    /// and stores the new ones on the run. Returns what was added.
    ///
    /// Maps searches only; neighborhoods are not split further. Expansion
    /// failures are logged and leave the run without new sub-locations.
    async fn expand(
        &self,
        run: &ExtractionRun,
        config: &ExtractionConfig,
        segments: &mut Vec<String>,
    ) -> Result<Vec<String>, AppError> {
        let Some(expander) = self.sources.location_expander() else {
            return Ok(Vec::new());
        };
        if config.source != SourceType::GoogleMaps {
            return Ok(Vec::new());
        }
        let room = self.settings.max_sub_locations.saturating_sub(segments.len());
        if room == 0 {
            return Ok(Vec::new());
        }
        let Some(parsed) = parse_location(&config.location) else {
            tracing::info!(run_id = %run.id, "'{}' is a neighborhood, not expanding", config.location);
            return Ok(Vec::new());
        };

        let remaining = usize::try_from(run.remaining_capacity()).unwrap_or(0);
        let wanted = remaining
            .div_ceil(LEADS_PER_SUB_LOCATION)
            .max(MIN_SUB_LOCATIONS)
            .min(room);
        let policy = self.settings.retry_policy();
        let searched: &[String] = segments;
        let candidates = match retry_with_backoff(&policy, "location expansion", || {
            expander.sub_locations(&config.search_term, &parsed, searched, wanted)
        })
        .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!(run_id = %run.id, "Location expansion failed: {}", e);
                self.tracker
                    .log(
                        run.id,
                        PipelineStep::Discovery,
                        LogLevel::Warning,
                        format!("Location expansion failed: {}", e.sanitized()),
                    )
                    .await;
                return Ok(Vec::new());
            }
        };

        let mut added = clean_sub_locations(candidates, segments, &parsed);
        added.truncate(room);
        if added.is_empty() {
            return Ok(added);
        }
        segments.extend(added.iter().cloned());
        self.tracker
            .store()
            .save_search_segments(run.id, segments)
            .await?;
        self.tracker
            .log_with_details(
                run.id,
                PipelineStep::Discovery,
                LogLevel::Info,
                format!(
                    "'{}' ran dry, searching {} sub-locations",
                    config.location,
                    added.len()
                ),
                json!({ "level": parsed.level, "sub_locations": added }),
            )
            .await;
        Ok(added)
    }

    /// Stages one page of results and returns the counter delta.
    async fn stage_page(
        &self,
        run: &ExtractionRun,
        config: &ExtractionConfig,
        payloads: Vec<SourcePayload>,
        report: &mut DiscoveryReport,
    ) -> Result<RunCounters, AppError> {
        let mut delta = RunCounters {
            pages_consumed: 1,
            ..RunCounters::default()
        };
        let mut seen: HashSet<String> = HashSet::new();
        let now = Utc::now();

        for payload in payloads {
            let hash = match deduplication_hash(&payload, &config.location) {
                Ok(hash) => hash,
                Err(e) => {
                    report.malformed += 1;
                    tracing::warn!(run_id = %run.id, "Skipping result without identity: {}", e);
                    self.tracker
                        .log(
                            run.id,
                            PipelineStep::Discovery,
                            LogLevel::Warning,
                            format!("Skipped result: {}", e.sanitized()),
                        )
                        .await;
                    continue;
                }
            };
            if !seen.insert(hash.clone()) {
                delta.duplicates_skipped += 1;
                continue;
            }

            let mut record = StagingRecord::discovered(run, payload, hash, now);
            record.cnpj_normalized = record.payload.cnpj().and_then(normalize_cnpj);
            record.domain = record.payload.website().and_then(business_domain);

            match self.staging.insert_staging(&record).await? {
                InsertOutcome::Inserted(_) => delta.found_quantity += 1,
                InsertOutcome::Duplicate => delta.duplicates_skipped += 1,
            }
        }

        report.inserted += delta.found_quantity;
        report.duplicates += delta.duplicates_skipped;
        tracing::debug!(
            run_id = %run.id,
            inserted = delta.found_quantity,
            duplicates = delta.duplicates_skipped,
            "Staged page"
        );
        Ok(delta)
    }
}
