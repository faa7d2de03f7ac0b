//! Shared fixtures: scripted sources, canned providers and a pipeline wired to
//! the in-memory store.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use uuid::Uuid;

use rust_lead_extraction::config::PipelineSettings;
use rust_lead_extraction::errors::AppError;
use rust_lead_extraction::memory_store::MemoryStore;
use rust_lead_extraction::models::{
    CnpjCompany, ExtractionConfig, ExtractionRun, MapsPlace, QualificationFilters, SourcePayload,
    SourceType, WhoisData,
};
use rust_lead_extraction::notifications::EventBus;
use rust_lead_extraction::pipeline::{Pipeline, Stores};
use rust_lead_extraction::queue::{JobQueue, JobReceiver};
use rust_lead_extraction::services::{
    CnpjRegistry, EnrichmentProviders, SearchPage, SearchRequest, SearchSource, SearchSources,
    WhoisLookup,
};
use rust_lead_extraction::store::RunStore;

/// Settings with no backoff so retries do not slow the suite down.
pub fn test_settings() -> PipelineSettings {
    PipelineSettings {
        results_per_page: 10,
        max_pages_per_run: 20,
        backoff_base: Duration::ZERO,
        backoff_max: Duration::ZERO,
        worker_count: 2,
        ..PipelineSettings::default()
    }
}

/// `count` distinct Maps places starting at `start`.
pub fn maps_page(start: usize, count: usize) -> Vec<SourcePayload> {
    (start..start + count)
        .map(|i| {
            SourcePayload::GoogleMaps(MapsPlace {
                cid: Some(format!("cid-{}", i)),
                title: format!("Padaria {}", i),
                address: Some(format!("Rua {}, São Paulo", i)),
                rating: Some(4.0 + (i % 10) as f64 / 10.0),
                rating_count: Some(i as i64),
                ..MapsPlace::default()
            })
        })
        .collect()
}

/// Like [`maps_page`], each place with its own `.com.br` website.
pub fn maps_page_with_sites(start: usize, count: usize) -> Vec<SourcePayload> {
    maps_page(start, count)
        .into_iter()
        .enumerate()
        .map(|(i, payload)| match payload {
            SourcePayload::GoogleMaps(place) => SourcePayload::GoogleMaps(MapsPlace {
                website: Some(format!("https://padaria{}.com.br", start + i)),
                ..place
            }),
            other => other,
        })
        .collect()
}

/// Source replaying a fixed list of pages; anything past the list is exhausted.
pub struct ScriptedSource {
    source: SourceType,
    pages: Vec<SearchPage>,
    pub calls: AtomicU32,
}

impl ScriptedSource {
    pub fn new(source: SourceType, pages: Vec<SearchPage>) -> Self {
        Self {
            source,
            pages,
            calls: AtomicU32::new(0),
        }
    }

    /// `full_pages` pages of `per_page` maps results, then exhaustion.
    pub fn maps(full_pages: usize, per_page: usize) -> Self {
        let pages = (0..full_pages)
            .map(|p| SearchPage::Results(maps_page(p * per_page, per_page)))
            .collect();
        Self::new(SourceType::GoogleMaps, pages)
    }
}

#[async_trait]
impl SearchSource for ScriptedSource {
    fn source_type(&self) -> SourceType {
        self.source
    }

    async fn fetch_page(
        &self,
        _request: &SearchRequest,
        page: u32,
    ) -> Result<SearchPage, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .pages
            .get(page.saturating_sub(1) as usize)
            .cloned()
            .unwrap_or(SearchPage::Exhausted))
    }
}

/// Maps source answering per searched location; unknown locations are exhausted.
#[derive(Default)]
pub struct LocationSource {
    pages: HashMap<String, Vec<SearchPage>>,
    requests: Mutex<Vec<(String, String, u32)>>,
}

impl LocationSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_location(mut self, location: &str, pages: Vec<SearchPage>) -> Self {
        self.pages.insert(location.to_string(), pages);
        self
    }

    /// `(search_term, location, page)` of every fetch, in order.
    pub fn requests(&self) -> Vec<(String, String, u32)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchSource for LocationSource {
    fn source_type(&self) -> SourceType {
        SourceType::GoogleMaps
    }

    async fn fetch_page(
        &self,
        request: &SearchRequest,
        page: u32,
    ) -> Result<SearchPage, AppError> {
        self.requests.lock().unwrap().push((
            request.search_term.clone(),
            request.location.clone(),
            page,
        ));
        Ok(self
            .pages
            .get(&request.location)
            .and_then(|pages| pages.get(page.saturating_sub(1) as usize))
            .cloned()
            .unwrap_or(SearchPage::Exhausted))
    }
}

/// WHOIS answering every domain with the same record.
pub struct StaticWhois(pub WhoisData);

#[async_trait]
impl WhoisLookup for StaticWhois {
    async fn lookup(&self, domain: &str) -> Result<Option<WhoisData>, AppError> {
        Ok(Some(WhoisData {
            domain: domain.to_string(),
            ..self.0.clone()
        }))
    }
}

/// WHOIS that always fails, counting calls.
pub struct FailingWhois {
    transient: bool,
    pub calls: AtomicU32,
}

impl FailingWhois {
    /// Fails like an outage (retried).
    pub fn transient() -> Self {
        Self {
            transient: true,
            calls: AtomicU32::new(0),
        }
    }

    /// Fails with an unparseable answer (not retried).
    pub fn malformed() -> Self {
        Self {
            transient: false,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WhoisLookup for FailingWhois {
    async fn lookup(&self, _domain: &str) -> Result<Option<WhoisData>, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.transient {
            Err(AppError::ExternalApiError("WHOIS returned status 503".into()))
        } else {
            Err(AppError::MalformedData("Failed to parse WHOIS response".into()))
        }
    }
}

/// WHOIS that flags its run for cancellation while answering, like a user
/// cancelling in the middle of an enrichment batch.
#[derive(Default)]
pub struct CancellingWhois {
    pub run: OnceLock<(Arc<dyn RunStore>, Uuid)>,
}

#[async_trait]
impl WhoisLookup for CancellingWhois {
    async fn lookup(&self, domain: &str) -> Result<Option<WhoisData>, AppError> {
        if let Some((store, run_id)) = self.run.get() {
            store.request_cancel(*run_id).await?;
        }
        Ok(Some(WhoisData {
            domain: domain.to_string(),
            phones: vec!["11987654321".to_string()],
            ..WhoisData::default()
        }))
    }
}

/// Registry knowing exactly one company.
pub struct StaticRegistry(pub CnpjCompany);

#[async_trait]
impl CnpjRegistry for StaticRegistry {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn lookup(&self, cnpj: &str) -> Result<Option<CnpjCompany>, AppError> {
        Ok((cnpj == self.0.cnpj).then(|| self.0.clone()))
    }
}

pub fn maps_config(workspace_id: Uuid, target: i64) -> ExtractionConfig {
    ExtractionConfig {
        id: Uuid::new_v4(),
        workspace_id,
        name: "Padarias SP".to_string(),
        source: SourceType::GoogleMaps,
        search_term: "padaria".to_string(),
        location: "São Paulo, SP".to_string(),
        target_quantity: target,
        filters: QualificationFilters::default(),
        funnel_id: Uuid::new_v4(),
        column_id: Uuid::new_v4(),
        schedule: None,
        max_pages: None,
        cnpj_filters: None,
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub pipeline: Arc<Pipeline>,
    pub queue: JobQueue,
    pub receiver: JobReceiver,
}

impl Harness {
    pub fn new(
        source: Arc<dyn SearchSource>,
        providers: EnrichmentProviders,
        settings: PipelineSettings,
    ) -> Self {
        Self::with_sources(SearchSources::new().with(source), providers, settings)
    }

    pub fn with_sources(
        sources: SearchSources,
        providers: EnrichmentProviders,
        settings: PipelineSettings,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let (queue, receiver) = JobQueue::new();
        let pipeline = Arc::new(Pipeline::new(
            Stores::shared(store.clone()),
            sources,
            providers,
            EventBus::default(),
            settings,
            queue.clone(),
        ));
        Self {
            store,
            pipeline,
            queue,
            receiver,
        }
    }

    /// Registers `config` and a valid destination for it.
    pub fn register(&self, config: &ExtractionConfig) {
        self.store.insert_config(config.clone()).unwrap();
        self.store
            .add_destination(config.workspace_id, config.funnel_id, config.column_id)
            .unwrap();
    }

    /// Processes queued jobs until none are left.
    pub async fn drain(&mut self) {
        self.pipeline.drain(&mut self.receiver).await;
    }

    pub async fn run(&self, run_id: Uuid) -> ExtractionRun {
        self.pipeline.tracker().load_run(run_id).await.unwrap()
    }

    /// Starts a run for `config` and drives it to a terminal state.
    pub async fn run_to_end(&mut self, config: &ExtractionConfig) -> ExtractionRun {
        let run = self.pipeline.start_run(config.id).await.unwrap();
        self.drain().await;
        self.run(run.id).await
    }
}
