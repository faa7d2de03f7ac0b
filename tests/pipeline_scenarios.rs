/// End-to-end runs over the in-memory store
/// Sources and providers are scripted; the stages, queue and tracker are real
mod common;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use common::*;
use rust_lead_extraction::config::PipelineSettings;
use rust_lead_extraction::errors::AppError;
use rust_lead_extraction::location::StaticNeighborhoods;
use rust_lead_extraction::migration::{build_lead, MigrationStage};
use rust_lead_extraction::models::{
    CnpjCompany, DataSource, EnrichmentStatus, ExtractionConfig, ExtractionStatus, MapsPlace,
    MigrationOutcome, RunStatus, SourcePayload, SourceType, WhoisData,
};
use rust_lead_extraction::services::{EnrichmentProviders, SearchPage, SearchSources};
use rust_lead_extraction::store::{RunStore, StagingStore};
use rust_lead_extraction::watchdog::Watchdog;

/// Runs the start, discover and enrich jobs, leaving the run in `migrating`.
async fn run_until_migrating(harness: &mut Harness, config: &ExtractionConfig) -> Uuid {
    let run = harness.pipeline.start_run(config.id).await.unwrap();
    for _ in 0..3 {
        let job = harness.receiver.try_recv().unwrap();
        harness.pipeline.handle(job).await;
    }
    assert_eq!(harness.run(run.id).await.status, RunStatus::Migrating);
    run.id
}

fn single_page_with_sites(count: usize) -> Arc<ScriptedSource> {
    Arc::new(ScriptedSource::new(
        SourceType::GoogleMaps,
        vec![SearchPage::Results(maps_page_with_sites(0, count))],
    ))
}

#[tokio::test]
async fn test_exhausted_source_ends_partial() {
    let source = Arc::new(ScriptedSource::maps(3, 10));
    let mut harness = Harness::new(source.clone(), EnrichmentProviders::default(), test_settings());
    let config = maps_config(Uuid::new_v4(), 50);
    harness.register(&config);

    let run = harness.run_to_end(&config).await;

    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.counters.created_quantity, 30);
    assert_eq!(run.counters.found_quantity, 30);
    assert_eq!(run.counters.pages_consumed, 3);
    assert!(run.source_exhausted);
    assert!(run.error_message.is_none());
    assert_eq!(harness.store.leads().unwrap().len(), 30);
    // Pages 1-3 plus the exhausted page 4.
    assert_eq!(source.calls.load(std::sync::atomic::Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_target_reached_completes_without_overshoot() {
    let source = Arc::new(ScriptedSource::maps(5, 10));
    let mut harness = Harness::new(source, EnrichmentProviders::default(), test_settings());
    let config = maps_config(Uuid::new_v4(), 15);
    harness.register(&config);

    let run = harness.run_to_end(&config).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.created_quantity, 15);
    // Two pages cover a target of 15.
    assert_eq!(run.counters.found_quantity, 20);
    assert_eq!(harness.store.leads().unwrap().len(), 15);

    let staged = harness.pipeline.list_staging(run.id).await.unwrap();
    let migrated = staged.iter().filter(|r| r.is_migrated()).count();
    assert_eq!(migrated, 15);
    assert!(staged
        .iter()
        .filter(|r| r.is_migrated())
        .all(|r| r.status_extraction == ExtractionStatus::Migrated && r.migrated_lead_id.is_some()));
}

#[tokio::test]
async fn test_filtered_records_loop_back_to_discovery() {
    // Three results per page clear the rating bar, so the run needs extra rounds.
    let source = Arc::new(ScriptedSource::maps(6, 10));
    let mut harness = Harness::new(source, EnrichmentProviders::default(), test_settings());
    let mut config = maps_config(Uuid::new_v4(), 10);
    config.filters.min_rating = Some(4.65);
    harness.register(&config);

    let run = harness.run_to_end(&config).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.created_quantity, 10);
    assert!(run.counters.filtered_quantity > 0);
    assert!(run.counters.pages_consumed > 1);

    let staged = harness.pipeline.list_staging(run.id).await.unwrap();
    let rejected = staged
        .iter()
        .find(|r| r.should_migrate == Some(false))
        .expect("some records fail the rating threshold");
    assert!(rejected
        .filter_reason
        .as_deref()
        .unwrap()
        .starts_with("rating"));
    assert!(!rejected.is_migrated());
}

#[tokio::test]
async fn test_page_budget_caps_discovery() {
    let source = Arc::new(ScriptedSource::maps(10, 10));
    let mut harness = Harness::new(source, EnrichmentProviders::default(), test_settings());
    let mut config = maps_config(Uuid::new_v4(), 100);
    config.max_pages = Some(2);
    harness.register(&config);

    let run = harness.run_to_end(&config).await;

    assert_eq!(run.status, RunStatus::Partial);
    assert_eq!(run.counters.pages_consumed, 2);
    assert_eq!(run.counters.created_quantity, 20);
}

#[tokio::test]
async fn test_duplicates_are_staged_once_per_workspace() {
    let page = maps_page(0, 5);
    let mut repeated = page.clone();
    repeated.push(page[0].clone());
    let source = Arc::new(ScriptedSource::new(
        rust_lead_extraction::models::SourceType::GoogleMaps,
        vec![
            SearchPage::Results(repeated),
            SearchPage::Results(page),
            SearchPage::Exhausted,
        ],
    ));
    let mut harness = Harness::new(source, EnrichmentProviders::default(), test_settings());
    let config = maps_config(Uuid::new_v4(), 50);
    harness.register(&config);

    let run = harness.run_to_end(&config).await;

    assert_eq!(run.counters.found_quantity, 5);
    assert_eq!(run.counters.duplicates_skipped, 6);
    assert_eq!(run.counters.created_quantity, 5);

    let staged = harness.pipeline.list_staging(run.id).await.unwrap();
    let mut hashes: Vec<_> = staged.iter().map(|r| r.deduplication_hash.clone()).collect();
    hashes.sort();
    hashes.dedup();
    assert_eq!(hashes.len(), staged.len());
}

#[tokio::test]
async fn test_second_run_resumes_after_exhausted_query() {
    let source = Arc::new(ScriptedSource::maps(2, 10));
    let mut harness = Harness::new(source.clone(), EnrichmentProviders::default(), test_settings());
    let config = maps_config(Uuid::new_v4(), 50);
    harness.register(&config);

    let first = harness.run_to_end(&config).await;
    assert_eq!(first.status, RunStatus::Partial);
    let calls_after_first = source.calls.load(std::sync::atomic::Ordering::SeqCst);

    let second = harness.run_to_end(&config).await;
    assert_eq!(second.status, RunStatus::Failed);
    assert_eq!(second.counters.created_quantity, 0);
    assert!(second.source_exhausted);
    assert!(second
        .error_message
        .as_deref()
        .unwrap()
        .contains("source exhausted"));
    // The exhausted query is not searched again.
    assert_eq!(
        source.calls.load(std::sync::atomic::Ordering::SeqCst),
        calls_after_first
    );
}

#[tokio::test]
async fn test_cnpj_registry_phone_wins_over_whois() {
    let place = SourcePayload::GoogleMaps(MapsPlace {
        title: "Padaria Estrela".to_string(),
        address: Some("Rua Augusta 100, São Paulo".to_string()),
        website: Some("https://padariaestrela.com.br".to_string()),
        ..MapsPlace::default()
    });
    let source = Arc::new(ScriptedSource::new(
        rust_lead_extraction::models::SourceType::GoogleMaps,
        vec![SearchPage::Results(vec![place])],
    ));
    let providers = EnrichmentProviders {
        whois: Some(Arc::new(StaticWhois(WhoisData {
            owner: Some("Padaria Estrela Ltda".to_string()),
            owner_document: Some("11.222.333/0001-81".to_string()),
            phones: vec!["(11) 3333-4444".to_string()],
            emails: vec!["dono@padariaestrela.com.br".to_string()],
            ..WhoisData::default()
        }))),
        cnpj: Some(Arc::new(StaticRegistry(CnpjCompany {
            cnpj: "11222333000181".to_string(),
            razao_social: Some("PADARIA ESTRELA LTDA".to_string()),
            phones: vec!["(11) 98765-4321".to_string()],
            ..CnpjCompany::default()
        }))),
        ..EnrichmentProviders::default()
    };
    let mut harness = Harness::new(source, providers, test_settings());
    let config = maps_config(Uuid::new_v4(), 1);
    harness.register(&config);

    let run = harness.run_to_end(&config).await;
    assert_eq!(run.status, RunStatus::Completed);

    let staged = harness.pipeline.list_staging(run.id).await.unwrap();
    let record = &staged[0];
    assert_eq!(record.status_enrichment, EnrichmentStatus::Completed);
    assert_eq!(record.cnpj_normalized.as_deref(), Some("11222333000181"));

    let phone = record.contacts.phone.as_ref().unwrap();
    assert_eq!(phone.source, DataSource::CnpjRegistry);
    assert_eq!(phone.value, "+5511987654321");

    // Only WHOIS has an email, so it wins that field.
    let email = record.contacts.email.as_ref().unwrap();
    assert_eq!(email.source, DataSource::Whois);

    let lead = &harness.store.leads().unwrap()[0].lead;
    assert_eq!(lead.phone.as_deref(), Some("+5511987654321"));
    assert_eq!(
        lead.custom_fields.get("phone_source").map(String::as_str),
        Some("cnpj_registry")
    );
}

#[tokio::test]
async fn test_cancel_before_processing() {
    let source = Arc::new(ScriptedSource::maps(3, 10));
    let mut harness = Harness::new(source.clone(), EnrichmentProviders::default(), test_settings());
    let config = maps_config(Uuid::new_v4(), 50);
    harness.register(&config);

    let run = harness.pipeline.start_run(config.id).await.unwrap();
    let flagged = harness.pipeline.request_cancel(run.id).await.unwrap();
    assert!(flagged.cancel_requested);
    harness.drain().await;

    let run = harness.run(run.id).await;
    assert_eq!(run.status, RunStatus::Cancelled);
    assert!(run.finished_at.is_some());
    assert_eq!(source.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(harness.store.leads().unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_destination_fails_run() {
    let source = Arc::new(ScriptedSource::maps(3, 10));
    let mut harness = Harness::new(source, EnrichmentProviders::default(), test_settings());
    let config = maps_config(Uuid::new_v4(), 10);
    harness.store.insert_config(config.clone()).unwrap();

    let run = harness.run_to_end(&config).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error_message.as_deref().unwrap().contains("destination"));
}

#[tokio::test]
async fn test_invalid_config_fails_run() {
    let source = Arc::new(ScriptedSource::maps(3, 10));
    let mut harness = Harness::new(source, EnrichmentProviders::default(), test_settings());
    let mut config = maps_config(Uuid::new_v4(), 10);
    config.search_term = "   ".to_string();
    harness.register(&config);

    let run = harness.run_to_end(&config).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error_message.as_deref().unwrap().contains("search_term"));
}

#[tokio::test]
async fn test_active_run_limit_per_workspace() {
    let source = Arc::new(ScriptedSource::maps(3, 10));
    let settings = rust_lead_extraction::config::PipelineSettings {
        max_active_runs_per_workspace: 1,
        ..test_settings()
    };
    let harness = Harness::new(source, EnrichmentProviders::default(), settings);
    let config = maps_config(Uuid::new_v4(), 10);
    harness.register(&config);

    harness.pipeline.start_run(config.id).await.unwrap();
    let second = harness.pipeline.start_run(config.id).await;
    assert!(matches!(second, Err(AppError::Conflict(_))));
}

#[tokio::test]
async fn test_unknown_config_is_not_found() {
    let source = Arc::new(ScriptedSource::maps(1, 10));
    let harness = Harness::new(source, EnrichmentProviders::default(), test_settings());
    let result = harness.pipeline.start_run(Uuid::new_v4()).await;
    assert!(matches!(result, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn test_migration_is_idempotent() {
    let source = Arc::new(ScriptedSource::maps(1, 10));
    let mut harness = Harness::new(source, EnrichmentProviders::default(), test_settings());
    let config = maps_config(Uuid::new_v4(), 5);
    harness.register(&config);

    let run = harness.run_to_end(&config).await;
    assert_eq!(run.status, RunStatus::Completed);

    let staged = harness.pipeline.list_staging(run.id).await.unwrap();
    let migrated = staged.iter().find(|r| r.is_migrated()).unwrap();
    let lead = rust_lead_extraction::migration::build_lead(migrated, &config);
    let outcome = harness
        .store
        .migrate_record(run.id, migrated.id, &lead)
        .await
        .unwrap();
    assert_eq!(outcome, MigrationOutcome::AlreadyMigrated);

    let pending = staged.iter().find(|r| !r.is_migrated()).unwrap();
    let outcome = harness
        .store
        .migrate_record(run.id, pending.id, &lead)
        .await
        .unwrap();
    assert_eq!(outcome, MigrationOutcome::CapacityReached);

    assert_eq!(harness.store.leads().unwrap().len(), 5);
    assert_eq!(harness.run(run.id).await.counters.created_quantity, 5);
}

#[tokio::test]
async fn test_concurrent_migration_never_exceeds_target() {
    let source = Arc::new(ScriptedSource::maps(2, 10));
    let settings = rust_lead_extraction::config::PipelineSettings {
        max_pages_per_run: 2,
        ..test_settings()
    };
    let mut harness = Harness::new(source, EnrichmentProviders::default(), settings);
    let config = maps_config(Uuid::new_v4(), 20);
    harness.register(&config);

    // Stop before migration: run the start, discover and enrich jobs only.
    let run = harness.pipeline.start_run(config.id).await.unwrap();
    for _ in 0..3 {
        let job = harness.receiver.try_recv().unwrap();
        harness.pipeline.handle(job).await;
    }
    assert_eq!(harness.run(run.id).await.status, RunStatus::Migrating);

    let candidates = harness
        .store
        .list_migration_candidates(run.id, 100)
        .await
        .unwrap();
    assert_eq!(candidates.len(), 20);

    // Two racers per record, twenty records, a target of twenty.
    let mut tasks = Vec::new();
    for record in candidates.iter().chain(candidates.iter()) {
        let store = harness.store.clone();
        let lead = rust_lead_extraction::migration::build_lead(record, &config);
        let (run_id, staging_id) = (run.id, record.id);
        tasks.push(tokio::spawn(async move {
            store.migrate_record(run_id, staging_id, &lead).await
        }));
    }
    let mut migrated = 0;
    for task in tasks {
        if let MigrationOutcome::Migrated(_) = task.await.unwrap().unwrap() {
            migrated += 1;
        }
    }

    assert_eq!(migrated, 20);
    assert_eq!(harness.store.leads().unwrap().len(), 20);
    let run = harness.run(run.id).await;
    assert_eq!(run.counters.created_quantity, 20);
    assert!(run.counters.created_quantity <= run.target_quantity);
}

#[tokio::test]
async fn test_watchdog_fails_stalled_run_without_leads() {
    let source = Arc::new(ScriptedSource::maps(3, 10));
    let harness = Harness::new(source, EnrichmentProviders::default(), test_settings());
    let config = maps_config(Uuid::new_v4(), 10);
    harness.register(&config);

    let run = harness.pipeline.start_run(config.id).await.unwrap();
    let watchdog = Watchdog::new(
        harness.pipeline.tracker().clone(),
        harness.queue.clone(),
        test_settings(),
    );

    // The default allows one re-queue; the run stalls again afterwards.
    let stalled_since = Utc::now() - ChronoDuration::minutes(20);
    harness.store.set_heartbeat(run.id, stalled_since).unwrap();
    let first = watchdog.sweep(Utc::now()).await.unwrap();
    assert_eq!(first.requeued, vec![run.id]);
    assert!(first.finalized.is_empty());

    harness.store.set_heartbeat(run.id, stalled_since).unwrap();
    let report = watchdog.sweep(Utc::now()).await.unwrap();

    assert_eq!(report.stale_runs, 1);
    assert_eq!(report.finalized.len(), 1);
    assert_eq!(report.finalized[0].status, RunStatus::Failed);
    assert!(report.finalized[0].reason.contains("stalled for 20 minutes"));

    let run = harness.run(run.id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.counters.created_quantity, 0);
    assert!(run.error_message.as_deref().unwrap().contains("stalled"));

    // A second sweep leaves the finished run alone.
    let again = watchdog.sweep(Utc::now()).await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn test_watchdog_requeues_before_giving_up() {
    let source = Arc::new(ScriptedSource::maps(3, 10));
    let settings = rust_lead_extraction::config::PipelineSettings {
        watchdog_max_recoveries: 1,
        ..test_settings()
    };
    let mut harness = Harness::new(source, EnrichmentProviders::default(), settings.clone());
    let config = maps_config(Uuid::new_v4(), 10);
    harness.register(&config);

    let run = harness.pipeline.start_run(config.id).await.unwrap();
    // Lose the start job, as if the worker died.
    harness.receiver.try_recv().unwrap();
    harness
        .store
        .set_heartbeat(run.id, Utc::now() - ChronoDuration::minutes(30))
        .unwrap();

    let watchdog = Watchdog::new(
        harness.pipeline.tracker().clone(),
        harness.queue.clone(),
        settings,
    );
    let report = watchdog.sweep(Utc::now()).await.unwrap();
    assert_eq!(report.requeued, vec![run.id]);
    assert_eq!(harness.run(run.id).await.watchdog_recoveries, 1);

    harness.drain().await;
    let run = harness.run(run.id).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.created_quantity, 10);
}

#[tokio::test]
async fn test_run_logs_cover_every_step() {
    let source = Arc::new(ScriptedSource::maps(1, 10));
    let mut harness = Harness::new(source, EnrichmentProviders::default(), test_settings());
    let config = maps_config(Uuid::new_v4(), 5);
    harness.register(&config);

    let run = harness.run_to_end(&config).await;
    let logs = harness
        .pipeline
        .tracker()
        .store()
        .list_logs(run.id)
        .await
        .unwrap();
    let steps: Vec<&str> = logs.iter().map(|l| l.step.as_str()).collect();
    for step in ["start", "discovery", "enrichment", "filter", "migration", "finalize"] {
        assert!(steps.contains(&step), "missing {} log", step);
    }
}

#[tokio::test]
async fn test_migration_writes_nothing_once_watchdog_finalized_run() {
    let source = Arc::new(ScriptedSource::maps(1, 10));
    let settings = PipelineSettings {
        watchdog_max_recoveries: 0,
        ..test_settings()
    };
    let mut harness = Harness::new(source, EnrichmentProviders::default(), settings.clone());
    let config = maps_config(Uuid::new_v4(), 5);
    harness.register(&config);
    let run_id = run_until_migrating(&mut harness, &config).await;

    harness
        .store
        .set_heartbeat(run_id, Utc::now() - ChronoDuration::minutes(20))
        .unwrap();
    let watchdog = Watchdog::new(
        harness.pipeline.tracker().clone(),
        harness.queue.clone(),
        settings.clone(),
    );
    watchdog.sweep(Utc::now()).await.unwrap();
    assert_eq!(harness.run(run_id).await.status, RunStatus::Failed);

    // A worker that loaded the run before the sweep still reaches migration.
    let migration = MigrationStage::new(
        harness.pipeline.tracker().clone(),
        harness.store.clone(),
        settings,
    );
    let report = migration.run(run_id, &config).await.unwrap();
    assert!(report.run_closed);
    assert_eq!(report.migrated, 0);

    // The queued migrate job is dropped as well.
    harness.drain().await;

    let run = harness.run(run_id).await;
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.counters.created_quantity, 0);
    assert!(run.error_message.as_deref().unwrap().contains("no leads created"));
    assert!(harness.store.leads().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_request_blocks_migrate_record() {
    let source = Arc::new(ScriptedSource::maps(1, 10));
    let mut harness = Harness::new(source, EnrichmentProviders::default(), test_settings());
    let config = maps_config(Uuid::new_v4(), 5);
    harness.register(&config);
    let run_id = run_until_migrating(&mut harness, &config).await;

    harness.pipeline.request_cancel(run_id).await.unwrap();
    let candidates = harness
        .store
        .list_migration_candidates(run_id, 10)
        .await
        .unwrap();
    let lead = build_lead(&candidates[0], &config);
    let outcome = harness
        .store
        .migrate_record(run_id, candidates[0].id, &lead)
        .await
        .unwrap();
    assert_eq!(outcome, MigrationOutcome::RunClosed);

    harness.drain().await;
    let run = harness.run(run_id).await;
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.counters.created_quantity, 0);
    assert!(harness.store.leads().unwrap().is_empty());
}

#[tokio::test]
async fn test_whois_outage_fails_record_after_retries() {
    let whois = Arc::new(FailingWhois::transient());
    let providers = EnrichmentProviders {
        whois: Some(whois.clone()),
        ..EnrichmentProviders::default()
    };
    let mut harness = Harness::new(single_page_with_sites(1), providers, test_settings());
    let config = maps_config(Uuid::new_v4(), 1);
    harness.register(&config);

    let run = harness.run_to_end(&config).await;

    assert_eq!(whois.calls(), 3);
    let staged = harness.pipeline.list_staging(run.id).await.unwrap();
    assert_eq!(staged.len(), 1);
    let record = &staged[0];
    assert_eq!(record.status_enrichment, EnrichmentStatus::Failed);
    assert_eq!(record.enrichment_attempts, 1);
    assert!(record
        .enrichment_error
        .as_deref()
        .unwrap()
        .starts_with("whois:"));

    // A failed enrichment still goes through the filter and migration.
    assert_eq!(record.should_migrate, Some(true));
    assert_eq!(run.counters.enrichment_failed, 1);
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.created_quantity, 1);
}

#[tokio::test]
async fn test_malformed_whois_answer_is_not_retried() {
    let whois = Arc::new(FailingWhois::malformed());
    let providers = EnrichmentProviders {
        whois: Some(whois.clone()),
        ..EnrichmentProviders::default()
    };
    let mut harness = Harness::new(single_page_with_sites(1), providers, test_settings());
    let config = maps_config(Uuid::new_v4(), 1);
    harness.register(&config);

    let run = harness.run_to_end(&config).await;

    assert_eq!(whois.calls(), 1);
    let staged = harness.pipeline.list_staging(run.id).await.unwrap();
    assert_eq!(staged[0].status_enrichment, EnrichmentStatus::Failed);
    assert!(staged[0]
        .enrichment_error
        .as_deref()
        .unwrap()
        .contains("Malformed data"));
    assert_eq!(run.counters.enrichment_failed, 1);
}

#[tokio::test]
async fn test_cancel_during_enrichment_discards_results() {
    let whois = Arc::new(CancellingWhois::default());
    let providers = EnrichmentProviders {
        whois: Some(whois.clone()),
        ..EnrichmentProviders::default()
    };
    let mut harness = Harness::new(single_page_with_sites(3), providers, test_settings());
    let config = maps_config(Uuid::new_v4(), 3);
    harness.register(&config);

    let run = harness.pipeline.start_run(config.id).await.unwrap();
    let store: Arc<dyn RunStore> = harness.store.clone();
    assert!(whois.run.set((store, run.id)).is_ok());
    harness.drain().await;

    let run = harness.run(run.id).await;
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.counters.found_quantity, 3);
    assert_eq!(run.counters.filtered_quantity, 0);
    assert_eq!(run.counters.enrichment_failed, 0);
    assert!(harness.store.leads().unwrap().is_empty());

    let staged = harness.pipeline.list_staging(run.id).await.unwrap();
    assert_eq!(staged.len(), 3);
    for record in &staged {
        assert_eq!(record.status_enrichment, EnrichmentStatus::InProgress);
        assert_ne!(record.status_extraction, ExtractionStatus::Filtered);
        assert_eq!(record.should_migrate, None);
        assert!(record.enrichment.whois.is_none());
    }
}

const MOEMA: &str = "Moema, Sao Paulo, State of Sao Paulo, Brazil";
const PINHEIROS: &str = "Pinheiros, Sao Paulo, State of Sao Paulo, Brazil";

fn expanding_harness(source: Arc<LocationSource>) -> Harness {
    let expander =
        StaticNeighborhoods::new().with_area("São Paulo", &["Moema", "Pinheiros"]);
    Harness::with_sources(
        SearchSources::new()
            .with(source)
            .with_location_expander(Arc::new(expander)),
        EnrichmentProviders::default(),
        test_settings(),
    )
}

#[tokio::test]
async fn test_discovery_moves_into_sub_locations_when_city_runs_dry() {
    let source = Arc::new(
        LocationSource::new()
            .with_location("São Paulo, SP", vec![SearchPage::Results(maps_page(0, 10))])
            .with_location(MOEMA, vec![SearchPage::Results(maps_page(10, 10))])
            .with_location(
                PINHEIROS,
                vec![
                    SearchPage::Results(maps_page(20, 10)),
                    SearchPage::Results(maps_page(30, 10)),
                ],
            ),
    );
    let mut harness = expanding_harness(source.clone());
    let config = maps_config(Uuid::new_v4(), 25);
    harness.register(&config);

    let run = harness.run_to_end(&config).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.created_quantity, 25);
    assert!(!run.source_exhausted);
    assert_eq!(run.search_segments, vec![MOEMA.to_string(), PINHEIROS.to_string()]);

    let requests = source.requests();
    assert_eq!(
        requests[..3],
        [
            ("padaria".to_string(), "São Paulo, SP".to_string(), 1),
            ("padaria".to_string(), "São Paulo, SP".to_string(), 2),
            ("padaria Moema".to_string(), MOEMA.to_string(), 1),
        ]
    );
    assert!(requests.contains(&("padaria Pinheiros".to_string(), PINHEIROS.to_string(), 1)));
}

#[tokio::test]
async fn test_source_exhausted_only_after_every_sub_location() {
    let source = Arc::new(
        LocationSource::new()
            .with_location(MOEMA, vec![SearchPage::Results(maps_page(0, 10))]),
    );
    let mut harness = expanding_harness(source.clone());
    let config = maps_config(Uuid::new_v4(), 50);
    harness.register(&config);

    let first = harness.run_to_end(&config).await;
    assert_eq!(first.status, RunStatus::Partial);
    assert_eq!(first.counters.created_quantity, 10);
    assert!(first.source_exhausted);
    assert_eq!(first.search_segments.len(), 2);
    let fetched = source.requests().len();
    // city page 1, Moema pages 1-2, Pinheiros page 1
    assert_eq!(fetched, 4);

    // Every sub-location is remembered as exhausted for the workspace.
    let second = harness.run_to_end(&config).await;
    assert_eq!(second.status, RunStatus::Failed);
    assert!(second.source_exhausted);
    assert_eq!(source.requests().len(), fetched);
}

#[tokio::test]
async fn test_sub_location_stops_at_page_cap() {
    let source = Arc::new(
        LocationSource::new().with_location(
            MOEMA,
            (0..5)
                .map(|p| SearchPage::Results(maps_page(p * 10, 10)))
                .collect(),
        ),
    );
    let mut harness = expanding_harness(source.clone());
    let config = maps_config(Uuid::new_v4(), 100);
    harness.register(&config);

    let run = harness.run_to_end(&config).await;

    let moema_pages: Vec<u32> = source
        .requests()
        .into_iter()
        .filter(|(_, location, _)| location == MOEMA)
        .map(|(_, _, page)| page)
        .collect();
    assert_eq!(moema_pages, vec![1, 2, 3]);
    assert_eq!(run.counters.found_quantity, 30);
    assert!(run.source_exhausted);
}
