mod common;

use chrono::Utc;
use std::env;
use std::sync::Arc;
use uuid::Uuid;

use common::{test_settings, ScriptedSource};
use rust_lead_extraction::db::Database;
use rust_lead_extraction::db_storage::PgStore;
use rust_lead_extraction::models::{ExtractionRun, RunStatus};
use rust_lead_extraction::notifications::EventBus;
use rust_lead_extraction::pipeline::{Pipeline, Stores};
use rust_lead_extraction::queue::JobQueue;
use rust_lead_extraction::services::{EnrichmentProviders, SearchSources};
use rust_lead_extraction::store::RunStore;

async fn connect() -> anyhow::Result<Database> {
    let db_url = env::var("TEST_DATABASE_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("Set TEST_DATABASE_URL or DATABASE_URL to run this test"))?;
    Database::connect_and_migrate(&db_url).await
}

/// Seeds a funnel, a column and a Maps extraction config; returns the config id.
async fn seed_config(db: &Database, target: i64) -> anyhow::Result<Uuid> {
    let workspace_id = Uuid::new_v4();
    let funnel_id: Uuid =
        sqlx::query_scalar("INSERT INTO funnels (workspace_id, name) VALUES ($1, 'Prospects') RETURNING id")
            .bind(workspace_id)
            .fetch_one(&db.pool)
            .await?;
    let column_id: Uuid = sqlx::query_scalar(
        "INSERT INTO funnel_columns (funnel_id, name) VALUES ($1, 'New') RETURNING id",
    )
    .bind(funnel_id)
    .fetch_one(&db.pool)
    .await?;
    let config_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO lead_extractions
            (workspace_id, name, source, search_term, location, target_quantity, funnel_id, column_id)
        VALUES ($1, 'Padarias SP', 'google_maps', 'padaria', 'São Paulo', $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(workspace_id)
    .bind(target)
    .bind(funnel_id)
    .bind(column_id)
    .fetch_one(&db.pool)
    .await?;
    Ok(config_id)
}

/// Full run against Postgres with a scripted source.
/// Marked ignored to avoid running against production by accident; set TEST_DATABASE_URL to run.
#[tokio::test]
#[ignore]
async fn run_completes_against_postgres() -> anyhow::Result<()> {
    let db = connect().await?;
    let config_id = seed_config(&db, 12).await?;

    let (queue, mut receiver) = JobQueue::new();
    let pipeline = Pipeline::new(
        Stores::shared(Arc::new(PgStore::new(db.pool.clone()))),
        SearchSources::new().with(Arc::new(ScriptedSource::maps(3, 10))),
        EnrichmentProviders::default(),
        EventBus::default(),
        test_settings(),
        queue,
    );

    let run = pipeline
        .start_run(config_id)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    pipeline.drain(&mut receiver).await;
    let run = pipeline
        .tracker()
        .load_run(run.id)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.counters.created_quantity, 12);

    let leads: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM leads WHERE source_run_id = $1")
        .bind(run.id)
        .fetch_one(&db.pool)
        .await?;
    assert_eq!(leads, 12);
    Ok(())
}

/// Migration stops at the target when more candidates qualify.
#[tokio::test]
#[ignore]
async fn migrate_record_is_capped_in_postgres() -> anyhow::Result<()> {
    let db = connect().await?;
    let config_id = seed_config(&db, 5).await?;

    let (queue, mut receiver) = JobQueue::new();
    let store = Arc::new(PgStore::new(db.pool.clone()));
    let pipeline = Pipeline::new(
        Stores::shared(store),
        SearchSources::new().with(Arc::new(ScriptedSource::maps(1, 10))),
        EnrichmentProviders::default(),
        EventBus::default(),
        test_settings(),
        queue,
    );

    let run = pipeline
        .start_run(config_id)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    pipeline.drain(&mut receiver).await;

    let created: i64 =
        sqlx::query_scalar("SELECT created_quantity FROM lead_extraction_runs WHERE id = $1")
            .bind(run.id)
            .fetch_one(&db.pool)
            .await?;
    let migrated: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM lead_extraction_staging WHERE run_id = $1 AND migrated_at IS NOT NULL",
    )
    .bind(run.id)
    .fetch_one(&db.pool)
    .await?;
    assert_eq!(created, 5);
    assert_eq!(migrated, 5);
    Ok(())
}

/// Sub-locations written by discovery come back with the run.
#[tokio::test]
#[ignore]
async fn search_segments_round_trip_in_postgres() -> anyhow::Result<()> {
    let db = connect().await?;
    let config_id = seed_config(&db, 5).await?;
    let store = PgStore::new(db.pool.clone());
    let config = store
        .get_config(config_id)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?
        .ok_or_else(|| anyhow::anyhow!("seeded config missing"))?;
    let run = ExtractionRun::new(&config, Utc::now());
    store
        .create_run(&run, 3)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let segments = vec!["Moema, Sao Paulo, State of Sao Paulo, Brazil".to_string()];
    store
        .save_search_segments(run.id, &segments)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let reloaded = store
        .get_run(run.id)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?
        .ok_or_else(|| anyhow::anyhow!("run missing"))?;
    assert_eq!(reloaded.search_segments, segments);
    Ok(())
}
