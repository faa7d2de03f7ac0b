//! One-shot watchdog pass against the configured database.
//!
//! Stale runs are finalized from their counters; nothing is re-queued because
//! no stage workers run in this process.

use chrono::Utc;
use dotenvy::dotenv;
use std::env;
use std::sync::Arc;

use rust_lead_extraction::config::PipelineSettings;
use rust_lead_extraction::db::Database;
use rust_lead_extraction::db_storage::PgStore;
use rust_lead_extraction::notifications::EventBus;
use rust_lead_extraction::queue::JobQueue;
use rust_lead_extraction::tracker::RunTracker;
use rust_lead_extraction::watchdog::Watchdog;

/// Main entry point for the sweep utility.
///
/// Reads `DB_URL` (or `DATABASE_URL`) and the pipeline settings from the
/// environment, then prints every run it finalized.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    let database_url = env::var("DB_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("DB_URL or DATABASE_URL must be set"))?;
    let db = Database::new(&database_url).await?;

    let settings = PipelineSettings {
        watchdog_max_recoveries: 0,
        ..PipelineSettings::from_env()?
    };
    let tracker = RunTracker::new(Arc::new(PgStore::new(db.pool)), EventBus::default());
    let (queue, _receiver) = JobQueue::new();
    let watchdog = Watchdog::new(tracker, queue, settings);

    let report = watchdog.sweep(Utc::now()).await?;
    println!("Stale runs: {}", report.stale_runs);
    for run in &report.finalized {
        println!("- {} -> {} ({})", run.run_id, run.status, run.reason);
    }
    Ok(())
}
