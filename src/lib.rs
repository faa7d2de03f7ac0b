//! Lead Extraction Pipeline Library
//!
//! This library drives multi-tenant lead extraction runs: discovering
//! businesses from search sources, enriching them through public registries,
//! qualifying them and migrating the survivors into CRM funnels.
//!
//! # Modules
//!
//! - `circuit_breaker`: Per-provider circuit breakers.
//! - `config`: Configuration management.
//! - `consolidation`: Contact consolidation by source priority.
//! - `db`: Database connection and pool management.
//! - `db_storage`: Postgres implementation of the storage seams.
//! - `discovery`: Paged discovery with deduplication.
//! - `enrichment`: Concurrent per-record enrichment.
//! - `errors`: Error handling types.
//! - `filter`: Qualification filter.
//! - `handlers`: HTTP request handlers.
//! - `hashing`: Deduplication and query hashes.
//! - `location`: Location levels and sub-location expansion.
//! - `memory_store`: In-memory storage for tests and local runs.
//! - `migration`: Capped migration into the CRM.
//! - `models`: Core data models.
//! - `normalize`: Phone, email, domain and CNPJ normalization.
//! - `notifications`: Pipeline event bus.
//! - `pipeline`: Stage orchestration and workers.
//! - `queue`: In-process job queue.
//! - `retry`: Exponential backoff.
//! - `services`: Search sources and enrichment provider clients.
//! - `store`: Storage traits.
//! - `tracker`: Run lifecycle bookkeeping.
//! - `watchdog`: Stuck-run recovery.

// Public for shared use in tests and other binaries
pub mod circuit_breaker;
pub mod config;
pub mod consolidation;
pub mod db;
pub mod db_storage;
pub mod discovery;
pub mod enrichment;
pub mod errors;
pub mod filter;
pub mod handlers;
pub mod hashing;
pub mod location;
pub mod memory_store;
pub mod migration;
pub mod models;
pub mod normalize;
pub mod notifications;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod services;
pub mod store;
pub mod tracker;
pub mod watchdog;
