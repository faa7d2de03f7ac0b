use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Runtime configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres URL. When absent the service runs on the in-memory store.
    pub database_url: Option<String>,
    pub port: u16,
    pub maps_api_url: String,
    pub maps_api_key: String,
    pub cnpj_search_url: Option<String>,
    pub cnpja_api_url: String,
    pub cnpja_api_key: Option<String>,
    pub brasilapi_url: String,
    pub whois_api_url: Option<String>,
    pub whatsapp_api_url: Option<String>,
    /// Chat-completions API asked for sub-locations.
    pub expansion_api_url: String,
    /// Location expansion is off without a key.
    pub expansion_api_key: Option<String>,
    pub expansion_model: String,
    pub pipeline: PipelineSettings,
}

/// Tunables for the stage workers.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Results a source returns per page.
    pub results_per_page: u32,
    /// Page budget for a run when its config does not set one.
    pub max_pages_per_run: u32,
    /// Records enriched concurrently within one run.
    pub enrichment_concurrency: usize,
    /// Records loaded per enrichment batch (cancellation is checked between batches).
    pub enrichment_batch_size: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub migration_batch_size: i64,
    /// Batches a single migration job may process before yielding.
    pub max_migration_batches: u32,
    pub watchdog_timeout: Duration,
    pub watchdog_interval: Duration,
    /// Times the watchdog re-enqueues a stuck run before finalizing it.
    pub watchdog_max_recoveries: i32,
    pub worker_count: usize,
    pub max_active_runs_per_workspace: i64,
    /// Attempts for a whole stage job that hit a transient error.
    pub job_max_attempts: u32,
    pub lookup_cache_ttl: Duration,
    pub http_timeout: Duration,
    /// Sub-locations a run may add once its base location runs dry.
    pub max_sub_locations: usize,
    /// Pages fetched per sub-location before it counts as exhausted.
    pub max_pages_per_sub_location: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            results_per_page: 10,
            max_pages_per_run: 20,
            enrichment_concurrency: 5,
            enrichment_batch_size: 25,
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(10),
            migration_batch_size: 100,
            max_migration_batches: 10,
            watchdog_timeout: Duration::from_secs(15 * 60),
            watchdog_interval: Duration::from_secs(60),
            watchdog_max_recoveries: 1,
            worker_count: 4,
            max_active_runs_per_workspace: 3,
            job_max_attempts: 3,
            lookup_cache_ttl: Duration::from_secs(3600),
            http_timeout: Duration::from_secs(30),
            max_sub_locations: 20,
            max_pages_per_sub_location: 3,
        }
    }
}

impl PipelineSettings {
    /// Backoff policy shared by lookups and job retries.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.max(1),
            base_delay: self.backoff_base,
            max_delay: self.backoff_max,
        }
    }

    /// Reads overrides from the environment, keeping defaults for unset variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let settings = Self {
            results_per_page: env_or("RESULTS_PER_PAGE", defaults.results_per_page)?,
            max_pages_per_run: env_or("MAX_PAGES_PER_RUN", defaults.max_pages_per_run)?,
            enrichment_concurrency: env_or(
                "ENRICHMENT_CONCURRENCY",
                defaults.enrichment_concurrency,
            )?,
            enrichment_batch_size: env_or("ENRICHMENT_BATCH_SIZE", defaults.enrichment_batch_size)?,
            max_retries: env_or("MAX_RETRIES", defaults.max_retries)?,
            backoff_base: Duration::from_millis(env_or(
                "BACKOFF_BASE_MS",
                defaults.backoff_base.as_millis() as u64,
            )?),
            backoff_max: Duration::from_millis(env_or(
                "BACKOFF_MAX_MS",
                defaults.backoff_max.as_millis() as u64,
            )?),
            migration_batch_size: env_or("MIGRATION_BATCH_SIZE", defaults.migration_batch_size)?,
            max_migration_batches: env_or("MAX_MIGRATION_BATCHES", defaults.max_migration_batches)?,
            watchdog_timeout: Duration::from_secs(
                60 * env_or::<u64>(
                    "WATCHDOG_TIMEOUT_MINUTES",
                    defaults.watchdog_timeout.as_secs() / 60,
                )?,
            ),
            watchdog_interval: Duration::from_secs(env_or(
                "WATCHDOG_INTERVAL_SECS",
                defaults.watchdog_interval.as_secs(),
            )?),
            watchdog_max_recoveries: env_or(
                "WATCHDOG_MAX_RECOVERIES",
                defaults.watchdog_max_recoveries,
            )?,
            worker_count: env_or("WORKER_COUNT", defaults.worker_count)?,
            max_active_runs_per_workspace: env_or(
                "MAX_ACTIVE_RUNS_PER_WORKSPACE",
                defaults.max_active_runs_per_workspace,
            )?,
            job_max_attempts: env_or("JOB_MAX_ATTEMPTS", defaults.job_max_attempts)?,
            lookup_cache_ttl: Duration::from_secs(env_or(
                "LOOKUP_CACHE_TTL_SECS",
                defaults.lookup_cache_ttl.as_secs(),
            )?),
            http_timeout: Duration::from_secs(env_or(
                "HTTP_TIMEOUT_SECS",
                defaults.http_timeout.as_secs(),
            )?),
            max_sub_locations: env_or("MAX_SUB_LOCATIONS", defaults.max_sub_locations)?,
            max_pages_per_sub_location: env_or(
                "MAX_PAGES_PER_SUB_LOCATION",
                defaults.max_pages_per_sub_location,
            )?,
        };

        if settings.results_per_page == 0 {
            anyhow::bail!("RESULTS_PER_PAGE must be greater than zero");
        }
        if settings.enrichment_concurrency == 0 || settings.worker_count == 0 {
            anyhow::bail!("ENRICHMENT_CONCURRENCY and WORKER_COUNT must be greater than zero");
        }
        if settings.migration_batch_size <= 0 {
            anyhow::bail!("MIGRATION_BATCH_SIZE must be greater than zero");
        }

        Ok(settings)
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: match std::env::var("DB_URL").or_else(|_| std::env::var("DATABASE_URL"))
            {
                Ok(url) => {
                    if url.trim().is_empty() {
                        anyhow::bail!("DB_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DB_URL must start with postgresql:// or postgres://");
                    }
                    Some(url)
                }
                Err(_) => None,
            },
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            maps_api_url: http_url_or("MAPS_API_URL", "https://google.serper.dev")?,
            maps_api_key: std::env::var("MAPS_API_KEY")
                .or_else(|_| std::env::var("SERPER_API_KEY"))
                .map_err(|_| {
                    anyhow::anyhow!("MAPS_API_KEY or SERPER_API_KEY environment variable required")
                })
                .and_then(|key| {
                    if key.trim().is_empty() {
                        anyhow::bail!("MAPS_API_KEY cannot be empty");
                    }
                    Ok(key)
                })?,
            cnpj_search_url: optional_http_url("CNPJ_SEARCH_URL")?,
            cnpja_api_url: http_url_or("CNPJA_API_URL", "https://api.cnpja.com.br")?,
            cnpja_api_key: std::env::var("CNPJA_API_KEY")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            brasilapi_url: http_url_or("BRASILAPI_URL", "https://brasilapi.com.br")?,
            whois_api_url: optional_http_url("WHOIS_API_URL")?,
            whatsapp_api_url: optional_http_url("WHATSAPP_API_URL")?,
            expansion_api_url: http_url_or("EXPANSION_API_URL", "https://openrouter.ai/api/v1")?,
            expansion_api_key: std::env::var("EXPANSION_API_KEY")
                .or_else(|_| std::env::var("OPENROUTER_API_KEY"))
                .ok()
                .filter(|s| !s.trim().is_empty()),
            expansion_model: std::env::var("EXPANSION_MODEL")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| "perplexity/sonar-pro".to_string()),
            pipeline: PipelineSettings::from_env()?,
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        match &config.database_url {
            Some(url) => tracing::debug!("Database URL: {}...", &url[..20.min(url.len())]),
            None => tracing::warn!("No DB_URL set, using in-memory store"),
        }
        tracing::debug!("Maps API URL: {}", config.maps_api_url);
        if config.cnpj_search_url.is_none() {
            tracing::info!("CNPJ_SEARCH_URL not set, CNPJ source disabled");
        }
        if config.whois_api_url.is_none() {
            tracing::info!("WHOIS_API_URL not set, WHOIS lookups disabled");
        }
        if config.whatsapp_api_url.is_none() {
            tracing::info!("WHATSAPP_API_URL not set, WhatsApp checks disabled");
        }
        if config.expansion_api_key.is_none() {
            tracing::info!("EXPANSION_API_KEY not set, location expansion disabled");
        }
        tracing::debug!("Server Port: {}", config.port);
        tracing::debug!("Pipeline settings: {:?}", config.pipeline);

        Ok(config)
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: {}", name, raw)),
        _ => Ok(default),
    }
}

fn http_url_or(name: &str, default: &str) -> anyhow::Result<String> {
    Ok(optional_http_url(name)?.unwrap_or_else(|| default.to_string()))
}

fn optional_http_url(name: &str) -> anyhow::Result<Option<String>> {
    match std::env::var(name) {
        Ok(url) if !url.trim().is_empty() => {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!("{} must start with http:// or https://", name);
            }
            Ok(Some(url.trim_end_matches('/').to_string()))
        }
        _ => Ok(None),
    }
}
