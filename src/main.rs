use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rust_lead_extraction::config::Config;
use rust_lead_extraction::db::Database;
use rust_lead_extraction::db_storage::PgStore;
use rust_lead_extraction::handlers::{self, AppState};
use rust_lead_extraction::location::ChatCompletionsExpander;
use rust_lead_extraction::memory_store::MemoryStore;
use rust_lead_extraction::notifications::{log_events, EventBus};
use rust_lead_extraction::pipeline::{Pipeline, Stores};
use rust_lead_extraction::queue::JobQueue;
use rust_lead_extraction::services::{
    BrasilApiService, CnpjFallbackChain, CnpjRegistry, CnpjSearchService, EnrichmentProviders,
    InstagramSearchService, MapsSearchService, OpenCnpjService, SearchSources,
    WebsiteScraperService, WhatsappService, WhatsappValidator, WhoisLookup, WhoisService,
};
use rust_lead_extraction::watchdog::Watchdog;

/// Serves the Swagger UI HTML page.
///
/// The page loads the OpenAPI document generated from the handler annotations.
async fn serve_swagger_ui() -> impl IntoResponse {
    let html = r#"
<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Lead Extraction API - Swagger UI</title>
    <link rel="stylesheet" type="text/css" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css">
    <style>
        body { margin: 0; padding: 0; }
    </style>
</head>
<body>
    <div id="swagger-ui"></div>
    <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
    <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-standalone-preset.js"></script>
    <script>
        window.onload = function() {
            window.ui = SwaggerUIBundle({
                url: "/api-docs/openapi.json",
                dom_id: '#swagger-ui',
                deepLinking: true,
                presets: [
                    SwaggerUIBundle.presets.apis,
                    SwaggerUIStandalonePreset
                ],
                layout: "StandaloneLayout"
            });
        };
    </script>
</body>
</html>
"#;
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
}

/// Builds the search sources the configured APIs support.
fn build_sources(config: &Config, client: &reqwest::Client) -> SearchSources {
    let mut sources = SearchSources::new()
        .with(Arc::new(MapsSearchService::new(
            client.clone(),
            config.maps_api_url.clone(),
            config.maps_api_key.clone(),
        )))
        .with(Arc::new(InstagramSearchService::new(
            client.clone(),
            config.maps_api_url.clone(),
            config.maps_api_key.clone(),
        )));
    if let Some(url) = &config.cnpj_search_url {
        sources = sources.with(Arc::new(CnpjSearchService::new(client.clone(), url.clone())));
    }
    if let Some(key) = &config.expansion_api_key {
        sources = sources.with_location_expander(Arc::new(ChatCompletionsExpander::new(
            client.clone(),
            config.expansion_api_url.clone(),
            key.clone(),
            config.expansion_model.clone(),
        )));
    }
    sources
}

fn build_providers(config: &Config, client: &reqwest::Client) -> EnrichmentProviders {
    let registries: Vec<Arc<dyn CnpjRegistry>> = vec![
        Arc::new(OpenCnpjService::new(
            client.clone(),
            config.cnpja_api_url.clone(),
            config.cnpja_api_key.clone(),
        )),
        Arc::new(BrasilApiService::new(
            client.clone(),
            config.brasilapi_url.clone(),
        )),
    ];

    EnrichmentProviders {
        whois: config
            .whois_api_url
            .as_ref()
            .map(|url| Arc::new(WhoisService::new(client.clone(), url.clone())) as Arc<dyn WhoisLookup>),
        website: Some(Arc::new(WebsiteScraperService::new(client.clone()))),
        cnpj: Some(Arc::new(CnpjFallbackChain::new(registries))),
        whatsapp: config
            .whatsapp_api_url
            .as_ref()
            .map(|url| {
                Arc::new(WhatsappService::new(client.clone(), url.clone())) as Arc<dyn WhatsappValidator>
            }),
    }
}

/// Main entry point for the application.
///
/// This function initializes the application, including:
/// - Logging and tracing.
/// - Configuration loading.
/// - The run store (Postgres, or in-memory without `DB_URL`).
/// - Search sources and enrichment providers.
/// - Stage workers and the watchdog.
/// - HTTP routes and middleware (CORS, Rate Limiting).
///
/// It then starts the Axum server and drains the workers on Ctrl-C.
///
/// # Returns
///
/// * `anyhow::Result<()>` - Ok if the server runs successfully, or an error if initialization fails.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_lead_extraction=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    let stores = match &config.database_url {
        Some(url) => {
            let db = Database::connect_and_migrate(url).await?;
            tracing::info!("Database connection pool established");
            Stores::shared(Arc::new(PgStore::new(db.pool)))
        }
        None => {
            tracing::warn!("Running on the in-memory store; runs are lost on restart");
            Stores::shared(Arc::new(MemoryStore::new()))
        }
    };

    let client = reqwest::Client::builder()
        .timeout(config.pipeline.http_timeout)
        .build()?;
    let sources = build_sources(&config, &client);
    let providers = build_providers(&config, &client);
    tracing::info!("✓ Search sources and enrichment providers initialized");

    let events = EventBus::default();
    tokio::spawn(log_events(events.subscribe()));

    let shutdown = CancellationToken::new();
    let (queue, receiver) = JobQueue::new();
    let pipeline = Arc::new(Pipeline::new(
        stores,
        sources,
        providers,
        events,
        config.pipeline.clone(),
        queue.clone(),
    ));
    let workers = pipeline.spawn_workers(receiver, shutdown.clone());

    let watchdog = Arc::new(Watchdog::new(
        pipeline.tracker().clone(),
        queue,
        config.pipeline.clone(),
    ));
    let watchdog_task = tokio::spawn(Arc::clone(&watchdog).run(shutdown.clone()));

    let app_state = Arc::new(AppState { pipeline, watchdog });

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid rate limiter configuration"))?,
    );

    // Build protected routes with security layers
    let protected_routes = handlers::api_routes()
        .route("/docs", get(serve_swagger_ui))
        .route("/api-docs/openapi.json", get(handlers::openapi_json))
        .layer(
            ServiceBuilder::new()
                // Request size limit: 5MB max payload
                .layer(RequestBodyLimitLayer::new(5 * 1024 * 1024))
                // Rate limiting: 10 req/sec per IP, burst of 20
                .layer(GovernorLayer {
                    config: governor_conf,
                }),
        );

    // Health check bypasses rate limiting
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    let signal = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
        tracing::info!("Shutdown signal received");
        signal.cancel();
    })
    .await?;

    shutdown.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    let _ = watchdog_task.await;
    tracing::info!("Stage workers stopped, bye");

    Ok(())
}
