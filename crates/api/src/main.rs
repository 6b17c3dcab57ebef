//! HTTP entrypoint: wires the repository, object store, and external
//! clients into the dispatch engine and the route modules, then starts the
//! worker-failer and work-reaper background loops alongside the server.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tessera_core::OrchestratorConfig;
use tessera_dispatch::{DispatchEngine, WorkFailer, WorkReaper};
use tessera_storage::{PostgresRepository, SharedRepository};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use tessera_api::openapi::ApiDoc;
use tessera_api::routes;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tessera_api=info,tower_http=info".to_string()),
        )
        .init();

    tracing::info!("tessera-api starting");

    let config = OrchestratorConfig::from_env();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;
    let repo: SharedRepository = Arc::new(
        PostgresRepository::connect(&database_url)
            .await
            .map_err(|e| anyhow::anyhow!("failed to connect to database: {e}"))?,
    );
    tracing::info!("connected to database");

    let store: Arc<dyn tessera_clients::ObjectStore> = build_object_store(&config).await;
    let permission_client: Arc<dyn tessera_clients::PermissionClient> = Arc::new(
        tessera_clients::HttpPermissionClient::new(
            std::env::var("PERMISSION_SERVICE_URL").context("PERMISSION_SERVICE_URL environment variable required")?,
        ),
    );

    let engine = Arc::new(DispatchEngine::new(repo.clone(), store.clone(), config.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let failer = Arc::new(WorkFailer::new(repo.clone(), config.clone()));
    let failer_handle = failer.spawn(shutdown_rx.clone());

    let reaper = Arc::new(WorkReaper::new(repo.clone(), config.clone()));
    let reaper_handle = reaper.spawn(shutdown_rx.clone());

    let worker_state = routes::worker::AppState {
        engine: engine.clone(),
        repo: repo.clone(),
    };
    let jobs_state = routes::jobs::AppState {
        repo: repo.clone(),
        permission_client: permission_client.clone(),
        default_limit: config.default_result_page_size,
    };
    let stac_state = routes::stac::AppState {
        repo: repo.clone(),
        permission_client: permission_client.clone(),
        default_limit: config.default_result_page_size,
    };

    let api_routes = Router::new()
        .merge(routes::worker::routes(worker_state))
        .merge(routes::jobs::routes(jobs_state))
        .merge(routes::stac::routes(stac_state));

    let app = Router::new()
        .route("/health", get(health))
        .merge(api_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http());

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    tracing::info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    failer_handle.abort();
    reaper_handle.abort();
    Ok(())
}

async fn build_object_store(config: &OrchestratorConfig) -> Arc<dyn tessera_clients::ObjectStore> {
    if let Ok(bucket) = std::env::var("OBJECT_STORE_BUCKET") {
        Arc::new(tessera_clients::S3ObjectStore::new(bucket, &config.aws_default_region).await)
    } else {
        Arc::new(tessera_clients::LocalFsObjectStore::new(config.host_volume_path.clone()))
    }
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}
