mod api;
mod config;
mod db;
mod digest;
mod error;
mod flush;
mod ingest;
mod package;
mod queue;
mod record;
mod storage;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::AppState;
use config::Config;
use db::SqliteRepository;
use flush::FlushSupervisor;
use ingest::IngestionPipeline;
use package::RetrievalPackager;
use queue::NatsDispatcher;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sample_vault=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();

    // Metadata repository
    let repo = SqliteRepository::open(
        &config.db_path,
        config.admin_username.clone(),
        config.admin_password.clone(),
    )
    .await
    .expect("Failed to initialize metadata repository");
    let repo: Arc<dyn db::MetadataRepository> = Arc::new(repo);
    tracing::info!("Metadata repository initialized at {:?}", config.db_path);

    // Object store
    let store = config.storage.build().await;
    tracing::info!("Object store ready: {:?}", config.storage.storage_type);

    // Job queue
    let dispatcher = NatsDispatcher::connect(&config.nats_url)
        .await
        .expect("Failed to connect to NATS");
    let dispatcher: Arc<dyn queue::JobDispatcher> = Arc::new(dispatcher);

    let state = Arc::new(AppState {
        pipeline: IngestionPipeline::new(
            store.clone(),
            repo.clone(),
            dispatcher,
            config.max_upload_size,
            config.upload_timeout,
        ),
        packager: RetrievalPackager::new(store),
        repo,
        flush: FlushSupervisor::new(),
    });

    let app = api::router()
        .with_state(state)
        // Leave headroom above the admission cap so the pipeline's own
        // size check produces the 413, with its structured body.
        .layer(DefaultBodyLimit::max(config.max_upload_size + 1024 * 1024))
        .layer(TraceLayer::new_for_http());

    tracing::info!("Sample Vault starting on http://{}", config.bind_addr);
    tracing::info!("Admission size cap: {} bytes", config.max_upload_size);
    tracing::info!("");
    tracing::info!("API Endpoints:");
    tracing::info!("  POST   /v1/files                  - Admit a submission");
    tracing::info!("  GET    /v1/files?fields=a,b       - List records (projected)");
    tracing::info!("  GET    /v1/files/:digest          - Record details");
    tracing::info!("  PUT    /v1/files/:digest          - Merge partial update");
    tracing::info!("  GET    /v1/files/:digest/download - Packaged download");
    tracing::info!("  DELETE /v1/files                  - Flush repository (admin)");
    tracing::info!("  GET    /v1/admin/flush            - Flush task status");
    tracing::info!("  GET    /health                    - Health check");

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .expect("Failed to bind listener");
    axum::serve(listener, app).await.expect("Server error");
}
