mod config;
mod db;
mod error;
mod handlers;
mod middleware;
mod models;
mod services;
mod storage;


use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::db::Database;
use crate::services::{AuthorizationEngine, FileService, TokenVerifier};
use crate::storage::{Catalog, ChunkStore};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub verifier: Arc<TokenVerifier>,
    pub files: Arc<FileService>,
    pub required_role: Option<String>,
}

impl AppState {
    pub fn new(config: Arc<Config>, db: Database) -> anyhow::Result<Self> {
        let catalog = Catalog::new(db.clone());
        let chunks = ChunkStore::new(db, config.storage.chunk_size);
        let authz = AuthorizationEngine::from_config(&config.auth);
        let files = FileService::new(
            catalog,
            chunks,
            authz,
            config.storage.max_upload_size,
            Duration::from_secs(config.storage.pending_ttl_secs),
        );
        let verifier = TokenVerifier::from_config(&config.auth)?;
        let required_role = Some(config.auth.required_role.clone()).filter(|r| !r.is_empty());

        Ok(Self {
            config,
            verifier: Arc::new(verifier),
            files: Arc::new(files),
            required_role,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "micro_file_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting micro file server...");

    // Load configuration
    let config = Arc::new(Config::load()?);
    tracing::info!(
        db_path = %config.database.path,
        path_prefix = %config.server.path_prefix,
        test_mode = config.auth.test_mode,
        chunk_size = config.storage.chunk_size,
        max_upload_size = config.storage.max_upload_size,
        "Configuration loaded"
    );
    if config.auth.test_mode {
        tracing::warn!("Token verification is running in test mode; do not expose this server");
    }

    // Initialize database
    let db = Database::new(
        &config.database.path,
        config.database.max_connections,
        config.storage.op_timeout(),
    )
    .await?;
    db.run_migrations().await?;
    tracing::info!("Database initialized");

    let state = AppState::new(config.clone(), db)?;

    spawn_upload_sweeper(
        state.files.clone(),
        Duration::from_secs(config.storage.sweep_interval_secs),
    );

    // Build router
    let app = create_router(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}{}", addr, config.server.path_prefix);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodically drop uploads that never reached the committed state
fn spawn_upload_sweeper(files: Arc<FileService>, every: Duration) {
    let every = every.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            ticker.tick().await;
            if let Err(e) = files.purge_abandoned_uploads().await {
                tracing::error!(error = %e, "Failed to purge abandoned uploads");
            }
        }
    });
}

fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let body_limit = usize::try_from(state.config.storage.max_upload_size).unwrap_or(usize::MAX);

    // Public routes (no auth required)
    let public_routes = Router::new().route("/health", get(handlers::file::health));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route("/upload", post(handlers::file::upload_file))
        .route("/files", get(handlers::file::list_files))
        .route(
            "/files/:id",
            get(handlers::file::get_file).delete(handlers::file::delete_file),
        )
        .route("/files/:id/info", get(handlers::file::get_file_info))
        .route("/download/:id", get(handlers::file::download_file))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::auth_middleware,
        ));

    let routes = public_routes.merge(protected_routes);
    let prefix = state.config.server.path_prefix.clone();
    let router = if prefix.is_empty() {
        routes
    } else {
        Router::new().nest(&prefix, routes)
    };

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
