//! Typsnip HTTP API Server
//!
//! Serves the snippet API: creating and updating snippets renders them
//! through the Typst render service in every requested engine version,
//! charged against each user's daily computation budget.

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::HeaderValue,
    response::Json,
    routing::get,
};
use serde_json::{Value, json};
use std::{net::SocketAddr, sync::Arc};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use typsnip::{BudgetLedger, HttpRenderClient};
use typsnip_registry::{
    Authenticator, BlobStorage, FsStorage, MemorySnippetStore, MemoryStorage, PostgresSnippetStore,
    S3Storage, SnippetService, SnippetStore,
};

mod auth;
mod config;
mod error;
mod models;
mod routes;

use config::{ServerConfig, StorageBackend};
use error::{ApiError, Result};

/// Main application state
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SnippetService>,
    pub authenticator: Arc<dyn Authenticator>,
    pub config: ServerConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "typsnip_server=debug,typsnip=info,typsnip_registry=info,tower_http=debug".to_string()
        }))
        .init();

    // Load configuration
    let config = ServerConfig::from_env()?;
    info!("Starting Typsnip Server on {}:{}", config.host, config.port);

    let state = build_state(config.clone()).await?;
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|_| ApiError::Config(format!("Invalid bind address {}:{}", config.host, config.port)))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("Server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Artifact backend selected by `STORAGE_BACKEND`
async fn blob_storage(config: &ServerConfig) -> Result<Arc<dyn BlobStorage>> {
    let blobs: Arc<dyn BlobStorage> = match config.storage_backend {
        StorageBackend::Memory => {
            warn!("Artifacts are kept in memory and lost on restart");
            Arc::new(MemoryStorage::new())
        }
        StorageBackend::Fs => Arc::new(FsStorage::new(&config.storage_path).await?),
        StorageBackend::S3 => {
            let s3 = S3Storage::from_env()?;
            // Ensure S3 bucket exists
            if let Err(e) = s3.ensure_bucket().await {
                error!("Failed to ensure S3 bucket exists: {}", e);
            }
            Arc::new(s3)
        }
    };
    Ok(blobs)
}

async fn build_state(config: ServerConfig) -> Result<AppState> {
    let blobs = blob_storage(&config).await?;
    let renderer = Arc::new(HttpRenderClient::new(&config.typst_url)?);
    info!("Rendering through {}", renderer.endpoint());

    let (store, ledger, authenticator): (
        Arc<dyn SnippetStore>,
        Arc<dyn BudgetLedger>,
        Arc<dyn Authenticator>,
    ) = match &config.database_url {
        Some(url) => {
            let postgres = Arc::new(PostgresSnippetStore::from_url(url).await?);
            postgres.migrate().await?;
            (
                postgres.clone() as Arc<dyn SnippetStore>,
                postgres.clone() as Arc<dyn BudgetLedger>,
                postgres as Arc<dyn Authenticator>,
            )
        }
        None => {
            warn!("DATABASE_URL is not set, using the in-memory snippet store");
            let memory = Arc::new(MemorySnippetStore::new());
            seed_dev_user(&memory)?;
            (
                memory.clone() as Arc<dyn SnippetStore>,
                memory.clone() as Arc<dyn BudgetLedger>,
                memory as Arc<dyn Authenticator>,
            )
        }
    };

    let service = SnippetService::new(store, ledger, blobs, renderer, config.render.clone());

    Ok(AppState {
        service: Arc::new(service),
        authenticator,
        config,
    })
}

/// A user to log in with when running without a database
fn seed_dev_user(store: &MemorySnippetStore) -> Result<()> {
    let user = store.create_user("dev")?;
    let token = store.issue_token(user.id)?;
    info!("Development user '{}' can authenticate with bearer token {}", user.username, token);
    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::permissive();
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin '{}'", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);

    Router::new()
        // Health check
        .route("/health", get(health_check))
        // API routes
        .nest("/v1", api_routes())
        .nest("/uploads", routes::uploads::router())
        // Middleware
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors)
                .layer(DefaultBodyLimit::max(1024 * 1024)),
        )
        .with_state(state)
}

/// API routes
fn api_routes() -> Router<AppState> {
    Router::new().nest("/snippets", routes::snippets::router())
}

/// Health check endpoint
async fn health_check() -> Result<Json<Value>> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "typsnip-server",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": time::OffsetDateTime::now_utc()
    })))
}
