//! Tidemark API Server - tenant PDF watermarking
//!
//! Provides REST endpoints for:
//! - Watermarking uploaded PDFs with the tenant's brand and tracking code
//! - Health checks

use anyhow::Result;
use axum::extract::DefaultBodyLimit;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

mod disclaimer;
mod error;
mod handlers;
mod models;
mod state;

use state::AppState;

/// Uploads are whole documents, not form fields; allow up to 50 MiB.
const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tidemark_api=info".parse()?)
                .add_directive("tidemark_core=info".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    info!("Initializing Tidemark API...");
    let state = AppState::new().await?;
    let state = Arc::new(state);

    // CORS configuration for browser-based partners
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(handlers::health))
        .route("/watermark", post(handlers::watermark))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting Tidemark API on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
