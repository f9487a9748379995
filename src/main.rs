//! branchline - branching conversation server
//!
//! Stores conversations as trees of messages with a movable tip, reconciles
//! offline-authored batches, and pushes live updates over SSE and WebSocket.

mod api;
mod broadcast;
mod config;
mod conversation;
mod db;
mod error;
mod generation;
#[cfg(test)]
mod testing;

use api::{create_router, AppState};
use broadcast::Broadcaster;
use config::Config;
use conversation::{ConversationService, DatabaseRepository};
use db::Database;
use generation::{GenerationWorker, HttpResponseEngine};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "branchline=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Config::from_env();

    // Ensure database directory exists
    if let Some(parent) = PathBuf::from(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path, "Opening database");
    let db = Database::open(&config.db_path)?;

    let repo = Arc::new(DatabaseRepository::new(db));
    let broadcaster = Broadcaster::new(config.queue_capacity);
    let mut service = ConversationService::new(repo.clone(), broadcaster.clone(), config.tip_policy);

    // Generation workers share the service's tip controller
    let cancel = CancellationToken::new();
    let mut workers = Vec::new();
    if let Some(url) = &config.engine_url {
        let engine = Arc::new(HttpResponseEngine::new(url.clone(), config.generation_timeout)?);
        let worker = GenerationWorker::new(
            repo,
            service.tips(),
            engine,
            broadcaster,
            config.generation_timeout,
        );
        let (handle, handles) = worker.start(config.generation_workers, config.generation_queue, cancel.clone());
        service = service.with_generation(handle);
        workers = handles;
        tracing::info!(
            engine = %url,
            workers = config.generation_workers,
            "Response generation enabled"
        );
    } else {
        tracing::warn!("No response engine configured. Set BRANCHLINE_ENGINE_URL to enable replies.");
    }

    let state = AppState::new(service, config.keepalive);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(compression);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("branchline server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    for handle in workers {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "Generation worker ended abnormally");
        }
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
    cancel.cancel();
}
