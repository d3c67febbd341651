use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::service::TicketService;
use crate::sweeper::{self, DEFAULT_SWEEP_INTERVAL};

/// Server configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 9191,
            request_timeout_secs: 300,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL.as_secs(),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TicketService>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/tickets/analyze", post(handlers::analyze))
        .route("/api/tickets/analyze/stream", post(handlers::analyze_stream))
        .route("/api/tickets/analyze/batch", post(handlers::analyze_batch))
        .route("/api/tickets/approve/{session_id}", post(handlers::approve))
        .route("/api/tickets/approve/{session_id}/stream", post(handlers::approve_stream))
        .route("/api/sessions/{session_id}", get(handlers::session))
        .with_state(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind, serve, and start the session sweeper.
pub async fn start(config: ServerConfig, state: AppState) -> Result<ServerHandle, std::io::Error> {
    let _sweeper = sweeper::start_sweeper(
        Arc::clone(&state.service),
        Duration::from_secs(config.sweep_interval_secs.max(1)),
    );

    let router = build_router(state, Duration::from_secs(config.request_timeout_secs));
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "triage server started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server_handle,
        _sweeper,
    })
}

/// Handle returned by `start()`; keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _sweeper: tokio::task::JoinHandle<()>,
}
