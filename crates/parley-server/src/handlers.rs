//! HTTP/WebSocket entry points.
//!
//! Upgrades inbound WebSocket handshakes and hands each connection to a
//! [`ConnectionSession`].

use crate::config::Config;
use crate::metrics;
use crate::session::ConnectionSession;
use anyhow::Result;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::IntoResponse,
    routing::get,
    Router,
};
use parley_core::{Broadcaster, MessageLog, OperationDispatcher};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Shared server state.
pub struct AppState {
    /// The operation dispatcher all sessions go through.
    pub dispatcher: Arc<OperationDispatcher>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state with a fresh, empty engine.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let dispatcher = OperationDispatcher::with_queue_capacity(
            Arc::new(MessageLog::new()),
            Arc::new(Broadcaster::new()),
            config.limits.subscription_queue_capacity,
        );

        Self {
            dispatcher: Arc::new(dispatcher),
            config,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Parley server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let session = ConnectionSession::new(Arc::clone(&state.dispatcher), &state.config);
    ws.on_upgrade(move |socket| session.run(socket))
}
