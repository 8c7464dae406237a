//! Huddle Relay Server
//!
//! A self-hostable signaling store for Huddle calls. Clients connect over
//! WebSocket and read, write, and watch the call session and candidate
//! documents that drive peer negotiation. The relay never looks inside the
//! documents; expired call sessions are swept on an interval.

pub mod handler;
pub mod state;

use axum::{
    extract::{State, WebSocketUpgrade},
    http::Method,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use state::RelayState;

/// Build the relay's HTTP router.
pub fn router(state: RelayState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Route Handlers ────────────────────────────────────────────────────────────

/// WebSocket upgrade handler for client connections.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handler::handle_websocket(socket, state))
}

/// Health check endpoint.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "huddle-relay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Snapshot of relay load.
#[derive(Debug, Serialize)]
pub struct RelayStats {
    pub online_clients: usize,
    pub active_subscriptions: usize,
    pub stored_documents: usize,
    pub timestamp: i64,
}

impl RelayStats {
    /// Collect the current counters.
    pub fn collect(state: &RelayState) -> Self {
        Self {
            online_clients: state.online_count(),
            active_subscriptions: state.subscription_count(),
            stored_documents: state.store.document_count(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Statistics endpoint.
async fn stats_handler(State(state): State<RelayState>) -> impl IntoResponse {
    Json(RelayStats::collect(&state))
}
