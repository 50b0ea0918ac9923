//! API Router and Application State
//!
//! Central routing configuration and shared state.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{config::Config, voice, voice::SfuServer, ws, ws::Hub};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration
    pub config: Arc<Config>,
    /// SFU server for voice channels and screen shares
    pub sfu: Arc<SfuServer>,
    /// Connected WebSocket clients
    pub hub: Arc<Hub>,
}

impl AppState {
    /// Create new application state.
    #[must_use]
    pub fn new(config: Config, sfu: Arc<SfuServer>, hub: Arc<Hub>) -> Self {
        Self {
            config: Arc::new(config),
            sfu,
            hub,
        }
    }
}

/// Create the main application router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(health_check))
        .nest("/api/voice", voice::router())
        // WebSocket
        .route("/ws", get(ws::handler))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    /// Service status
    status: &'static str,
    /// Active voice rooms
    rooms: usize,
    /// Active screen shares
    screen_shares: usize,
    /// Connected WebSocket clients
    connections: usize,
}

/// Health check endpoint.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        rooms: state.sfu.room_count().await,
        screen_shares: state.sfu.screen_shares().await.len(),
        connections: state.hub.connected_count(),
    })
}
