//! Voice HTTP Handlers
//!
//! Voice signaling (join/leave/offer/answer/ice) is handled via WebSocket.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::api::AppState;
use crate::config::IceServer;

/// Response containing ICE server configuration.
#[derive(Debug, Serialize)]
pub struct IceServersResponse {
    /// List of ICE servers to use for WebRTC.
    pub ice_servers: Vec<IceServer>,
}

/// Get ICE server configuration.
///
/// GET /api/voice/ice-servers
///
/// Same STUN/TURN servers the SFU uses for its own connections.
pub async fn get_ice_servers(State(state): State<AppState>) -> Json<IceServersResponse> {
    Json(IceServersResponse {
        ice_servers: state.config.ice_servers(),
    })
}
