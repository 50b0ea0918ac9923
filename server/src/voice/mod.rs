//! Voice Service (SFU)
//!
//! WebRTC Selective Forwarding Unit for voice channels and screen sharing.
//!
//! Voice signaling is handled through WebSocket (see ws/mod.rs).
//! This module provides:
//! - SFU server for managing voice rooms and screen share rooms
//! - Offer/answer negotiation per connection
//! - RTP forwarding from inbound tracks to subscribers
//! - HTTP endpoint for ICE server configuration

pub mod error;
mod handlers;
pub mod media;
#[cfg(test)]
pub(crate) mod mock;
pub mod negotiation;
pub mod peer;
pub mod room;
pub mod rtc;
pub mod screen_share;
pub mod sfu;
pub mod track;
pub mod ws_handler;

use axum::routing::get;
use axum::Router;
// Re-exports
pub use error::VoiceError;
pub use handlers::IceServersResponse;
pub use peer::{Peer, VoiceState};
pub use room::Room;
pub use rtc::RtcFactory;
pub use screen_share::{ScreenRole, ScreenRoom, ScreenShareState};
pub use sfu::{SfuEvents, SfuServer, Signal};

use crate::api::AppState;

/// Create voice router.
///
/// Note: Voice join/leave are handled via WebSocket events.
/// This router only provides ICE server configuration.
pub fn router() -> Router<AppState> {
    Router::new().route("/ice-servers", get(handlers::get_ice_servers))
}
