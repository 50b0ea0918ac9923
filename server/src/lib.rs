//! Kaiku SFU
//!
//! Selective forwarding unit for voice channels and screen sharing.
//! Clients signal over WebSocket; media flows over WebRTC.

pub mod api;
pub mod config;
pub mod voice;
pub mod ws;
