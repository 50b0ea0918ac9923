//! Server Configuration
//!
//! Loads configuration from environment variables.

use anyhow::{Context, Result};
use serde::Serialize;
use std::env;
use uuid::Uuid;

/// Default STUN server when `STUN_SERVER` is unset.
const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// ICE server handed to the media engine and to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IceServer {
    /// Server URLs (e.g., "stun:stun.l.google.com:19302")
    pub urls: Vec<String>,
    /// Username for TURN servers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Credential for TURN servers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:8080")
    pub bind_address: String,

    /// WebRTC STUN server. Empty disables STUN.
    pub stun_server: String,

    /// WebRTC TURN server (optional)
    pub turn_server: Option<String>,

    /// WebRTC TURN username (optional)
    pub turn_username: Option<String>,

    /// WebRTC TURN credential (optional)
    pub turn_credential: Option<String>,

    /// Public IP advertised in host candidates (1:1 NAT)
    pub public_ip: Option<String>,

    /// Users allowed to server-mute others
    pub admin_user_ids: Vec<Uuid>,

    /// Per-connection outbound WebSocket queue (default: 256 events)
    pub ws_send_buffer: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            stun_server: env::var("STUN_SERVER").unwrap_or_else(|_| DEFAULT_STUN_SERVER.into()),
            turn_server: non_empty_var("TURN_SERVER"),
            turn_username: non_empty_var("TURN_USERNAME"),
            turn_credential: non_empty_var("TURN_CREDENTIAL"),
            public_ip: non_empty_var("PUBLIC_IP"),
            admin_user_ids: env::var("ADMIN_USER_IDS")
                .map(|v| parse_user_ids(&v))
                .unwrap_or_else(|_| Ok(Vec::new()))
                .context("ADMIN_USER_IDS must be a comma-separated list of UUIDs")?,
            ws_send_buffer: env::var("WS_SEND_BUFFER")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(256),
        })
    }

    /// Check if TURN is configured.
    #[must_use]
    pub const fn has_turn(&self) -> bool {
        self.turn_server.is_some()
    }

    /// Whether `user_id` may perform administrative voice actions.
    #[must_use]
    pub fn is_admin(&self, user_id: Uuid) -> bool {
        self.admin_user_ids.contains(&user_id)
    }

    /// ICE servers for peer connections: STUN if set, then TURN if set.
    #[must_use]
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let mut servers = Vec::new();

        if !self.stun_server.is_empty() {
            servers.push(IceServer {
                urls: vec![self.stun_server.clone()],
                username: None,
                credential: None,
            });
        }

        if let Some(turn) = &self.turn_server {
            servers.push(IceServer {
                urls: vec![turn.clone()],
                username: self.turn_username.clone(),
                credential: self.turn_credential.clone(),
            });
        }

        servers
    }

    /// Create a default configuration for testing.
    ///
    /// No STUN server, so connections gather host candidates only and
    /// tests never touch the network.
    #[must_use]
    pub fn default_for_test() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".into(),
            stun_server: String::new(),
            turn_server: None,
            turn_username: None,
            turn_credential: None,
            public_ip: None,
            admin_user_ids: Vec::new(),
            ws_send_buffer: 256,
        }
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_user_ids(value: &str) -> std::result::Result<Vec<Uuid>, uuid::Error> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Uuid::parse_str)
        .collect()
}
