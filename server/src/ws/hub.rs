//! Connection Hub
//!
//! Maps each connected user to the outbound queue of their socket and
//! delivers SFU notifications through it.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use super::ServerEvent;
use crate::voice::sfu::{SfuEvents, Signal};

struct Connection {
    id: u64,
    tx: mpsc::Sender<ServerEvent>,
}

/// Registry of connected users.
#[derive(Default)]
pub struct Hub {
    connections: DashMap<Uuid, Connection>,
    next_id: AtomicU64,
}

impl Hub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket for `user_id`, replacing any older one.
    ///
    /// Returns the connection id to pass to [`Self::unregister`].
    pub fn register(&self, user_id: Uuid, tx: mpsc::Sender<ServerEvent>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if self.connections.insert(user_id, Connection { id, tx }).is_some() {
            debug!(user_id = %user_id, "Replaced existing connection");
        }
        id
    }

    /// Unregister a socket. A newer socket for the same user is left alone.
    ///
    /// Returns whether the entry was removed.
    pub fn unregister(&self, user_id: Uuid, connection_id: u64) -> bool {
        self.connections
            .remove_if(&user_id, |_, c| c.id == connection_id)
            .is_some()
    }

    /// Whether the user has a live socket.
    pub fn is_connected(&self, user_id: Uuid) -> bool {
        self.connections.contains_key(&user_id)
    }

    /// Number of connected users.
    pub fn connected_count(&self) -> usize {
        self.connections.len()
    }

    /// Queue an event for one user without waiting. Returns whether it was queued.
    pub fn send(&self, user_id: Uuid, event: ServerEvent) -> bool {
        let Some(tx) = self.connections.get(&user_id).map(|c| c.tx.clone()) else {
            debug!(user_id = %user_id, "Dropping event for disconnected user");
            return false;
        };

        match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(user_id = %user_id, "Outbound queue full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Queue an event for every connected user.
    pub fn broadcast(&self, event: &ServerEvent) {
        let targets: Vec<Uuid> = self.connections.iter().map(|c| *c.key()).collect();
        for user_id in targets {
            self.send(user_id, event.clone());
        }
    }
}

impl From<Signal> for ServerEvent {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::Offer { sdp } => Self::WebrtcOffer { sdp },
            Signal::IceCandidate { candidate } => Self::WebrtcIce { candidate },
            Signal::ScreenOffer { sdp } => Self::WebrtcScreenOffer { sdp },
            Signal::ScreenIceCandidate { candidate } => Self::WebrtcScreenIce { candidate },
        }
    }
}

impl SfuEvents for Hub {
    fn signal(&self, user_id: Uuid, signal: Signal) {
        self.send(user_id, signal.into());
    }

    fn peer_removed(&self, user_id: Uuid, channel_id: Uuid) {
        debug!(user_id = %user_id, channel_id = %channel_id, "Broadcasting voice departure");
        self.broadcast(&ServerEvent::VoiceStateUpdate {
            user_id,
            channel_id: None,
            self_mute: false,
            self_deafen: false,
            server_mute: false,
            speaking: false,
        });
    }

    fn screen_share_stopped(&self, presenter_id: Uuid, channel_id: Uuid) {
        self.broadcast(&ServerEvent::ScreenShareStopped {
            user_id: presenter_id,
            channel_id,
        });
    }
}
