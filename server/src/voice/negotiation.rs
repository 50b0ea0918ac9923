//! Offer/Answer Negotiation
//!
//! Every SFU-side connection (voice peer, screen presenter, screen viewer)
//! is driven by a [`Negotiator`]. At most one offer is outstanding per
//! connection: a topology change that arrives while an offer awaits its
//! answer is recorded as `pending_change` and replayed, as a single new
//! offer, once that answer has been applied.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use super::error::VoiceError;
use super::media::MediaConnection;
use super::sfu::{SfuEvents, Signal};

/// Negotiation phase of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No offer outstanding; a new offer may be issued.
    Stable,
    /// An offer was sent and its answer has not been applied yet.
    AwaitingAnswer {
        /// A topology change happened after the outstanding offer was created.
        pending_change: bool,
    },
}

/// Outcome of a renegotiation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Renegotiation {
    /// A new offer was created and delivered.
    Sent,
    /// An offer is outstanding; the change will be offered after its answer.
    Deferred,
    /// The connection is closed.
    Skipped,
    /// Offer creation failed; the next topology change retries.
    Failed,
}

/// Which signaling messages a connection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalPath {
    /// `webrtc_offer` / `webrtc_ice`.
    Voice,
    /// `webrtc_screen_offer` / `webrtc_screen_ice`.
    Screen,
}

impl SignalPath {
    /// Wrap an offer SDP.
    #[must_use]
    pub fn offer(self, sdp: String) -> Signal {
        match self {
            Self::Voice => Signal::Offer { sdp },
            Self::Screen => Signal::ScreenOffer { sdp },
        }
    }

    /// Wrap a local ICE candidate.
    #[must_use]
    pub fn ice(self, candidate: RTCIceCandidateInit) -> Signal {
        match self {
            Self::Voice => Signal::IceCandidate { candidate },
            Self::Screen => Signal::ScreenIceCandidate { candidate },
        }
    }
}

/// Owns one connection and serializes its offers.
pub struct Negotiator {
    user_id: Uuid,
    connection: Arc<dyn MediaConnection>,
    state: Mutex<NegotiationState>,
    path: SignalPath,
    events: Arc<dyn SfuEvents>,
}

impl Negotiator {
    /// Wrap a freshly created connection.
    pub fn new(
        user_id: Uuid,
        connection: Arc<dyn MediaConnection>,
        path: SignalPath,
        events: Arc<dyn SfuEvents>,
    ) -> Self {
        Self {
            user_id,
            connection,
            state: Mutex::new(NegotiationState::Stable),
            path,
            events,
        }
    }

    /// User this connection belongs to.
    pub const fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// The underlying connection.
    pub const fn connection(&self) -> &Arc<dyn MediaConnection> {
        &self.connection
    }

    /// Current negotiation phase.
    pub async fn state(&self) -> NegotiationState {
        *self.state.lock().await
    }

    /// Whether a renegotiation is waiting for the outstanding answer.
    pub async fn needs_renegotiation(&self) -> bool {
        matches!(
            *self.state.lock().await,
            NegotiationState::AwaitingAnswer {
                pending_change: true
            }
        )
    }

    /// Create the first offer and set it as the local description.
    ///
    /// The offer is not delivered; call [`Self::send_offer`] once the
    /// connection is registered.
    pub async fn initial_offer(&self) -> Result<String, VoiceError> {
        *self.state.lock().await = NegotiationState::AwaitingAnswer {
            pending_change: false,
        };

        match self.connection.create_local_offer().await {
            Ok(sdp) => Ok(sdp),
            Err(e) => {
                *self.state.lock().await = NegotiationState::Stable;
                Err(e)
            }
        }
    }

    /// Deliver an offer to the user.
    pub fn send_offer(&self, sdp: String) {
        self.events.signal(self.user_id, self.path.offer(sdp));
    }

    /// Deliver a locally gathered ICE candidate to the user.
    pub fn send_ice_candidate(&self, candidate: RTCIceCandidateInit) {
        self.events.signal(self.user_id, self.path.ice(candidate));
    }

    /// Offer the connection's current topology, or defer if an offer is outstanding.
    pub async fn renegotiate(&self) -> Renegotiation {
        {
            let mut state = self.state.lock().await;
            let signaling = self.connection.signaling_state();

            if signaling == RTCSignalingState::Closed {
                return Renegotiation::Skipped;
            }

            let stable = *state == NegotiationState::Stable && signaling == RTCSignalingState::Stable;
            if !stable {
                *state = NegotiationState::AwaitingAnswer {
                    pending_change: true,
                };
                debug!(
                    user_id = %self.user_id,
                    signaling = %signaling,
                    "Deferring renegotiation until answer"
                );
                return Renegotiation::Deferred;
            }

            *state = NegotiationState::AwaitingAnswer {
                pending_change: false,
            };
        }

        match self.connection.create_local_offer().await {
            Ok(sdp) => {
                debug!(user_id = %self.user_id, "Sent renegotiation offer");
                self.send_offer(sdp);
                Renegotiation::Sent
            }
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "Renegotiation offer failed");
                *self.state.lock().await = NegotiationState::Stable;
                Renegotiation::Failed
            }
        }
    }

    /// Apply the user's answer, then run any deferred renegotiation.
    ///
    /// On error the connection keeps its previous state.
    pub async fn apply_answer(&self, sdp: String) -> Result<(), VoiceError> {
        self.connection.set_remote_answer(sdp).await?;

        let pending = {
            let mut state = self.state.lock().await;
            let pending = matches!(
                *state,
                NegotiationState::AwaitingAnswer {
                    pending_change: true
                }
            );
            *state = NegotiationState::Stable;
            pending
        };

        if pending {
            debug!(user_id = %self.user_id, "Running deferred renegotiation");
            self.renegotiate().await;
        }

        Ok(())
    }

    /// Apply a remote ICE candidate.
    pub async fn add_ice_candidate(
        &self,
        candidate: RTCIceCandidateInit,
    ) -> Result<(), VoiceError> {
        self.connection.add_ice_candidate(candidate).await
    }

    /// Close the connection, logging failures.
    pub async fn close(&self) {
        if let Err(e) = self.connection.close().await {
            warn!(user_id = %self.user_id, error = %e, "Failed to close connection");
        }
    }
}
