//! Voice Room
//!
//! All peers of one voice channel. Every peer's audio is forwarded to every
//! other peer of the room, never back to its sender.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use super::error::VoiceError;
use super::media::{is_terminal, ConnectionFactory, InboundTrack, MediaProfile};
use super::peer::{Peer, VoiceState};
use super::sfu::{SfuEvents, SfuServer};
use super::track::ForwardingTrack;

#[derive(Default)]
struct RoomState {
    peers: HashMap<Uuid, Arc<Peer>>,
    /// Set by the router when it drops the room; no peer may be added afterwards.
    retired: bool,
}

/// A voice channel's set of peers.
pub struct Room {
    /// Channel ID.
    pub channel_id: Uuid,
    state: RwLock<RoomState>,
    /// Serializes joins so a joiner never misses a peer joining alongside it.
    join_lock: Mutex<()>,
    factory: Arc<dyn ConnectionFactory>,
    events: Arc<dyn SfuEvents>,
    sfu: Weak<SfuServer>,
}

impl Room {
    /// Create an empty room.
    pub fn new(
        channel_id: Uuid,
        factory: Arc<dyn ConnectionFactory>,
        events: Arc<dyn SfuEvents>,
        sfu: Weak<SfuServer>,
    ) -> Self {
        Self {
            channel_id,
            state: RwLock::new(RoomState::default()),
            join_lock: Mutex::new(()),
            factory,
            events,
            sfu,
        }
    }

    /// Connect a user to the room and send them the initial offer.
    ///
    /// The offer already contains a track for every peer whose audio has
    /// arrived. Tracks arriving while the join is in flight are attached
    /// right after the peer becomes visible.
    pub async fn add_peer(self: &Arc<Self>, user_id: Uuid) -> Result<Arc<Peer>, VoiceError> {
        let _join = self.join_lock.lock().await;

        {
            let state = self.state.read().await;
            if state.retired {
                return Err(VoiceError::RoomClosed(self.channel_id));
            }
            if state.peers.contains_key(&user_id) {
                return Err(VoiceError::AlreadyJoined);
            }
        }

        let connection = self.factory.new_connection(MediaProfile::Voice).await?;
        let peer = Arc::new(Peer::new(
            user_id,
            self.channel_id,
            connection,
            self.events.clone(),
        ));

        let offer = match self.setup_peer(&peer).await {
            Ok(offer) => offer,
            Err(e) => {
                warn!(channel_id = %self.channel_id, user_id = %user_id, error = %e, "Voice peer setup failed");
                peer.close().await;
                return Err(e);
            }
        };

        {
            let mut state = self.state.write().await;
            if state.retired {
                drop(state);
                peer.close().await;
                return Err(VoiceError::RoomClosed(self.channel_id));
            }
            state.peers.insert(user_id, peer.clone());
        }

        peer.negotiator().send_offer(offer);
        self.attach_missed_tracks(&peer).await;

        info!(
            channel_id = %self.channel_id,
            user_id = %user_id,
            "Peer joined voice room"
        );

        Ok(peer)
    }

    /// Register handlers, attach existing tracks and create the initial offer.
    async fn setup_peer(self: &Arc<Self>, peer: &Arc<Peer>) -> Result<String, VoiceError> {
        let connection = peer.connection().clone();
        connection.add_recv_transceiver(RTPCodecType::Audio).await?;

        self.register_track_handler(peer);
        Self::register_ice_handler(peer);
        self.register_state_handler(peer);

        for other in self.other_peers(peer.user_id).await {
            let Some(track) = other.forward_track() else {
                continue;
            };
            if let Err(e) = peer.attach_source(other.user_id, &track).await {
                warn!(
                    channel_id = %self.channel_id,
                    user_id = %peer.user_id,
                    source_id = %other.user_id,
                    error = %e,
                    "Failed to attach existing track"
                );
            }
        }

        peer.negotiator().initial_offer().await
    }

    fn register_track_handler(self: &Arc<Self>, peer: &Arc<Peer>) {
        let room = Arc::downgrade(self);
        let peer_ref = Arc::downgrade(peer);

        peer.connection().on_track(Box::new(move |inbound| {
            let room = room.clone();
            let peer = peer_ref.clone();
            Box::pin(async move {
                if let (Some(room), Some(peer)) = (room.upgrade(), peer.upgrade()) {
                    room.handle_inbound_track(&peer, inbound).await;
                }
            })
        }));
    }

    fn register_ice_handler(peer: &Arc<Peer>) {
        let peer_ref = Arc::downgrade(peer);

        peer.connection().on_ice_candidate(Box::new(move |candidate| {
            let peer = peer_ref.clone();
            Box::pin(async move {
                if let Some(peer) = peer.upgrade() {
                    peer.negotiator().send_ice_candidate(candidate);
                }
            })
        }));
    }

    fn register_state_handler(self: &Arc<Self>, peer: &Arc<Peer>) {
        let room = Arc::downgrade(self);
        let peer_ref = Arc::downgrade(peer);
        let user_id = peer.user_id;

        peer.connection().on_connection_state_change(Box::new(move |state| {
            let room = room.clone();
            let peer = peer_ref.clone();
            Box::pin(async move {
                debug!(user_id = %user_id, state = %state, "Voice connection state changed");
                if !is_terminal(state) {
                    return;
                }
                // The engine holds its handler lock while this runs, and
                // closing the connection re-enters it.
                tokio::spawn(async move {
                    if let (Some(room), Some(peer)) = (room.upgrade(), peer.upgrade()) {
                        room.remove_entry(user_id, Some(&peer)).await;
                    }
                });
            })
        }));
    }

    /// A peer's microphone arrived: start forwarding it to everyone else.
    async fn handle_inbound_track(&self, peer: &Arc<Peer>, inbound: Arc<dyn InboundTrack>) {
        if inbound.kind() != RTPCodecType::Audio {
            warn!(user_id = %peer.user_id, kind = %inbound.kind(), "Ignoring non-audio track in voice room");
            return;
        }

        let Some(track) = peer.init_forward_track(&inbound.codec()) else {
            warn!(user_id = %peer.user_id, "Ignoring additional audio track");
            return;
        };

        info!(
            channel_id = %self.channel_id,
            user_id = %peer.user_id,
            codec = %inbound.codec().mime_type,
            "Voice track received"
        );

        peer.start_forwarding(inbound, track.clone()).await;
        self.fan_out(peer.user_id, &track).await;
    }

    /// Attach `source_id`'s track to every other peer and renegotiate those that changed.
    async fn fan_out(&self, source_id: Uuid, track: &Arc<ForwardingTrack>) {
        for other in self.other_peers(source_id).await {
            match other.attach_source(source_id, track).await {
                Ok(true) => {
                    other.negotiator().renegotiate().await;
                }
                Ok(false) => {}
                Err(e) => warn!(
                    channel_id = %self.channel_id,
                    user_id = %other.user_id,
                    source_id = %source_id,
                    error = %e,
                    "Failed to attach forwarding track"
                ),
            }
        }
    }

    /// Attach tracks that arrived between the join-time snapshot and the
    /// peer becoming visible to fan-outs.
    async fn attach_missed_tracks(&self, peer: &Arc<Peer>) {
        let mut changed = false;

        for other in self.other_peers(peer.user_id).await {
            let Some(track) = other.forward_track() else {
                continue;
            };
            match peer.attach_source(other.user_id, &track).await {
                Ok(attached) => changed |= attached,
                Err(e) => warn!(
                    user_id = %peer.user_id,
                    source_id = %other.user_id,
                    error = %e,
                    "Failed to attach late track"
                ),
            }
        }

        if changed {
            debug!(user_id = %peer.user_id, "Attached tracks that arrived during join");
            peer.negotiator().renegotiate().await;
        }
    }

    /// Remove a user from the room. Returns whether they were present.
    pub async fn remove_peer(&self, user_id: Uuid) -> bool {
        self.remove_entry(user_id, None).await
    }

    /// Remove `user_id`, but only if the entry is `expected` when one is given.
    ///
    /// The removal from the map is the single gate for the departure
    /// notification.
    async fn remove_entry(&self, user_id: Uuid, expected: Option<&Arc<Peer>>) -> bool {
        let (peer, remaining) = {
            let mut state = self.state.write().await;
            let matches = state
                .peers
                .get(&user_id)
                .is_some_and(|p| expected.is_none_or(|e| Arc::ptr_eq(e, p)));
            if !matches {
                return false;
            }
            let Some(peer) = state.peers.remove(&user_id) else {
                return false;
            };
            let remaining: Vec<_> = state.peers.values().cloned().collect();
            (peer, remaining)
        };

        self.events.peer_removed(user_id, self.channel_id);
        peer.close().await;

        info!(
            channel_id = %self.channel_id,
            user_id = %user_id,
            "Peer left voice room"
        );

        for other in &remaining {
            if let Err(e) = other.detach_source(user_id).await {
                warn!(
                    user_id = %other.user_id,
                    source_id = %user_id,
                    error = %e,
                    "Failed to detach departed peer's track"
                );
            }
            other.negotiator().renegotiate().await;
        }

        if remaining.is_empty() {
            if let Some(sfu) = self.sfu.upgrade() {
                sfu.remove_room_if_empty(self.channel_id).await;
            }
        }

        true
    }

    /// Mark the room retired if it has no peers. Returns whether it was retired.
    pub(super) async fn retire_if_empty(&self) -> bool {
        let mut state = self.state.write().await;
        if state.peers.is_empty() {
            state.retired = true;
        }
        state.retired
    }

    /// Apply a peer's SDP answer.
    pub async fn handle_answer(&self, user_id: Uuid, sdp: String) -> Result<(), VoiceError> {
        let peer = self
            .get_peer(user_id)
            .await
            .ok_or(VoiceError::ParticipantNotFound(user_id))?;
        peer.negotiator().apply_answer(sdp).await
    }

    /// Apply a peer's ICE candidate.
    pub async fn handle_ice(
        &self,
        user_id: Uuid,
        candidate: RTCIceCandidateInit,
    ) -> Result<(), VoiceError> {
        let peer = self
            .get_peer(user_id)
            .await
            .ok_or(VoiceError::ParticipantNotFound(user_id))?;
        peer.negotiator().add_ice_candidate(candidate).await
    }

    /// Look up a peer.
    pub async fn get_peer(&self, user_id: Uuid) -> Option<Arc<Peer>> {
        self.state.read().await.peers.get(&user_id).cloned()
    }

    /// Whether `user_id` is in the room.
    pub async fn contains(&self, user_id: Uuid) -> bool {
        self.state.read().await.peers.contains_key(&user_id)
    }

    /// Snapshot of all peers except `user_id`.
    async fn other_peers(&self, user_id: Uuid) -> Vec<Arc<Peer>> {
        self.state
            .read()
            .await
            .peers
            .values()
            .filter(|p| p.user_id != user_id)
            .cloned()
            .collect()
    }

    /// User IDs in the room.
    pub async fn peer_ids(&self) -> Vec<Uuid> {
        self.state.read().await.peers.keys().copied().collect()
    }

    /// Number of peers.
    pub async fn peer_count(&self) -> usize {
        self.state.read().await.peers.len()
    }

    /// Whether the room has no peers.
    pub async fn is_empty(&self) -> bool {
        self.state.read().await.peers.is_empty()
    }

    /// Voice state of every peer.
    pub async fn voice_states(&self) -> Vec<VoiceState> {
        let peers: Vec<_> = self.state.read().await.peers.values().cloned().collect();
        let mut states = Vec::with_capacity(peers.len());
        for peer in peers {
            states.push(peer.voice_state().await);
        }
        states
    }
}
