//! Voice Peer
//!
//! One participant of a voice room: their SFU-side connection, the
//! forwarding track carrying their microphone to everyone else, and the
//! tracks of other participants attached to their connection.

use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

use super::error::VoiceError;
use super::media::{InboundTrack, MediaConnection};
use super::negotiation::{Negotiator, SignalPath};
use super::sfu::SfuEvents;
use super::track::{spawn_forwarder, ForwardGate, ForwardingTrack, OutboundTracks};

/// Publicly visible voice state of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceState {
    /// User ID.
    pub user_id: Uuid,
    /// Voice channel the user is in.
    pub channel_id: Uuid,
    /// Muted by the user.
    pub self_mute: bool,
    /// Deafened by the user.
    pub self_deafen: bool,
    /// Muted by an administrator. Audio is not forwarded.
    pub server_mute: bool,
    /// Client-reported voice activity.
    pub speaking: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct VoiceFlags {
    self_mute: bool,
    self_deafen: bool,
    server_mute: bool,
    speaking: bool,
}

/// A user's voice connection to the SFU.
pub struct Peer {
    /// User ID.
    pub user_id: Uuid,
    /// Channel ID the peer is connected to.
    pub channel_id: Uuid,
    negotiator: Negotiator,
    /// Set once, when the user's audio first arrives.
    forward_track: OnceLock<Arc<ForwardingTrack>>,
    /// Other participants' tracks attached to this connection, by source user.
    outbound: OutboundTracks<Uuid>,
    flags: RwLock<VoiceFlags>,
    gate: ForwardGate,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("user_id", &self.user_id)
            .field("channel_id", &self.channel_id)
            .finish_non_exhaustive()
    }
}

impl Peer {
    /// Wrap a new voice connection.
    pub fn new(
        user_id: Uuid,
        channel_id: Uuid,
        connection: Arc<dyn MediaConnection>,
        events: Arc<dyn SfuEvents>,
    ) -> Self {
        Self {
            user_id,
            channel_id,
            negotiator: Negotiator::new(user_id, connection, SignalPath::Voice, events),
            forward_track: OnceLock::new(),
            outbound: OutboundTracks::new(),
            flags: RwLock::new(VoiceFlags::default()),
            gate: ForwardGate::open(),
            forwarder: Mutex::new(None),
        }
    }

    /// The SFU-side connection.
    pub fn connection(&self) -> &Arc<dyn MediaConnection> {
        self.negotiator.connection()
    }

    /// Offer/answer state of the connection.
    pub const fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    /// The track carrying this user's audio to others, once it has arrived.
    pub fn forward_track(&self) -> Option<Arc<ForwardingTrack>> {
        self.forward_track.get().cloned()
    }

    /// Create the forwarding track for this user's audio.
    ///
    /// Returns `None` if one already exists; the first inbound audio track wins.
    pub fn init_forward_track(&self, codec: &RTCRtpCodecCapability) -> Option<Arc<ForwardingTrack>> {
        if self.forward_track.get().is_some() {
            return None;
        }
        let track = Arc::new(ForwardingTrack::new(
            codec,
            format!("voice-{}", self.user_id),
            self.user_id.to_string(),
        ));
        self.forward_track.set(track.clone()).ok().map(|()| track)
    }

    /// Start copying `inbound` into this user's forwarding track.
    pub async fn start_forwarding(&self, inbound: Arc<dyn InboundTrack>, track: Arc<ForwardingTrack>) {
        let handle = spawn_forwarder(
            format!("voice:{}", self.user_id),
            inbound,
            track,
            self.gate.clone(),
        );
        if let Some(previous) = self.forwarder.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Attach another participant's track. Returns whether anything changed.
    pub async fn attach_source(
        &self,
        source_id: Uuid,
        track: &Arc<ForwardingTrack>,
    ) -> Result<bool, VoiceError> {
        self.outbound
            .attach(self.negotiator.connection(), source_id, track)
            .await
    }

    /// Detach a departed participant's track. Returns whether anything changed.
    pub async fn detach_source(&self, source_id: Uuid) -> Result<bool, VoiceError> {
        self.outbound
            .detach(self.negotiator.connection(), source_id)
            .await
    }

    /// Whether `source_id`'s track is attached to this connection.
    pub async fn has_source(&self, source_id: Uuid) -> bool {
        self.outbound.contains(source_id).await
    }

    /// Number of other participants' tracks attached.
    pub async fn source_count(&self) -> usize {
        self.outbound.len().await
    }

    /// Current voice state.
    pub async fn voice_state(&self) -> VoiceState {
        let flags = *self.flags.read().await;
        self.state_from(flags)
    }

    /// Set the self-mute flag.
    pub async fn set_self_mute(&self, muted: bool) -> VoiceState {
        self.update_flags(|f| f.self_mute = muted).await
    }

    /// Set the self-deafen flag.
    pub async fn set_self_deafen(&self, deafened: bool) -> VoiceState {
        self.update_flags(|f| f.self_deafen = deafened).await
    }

    /// Set the speaking indicator.
    pub async fn set_speaking(&self, speaking: bool) -> VoiceState {
        self.update_flags(|f| f.speaking = speaking).await
    }

    /// Server mute. While set, this user's audio is read and discarded.
    pub async fn set_server_mute(&self, muted: bool) -> VoiceState {
        let state = self.update_flags(|f| f.server_mute = muted).await;
        self.gate.set_open(!muted);
        debug!(user_id = %self.user_id, muted, "Server mute changed");
        state
    }

    async fn update_flags(&self, update: impl FnOnce(&mut VoiceFlags)) -> VoiceState {
        let mut flags = self.flags.write().await;
        update(&mut flags);
        self.state_from(*flags)
    }

    const fn state_from(&self, flags: VoiceFlags) -> VoiceState {
        VoiceState {
            user_id: self.user_id,
            channel_id: self.channel_id,
            self_mute: flags.self_mute,
            self_deafen: flags.self_deafen,
            server_mute: flags.server_mute,
            speaking: flags.speaking,
        }
    }

    /// Close the connection and stop forwarding this user's audio.
    pub async fn close(&self) {
        self.negotiator.close().await;
        if let Some(handle) = self.forwarder.lock().await.take() {
            handle.abort();
        }
    }
}
