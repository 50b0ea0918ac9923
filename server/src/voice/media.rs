//! Media Engine Boundary
//!
//! The SFU core never touches the WebRTC stack directly. It talks to a
//! [`ConnectionFactory`] that hands out [`MediaConnection`] objects, receives
//! inbound media as [`InboundTrack`]s and drains feedback through
//! [`TrackSender`]s. [`super::rtc`] provides the webrtc-rs implementation.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp::packet::Packet as RtpPacket;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};

use super::error::VoiceError;
use super::track::ForwardingTrack;

/// Codec profile a connection is negotiated with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaProfile {
    /// Opus only.
    Voice,
    /// VP8 video plus Opus audio.
    Screen,
}

/// Called once per inbound track.
pub type OnTrackHandler = Box<dyn Fn(Arc<dyn InboundTrack>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Called for every locally gathered ICE candidate.
pub type OnIceCandidateHandler =
    Box<dyn Fn(RTCIceCandidateInit) -> BoxFuture<'static, ()> + Send + Sync>;

/// Called on every connection state transition.
pub type OnStateChangeHandler =
    Box<dyn Fn(RTCPeerConnectionState) -> BoxFuture<'static, ()> + Send + Sync>;

/// Creates connection objects. Pure construction, holds no session state.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Create a new connection with the codec set of `profile`.
    async fn new_connection(
        &self,
        profile: MediaProfile,
    ) -> Result<Arc<dyn MediaConnection>, VoiceError>;
}

/// One peer connection owned by the SFU.
#[async_trait]
pub trait MediaConnection: Send + Sync {
    /// Add a receive-only transceiver of the given kind.
    async fn add_recv_transceiver(&self, kind: RTPCodecType) -> Result<(), VoiceError>;

    /// Attach a forwarding track. The returned sender must be drained.
    async fn add_track(
        &self,
        track: &Arc<ForwardingTrack>,
    ) -> Result<Arc<dyn TrackSender>, VoiceError>;

    /// Detach the forwarding track with the given id.
    async fn remove_track(&self, track_id: &str) -> Result<(), VoiceError>;

    /// Create an offer and apply it as the local description.
    ///
    /// Returns the offer SDP.
    async fn create_local_offer(&self) -> Result<String, VoiceError>;

    /// Apply the client's answer as the remote description.
    async fn set_remote_answer(&self, sdp: String) -> Result<(), VoiceError>;

    /// Add a remote ICE candidate.
    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), VoiceError>;

    /// Current signaling state.
    fn signaling_state(&self) -> RTCSignalingState;

    /// Close the connection. Closing twice is harmless.
    async fn close(&self) -> Result<(), VoiceError>;

    /// Register the inbound track handler.
    fn on_track(&self, handler: OnTrackHandler);

    /// Register the local ICE candidate handler.
    fn on_ice_candidate(&self, handler: OnIceCandidateHandler);

    /// Register the connection state handler.
    fn on_connection_state_change(&self, handler: OnStateChangeHandler);
}

/// Media arriving from a client.
#[async_trait]
pub trait InboundTrack: Send + Sync {
    /// Track kind.
    fn kind(&self) -> RTPCodecType;

    /// Negotiated codec of the track.
    fn codec(&self) -> RTCRtpCodecCapability;

    /// Read the next RTP packet. An error means the track has ended.
    async fn read_packet(&self, buf: &mut [u8]) -> Result<RtpPacket, VoiceError>;
}

/// The sending side of an attached forwarding track.
#[async_trait]
pub trait TrackSender: Send + Sync {
    /// Read (and discard) the next batch of RTCP feedback.
    /// An error means the sender has stopped.
    async fn read_rtcp(&self) -> Result<(), VoiceError>;
}

/// Whether a connection state ends the session.
#[must_use]
pub const fn is_terminal(state: RTCPeerConnectionState) -> bool {
    matches!(
        state,
        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
    )
}
