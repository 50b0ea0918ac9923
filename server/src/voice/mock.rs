//! In-memory media engine for unit tests.
//!
//! Mirrors the observable behaviour of webrtc-rs that the SFU relies on:
//! offers move the signaling state to `have-local-offer`, answers move it
//! back to `stable`, and closing fires the state handler inline. State
//! handlers run under a lock, so a handler that closes its own connection
//! hangs here just as it does in webrtc-rs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet as RtpPacket;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};

use super::error::VoiceError;
use super::media::{
    ConnectionFactory, InboundTrack, MediaConnection, MediaProfile, OnIceCandidateHandler,
    OnStateChangeHandler, OnTrackHandler, TrackSender,
};
use super::sfu::{SfuEvents, Signal};
use super::track::ForwardingTrack;

/// Opus capability as negotiated for voice.
pub fn opus_codec() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

/// VP8 capability as negotiated for screen video.
pub fn vp8_codec() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "video/VP8".to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

/// Yield until `cond` holds, failing the test after a generous bound.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

/// Give spawned handler tasks a chance to run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[derive(Default)]
struct ConnectionState {
    closed: bool,
    offers: Vec<String>,
    tracks: Vec<String>,
    recv_kinds: Vec<RTPCodecType>,
    candidates: Vec<RTCIceCandidateInit>,
}

/// Records everything the SFU does to one connection.
pub struct MockConnection {
    profile: MediaProfile,
    signaling: Mutex<RTCSignalingState>,
    state: Mutex<ConnectionState>,
    fail_offers: AtomicBool,
    fail_transceivers: AtomicBool,
    on_track: Mutex<Option<Arc<OnTrackHandler>>>,
    on_ice: Mutex<Option<Arc<OnIceCandidateHandler>>>,
    on_state: Mutex<Option<Arc<OnStateChangeHandler>>>,
    state_handler_lock: AsyncMutex<()>,
}

impl MockConnection {
    /// An answer SDP the mock rejects.
    pub const BAD_SDP: &'static str = "not an sdp";

    pub fn new(profile: MediaProfile) -> Arc<Self> {
        Arc::new(Self {
            profile,
            signaling: Mutex::new(RTCSignalingState::Stable),
            state: Mutex::new(ConnectionState::default()),
            fail_offers: AtomicBool::new(false),
            fail_transceivers: AtomicBool::new(false),
            on_track: Mutex::new(None),
            on_ice: Mutex::new(None),
            on_state: Mutex::new(None),
            state_handler_lock: AsyncMutex::new(()),
        })
    }

    pub fn profile(&self) -> MediaProfile {
        self.profile
    }

    pub fn fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }

    pub fn fail_transceivers(&self, fail: bool) {
        self.fail_transceivers.store(fail, Ordering::SeqCst);
    }

    pub fn offer_count(&self) -> usize {
        self.state.lock().unwrap().offers.len()
    }

    pub fn last_offer(&self) -> Option<String> {
        self.state.lock().unwrap().offers.last().cloned()
    }

    pub fn attached_tracks(&self) -> Vec<String> {
        self.state.lock().unwrap().tracks.clone()
    }

    pub fn recv_kinds(&self) -> Vec<RTPCodecType> {
        self.state.lock().unwrap().recv_kinds.clone()
    }

    pub fn remote_candidates(&self) -> usize {
        self.state.lock().unwrap().candidates.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Deliver an inbound track as the media engine would.
    pub async fn fire_track(&self, track: Arc<dyn InboundTrack>) {
        let handler = self.on_track.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(track).await;
        }
    }

    /// Report a locally gathered candidate.
    pub async fn fire_ice(&self, candidate: RTCIceCandidateInit) {
        let handler = self.on_ice.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(candidate).await;
        }
    }

    /// Report a connection state transition.
    pub async fn fire_state(&self, state: RTCPeerConnectionState) {
        let _running = self.state_handler_lock.lock().await;
        let handler = self.on_state.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(state).await;
        }
    }
}

#[async_trait]
impl MediaConnection for MockConnection {
    async fn add_recv_transceiver(&self, kind: RTPCodecType) -> Result<(), VoiceError> {
        if self.fail_transceivers.load(Ordering::SeqCst) {
            return Err(VoiceError::WebRtc("transceiver rejected".into()));
        }
        self.state.lock().unwrap().recv_kinds.push(kind);
        Ok(())
    }

    async fn add_track(
        &self,
        track: &Arc<ForwardingTrack>,
    ) -> Result<Arc<dyn TrackSender>, VoiceError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(VoiceError::WebRtc("connection closed".into()));
        }
        state.tracks.push(track.id().to_string());
        Ok(Arc::new(MockSender))
    }

    async fn remove_track(&self, track_id: &str) -> Result<(), VoiceError> {
        let mut state = self.state.lock().unwrap();
        let before = state.tracks.len();
        state.tracks.retain(|id| id != track_id);
        if state.tracks.len() == before {
            return Err(VoiceError::WebRtc(format!("no sender for {track_id}")));
        }
        Ok(())
    }

    async fn create_local_offer(&self) -> Result<String, VoiceError> {
        if self.fail_offers.load(Ordering::SeqCst) {
            return Err(VoiceError::WebRtc("offer failed".into()));
        }
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(VoiceError::WebRtc("connection closed".into()));
        }
        let sdp = format!("offer-{} tracks={}", state.offers.len() + 1, state.tracks.join(","));
        state.offers.push(sdp.clone());
        *self.signaling.lock().unwrap() = RTCSignalingState::HaveLocalOffer;
        Ok(sdp)
    }

    async fn set_remote_answer(&self, sdp: String) -> Result<(), VoiceError> {
        {
            let mut signaling = self.signaling.lock().unwrap();
            if *signaling != RTCSignalingState::HaveLocalOffer {
                return Err(VoiceError::Signaling(format!(
                    "no outstanding offer ({signaling})"
                )));
            }
            if sdp == Self::BAD_SDP {
                return Err(VoiceError::Signaling("malformed answer".into()));
            }
            *signaling = RTCSignalingState::Stable;
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), VoiceError> {
        if candidate.candidate.is_empty() {
            return Err(VoiceError::Signaling("empty candidate".into()));
        }
        self.state.lock().unwrap().candidates.push(candidate);
        Ok(())
    }

    fn signaling_state(&self) -> RTCSignalingState {
        *self.signaling.lock().unwrap()
    }

    async fn close(&self) -> Result<(), VoiceError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }
        *self.signaling.lock().unwrap() = RTCSignalingState::Closed;
        self.fire_state(RTCPeerConnectionState::Closed).await;
        Ok(())
    }

    fn on_track(&self, handler: OnTrackHandler) {
        *self.on_track.lock().unwrap() = Some(Arc::new(handler));
    }

    fn on_ice_candidate(&self, handler: OnIceCandidateHandler) {
        *self.on_ice.lock().unwrap() = Some(Arc::new(handler));
    }

    fn on_connection_state_change(&self, handler: OnStateChangeHandler) {
        *self.on_state.lock().unwrap() = Some(Arc::new(handler));
    }
}

struct MockSender;

#[async_trait]
impl TrackSender for MockSender {
    async fn read_rtcp(&self) -> Result<(), VoiceError> {
        Err(VoiceError::WebRtc("no rtcp".into()))
    }
}

/// Hands out [`MockConnection`]s and remembers them in creation order.
#[derive(Default)]
pub struct MockFactory {
    created: Mutex<Vec<Arc<MockConnection>>>,
    fail: AtomicBool,
    fail_transceivers: AtomicBool,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every following `new_connection` call fail.
    pub fn fail_connections(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Make transceiver setup fail on connections created from now on.
    pub fn fail_transceivers(&self, fail: bool) {
        self.fail_transceivers.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn last(&self) -> Arc<MockConnection> {
        self.created
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no connection created")
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn new_connection(
        &self,
        profile: MediaProfile,
    ) -> Result<Arc<dyn MediaConnection>, VoiceError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(VoiceError::WebRtc("factory failure".into()));
        }
        let connection = MockConnection::new(profile);
        connection.fail_transceivers(self.fail_transceivers.load(Ordering::SeqCst));
        self.created.lock().unwrap().push(connection.clone());
        Ok(connection)
    }
}

/// Channel-backed inbound track.
pub struct MockInboundTrack {
    kind: RTPCodecType,
    codec: RTCRtpCodecCapability,
    tx: Mutex<Option<mpsc::UnboundedSender<RtpPacket>>>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<RtpPacket>>,
    pushed: AtomicUsize,
    reads: AtomicUsize,
}

impl MockInboundTrack {
    fn new(kind: RTPCodecType, codec: RTCRtpCodecCapability) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            kind,
            codec,
            tx: Mutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
            pushed: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
        })
    }

    pub fn audio() -> Arc<Self> {
        Self::new(RTPCodecType::Audio, opus_codec())
    }

    pub fn video() -> Arc<Self> {
        Self::new(RTPCodecType::Video, vp8_codec())
    }

    /// Queue one RTP packet for the reader.
    pub fn push_packet(&self) {
        let seq = self.pushed.fetch_add(1, Ordering::SeqCst);
        let packet = RtpPacket {
            header: Header {
                sequence_number: u16::try_from(seq % 65_536).unwrap(),
                ..Default::default()
            },
            payload: Bytes::from_static(b"rtp"),
        };
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            tx.send(packet).unwrap();
        }
    }

    /// Wait until every queued packet has been fully handled by the reader.
    ///
    /// The reader asks for the next packet only after handling the previous one.
    pub async fn wait_drained(&self) {
        wait_until(|| self.reads.load(Ordering::SeqCst) > self.pushed.load(Ordering::SeqCst)).await;
    }

    /// End the track; the reader sees an error once the queue is empty.
    pub fn end(&self) {
        self.tx.lock().unwrap().take();
    }
}

#[async_trait]
impl InboundTrack for MockInboundTrack {
    fn kind(&self) -> RTPCodecType {
        self.kind
    }

    fn codec(&self) -> RTCRtpCodecCapability {
        self.codec.clone()
    }

    async fn read_packet(&self, _buf: &mut [u8]) -> Result<RtpPacket, VoiceError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| VoiceError::WebRtc("track ended".into()))
    }
}

/// Records every callback the SFU fires.
#[derive(Default)]
pub struct RecordingEvents {
    signals: Mutex<Vec<(Uuid, Signal)>>,
    removed: Mutex<Vec<(Uuid, Uuid)>>,
    stopped: Mutex<Vec<(Uuid, Uuid)>>,
}

impl RecordingEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn signals_for(&self, user_id: Uuid) -> Vec<Signal> {
        self.signals
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == user_id)
            .map(|(_, s)| s.clone())
            .collect()
    }

    /// Offer SDPs (voice or screen) delivered to `user_id`.
    pub fn offers_for(&self, user_id: Uuid) -> Vec<String> {
        self.signals_for(user_id)
            .into_iter()
            .filter_map(|s| match s {
                Signal::Offer { sdp } | Signal::ScreenOffer { sdp } => Some(sdp),
                _ => None,
            })
            .collect()
    }

    pub fn removed(&self) -> Vec<(Uuid, Uuid)> {
        self.removed.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<(Uuid, Uuid)> {
        self.stopped.lock().unwrap().clone()
    }
}

impl SfuEvents for RecordingEvents {
    fn signal(&self, user_id: Uuid, signal: Signal) {
        self.signals.lock().unwrap().push((user_id, signal));
    }

    fn peer_removed(&self, user_id: Uuid, channel_id: Uuid) {
        self.removed.lock().unwrap().push((user_id, channel_id));
    }

    fn screen_share_stopped(&self, presenter_id: Uuid, channel_id: Uuid) {
        self.stopped.lock().unwrap().push((presenter_id, channel_id));
    }
}
