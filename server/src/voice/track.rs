//! Track Forwarding
//!
//! Forwarding tracks, the per-track RTP forwarding loop and the RTCP drain
//! that every attached sender needs.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use webrtc::rtp::packet::Packet as RtpPacket;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

use super::error::VoiceError;
use super::media::{InboundTrack, MediaConnection, TrackSender};

/// Read buffer size for inbound RTP (MTU).
const RTP_MTU: usize = 1500;

/// A local track whose content is copied from another participant's inbound track.
pub struct ForwardingTrack {
    id: String,
    stream_id: String,
    local: Arc<TrackLocalStaticRTP>,
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

impl ForwardingTrack {
    /// Create a forwarding track with the same codec as its source.
    #[must_use]
    pub fn new(codec: &RTCRtpCodecCapability, id: String, stream_id: String) -> Self {
        let local = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: codec.mime_type.clone(),
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                sdp_fmtp_line: codec.sdp_fmtp_line.clone(),
                rtcp_feedback: vec![],
            },
            id.clone(),
            stream_id.clone(),
        ));

        Self {
            id,
            stream_id,
            local,
            forwarded: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Track ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stream ID (the source user's ID).
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// The underlying webrtc-rs track.
    pub fn local(&self) -> Arc<TrackLocalStaticRTP> {
        self.local.clone()
    }

    /// Write a packet to every connection this track is attached to.
    pub async fn forward(&self, packet: &RtpPacket) -> Result<(), VoiceError> {
        self.local.write_rtp(packet).await?;
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Count a packet that was read but not forwarded.
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Packets forwarded so far.
    pub fn forwarded_packets(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Packets read and discarded so far.
    pub fn dropped_packets(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Decides per packet whether the forwarding loop writes or discards.
///
/// Server mute closes the gate; the transceiver stays untouched so
/// flipping it needs no renegotiation.
#[derive(Clone, Debug)]
pub struct ForwardGate(Arc<AtomicBool>);

impl ForwardGate {
    /// A gate that starts open.
    #[must_use]
    pub fn open() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// Open or close the gate.
    pub fn set_open(&self, open: bool) {
        self.0.store(open, Ordering::Release);
    }

    /// Whether packets currently pass.
    pub fn is_open(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Spawn a task copying packets from `inbound` to `forward` until the read fails.
pub fn spawn_forwarder(
    label: String,
    inbound: Arc<dyn InboundTrack>,
    forward: Arc<ForwardingTrack>,
    gate: ForwardGate,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; RTP_MTU];

        loop {
            let packet = match inbound.read_packet(&mut buf).await {
                Ok(packet) => packet,
                Err(e) => {
                    debug!(source = %label, error = %e, "Track read ended");
                    break;
                }
            };

            if !gate.is_open() {
                forward.record_dropped();
                continue;
            }

            if let Err(e) = forward.forward(&packet).await {
                warn!(source = %label, error = %e, "Failed to forward RTP packet");
                break;
            }
        }

        debug!(
            source = %label,
            forwarded = forward.forwarded_packets(),
            dropped = forward.dropped_packets(),
            "RTP forwarder stopped"
        );
    })
}

/// Spawn a task draining RTCP from an attached sender for its lifetime.
pub fn spawn_rtcp_drain(track_id: String, sender: Arc<dyn TrackSender>) {
    tokio::spawn(async move {
        while sender.read_rtcp().await.is_ok() {}
        debug!(track_id = %track_id, "RTCP drain stopped");
    });
}

/// Forwarding tracks attached to one connection, keyed by source.
///
/// Attaching is idempotent so a track-arrival fan-out and a join-time
/// reconciliation racing each other add the track once.
pub struct OutboundTracks<K> {
    attached: Mutex<HashMap<K, String>>,
}

impl<K> OutboundTracks<K>
where
    K: Copy + Eq + Hash + Debug + Send,
{
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            attached: Mutex::new(HashMap::new()),
        }
    }

    /// Attach `track` under `key` unless something is already attached there.
    ///
    /// Returns whether the connection changed.
    pub async fn attach(
        &self,
        connection: &Arc<dyn MediaConnection>,
        key: K,
        track: &Arc<ForwardingTrack>,
    ) -> Result<bool, VoiceError> {
        let mut attached = self.attached.lock().await;
        if attached.contains_key(&key) {
            return Ok(false);
        }

        let sender = connection.add_track(track).await?;
        spawn_rtcp_drain(track.id().to_string(), sender);
        attached.insert(key, track.id().to_string());

        debug!(source = ?key, track_id = %track.id(), "Attached forwarding track");
        Ok(true)
    }

    /// Detach whatever is attached under `key`.
    ///
    /// Returns whether the connection changed.
    pub async fn detach(
        &self,
        connection: &Arc<dyn MediaConnection>,
        key: K,
    ) -> Result<bool, VoiceError> {
        let mut attached = self.attached.lock().await;
        let Some(track_id) = attached.remove(&key) else {
            return Ok(false);
        };

        connection.remove_track(&track_id).await?;
        debug!(source = ?key, track_id = %track_id, "Detached forwarding track");
        Ok(true)
    }

    /// Whether a track is attached under `key`.
    pub async fn contains(&self, key: K) -> bool {
        self.attached.lock().await.contains_key(&key)
    }

    /// Number of attached tracks.
    pub async fn len(&self) -> usize {
        self.attached.lock().await.len()
    }

    /// Whether nothing is attached.
    pub async fn is_empty(&self) -> bool {
        self.attached.lock().await.is_empty()
    }
}

impl<K> Default for OutboundTracks<K>
where
    K: Copy + Eq + Hash + Debug + Send,
{
    fn default() -> Self {
        Self::new()
    }
}
