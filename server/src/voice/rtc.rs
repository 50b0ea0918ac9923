//! webrtc-rs Media Engine
//!
//! [`ConnectionFactory`] backed by webrtc-rs. Voice connections negotiate
//! Opus only; screen connections negotiate VP8 video plus Opus audio.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::{info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet as RtpPacket;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCPFeedback, RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::error::VoiceError;
use super::media::{
    ConnectionFactory, InboundTrack, MediaConnection, MediaProfile, OnIceCandidateHandler,
    OnStateChangeHandler, OnTrackHandler, TrackSender,
};
use super::track::ForwardingTrack;
use crate::config::Config;

/// Opus parameters for voice: in-band FEC, DTX, 128 kbps ceiling.
const VOICE_OPUS_FMTP: &str = "minptime=10;useinbandfec=1;usedtx=1;maxaveragebitrate=128000";

/// Opus parameters for screen audio.
const SCREEN_OPUS_FMTP: &str = "minptime=10;useinbandfec=1";

fn opus(fmtp: &str) -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: fmtp.to_string(),
            rtcp_feedback: vec![],
        },
        payload_type: 111,
        ..Default::default()
    }
}

fn vp8() -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![
                RTCPFeedback {
                    typ: "goog-remb".to_string(),
                    parameter: String::new(),
                },
                RTCPFeedback {
                    typ: "ccm".to_string(),
                    parameter: "fir".to_string(),
                },
                RTCPFeedback {
                    typ: "nack".to_string(),
                    parameter: String::new(),
                },
                RTCPFeedback {
                    typ: "nack".to_string(),
                    parameter: "pli".to_string(),
                },
            ],
        },
        payload_type: 96,
        ..Default::default()
    }
}

fn media_engine(profile: MediaProfile) -> Result<MediaEngine, VoiceError> {
    let mut media_engine = MediaEngine::default();

    match profile {
        MediaProfile::Voice => {
            media_engine.register_codec(opus(VOICE_OPUS_FMTP), RTPCodecType::Audio)?;
        }
        MediaProfile::Screen => {
            media_engine.register_codec(vp8(), RTPCodecType::Video)?;
            media_engine.register_codec(opus(SCREEN_OPUS_FMTP), RTPCodecType::Audio)?;
        }
    }

    Ok(media_engine)
}

fn build_api(profile: MediaProfile, public_ip: Option<&str>) -> Result<API, VoiceError> {
    let mut media_engine = media_engine(profile)?;

    // NACK, RTCP reports and TWCC.
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let mut setting_engine = SettingEngine::default();
    if let Some(ip) = public_ip {
        setting_engine.set_nat_1to1_ips(vec![ip.to_string()], RTCIceCandidateType::Host);
    }

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .with_setting_engine(setting_engine)
        .build())
}

/// Builds webrtc-rs peer connections.
pub struct RtcFactory {
    voice_api: API,
    screen_api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl RtcFactory {
    /// Create the voice and screen APIs from server configuration.
    pub fn new(config: &Config) -> Result<Self, VoiceError> {
        let public_ip = config.public_ip.as_deref();

        let factory = Self {
            voice_api: build_api(MediaProfile::Voice, public_ip)?,
            screen_api: build_api(MediaProfile::Screen, public_ip)?,
            ice_servers: config
                .ice_servers()
                .into_iter()
                .map(|s| RTCIceServer {
                    urls: s.urls,
                    username: s.username.unwrap_or_default(),
                    credential: s.credential.unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
        };

        info!(
            ice_servers = factory.ice_servers.len(),
            public_ip = public_ip.unwrap_or("-"),
            "WebRTC media engine initialized"
        );

        Ok(factory)
    }

    fn rtc_config(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ConnectionFactory for RtcFactory {
    async fn new_connection(
        &self,
        profile: MediaProfile,
    ) -> Result<Arc<dyn MediaConnection>, VoiceError> {
        let api = match profile {
            MediaProfile::Voice => &self.voice_api,
            MediaProfile::Screen => &self.screen_api,
        };
        let pc = api.new_peer_connection(self.rtc_config()).await?;
        Ok(Arc::new(RtcConnection { pc: Arc::new(pc) }))
    }
}

/// A webrtc-rs peer connection.
pub struct RtcConnection {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaConnection for RtcConnection {
    async fn add_recv_transceiver(&self, kind: RTPCodecType) -> Result<(), VoiceError> {
        self.pc
            .add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        Ok(())
    }

    async fn add_track(
        &self,
        track: &Arc<ForwardingTrack>,
    ) -> Result<Arc<dyn TrackSender>, VoiceError> {
        let local: Arc<dyn TrackLocal + Send + Sync> = track.local();
        let sender = self.pc.add_track(local).await?;
        Ok(Arc::new(RtcSender { sender }))
    }

    async fn remove_track(&self, track_id: &str) -> Result<(), VoiceError> {
        for sender in self.pc.get_senders().await {
            let Some(track) = sender.track().await else {
                continue;
            };
            if track.id() == track_id {
                self.pc.remove_track(&sender).await?;
                return Ok(());
            }
        }
        Err(VoiceError::WebRtc(format!("no sender for track {track_id}")))
    }

    async fn create_local_offer(&self) -> Result<String, VoiceError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(offer.sdp)
    }

    async fn set_remote_answer(&self, sdp: String) -> Result<(), VoiceError> {
        let answer =
            RTCSessionDescription::answer(sdp).map_err(|e| VoiceError::Signaling(e.to_string()))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| VoiceError::Signaling(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), VoiceError> {
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| VoiceError::Signaling(e.to_string()))
    }

    fn signaling_state(&self) -> RTCSignalingState {
        self.pc.signaling_state()
    }

    async fn close(&self) -> Result<(), VoiceError> {
        self.pc.close().await?;
        Ok(())
    }

    fn on_track(&self, handler: OnTrackHandler) {
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>|
                  -> BoxFuture<'static, ()> {
                handler(Arc::new(RtcInboundTrack { track }))
            },
        ));
    }

    fn on_ice_candidate(&self, handler: OnIceCandidateHandler) {
        self.pc.on_ice_candidate(Box::new(
            move |candidate: Option<RTCIceCandidate>| -> BoxFuture<'static, ()> {
                let Some(candidate) = candidate else {
                    return Box::pin(async {});
                };
                match candidate.to_json() {
                    Ok(init) => handler(init),
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize ICE candidate");
                        Box::pin(async {})
                    }
                }
            },
        ));
    }

    fn on_connection_state_change(&self, handler: OnStateChangeHandler) {
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                handler(state)
            }));
    }
}

/// A webrtc-rs remote track.
struct RtcInboundTrack {
    track: Arc<TrackRemote>,
}

#[async_trait]
impl InboundTrack for RtcInboundTrack {
    fn kind(&self) -> RTPCodecType {
        self.track.kind()
    }

    fn codec(&self) -> RTCRtpCodecCapability {
        self.track.codec().capability
    }

    async fn read_packet(&self, buf: &mut [u8]) -> Result<RtpPacket, VoiceError> {
        let (packet, _) = self.track.read(buf).await?;
        Ok(packet)
    }
}

/// A webrtc-rs RTP sender.
struct RtcSender {
    sender: Arc<RTCRtpSender>,
}

#[async_trait]
impl TrackSender for RtcSender {
    async fn read_rtcp(&self) -> Result<(), VoiceError> {
        self.sender.read_rtcp().await?;
        Ok(())
    }
}
