//! Screen Sharing
//!
//! A channel has at most one presenter. The presenter sends a VP8 video
//! track and optionally an Opus audio track; every subscribed viewer gets
//! both forwarded on a dedicated connection, separate from voice.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

use super::error::VoiceError;
use super::media::{is_terminal, ConnectionFactory, InboundTrack, MediaConnection, MediaProfile};
use super::negotiation::{Negotiator, SignalPath};
use super::sfu::{SfuEvents, SfuServer};
use super::track::{spawn_forwarder, ForwardGate, ForwardingTrack, OutboundTracks};

/// Which side of a screen share a signaling message is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenRole {
    /// The user sharing their screen.
    Presenter,
    /// A user watching it.
    Viewer,
}

/// Media slot of a screen share.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScreenSlot {
    /// Screen capture.
    Video,
    /// Captured system audio.
    Audio,
}

impl fmt::Display for ScreenSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => f.write_str("video"),
            Self::Audio => f.write_str("audio"),
        }
    }
}

/// Public summary of an active screen share.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenShareState {
    /// User who is sharing.
    pub user_id: Uuid,
    /// Channel the share belongs to.
    pub channel_id: Uuid,
    /// Number of subscribed viewers.
    pub viewer_count: usize,
    /// Whether the presenter's video has arrived.
    pub has_video: bool,
    /// Whether the presenter's audio has arrived.
    pub has_audio: bool,
}

/// A subscriber's receive-only connection to a screen share.
pub struct ScreenViewer {
    /// Viewer user ID.
    pub user_id: Uuid,
    negotiator: Negotiator,
    outbound: OutboundTracks<ScreenSlot>,
}

impl fmt::Debug for ScreenViewer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScreenViewer")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl ScreenViewer {
    fn new(user_id: Uuid, connection: Arc<dyn MediaConnection>, events: Arc<dyn SfuEvents>) -> Self {
        Self {
            user_id,
            negotiator: Negotiator::new(user_id, connection, SignalPath::Screen, events),
            outbound: OutboundTracks::new(),
        }
    }

    /// Offer/answer state of the viewer connection.
    pub const fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    async fn attach(&self, slot: ScreenSlot, track: &Arc<ForwardingTrack>) -> Result<bool, VoiceError> {
        self.outbound
            .attach(self.negotiator.connection(), slot, track)
            .await
    }

    /// Number of presenter tracks attached.
    pub async fn track_count(&self) -> usize {
        self.outbound.len().await
    }
}

#[derive(Default)]
struct ScreenState {
    presenter: Option<Arc<Negotiator>>,
    video: Option<Arc<ForwardingTrack>>,
    audio: Option<Arc<ForwardingTrack>>,
    viewers: HashMap<Uuid, Arc<ScreenViewer>>,
    forwarders: Vec<JoinHandle<()>>,
    stopped: bool,
}

impl ScreenState {
    fn tracks(&self) -> Vec<(ScreenSlot, Arc<ForwardingTrack>)> {
        let mut tracks = Vec::with_capacity(2);
        if let Some(video) = &self.video {
            tracks.push((ScreenSlot::Video, video.clone()));
        }
        if let Some(audio) = &self.audio {
            tracks.push((ScreenSlot::Audio, audio.clone()));
        }
        tracks
    }
}

/// The active screen share of one channel.
pub struct ScreenRoom {
    /// Channel ID.
    pub channel_id: Uuid,
    /// Presenting user.
    pub presenter_id: Uuid,
    state: RwLock<ScreenState>,
    join_lock: Mutex<()>,
    factory: Arc<dyn ConnectionFactory>,
    events: Arc<dyn SfuEvents>,
    sfu: Weak<SfuServer>,
}

impl fmt::Debug for ScreenRoom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScreenRoom")
            .field("channel_id", &self.channel_id)
            .field("presenter_id", &self.presenter_id)
            .finish_non_exhaustive()
    }
}

impl ScreenRoom {
    /// Create a screen room with no presenter connection yet.
    pub fn new(
        channel_id: Uuid,
        presenter_id: Uuid,
        factory: Arc<dyn ConnectionFactory>,
        events: Arc<dyn SfuEvents>,
        sfu: Weak<SfuServer>,
    ) -> Self {
        Self {
            channel_id,
            presenter_id,
            state: RwLock::new(ScreenState::default()),
            join_lock: Mutex::new(()),
            factory,
            events,
            sfu,
        }
    }

    /// Create the presenter connection and send the presenter the initial offer.
    pub async fn setup_presenter(self: &Arc<Self>) -> Result<(), VoiceError> {
        let connection = self.factory.new_connection(MediaProfile::Screen).await?;
        let presenter = Arc::new(Negotiator::new(
            self.presenter_id,
            connection,
            SignalPath::Screen,
            self.events.clone(),
        ));

        let offer = match self.prepare_presenter(&presenter).await {
            Ok(offer) => offer,
            Err(e) => {
                presenter.close().await;
                return Err(e);
            }
        };

        {
            let mut state = self.state.write().await;
            if state.stopped {
                drop(state);
                presenter.close().await;
                return Err(VoiceError::ScreenShareNotFound(self.channel_id));
            }
            state.presenter = Some(presenter.clone());
        }

        presenter.send_offer(offer);
        Ok(())
    }

    async fn prepare_presenter(self: &Arc<Self>, presenter: &Arc<Negotiator>) -> Result<String, VoiceError> {
        let connection = presenter.connection();
        connection.add_recv_transceiver(RTPCodecType::Video).await?;
        connection.add_recv_transceiver(RTPCodecType::Audio).await?;

        let room = Arc::downgrade(self);
        connection.on_track(Box::new(move |inbound| {
            let room = room.clone();
            Box::pin(async move {
                if let Some(room) = room.upgrade() {
                    room.handle_presenter_track(inbound).await;
                }
            })
        }));

        let negotiator = Arc::downgrade(presenter);
        connection.on_ice_candidate(Box::new(move |candidate| {
            let negotiator = negotiator.clone();
            Box::pin(async move {
                if let Some(negotiator) = negotiator.upgrade() {
                    negotiator.send_ice_candidate(candidate);
                }
            })
        }));

        let room = Arc::downgrade(self);
        let sfu = self.sfu.clone();
        let presenter_id = self.presenter_id;
        connection.on_connection_state_change(Box::new(move |state| {
            let room = room.clone();
            let sfu = sfu.clone();
            Box::pin(async move {
                debug!(presenter_id = %presenter_id, state = %state, "Presenter connection state changed");
                if !is_terminal(state) {
                    return;
                }
                tokio::spawn(async move {
                    let Some(room) = room.upgrade() else {
                        return;
                    };
                    // A presenter that never finished setup is cleaned up by the caller.
                    if !room.has_presenter().await {
                        return;
                    }
                    if let Some(sfu) = sfu.upgrade() {
                        sfu.stop_screen_room(&room).await;
                    }
                });
            })
        }));

        presenter.initial_offer().await
    }

    async fn has_presenter(&self) -> bool {
        self.state.read().await.presenter.is_some()
    }

    /// Presenter media arrived: forward it to every viewer.
    async fn handle_presenter_track(&self, inbound: Arc<dyn InboundTrack>) {
        let slot = match inbound.kind() {
            RTPCodecType::Video => ScreenSlot::Video,
            RTPCodecType::Audio => ScreenSlot::Audio,
            other => {
                warn!(presenter_id = %self.presenter_id, kind = %other, "Ignoring unknown screen track kind");
                return;
            }
        };

        let track = Arc::new(ForwardingTrack::new(
            &inbound.codec(),
            format!("screen-{slot}-{}", self.presenter_id),
            format!("screen-{}", self.presenter_id),
        ));

        let viewers: Vec<_> = {
            let mut state = self.state.write().await;
            if state.stopped {
                return;
            }
            let existing = match slot {
                ScreenSlot::Video => &mut state.video,
                ScreenSlot::Audio => &mut state.audio,
            };
            if existing.is_some() {
                warn!(presenter_id = %self.presenter_id, slot = %slot, "Ignoring duplicate screen track");
                return;
            }
            *existing = Some(track.clone());

            let handle = spawn_forwarder(
                format!("screen-{slot}:{}", self.presenter_id),
                inbound.clone(),
                track.clone(),
                ForwardGate::open(),
            );
            state.forwarders.push(handle);
            state.viewers.values().cloned().collect()
        };

        info!(
            channel_id = %self.channel_id,
            presenter_id = %self.presenter_id,
            slot = %slot,
            codec = %inbound.codec().mime_type,
            "Screen track received"
        );

        for viewer in viewers {
            match viewer.attach(slot, &track).await {
                Ok(true) => {
                    viewer.negotiator().renegotiate().await;
                }
                Ok(false) => {}
                Err(e) => warn!(
                    viewer_id = %viewer.user_id,
                    slot = %slot,
                    error = %e,
                    "Failed to attach screen track"
                ),
            }
        }
    }

    /// Subscribe a viewer and send them a screen offer.
    pub async fn add_viewer(self: &Arc<Self>, user_id: Uuid) -> Result<Arc<ScreenViewer>, VoiceError> {
        let _join = self.join_lock.lock().await;

        let tracks = {
            let state = self.state.read().await;
            if state.stopped {
                return Err(VoiceError::ScreenShareNotFound(self.channel_id));
            }
            if state.viewers.contains_key(&user_id) {
                return Err(VoiceError::AlreadyJoined);
            }
            state.tracks()
        };

        let connection = self.factory.new_connection(MediaProfile::Screen).await?;
        let viewer = Arc::new(ScreenViewer::new(user_id, connection, self.events.clone()));

        let offer = match self.prepare_viewer(&viewer, tracks).await {
            Ok(offer) => offer,
            Err(e) => {
                warn!(channel_id = %self.channel_id, viewer_id = %user_id, error = %e, "Screen viewer setup failed");
                viewer.negotiator().close().await;
                return Err(e);
            }
        };

        {
            let mut state = self.state.write().await;
            if state.stopped {
                drop(state);
                viewer.negotiator().close().await;
                return Err(VoiceError::ScreenShareNotFound(self.channel_id));
            }
            state.viewers.insert(user_id, viewer.clone());
        }

        viewer.negotiator().send_offer(offer);
        self.attach_missed_tracks(&viewer).await;

        info!(
            channel_id = %self.channel_id,
            viewer_id = %user_id,
            "Viewer subscribed to screen share"
        );

        Ok(viewer)
    }

    async fn prepare_viewer(
        self: &Arc<Self>,
        viewer: &Arc<ScreenViewer>,
        tracks: Vec<(ScreenSlot, Arc<ForwardingTrack>)>,
    ) -> Result<String, VoiceError> {
        let connection = viewer.negotiator().connection();

        for (slot, track) in tracks {
            if let Err(e) = viewer.attach(slot, &track).await {
                warn!(viewer_id = %viewer.user_id, slot = %slot, error = %e, "Failed to attach screen track");
            }
        }

        let viewer_ref = Arc::downgrade(viewer);
        connection.on_ice_candidate(Box::new(move |candidate| {
            let viewer = viewer_ref.clone();
            Box::pin(async move {
                if let Some(viewer) = viewer.upgrade() {
                    viewer.negotiator().send_ice_candidate(candidate);
                }
            })
        }));

        let room = Arc::downgrade(self);
        let viewer_ref = Arc::downgrade(viewer);
        let user_id = viewer.user_id;
        connection.on_connection_state_change(Box::new(move |state| {
            let room = room.clone();
            let viewer = viewer_ref.clone();
            Box::pin(async move {
                debug!(viewer_id = %user_id, state = %state, "Viewer connection state changed");
                if !is_terminal(state) {
                    return;
                }
                tokio::spawn(async move {
                    if let (Some(room), Some(viewer)) = (room.upgrade(), viewer.upgrade()) {
                        room.remove_viewer_entry(user_id, Some(&viewer)).await;
                    }
                });
            })
        }));

        viewer.negotiator().initial_offer().await
    }

    /// Attach presenter tracks that arrived while the viewer was joining.
    async fn attach_missed_tracks(&self, viewer: &Arc<ScreenViewer>) {
        let tracks = self.state.read().await.tracks();
        let mut changed = false;

        for (slot, track) in tracks {
            match viewer.attach(slot, &track).await {
                Ok(attached) => changed |= attached,
                Err(e) => warn!(viewer_id = %viewer.user_id, slot = %slot, error = %e, "Failed to attach late screen track"),
            }
        }

        if changed {
            viewer.negotiator().renegotiate().await;
        }
    }

    /// Unsubscribe a viewer. Returns whether they were subscribed.
    pub async fn remove_viewer(&self, user_id: Uuid) -> bool {
        self.remove_viewer_entry(user_id, None).await
    }

    async fn remove_viewer_entry(&self, user_id: Uuid, expected: Option<&Arc<ScreenViewer>>) -> bool {
        let viewer = {
            let mut state = self.state.write().await;
            let matches = state
                .viewers
                .get(&user_id)
                .is_some_and(|v| expected.is_none_or(|e| Arc::ptr_eq(e, v)));
            if !matches {
                return false;
            }
            state.viewers.remove(&user_id)
        };

        let Some(viewer) = viewer else {
            return false;
        };
        viewer.negotiator().close().await;

        info!(
            channel_id = %self.channel_id,
            viewer_id = %user_id,
            "Viewer left screen share"
        );
        true
    }

    /// Close the presenter and every viewer. Calling it again does nothing.
    pub async fn stop(&self) {
        let (presenter, viewers, forwarders) = {
            let mut state = self.state.write().await;
            if state.stopped {
                return;
            }
            state.stopped = true;
            state.video = None;
            state.audio = None;
            (
                state.presenter.take(),
                std::mem::take(&mut state.viewers),
                std::mem::take(&mut state.forwarders),
            )
        };

        for handle in forwarders {
            handle.abort();
        }
        if let Some(presenter) = presenter {
            presenter.close().await;
        }
        for viewer in viewers.into_values() {
            viewer.negotiator().close().await;
        }

        info!(
            channel_id = %self.channel_id,
            presenter_id = %self.presenter_id,
            "Screen share stopped"
        );
    }

    async fn negotiator_for(&self, user_id: Uuid, role: Option<ScreenRole>) -> Option<ScreenNegotiator> {
        let state = self.state.read().await;

        if role != Some(ScreenRole::Viewer) && user_id == self.presenter_id {
            if let Some(presenter) = &state.presenter {
                return Some(ScreenNegotiator::Presenter(presenter.clone()));
            }
        }
        if role != Some(ScreenRole::Presenter) {
            if let Some(viewer) = state.viewers.get(&user_id) {
                return Some(ScreenNegotiator::Viewer(viewer.clone()));
            }
        }
        None
    }

    /// Whether `user_id` takes part in this share in the given role.
    pub async fn has_participant(&self, user_id: Uuid, role: Option<ScreenRole>) -> bool {
        self.negotiator_for(user_id, role).await.is_some()
    }

    /// Apply an answer from the presenter or a viewer.
    pub async fn handle_answer(
        &self,
        user_id: Uuid,
        sdp: String,
        role: Option<ScreenRole>,
    ) -> Result<(), VoiceError> {
        let negotiator = self
            .negotiator_for(user_id, role)
            .await
            .ok_or(VoiceError::ParticipantNotFound(user_id))?;
        negotiator.get().apply_answer(sdp).await
    }

    /// Apply an ICE candidate from the presenter or a viewer.
    pub async fn handle_ice(
        &self,
        user_id: Uuid,
        candidate: RTCIceCandidateInit,
        role: Option<ScreenRole>,
    ) -> Result<(), VoiceError> {
        let negotiator = self
            .negotiator_for(user_id, role)
            .await
            .ok_or(VoiceError::ParticipantNotFound(user_id))?;
        negotiator.get().add_ice_candidate(candidate).await
    }

    /// Look up a viewer.
    pub async fn get_viewer(&self, user_id: Uuid) -> Option<Arc<ScreenViewer>> {
        self.state.read().await.viewers.get(&user_id).cloned()
    }

    /// Number of viewers.
    pub async fn viewer_count(&self) -> usize {
        self.state.read().await.viewers.len()
    }

    /// Whether [`Self::stop`] has run.
    pub async fn is_stopped(&self) -> bool {
        self.state.read().await.stopped
    }

    /// Public summary.
    pub async fn info(&self) -> ScreenShareState {
        let state = self.state.read().await;
        ScreenShareState {
            user_id: self.presenter_id,
            channel_id: self.channel_id,
            viewer_count: state.viewers.len(),
            has_video: state.video.is_some(),
            has_audio: state.audio.is_some(),
        }
    }
}

/// Either side of a screen share, for routing signaling.
enum ScreenNegotiator {
    Presenter(Arc<Negotiator>),
    Viewer(Arc<ScreenViewer>),
}

impl ScreenNegotiator {
    fn get(&self) -> &Negotiator {
        match self {
            Self::Presenter(n) => n,
            Self::Viewer(v) => v.negotiator(),
        }
    }
}
