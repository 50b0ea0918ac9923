//! Selective Forwarding Unit
//!
//! Routes users to voice rooms and screen shares by channel, and funnels
//! every outbound notification through [`SfuEvents`].

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use super::error::VoiceError;
use super::media::ConnectionFactory;
use super::peer::{Peer, VoiceState};
use super::room::Room;
use super::screen_share::{ScreenRole, ScreenRoom, ScreenShareState, ScreenViewer};

/// A signaling message for one user.
#[derive(Debug, Clone)]
pub enum Signal {
    /// Voice connection offer.
    Offer {
        /// SDP.
        sdp: String,
    },
    /// Voice connection ICE candidate.
    IceCandidate {
        /// Candidate.
        candidate: RTCIceCandidateInit,
    },
    /// Screen connection offer.
    ScreenOffer {
        /// SDP.
        sdp: String,
    },
    /// Screen connection ICE candidate.
    ScreenIceCandidate {
        /// Candidate.
        candidate: RTCIceCandidateInit,
    },
}

impl Signal {
    /// Wire message type.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "webrtc_offer",
            Self::IceCandidate { .. } => "webrtc_ice",
            Self::ScreenOffer { .. } => "webrtc_screen_offer",
            Self::ScreenIceCandidate { .. } => "webrtc_screen_ice",
        }
    }
}

/// Outbound notifications.
///
/// Implementations must not block and must not call back into the SFU.
pub trait SfuEvents: Send + Sync {
    /// Deliver a signaling message to a user.
    fn signal(&self, user_id: Uuid, signal: Signal);

    /// A user left a voice room. Fired exactly once per removal.
    fn peer_removed(&self, user_id: Uuid, channel_id: Uuid);

    /// A screen share ended. Fired exactly once per share.
    fn screen_share_stopped(&self, presenter_id: Uuid, channel_id: Uuid);
}

/// SFU server managing all voice rooms and screen shares.
pub struct SfuServer {
    /// Voice rooms by channel.
    rooms: RwLock<HashMap<Uuid, Arc<Room>>>,
    /// Screen shares by channel.
    screen_rooms: RwLock<HashMap<Uuid, Arc<ScreenRoom>>>,
    factory: Arc<dyn ConnectionFactory>,
    events: Arc<dyn SfuEvents>,
}

impl SfuServer {
    /// Create a new SFU server.
    pub fn new(factory: Arc<dyn ConnectionFactory>, events: Arc<dyn SfuEvents>) -> Arc<Self> {
        info!("SFU server initialized");
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
            screen_rooms: RwLock::new(HashMap::new()),
            factory,
            events,
        })
    }

    // ---- Voice ----

    async fn get_or_create_room(self: &Arc<Self>, channel_id: Uuid) -> Arc<Room> {
        let mut rooms = self.rooms.write().await;

        if let Some(room) = rooms.get(&channel_id) {
            return room.clone();
        }

        let room = Arc::new(Room::new(
            channel_id,
            self.factory.clone(),
            self.events.clone(),
            Arc::downgrade(self),
        ));
        rooms.insert(channel_id, room.clone());

        debug!(channel_id = %channel_id, "Created new voice room");

        room
    }

    /// Get a room by channel ID.
    pub async fn get_room(&self, channel_id: Uuid) -> Option<Arc<Room>> {
        self.rooms.read().await.get(&channel_id).cloned()
    }

    /// Drop the room if it has no peers.
    ///
    /// The room is retired under the router lock, so a join racing with the
    /// cleanup either lands before it or sees [`VoiceError::RoomClosed`].
    pub async fn remove_room_if_empty(&self, channel_id: Uuid) {
        let mut rooms = self.rooms.write().await;

        if let Some(room) = rooms.get(&channel_id) {
            if room.retire_if_empty().await {
                rooms.remove(&channel_id);
                debug!(channel_id = %channel_id, "Removed empty voice room");
            }
        }
    }

    /// Join a user to a channel's voice room, creating the room if needed.
    pub async fn add_peer(
        self: &Arc<Self>,
        channel_id: Uuid,
        user_id: Uuid,
    ) -> Result<Arc<Peer>, VoiceError> {
        // A retired room is replaced by a fresh one on the next lookup.
        for _ in 0..2 {
            let room = self.get_or_create_room(channel_id).await;
            match room.add_peer(user_id).await {
                Ok(peer) => return Ok(peer),
                Err(VoiceError::RoomClosed(_)) => {
                    debug!(
                        channel_id = %channel_id,
                        user_id = %user_id,
                        "Room retired during join, retrying"
                    );
                }
                Err(e) => {
                    self.remove_room_if_empty(channel_id).await;
                    return Err(e);
                }
            }
        }

        Err(VoiceError::RoomClosed(channel_id))
    }

    /// Remove a user from a channel's voice room. Returns whether they were in it.
    pub async fn remove_peer(&self, channel_id: Uuid, user_id: Uuid) -> bool {
        match self.get_room(channel_id).await {
            Some(room) => room.remove_peer(user_id).await,
            None => false,
        }
    }

    /// The voice room the user is in.
    pub async fn user_room(&self, user_id: Uuid) -> Option<Arc<Room>> {
        let rooms: Vec<_> = self.rooms.read().await.values().cloned().collect();
        for room in rooms {
            if room.contains(user_id).await {
                return Some(room);
            }
        }
        None
    }

    async fn user_peer(&self, user_id: Uuid) -> Result<Arc<Peer>, VoiceError> {
        let room = self.user_room(user_id).await.ok_or(VoiceError::NotInChannel)?;
        room.get_peer(user_id).await.ok_or(VoiceError::NotInChannel)
    }

    /// Apply a voice SDP answer.
    pub async fn handle_answer(&self, user_id: Uuid, sdp: String) -> Result<(), VoiceError> {
        let room = self.user_room(user_id).await.ok_or(VoiceError::NotInChannel)?;
        room.handle_answer(user_id, sdp).await
    }

    /// Apply a voice ICE candidate.
    pub async fn handle_ice(&self, user_id: Uuid, candidate: RTCIceCandidateInit) -> Result<(), VoiceError> {
        let room = self.user_room(user_id).await.ok_or(VoiceError::NotInChannel)?;
        room.handle_ice(user_id, candidate).await
    }

    /// Voice state of one user.
    pub async fn voice_state(&self, user_id: Uuid) -> Option<VoiceState> {
        match self.user_peer(user_id).await {
            Ok(peer) => Some(peer.voice_state().await),
            Err(_) => None,
        }
    }

    /// Voice state of every connected user.
    pub async fn voice_states(&self) -> Vec<VoiceState> {
        let rooms: Vec<_> = self.rooms.read().await.values().cloned().collect();
        let mut states = Vec::new();
        for room in rooms {
            states.extend(room.voice_states().await);
        }
        states
    }

    /// Set a user's self-mute flag.
    pub async fn set_self_mute(&self, user_id: Uuid, muted: bool) -> Result<VoiceState, VoiceError> {
        Ok(self.user_peer(user_id).await?.set_self_mute(muted).await)
    }

    /// Set a user's self-deafen flag.
    pub async fn set_self_deafen(&self, user_id: Uuid, deafened: bool) -> Result<VoiceState, VoiceError> {
        Ok(self.user_peer(user_id).await?.set_self_deafen(deafened).await)
    }

    /// Set a user's speaking indicator.
    pub async fn set_speaking(&self, user_id: Uuid, speaking: bool) -> Result<VoiceState, VoiceError> {
        Ok(self.user_peer(user_id).await?.set_speaking(speaking).await)
    }

    /// Server-mute a user. Their audio stops reaching the room until unmuted.
    pub async fn set_server_mute(&self, user_id: Uuid, muted: bool) -> Result<VoiceState, VoiceError> {
        Ok(self.user_peer(user_id).await?.set_server_mute(muted).await)
    }

    /// Get active room count.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    // ---- Screen share ----

    /// Start a screen share. Fails with [`VoiceError::Conflict`] if the
    /// channel already has one.
    pub async fn start_screen_share(
        self: &Arc<Self>,
        channel_id: Uuid,
        presenter_id: Uuid,
    ) -> Result<Arc<ScreenRoom>, VoiceError> {
        let room = {
            let mut screen_rooms = self.screen_rooms.write().await;
            if screen_rooms.contains_key(&channel_id) {
                return Err(VoiceError::Conflict { channel_id });
            }
            let room = Arc::new(ScreenRoom::new(
                channel_id,
                presenter_id,
                self.factory.clone(),
                self.events.clone(),
                Arc::downgrade(self),
            ));
            screen_rooms.insert(channel_id, room.clone());
            room
        };

        if let Err(e) = room.setup_presenter().await {
            warn!(channel_id = %channel_id, presenter_id = %presenter_id, error = %e, "Screen share setup failed");
            {
                let mut screen_rooms = self.screen_rooms.write().await;
                if screen_rooms.get(&channel_id).is_some_and(|r| Arc::ptr_eq(r, &room)) {
                    screen_rooms.remove(&channel_id);
                }
            }
            room.stop().await;
            return Err(e);
        }

        info!(channel_id = %channel_id, presenter_id = %presenter_id, "Screen share started");
        Ok(room)
    }

    /// Stop a channel's screen share. Returns whether one was active.
    pub async fn stop_screen_share(&self, channel_id: Uuid) -> bool {
        let room = self.screen_rooms.write().await.remove(&channel_id);
        match room {
            Some(room) => {
                self.finish_screen_share(&room).await;
                true
            }
            None => false,
        }
    }

    /// Stop `room` if it is still the channel's registered share.
    pub(super) async fn stop_screen_room(&self, room: &Arc<ScreenRoom>) -> bool {
        {
            let mut screen_rooms = self.screen_rooms.write().await;
            let current = screen_rooms
                .get(&room.channel_id)
                .is_some_and(|r| Arc::ptr_eq(r, room));
            if !current {
                return false;
            }
            screen_rooms.remove(&room.channel_id);
        }
        self.finish_screen_share(room).await;
        true
    }

    async fn finish_screen_share(&self, room: &Arc<ScreenRoom>) {
        self.events
            .screen_share_stopped(room.presenter_id, room.channel_id);
        room.stop().await;
    }

    /// The active screen share of a channel.
    pub async fn get_screen_room(&self, channel_id: Uuid) -> Option<Arc<ScreenRoom>> {
        self.screen_rooms.read().await.get(&channel_id).cloned()
    }

    /// The screen share the user is presenting, if any.
    pub async fn user_screen_share(&self, user_id: Uuid) -> Option<Arc<ScreenRoom>> {
        self.screen_rooms
            .read()
            .await
            .values()
            .find(|r| r.presenter_id == user_id)
            .cloned()
    }

    /// Subscribe a user to a channel's screen share.
    pub async fn add_screen_viewer(
        &self,
        channel_id: Uuid,
        user_id: Uuid,
    ) -> Result<Arc<ScreenViewer>, VoiceError> {
        let room = self
            .get_screen_room(channel_id)
            .await
            .ok_or(VoiceError::ScreenShareNotFound(channel_id))?;
        room.add_viewer(user_id).await
    }

    /// Unsubscribe a user from a channel's screen share. Returns whether they were subscribed.
    pub async fn remove_screen_viewer(&self, channel_id: Uuid, user_id: Uuid) -> bool {
        match self.get_screen_room(channel_id).await {
            Some(room) => room.remove_viewer(user_id).await,
            None => false,
        }
    }

    /// Remove a user from every screen share they watch.
    pub async fn remove_viewer_everywhere(&self, user_id: Uuid) {
        for room in self.screen_room_list().await {
            room.remove_viewer(user_id).await;
        }
    }

    /// Find the screen share a signaling message belongs to.
    ///
    /// Without a role the presenter side is searched first.
    async fn screen_room_for(&self, user_id: Uuid, role: Option<ScreenRole>) -> Option<Arc<ScreenRoom>> {
        let rooms = self.screen_room_list().await;

        if role != Some(ScreenRole::Viewer) {
            for room in &rooms {
                if room.presenter_id == user_id && room.has_participant(user_id, Some(ScreenRole::Presenter)).await {
                    return Some(room.clone());
                }
            }
        }
        if role != Some(ScreenRole::Presenter) {
            for room in rooms {
                if room.has_participant(user_id, Some(ScreenRole::Viewer)).await {
                    return Some(room);
                }
            }
        }
        None
    }

    /// Apply a screen SDP answer from a presenter or viewer.
    pub async fn handle_screen_answer(
        &self,
        user_id: Uuid,
        sdp: String,
        role: Option<ScreenRole>,
    ) -> Result<(), VoiceError> {
        let room = self
            .screen_room_for(user_id, role)
            .await
            .ok_or(VoiceError::ParticipantNotFound(user_id))?;
        room.handle_answer(user_id, sdp, role).await
    }

    /// Apply a screen ICE candidate from a presenter or viewer.
    pub async fn handle_screen_ice(
        &self,
        user_id: Uuid,
        candidate: RTCIceCandidateInit,
        role: Option<ScreenRole>,
    ) -> Result<(), VoiceError> {
        let room = self
            .screen_room_for(user_id, role)
            .await
            .ok_or(VoiceError::ParticipantNotFound(user_id))?;
        room.handle_ice(user_id, candidate, role).await
    }

    /// Summary of every active screen share.
    pub async fn screen_shares(&self) -> Vec<ScreenShareState> {
        let mut shares = Vec::new();
        for room in self.screen_room_list().await {
            shares.push(room.info().await);
        }
        shares
    }

    async fn screen_room_list(&self) -> Vec<Arc<ScreenRoom>> {
        self.screen_rooms.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::mock::{settle, wait_until, MockFactory, MockInboundTrack, RecordingEvents};
    use std::time::Duration;
    use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

    fn sfu() -> (Arc<SfuServer>, Arc<MockFactory>, Arc<RecordingEvents>) {
        let factory = MockFactory::new();
        let events = RecordingEvents::new();
        (SfuServer::new(factory.clone(), events.clone()), factory, events)
    }

    #[tokio::test]
    async fn test_room_created_and_dropped_with_membership() {
        let (sfu, _, events) = sfu();
        let (channel, user) = (Uuid::new_v4(), Uuid::new_v4());

        sfu.add_peer(channel, user).await.unwrap();
        assert_eq!(sfu.room_count().await, 1);
        assert_eq!(sfu.user_room(user).await.unwrap().channel_id, channel);

        assert!(sfu.remove_peer(channel, user).await);
        assert_eq!(sfu.room_count().await, 0);
        assert!(sfu.user_room(user).await.is_none());
        assert_eq!(events.removed(), vec![(user, channel)]);
    }

    #[tokio::test]
    async fn test_failed_join_does_not_leave_empty_room() {
        let (sfu, factory, _) = sfu();
        factory.fail_connections(true);

        let err = sfu.add_peer(Uuid::new_v4(), Uuid::new_v4()).await.unwrap_err();

        assert!(matches!(err, VoiceError::WebRtc(_)));
        assert_eq!(sfu.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_join_after_room_emptied_gets_fresh_room() {
        let (sfu, _, _) = sfu();
        let (channel, a, b) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        sfu.add_peer(channel, a).await.unwrap();
        let first = sfu.get_room(channel).await.unwrap();
        sfu.remove_peer(channel, a).await;

        sfu.add_peer(channel, b).await.unwrap();
        let second = sfu.get_room(channel).await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_voice_flag_operations_require_membership() {
        let (sfu, _, _) = sfu();
        let (channel, user) = (Uuid::new_v4(), Uuid::new_v4());

        let err = sfu.set_self_mute(user, true).await.unwrap_err();
        assert!(matches!(err, VoiceError::NotInChannel));

        sfu.add_peer(channel, user).await.unwrap();
        let state = sfu.set_server_mute(user, true).await.unwrap();
        assert!(state.server_mute);
        assert_eq!(sfu.voice_states().await, vec![state]);
    }

    #[tokio::test]
    async fn test_second_screen_share_conflicts() {
        let (sfu, factory, _) = sfu();
        let channel = Uuid::new_v4();

        sfu.start_screen_share(channel, Uuid::new_v4()).await.unwrap();
        let err = sfu
            .start_screen_share(channel, Uuid::new_v4())
            .await
            .unwrap_err();

        assert!(matches!(err, VoiceError::Conflict { channel_id } if channel_id == channel));
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn test_failed_screen_setup_frees_channel() {
        let (sfu, factory, events) = sfu();
        let channel = Uuid::new_v4();

        factory.fail_transceivers(true);
        sfu.start_screen_share(channel, Uuid::new_v4()).await.unwrap_err();
        assert!(sfu.get_screen_room(channel).await.is_none());
        assert!(events.stopped().is_empty());

        factory.fail_transceivers(false);
        sfu.start_screen_share(channel, Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_screen_share_notifies_once() {
        let (sfu, factory, events) = sfu();
        let (channel, presenter) = (Uuid::new_v4(), Uuid::new_v4());

        sfu.start_screen_share(channel, presenter).await.unwrap();
        let presenter_conn = factory.last();

        assert!(sfu.stop_screen_share(channel).await);
        assert!(!sfu.stop_screen_share(channel).await);
        presenter_conn.fire_state(RTCPeerConnectionState::Failed).await;
        settle().await;

        assert_eq!(events.stopped(), vec![(presenter, channel)]);
    }

    #[tokio::test]
    async fn test_presenter_failure_stops_share() {
        let (sfu, factory, events) = sfu();
        let (channel, presenter) = (Uuid::new_v4(), Uuid::new_v4());

        sfu.start_screen_share(channel, presenter).await.unwrap();
        let presenter_conn = factory.last();
        sfu.add_screen_viewer(channel, Uuid::new_v4()).await.unwrap();
        let viewer_conn = factory.last();

        tokio::time::timeout(
            Duration::from_secs(2),
            presenter_conn.fire_state(RTCPeerConnectionState::Failed),
        )
        .await
        .expect("state handler did not return");
        wait_until(|| !events.stopped().is_empty()).await;
        wait_until(|| viewer_conn.is_closed()).await;

        assert!(presenter_conn.is_closed());
        assert!(sfu.get_screen_room(channel).await.is_none());
        assert_eq!(events.stopped(), vec![(presenter, channel)]);
    }

    #[tokio::test]
    async fn test_stale_presenter_failure_ignored_by_new_share() {
        let (sfu, factory, events) = sfu();
        let channel = Uuid::new_v4();

        sfu.start_screen_share(channel, Uuid::new_v4()).await.unwrap();
        let old_conn = factory.last();
        sfu.stop_screen_share(channel).await;

        let second = Uuid::new_v4();
        sfu.start_screen_share(channel, second).await.unwrap();
        old_conn.fire_state(RTCPeerConnectionState::Failed).await;
        settle().await;

        assert_eq!(sfu.get_screen_room(channel).await.unwrap().presenter_id, second);
        assert_eq!(events.stopped().len(), 1);
    }

    #[tokio::test]
    async fn test_screen_answer_routes_to_viewer() {
        let (sfu, factory, _) = sfu();
        let (channel, presenter, viewer) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        sfu.start_screen_share(channel, presenter).await.unwrap();
        let presenter_conn = factory.last();
        sfu.add_screen_viewer(channel, viewer).await.unwrap();

        sfu.handle_screen_answer(viewer, "answer".into(), None).await.unwrap();
        sfu.handle_screen_answer(presenter, "answer".into(), None).await.unwrap();

        let err = sfu
            .handle_screen_answer(Uuid::new_v4(), "answer".into(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::ParticipantNotFound(_)));

        presenter_conn.fire_track(MockInboundTrack::video()).await;
        let share = &sfu.screen_shares().await[0];
        assert!(share.has_video);
        assert_eq!(share.viewer_count, 1);
    }

    #[tokio::test]
    async fn test_viewer_requires_active_share() {
        let (sfu, _, _) = sfu();
        let err = sfu
            .add_screen_viewer(Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::ScreenShareNotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_voice_connection_drops_room() {
        let (sfu, factory, events) = sfu();
        let (channel, user) = (Uuid::new_v4(), Uuid::new_v4());

        sfu.add_peer(channel, user).await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(2),
            factory.last().fire_state(RTCPeerConnectionState::Failed),
        )
        .await
        .expect("state handler did not return");

        wait_until(|| !events.removed().is_empty()).await;
        settle().await;

        assert_eq!(events.removed(), vec![(user, channel)]);
        assert!(sfu.get_room(channel).await.is_none());
        assert!(sfu.user_room(user).await.is_none());
    }

    #[tokio::test]
    async fn test_viewer_failure_unsubscribes_viewer() {
        let (sfu, factory, events) = sfu();
        let (channel, presenter, viewer) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        sfu.start_screen_share(channel, presenter).await.unwrap();
        sfu.add_screen_viewer(channel, viewer).await.unwrap();
        let viewer_conn = factory.last();

        tokio::time::timeout(
            Duration::from_secs(2),
            viewer_conn.fire_state(RTCPeerConnectionState::Failed),
        )
        .await
        .expect("state handler did not return");
        wait_until(|| viewer_conn.is_closed()).await;
        settle().await;

        assert_eq!(sfu.screen_shares().await[0].viewer_count, 0);
        assert!(events.stopped().is_empty());
    }

    #[tokio::test]
    async fn test_server_mute_does_not_renegotiate() {
        let (sfu, factory, events) = sfu();
        let (channel, a, b) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        sfu.add_peer(channel, a).await.unwrap();
        let conn_a = factory.last();
        sfu.add_peer(channel, b).await.unwrap();
        let conn_b = factory.last();
        sfu.handle_answer(a, "answer".into()).await.unwrap();
        sfu.handle_answer(b, "answer".into()).await.unwrap();

        conn_a.fire_track(MockInboundTrack::audio()).await;
        assert_eq!(conn_b.attached_tracks(), vec![format!("voice-{a}")]);
        sfu.handle_answer(b, "answer".into()).await.unwrap();

        let offers = (events.offers_for(a).len(), events.offers_for(b).len());
        let counts = (conn_a.offer_count(), conn_b.offer_count());

        assert!(sfu.set_server_mute(a, true).await.unwrap().server_mute);
        assert!(!sfu.set_server_mute(a, false).await.unwrap().server_mute);
        settle().await;

        assert_eq!((events.offers_for(a).len(), events.offers_for(b).len()), offers);
        assert_eq!((conn_a.offer_count(), conn_b.offer_count()), counts);
        assert_eq!(conn_b.attached_tracks(), vec![format!("voice-{a}")]);
    }
}
