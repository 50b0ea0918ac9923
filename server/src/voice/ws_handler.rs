//! Voice WebSocket Message Handlers
//!
//! Handles voice and screen share signaling messages from WebSocket connections.

use tracing::{debug, info};
use uuid::Uuid;

use super::error::VoiceError;
use crate::api::AppState;
use crate::ws::{ClientEvent, ServerEvent};

/// Handle a voice-related client event.
pub async fn handle_voice_event(
    state: &AppState,
    user_id: Uuid,
    event: ClientEvent,
) -> Result<(), VoiceError> {
    match event {
        ClientEvent::JoinVoice { channel_id } => handle_join(state, user_id, channel_id).await,
        ClientEvent::LeaveVoice => {
            handle_leave(state, user_id).await;
            Ok(())
        }
        ClientEvent::WebrtcAnswer { sdp } => state.sfu.handle_answer(user_id, sdp).await,
        ClientEvent::WebrtcIce { candidate } => state.sfu.handle_ice(user_id, candidate).await,
        ClientEvent::VoiceSelfMute { muted } => {
            let voice_state = state.sfu.set_self_mute(user_id, muted).await?;
            state.hub.broadcast(&voice_state.into());
            Ok(())
        }
        ClientEvent::VoiceSelfDeafen { deafened } => {
            let voice_state = state.sfu.set_self_deafen(user_id, deafened).await?;
            state.hub.broadcast(&voice_state.into());
            Ok(())
        }
        ClientEvent::VoiceSpeaking { speaking } => {
            let voice_state = state.sfu.set_speaking(user_id, speaking).await?;
            state.hub.broadcast(&voice_state.into());
            Ok(())
        }
        ClientEvent::VoiceServerMute {
            user_id: target,
            muted,
        } => handle_server_mute(state, user_id, target, muted).await,
        ClientEvent::ScreenShareStart => {
            handle_screen_start(state, user_id).await;
            Ok(())
        }
        ClientEvent::ScreenShareStop => {
            stop_own_screen_share(state, user_id).await;
            Ok(())
        }
        ClientEvent::ScreenShareSubscribe { channel_id } => {
            state.sfu.add_screen_viewer(channel_id, user_id).await?;
            Ok(())
        }
        ClientEvent::ScreenShareUnsubscribe { channel_id } => {
            state.sfu.remove_screen_viewer(channel_id, user_id).await;
            Ok(())
        }
        ClientEvent::WebrtcScreenAnswer { sdp, role } => {
            state.sfu.handle_screen_answer(user_id, sdp, role).await
        }
        ClientEvent::WebrtcScreenIce { candidate, role } => {
            state.sfu.handle_screen_ice(user_id, candidate, role).await
        }
        ClientEvent::Ping => Ok(()),
    }
}

/// Handle a user joining a voice channel.
async fn handle_join(state: &AppState, user_id: Uuid, channel_id: Uuid) -> Result<(), VoiceError> {
    info!(user_id = %user_id, channel_id = %channel_id, "User joining voice channel");

    handle_leave(state, user_id).await;

    let peer = state.sfu.add_peer(channel_id, user_id).await?;
    state.hub.broadcast(&peer.voice_state().await.into());

    Ok(())
}

/// Leave the current voice channel, stopping the user's screen share.
async fn handle_leave(state: &AppState, user_id: Uuid) {
    stop_own_screen_share(state, user_id).await;

    if let Some(room) = state.sfu.user_room(user_id).await {
        state.sfu.remove_peer(room.channel_id, user_id).await;
        debug!(user_id = %user_id, channel_id = %room.channel_id, "User left voice channel");
    }
}

async fn handle_server_mute(
    state: &AppState,
    admin_id: Uuid,
    target: Uuid,
    muted: bool,
) -> Result<(), VoiceError> {
    if !state.config.is_admin(admin_id) {
        return Err(VoiceError::Unauthorized);
    }

    let voice_state = state.sfu.set_server_mute(target, muted).await?;
    info!(admin_id = %admin_id, user_id = %target, muted, "Server mute applied");
    state.hub.broadcast(&voice_state.into());
    Ok(())
}

/// Start a screen share in the user's voice channel.
///
/// Failures are reported as `screen_share_error` rather than a generic error.
async fn handle_screen_start(state: &AppState, user_id: Uuid) {
    let Some(room) = state.sfu.user_room(user_id).await else {
        state.hub.send(
            user_id,
            ServerEvent::ScreenShareError {
                error: VoiceError::NotInChannel.to_string(),
            },
        );
        return;
    };

    match state.sfu.start_screen_share(room.channel_id, user_id).await {
        Ok(screen) => {
            state.hub.broadcast(&ServerEvent::ScreenShareStarted {
                user_id,
                channel_id: screen.channel_id,
            });
        }
        Err(e) => {
            debug!(user_id = %user_id, error = %e, "Screen share rejected");
            state
                .hub
                .send(user_id, ServerEvent::ScreenShareError { error: e.to_string() });
        }
    }
}

async fn stop_own_screen_share(state: &AppState, user_id: Uuid) {
    if let Some(screen) = state.sfu.user_screen_share(user_id).await {
        state.sfu.stop_screen_share(screen.channel_id).await;
    }
}

/// Clean up after a socket closes: leave voice, stop sharing, stop watching.
pub async fn handle_disconnect(state: &AppState, user_id: Uuid) {
    handle_leave(state, user_id).await;
    state.sfu.remove_viewer_everywhere(user_id).await;
}
