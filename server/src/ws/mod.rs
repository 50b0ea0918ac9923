//! WebSocket Handler
//!
//! Voice and screen share signaling transport.

mod hub;

pub use hub::Hub;

use axum::extract::ws::{Message, WebSocket};
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

use crate::api::AppState;
use crate::voice::{self, ScreenRole, ScreenShareState, VoiceState};

/// WebSocket connection query params.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Connecting user
    pub user_id: Uuid,
}

/// Client-to-server events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Ping for keepalive
    Ping,
    /// Join a voice channel, leaving the current one
    JoinVoice { channel_id: Uuid },
    /// Leave the current voice channel
    LeaveVoice,
    /// Answer to a voice offer
    WebrtcAnswer { sdp: String },
    /// ICE candidate for the voice connection
    WebrtcIce { candidate: RTCIceCandidateInit },
    /// Self mute
    VoiceSelfMute { muted: bool },
    /// Self deafen
    VoiceSelfDeafen { deafened: bool },
    /// Voice activity
    VoiceSpeaking { speaking: bool },
    /// Server-mute another user (admin only)
    VoiceServerMute { user_id: Uuid, muted: bool },
    /// Start sharing the screen in the current voice channel
    ScreenShareStart,
    /// Stop sharing the screen
    ScreenShareStop,
    /// Watch a channel's screen share
    ScreenShareSubscribe { channel_id: Uuid },
    /// Stop watching a channel's screen share
    ScreenShareUnsubscribe { channel_id: Uuid },
    /// Answer to a screen offer
    WebrtcScreenAnswer {
        sdp: String,
        #[serde(default)]
        role: Option<ScreenRole>,
    },
    /// ICE candidate for a screen connection
    WebrtcScreenIce {
        candidate: RTCIceCandidateInit,
        #[serde(default)]
        role: Option<ScreenRole>,
    },
}

/// Server-to-client events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Connection established, with the current voice and screen share state
    Ready {
        user_id: Uuid,
        voice_states: Vec<VoiceState>,
        screen_shares: Vec<ScreenShareState>,
    },
    /// Pong response
    Pong,
    /// A user's voice state changed; `channel_id` is `None` once they left
    VoiceStateUpdate {
        user_id: Uuid,
        channel_id: Option<Uuid>,
        self_mute: bool,
        self_deafen: bool,
        server_mute: bool,
        speaking: bool,
    },
    /// Voice connection offer
    WebrtcOffer { sdp: String },
    /// Voice connection ICE candidate
    WebrtcIce { candidate: RTCIceCandidateInit },
    /// Screen connection offer
    WebrtcScreenOffer { sdp: String },
    /// Screen connection ICE candidate
    WebrtcScreenIce { candidate: RTCIceCandidateInit },
    /// A screen share started
    ScreenShareStarted { user_id: Uuid, channel_id: Uuid },
    /// A screen share ended
    ScreenShareStopped { user_id: Uuid, channel_id: Uuid },
    /// Screen share request rejected
    ScreenShareError { error: String },
    /// Error
    Error { code: String, message: String },
}

impl From<VoiceState> for ServerEvent {
    fn from(state: VoiceState) -> Self {
        Self::VoiceStateUpdate {
            user_id: state.user_id,
            channel_id: Some(state.channel_id),
            self_mute: state.self_mute,
            self_deafen: state.self_deafen,
            server_mute: state.server_mute,
            speaking: state.speaking,
        }
    }
}

/// WebSocket upgrade handler.
pub async fn handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.user_id))
}

/// Handle WebSocket connection.
async fn handle_socket(socket: WebSocket, state: AppState, user_id: Uuid) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel for sending messages to the WebSocket
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(state.config.ws_send_buffer);
    let connection_id = state.hub.register(user_id, tx.clone());

    info!(user_id = %user_id, "WebSocket connected");

    let ready = ServerEvent::Ready {
        user_id,
        voice_states: state.sfu.voice_states().await,
        screen_shares: state.sfu.screen_shares().await,
    };
    if tx.send(ready).await.is_err() {
        warn!(user_id = %user_id, "Socket closed before ready");
    }

    // Spawn task to forward events to WebSocket
    let sender_handle = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let msg = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "Failed to serialize event");
                    continue;
                }
            };

            if ws_sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Handle incoming messages
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                handle_client_message(text.as_str(), user_id, &state, &tx).await;
            }
            Ok(Message::Close(_)) => {
                debug!(user_id = %user_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    // Cleanup
    sender_handle.abort();
    if state.hub.unregister(user_id, connection_id) {
        voice::ws_handler::handle_disconnect(&state, user_id).await;
    }

    info!(user_id = %user_id, "WebSocket disconnected");
}

/// Handle a client message.
async fn handle_client_message(
    text: &str,
    user_id: Uuid,
    state: &AppState,
    tx: &mpsc::Sender<ServerEvent>,
) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(user_id = %user_id, error = %e, "Invalid client message");
            reply(
                tx,
                user_id,
                ServerEvent::Error {
                    code: "invalid_message".to_string(),
                    message: e.to_string(),
                },
            );
            return;
        }
    };

    if matches!(event, ClientEvent::Ping) {
        reply(tx, user_id, ServerEvent::Pong);
        return;
    }

    if let Err(e) = voice::ws_handler::handle_voice_event(state, user_id, event).await {
        warn!(user_id = %user_id, error = %e, "Voice event failed");
        reply(
            tx,
            user_id,
            ServerEvent::Error {
                code: e.code().to_string(),
                message: e.to_string(),
            },
        );
    }
}

/// Queue a direct reply without stalling the receive loop on a full queue.
fn reply(tx: &mpsc::Sender<ServerEvent>, user_id: Uuid, event: ServerEvent) {
    if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event) {
        warn!(user_id = %user_id, "Outbound queue full, dropping reply");
    }
}
