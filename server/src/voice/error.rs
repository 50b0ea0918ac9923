//! Voice Service Errors

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during voice and screen share operations.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// Participant not found.
    #[error("Participant not found: {0}")]
    ParticipantNotFound(Uuid),

    /// Media engine error (connection, transceiver or track setup).
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// Signaling error (bad SDP answer, invalid ICE candidate).
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Already in this voice channel or already watching this screen share.
    #[error("Already joined")]
    AlreadyJoined,

    /// Not in a voice channel.
    #[error("Not in voice channel")]
    NotInChannel,

    /// A screen share is already active in the channel.
    #[error("Screen share already active in channel {channel_id}")]
    Conflict {
        /// Channel that already has a presenter.
        channel_id: Uuid,
    },

    /// No active screen share in the channel.
    #[error("No active screen share in channel {0}")]
    ScreenShareNotFound(Uuid),

    /// The room was retired by the router while a join was in flight.
    #[error("Room closed: {0}")]
    RoomClosed(Uuid),

    /// Caller may not perform this action.
    #[error("Not authorized")]
    Unauthorized,
}

impl IntoResponse for VoiceError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            Self::ParticipantNotFound(_) => {
                (StatusCode::NOT_FOUND, "PARTICIPANT_NOT_FOUND", self.to_string())
            }
            Self::WebRtc(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "WEBRTC_ERROR",
                "WebRTC operation failed".to_string(),
            ),
            Self::Signaling(_) => (StatusCode::BAD_REQUEST, "SIGNALING_ERROR", self.to_string()),
            Self::AlreadyJoined => (StatusCode::CONFLICT, "ALREADY_JOINED", self.to_string()),
            Self::NotInChannel => (StatusCode::BAD_REQUEST, "NOT_IN_CHANNEL", self.to_string()),
            Self::Conflict { .. } => (
                StatusCode::CONFLICT,
                "SCREEN_SHARE_ACTIVE",
                self.to_string(),
            ),
            Self::ScreenShareNotFound(_) => (
                StatusCode::NOT_FOUND,
                "SCREEN_SHARE_NOT_FOUND",
                self.to_string(),
            ),
            Self::RoomClosed(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "ROOM_CLOSED",
                self.to_string(),
            ),
            Self::Unauthorized => (StatusCode::FORBIDDEN, "UNAUTHORIZED", self.to_string()),
        };

        let body = Json(serde_json::json!({
            "error": message,
            "code": code,
        }));

        (status, body).into_response()
    }
}

impl VoiceError {
    /// Short machine-readable code, shared with the WebSocket error event.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ParticipantNotFound(_) => "participant_not_found",
            Self::WebRtc(_) => "webrtc_error",
            Self::Signaling(_) => "signaling_error",
            Self::AlreadyJoined => "already_joined",
            Self::NotInChannel => "not_in_channel",
            Self::Conflict { .. } => "screen_share_active",
            Self::ScreenShareNotFound(_) => "screen_share_not_found",
            Self::RoomClosed(_) => "room_closed",
            Self::Unauthorized => "unauthorized",
        }
    }
}

impl From<webrtc::Error> for VoiceError {
    fn from(err: webrtc::Error) -> Self {
        Self::WebRtc(err.to_string())
    }
}
