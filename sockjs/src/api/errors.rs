//! Transport-level errors and their client-visible form.
//!
//! Binding conflicts are converted to close frames and delivered with
//! HTTP 200 in the framing of the transport that hit them; everything
//! else maps to a plain HTTP status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::proto::{CloseReason, PayloadError};
use crate::session::SessionError;

#[derive(Debug, thiserror::Error)]
pub(crate) enum TransportError {
    /// Receive-only transports require an existing session.
    #[error("session not found")]
    SessionNotFound,
    /// Session/server id segments must be non-empty and dot-free.
    #[error("invalid session id")]
    InvalidSessionId,
    /// The request carried no payload.
    #[error("Payload expected.")]
    PayloadExpected,
    /// The payload was not a JSON array of strings.
    #[error("Broken JSON encoding.")]
    BrokenJson,
    /// JSONP transports need their `c` callback parameter.
    #[error("\"callback\" parameter required")]
    MissingCallback,
    /// The callback parameter did not match `^[a-zA-Z0-9-_.]+$`.
    #[error("invalid \"callback\" parameter")]
    InvalidCallback,
    /// Another transport already holds the slot this one wants.
    #[error("another connection still open")]
    Conflict,
    /// The request came from a different IP than the one that created
    /// the session.
    #[error("IP session mismatch")]
    IpMismatch,
    /// The session is already closed; carries the close reason to relay.
    #[error("session is gone")]
    Gone(CloseReason),
    /// An application callback failed while handling the payload.
    #[error("dispatch failed")]
    Dispatch,
    /// The endpoint no longer accepts sessions.
    #[error("endpoint is stopped")]
    Stopped,
}

impl TransportError {
    /// The close frame this error shows to the client, if it is one of
    /// the frame-carrying kinds.
    pub(crate) fn close_reason(&self) -> Option<CloseReason> {
        match self {
            Self::Conflict => Some(CloseReason::conflict()),
            Self::IpMismatch => Some(CloseReason::ip_mismatch()),
            Self::Gone(reason) => Some(reason.clone()),
            _ => None,
        }
    }
}

impl From<PayloadError> for TransportError {
    fn from(err: PayloadError) -> Self {
        match err {
            PayloadError::Expected => Self::PayloadExpected,
            PayloadError::Broken => Self::BrokenJson,
        }
    }
}

impl From<SessionError> for TransportError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::AlreadyOpened | SessionError::DuplicateSession(_) => Self::Conflict,
            SessionError::Closed => Self::Gone(CloseReason::go_away()),
            SessionError::PoolStopping => Self::Stopped,
            SessionError::Unbound | SessionError::NotNew => Self::Dispatch,
        }
    }
}

impl IntoResponse for TransportError {
    fn into_response(self) -> Response {
        match self {
            Self::SessionNotFound | Self::InvalidSessionId | Self::Stopped => {
                StatusCode::NOT_FOUND.into_response()
            }
            Self::PayloadExpected
            | Self::BrokenJson
            | Self::MissingCallback
            | Self::InvalidCallback => {
                (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
            }
            Self::Dispatch => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            // frame-carrying errors are rendered by the transport that
            // owns the framing; reaching this path means none did
            Self::Conflict | Self::IpMismatch | Self::Gone(_) => {
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}
