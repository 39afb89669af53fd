//! SockJS wire protocol: frames and payload decoding.
//!
//! A frame is one protocol unit, identified by its first byte:
//!
//! - `o` – open
//! - `h` – heartbeat
//! - `a[…]` – array of JSON-encoded messages
//! - `m…` – single JSON-encoded message (the canonical form used by this
//!   server is the one-element `a` frame)
//! - `c[code,"reason"]` – close
//!
//! Outbound message payloads are JSON-encoded exactly once; coalescing a
//! buffer into an `a` frame joins the already-encoded strings so that the
//! original escape choices survive.

use serde_json::Value;

/// The open frame, sent once per session before any messages.
pub const OPEN_FRAME: &str = "o";

/// The heartbeat frame, sent periodically to keep intermediaries from
/// closing idle connections.
pub const HEARTBEAT_FRAME: &str = "h";

/// Close codes used by this server.
pub mod close_code {
    /// The underlying connection went away without a closing handshake.
    pub const INTERRUPTED: u16 = 1002;
    /// Transport binding conflict or IP pinning violation.
    pub const CONFLICT: u16 = 2010;
    /// Server-initiated close (shutdown, expiry, application `close()`).
    pub const GO_AWAY: u16 = 3000;
}

/// A close code together with its human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Numeric close code, see [`close_code`].
    pub code: u16,
    /// Reason text. Must not contain double quotes, see [`close_frame`].
    pub message: String,
}

impl CloseReason {
    pub(crate) fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub(crate) fn go_away() -> Self {
        Self::new(close_code::GO_AWAY, "Go away!")
    }

    pub(crate) fn conflict() -> Self {
        Self::new(close_code::CONFLICT, "Another connection still open")
    }

    pub(crate) fn ip_mismatch() -> Self {
        Self::new(close_code::CONFLICT, "IP session mismatch")
    }

    pub(crate) fn interrupted() -> Self {
        Self::new(close_code::INTERRUPTED, "Connection interrupted")
    }

    /// The `c[code,"reason"]` frame announcing this close.
    pub fn frame(&self) -> String {
        close_frame(self.code, &self.message)
    }
}

/// JSON-encode a single application message.
pub fn encode(message: &str) -> String {
    serde_json::to_string(message).expect("strings always encode")
}

/// Frame one already-encoded payload as a one-element array frame.
pub fn message_frame(payload: &str) -> String {
    format!("a[{payload}]")
}

/// Coalesce already-encoded payloads into a single array frame.
pub fn array_frame(payloads: &[String]) -> String {
    format!("a[{}]", payloads.join(","))
}

/// Build a `c[code,"reason"]` close frame.
///
/// The reason is interpolated verbatim; callers must not pass reasons
/// containing double quotes.
pub fn close_frame(code: u16, reason: &str) -> String {
    format!("c[{code},\"{reason}\"]")
}

/// Errors produced while decoding an inbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    /// The request carried no payload at all.
    #[error("Payload expected.")]
    Expected,
    /// The payload was not a JSON array of strings.
    #[error("Broken JSON encoding.")]
    Broken,
}

/// Decode an inbound payload into its list of messages.
///
/// A payload is a JSON array of strings; anything else is rejected.
pub fn decode_payload(data: &[u8]) -> Result<Vec<String>, PayloadError> {
    if data.is_empty() {
        return Err(PayloadError::Expected);
    }
    serde_json::from_slice::<Vec<String>>(data).map_err(|_| PayloadError::Broken)
}

/// Decode one text frame received over the bidirectional WebSocket
/// transport.
///
/// A single scalar string is coerced to a one-element list before
/// dispatch.
pub fn decode_websocket_text(text: &str) -> Result<Vec<String>, PayloadError> {
    match serde_json::from_str::<Value>(text).map_err(|_| PayloadError::Broken)? {
        Value::String(message) => Ok(vec![message]),
        Value::Array(values) => values
            .into_iter()
            .map(|value| match value {
                Value::String(message) => Ok(message),
                _ => Err(PayloadError::Broken),
            })
            .collect(),
        _ => Err(PayloadError::Broken),
    }
}
