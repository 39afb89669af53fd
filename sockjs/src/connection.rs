//! The application-facing side of a session.
//!
//! Applications implement [`Connection`] for their per-session state and
//! [`ConnectionFactory`] to mint one connection per session. The library
//! hands every connection a [`Conn`] handle for sending, closing and
//! broadcasting.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use http::HeaderMap;

use crate::session::Session;

/// Immutable snapshot of the request that created a session, handed once
/// to [`Connection::on_open`].
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Remote address of the caller.
    pub ip: String,
    /// Cookies sent by the browser.
    pub cookies: HashMap<String, String>,
    /// Query string arguments.
    pub arguments: HashMap<String, String>,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request URI path.
    pub path: String,
}

impl ConnectionInfo {
    /// Look up a single query argument by name.
    pub fn argument(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).map(String::as_str)
    }

    /// Look up a single cookie by name.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Look up a single header by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Per-session application callbacks.
///
/// For every session the observable callback sequence is
/// `on_open? on_message* on_close?`, with `on_close` firing exactly once
/// if `on_open` fired.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Called when the session has completed its opening handshake.
    ///
    /// Returning an error rejects the connection: the session is closed
    /// before any message is dispatched.
    async fn on_open(&self, _info: &ConnectionInfo) -> eyre::Result<()> {
        Ok(())
    }

    /// Called for each message received from the client, in arrival
    /// order. Returning an error terminates the session.
    async fn on_message(&self, message: String) -> eyre::Result<()>;

    /// Called when the session has closed. No messages can be sent to the
    /// client at this point.
    async fn on_close(&self) {}
}

/// Mints one [`Connection`] per session and observes the endpoint
/// lifecycle.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Create the application connection for a freshly created session.
    fn connect(&self, conn: Conn) -> Arc<dyn Connection>;

    /// Called when the endpoint has started accepting sessions.
    fn on_started(&self) {}

    /// Called when the endpoint has been told to stop but has not torn
    /// down any state yet; connected sessions can still be warned.
    fn on_stopping(&self) {}

    /// Called when the endpoint has stopped and all state is gone.
    fn on_stopped(&self) {}
}

/// Shared handle to an application connection factory.
pub type ConnectionService = Arc<dyn ConnectionFactory>;

/// Handle through which an application talks back to its session.
///
/// Cheap to clone. The session keeps its connection alive while open and
/// drops it on close, which breaks the `Session ↔ Connection` cycle; a
/// `Conn` retained past that point turns into a no-op.
#[derive(Clone)]
pub struct Conn {
    pub(crate) session: Arc<Session>,
}

impl Conn {
    /// Identifier of the underlying session.
    pub fn session_id(&self) -> &str {
        self.session.session_id()
    }

    /// Send a message to the client.
    ///
    /// The message is delivered through the attached transport, or
    /// buffered until one attaches. Sending on a closed session is a
    /// no-op.
    pub fn send(&self, message: &str) {
        if self.is_closed() {
            return;
        }
        self.session.send(message);
    }

    /// Send an already-JSON-encoded payload to the client.
    pub fn send_raw(&self, payload: String) {
        if self.is_closed() {
            return;
        }
        self.session.send_encoded(payload);
    }

    /// Close this connection with the standard `3000 "Go away!"` reason.
    pub async fn close(&self) {
        self.session.close().await;
    }

    /// Whether the session is closing or closed.
    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// Send a message to every active session of the endpoint, except the
    /// session ids listed in `exclude`.
    pub fn broadcast(&self, message: &str, exclude: Option<&HashSet<String>>) {
        if let Some(endpoint) = self.session.endpoint() {
            endpoint.broadcast(message, exclude);
        }
    }
}
