//! Session state machine, transport binding and outbound buffering.
//!
//! A [`Session`] is one logical SockJS connection. For polling transports
//! it outlives many HTTP requests; at most one send-capable and one
//! receive-capable transport hold it at any time. Messages sent while no
//! send transport is attached are buffered and coalesced into a single
//! array frame on the next flush.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::EndpointInner;
use crate::config::SockJsConfig;
use crate::connection::{Connection, ConnectionInfo};
use crate::metrics::{METRICS_MESSAGES_RECEIVED, METRICS_MESSAGES_SENT};
use crate::proto::{self, CloseReason};

pub(crate) mod pool;

/// Milliseconds since the Unix epoch; the time base for session expiry
/// and the pool GC cycle stamps.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as u64
}

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one transport binding, used to verify detaches.
pub(crate) fn next_transport_id() -> u64 {
    NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created but the opening handshake has not completed.
    New,
    /// Open, messages flow.
    Open,
    /// Closing; the close frame still has to reach the client.
    Closing,
    /// Closed. Terminal.
    Closed,
}

/// Errors raised by session operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The session was opened twice, or a second transport tried to claim
    /// an occupied slot.
    #[error("session has already been opened")]
    AlreadyOpened,
    /// A transport tried to attach to a session in its terminal state.
    #[error("session is closed")]
    Closed,
    /// A session operation ran before `bind` supplied the connection.
    #[error("session is not bound to a connection")]
    Unbound,
    /// The pool refused a session because it is shutting down.
    #[error("session pool is stopping")]
    PoolStopping,
    /// The pool already holds a session with this id.
    #[error("session {0:?} already registered")]
    DuplicateSession(String),
    /// Only sessions that have not begun their handshake can be pooled.
    #[error("session has already expired")]
    NotNew,
}

/// Declared capabilities of a transport binding.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TransportCaps {
    pub sendable: bool,
    pub recvable: bool,
}

impl TransportCaps {
    pub(crate) const SEND: Self = Self {
        sendable: true,
        recvable: false,
    };
    pub(crate) const RECV: Self = Self {
        sendable: false,
        recvable: true,
    };
    pub(crate) const BOTH: Self = Self {
        sendable: true,
        recvable: true,
    };
}

/// How frames are serialized onto a particular transport.
#[derive(Debug, Clone)]
pub(crate) enum FrameEncoding {
    /// WebSocket: the frame text verbatim.
    Raw,
    /// XHR polling and streaming: newline-terminated.
    Newline,
    /// EventSource: `data: <frame>\r\n\r\n`.
    EventSource,
    /// HtmlFile: a `<script>` block invoking the parent callback.
    HtmlFile,
    /// JSONP polling: `/**/<callback>(<json-frame>);\r\n`.
    Jsonp(String),
}

impl FrameEncoding {
    pub(crate) fn encode(&self, frame: &str) -> String {
        match self {
            Self::Raw => frame.to_owned(),
            Self::Newline => format!("{frame}\n"),
            Self::EventSource => format!("data: {frame}\r\n\r\n"),
            Self::HtmlFile => {
                let quoted = serde_json::to_string(frame).expect("strings always encode");
                format!("<script>\np({quoted});\n</script>\r\n")
            }
            Self::Jsonp(callback) => {
                let quoted = serde_json::to_string(frame).expect("strings always encode");
                format!("/**/{callback}({quoted});\r\n")
            }
        }
    }
}

enum SinkChannel {
    /// Polling transports carry exactly one frame per request; the slot
    /// is consumed by the first write.
    Single(Option<oneshot::Sender<String>>),
    /// Streaming and WebSocket transports; `budget` is the remaining
    /// response byte budget (`None` for unlimited).
    Stream {
        tx: mpsc::UnboundedSender<String>,
        budget: Option<i64>,
    },
}

/// The writable half of an attached send transport.
pub(crate) struct SendSink {
    transport_id: u64,
    encoding: FrameEncoding,
    channel: SinkChannel,
}

impl SendSink {
    pub(crate) fn single(
        transport_id: u64,
        encoding: FrameEncoding,
    ) -> (Self, oneshot::Receiver<String>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                transport_id,
                encoding,
                channel: SinkChannel::Single(Some(tx)),
            },
            rx,
        )
    }

    pub(crate) fn stream(
        transport_id: u64,
        encoding: FrameEncoding,
        budget: Option<i64>,
    ) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                transport_id,
                encoding,
                channel: SinkChannel::Stream { tx, budget },
            },
            rx,
        )
    }

    /// Write one frame, encoded for this transport. Returns `false` when
    /// the transport can take no more frames (consumed polling slot,
    /// exhausted byte budget, or a peer that went away); such frames are
    /// the caller's to buffer.
    fn try_write(&mut self, frame: &str) -> bool {
        let encoded = self.encoding.encode(frame);
        match &mut self.channel {
            SinkChannel::Single(slot) => match slot.take() {
                Some(tx) => tx.send(encoded).is_ok(),
                None => false,
            },
            SinkChannel::Stream { tx, budget } => {
                if budget.is_some_and(|b| b <= 0) {
                    return false;
                }
                let len = encoded.len() as i64;
                if tx.send(encoded).is_err() {
                    return false;
                }
                if let Some(b) = budget.as_mut() {
                    *b -= len;
                }
                true
            }
        }
    }
}

struct Inner {
    state: SessionState,
    close_reason: Option<CloseReason>,
    send_transport: Option<SendSink>,
    recv_transport: Option<u64>,
    buffer: Vec<String>,
    /// Expiry timestamp in epoch milliseconds; `0` means never.
    expires_at: u64,
    conn: Option<Arc<dyn Connection>>,
    conn_info: Option<Arc<ConnectionInfo>>,
    flush_scheduled: bool,
}

/// One logical SockJS connection.
pub struct Session {
    session_id: String,
    ttl: Duration,
    /// Raw-WebSocket shim: no framing, no open/close frames, no buffer.
    raw_frames: bool,
    immediate_flush: bool,
    disconnect_delay: Duration,
    endpoint: Weak<EndpointInner>,
    inner: Mutex<Inner>,
}

impl Session {
    pub(crate) fn new(
        session_id: impl Into<String>,
        config: &SockJsConfig,
        endpoint: Weak<EndpointInner>,
    ) -> Arc<Self> {
        let ttl = config.session_ttl();
        Arc::new(Self {
            session_id: session_id.into(),
            ttl,
            raw_frames: false,
            immediate_flush: config.immediate_flush,
            disconnect_delay: config.disconnect_delay,
            endpoint,
            inner: Mutex::new(Inner {
                state: SessionState::New,
                close_reason: None,
                send_transport: None,
                recv_transport: None,
                buffer: Vec::new(),
                expires_at: now_ms() + ttl.as_millis() as u64,
                conn: None,
                conn_info: None,
                flush_scheduled: false,
            }),
        })
    }

    /// A raw-WebSocket session: constant id, verbatim frames, never
    /// expires and is never pooled.
    pub(crate) fn raw(config: &SockJsConfig, endpoint: Weak<EndpointInner>) -> Arc<Self> {
        Arc::new(Self {
            session_id: "raw".to_owned(),
            ttl: Duration::ZERO,
            raw_frames: true,
            immediate_flush: true,
            disconnect_delay: config.disconnect_delay,
            endpoint,
            inner: Mutex::new(Inner {
                state: SessionState::New,
                close_reason: None,
                send_transport: None,
                recv_transport: None,
                buffer: Vec::new(),
                expires_at: 0,
                conn: None,
                conn_info: None,
                flush_scheduled: false,
            }),
        })
    }

    /// The client-chosen session identifier.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// The close code and reason, populated once the session enters
    /// `Closing` and preserved through `Closed`.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.lock().close_reason.clone()
    }

    /// Whether the session is closing or closed.
    pub fn is_closed(&self) -> bool {
        matches!(
            self.inner.lock().state,
            SessionState::Closing | SessionState::Closed
        )
    }

    pub(crate) fn endpoint(&self) -> Option<Arc<EndpointInner>> {
        self.endpoint.upgrade()
    }

    /// Whether this is the unframed raw-WebSocket shim.
    pub(crate) fn is_raw(&self) -> bool {
        self.raw_frames
    }

    /// Bind the application connection. Happens exactly once, right after
    /// creation.
    pub(crate) fn bind(&self, conn: Arc<dyn Connection>) {
        self.inner.lock().conn = Some(conn);
        self.touch();
    }

    pub(crate) fn set_conn_info(&self, info: ConnectionInfo) {
        self.inner.lock().conn_info = Some(Arc::new(info));
    }

    pub(crate) fn conn_info(&self) -> Option<Arc<ConnectionInfo>> {
        self.inner.lock().conn_info.clone()
    }

    /// Place a transport into the send and/or receive slot according to
    /// its capabilities. Assignment is transactional: a conflict on
    /// either slot leaves both untouched.
    pub(crate) fn attach_transport(
        &self,
        transport_id: u64,
        caps: TransportCaps,
        sink: Option<SendSink>,
    ) -> Result<(), SessionError> {
        debug_assert!(caps.sendable || caps.recvable);
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        if caps.sendable && inner.send_transport.is_some() {
            return Err(SessionError::AlreadyOpened);
        }
        if caps.recvable && inner.recv_transport.is_some() {
            return Err(SessionError::AlreadyOpened);
        }
        if caps.sendable {
            inner.send_transport = sink;
        }
        if caps.recvable {
            inner.recv_transport = Some(transport_id);
        }
        // a client holding a transport is not idle
        self.touch_locked(&mut inner);
        Ok(())
    }

    /// Clear the slots held by `transport_id` and start the disconnect
    /// grace window. Slots already cleared by `close`, or held by a
    /// different transport, are left alone.
    pub(crate) fn detach_transport(&self, transport_id: u64) {
        let mut inner = self.inner.lock();
        let mut matched = false;
        if inner
            .send_transport
            .as_ref()
            .is_some_and(|sink| sink.transport_id == transport_id)
        {
            inner.send_transport = None;
            matched = true;
        }
        if inner.recv_transport == Some(transport_id) {
            inner.recv_transport = None;
            matched = true;
        }
        if matched {
            let delay = self.disconnect_delay;
            Self::set_expiry_locked(&mut inner, delay);
        }
    }

    /// Advance `New → Open` and dispatch the open callback. Opening twice
    /// fails.
    pub(crate) async fn open(self: &Arc<Self>) -> Result<(), SessionError> {
        let (conn, info) = {
            let mut inner = self.inner.lock();
            if inner.state != SessionState::New {
                return Err(SessionError::AlreadyOpened);
            }
            inner.state = SessionState::Open;
            let conn = inner.conn.clone().ok_or(SessionError::Unbound)?;
            let info = inner.conn_info.clone().ok_or(SessionError::Unbound)?;
            self.touch_locked(&mut inner);
            (conn, info)
        };
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.session_opened(self);
        }
        if let Err(err) = conn.on_open(&info).await {
            tracing::debug!(session_id = %self.session_id, "connection rejected: {err:?}");
            self.close().await;
        }
        Ok(())
    }

    /// Close with the standard `3000 "Go away!"` reason. No-op on an
    /// already closing or closed session.
    pub async fn close(self: &Arc<Self>) {
        let reason = CloseReason::go_away();
        self.close_with(reason.code, &reason.message).await;
    }

    /// Close with an explicit code and reason.
    pub(crate) async fn close_with(self: &Arc<Self>, code: u16, message: &str) {
        let conn = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            inner.state = SessionState::Closing;
            inner.close_reason = Some(CloseReason::new(code, message));
            let conn = inner.conn.take();
            // deliver the close frame through an attached send transport;
            // without one it is delivered on the next attach
            if let Some(sink) = inner.send_transport.as_mut() {
                if !self.raw_frames {
                    sink.try_write(&proto::close_frame(code, message));
                }
                inner.state = SessionState::Closed;
                inner.send_transport = None;
                inner.recv_transport = None;
            }
            conn
        };
        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.session_closed(self);
        }
        if let Some(conn) = conn {
            conn.on_close().await;
        }
        tracing::debug!(session_id = %self.session_id, code, message, "session closed");
    }

    /// Advance `Closing → Closed` after the close frame has been
    /// delivered to the client.
    pub(crate) fn did_close(&self) {
        let mut inner = self.inner.lock();
        inner.state = SessionState::Closed;
        inner.send_transport = None;
        inner.recv_transport = None;
    }

    /// Dispatch decoded client messages to the application, in order.
    pub(crate) async fn dispatch(self: &Arc<Self>, messages: Vec<String>) -> eyre::Result<()> {
        self.touch();
        let conn = self
            .inner
            .lock()
            .conn
            .clone()
            .ok_or(SessionError::Unbound)?;
        ::metrics::counter!(METRICS_MESSAGES_RECEIVED).increment(messages.len() as u64);
        for message in messages {
            conn.on_message(message).await?;
        }
        Ok(())
    }

    /// Send one application message: JSON-encode, then deliver or buffer.
    pub(crate) fn send(self: &Arc<Self>, message: &str) {
        if self.raw_frames {
            // no framing at all: bytes go through verbatim
            let mut inner = self.inner.lock();
            self.write_locked(&mut inner, message);
            return;
        }
        self.send_encoded(proto::encode(message));
    }

    /// Send an already-JSON-encoded payload.
    pub(crate) fn send_encoded(self: &Arc<Self>, payload: String) {
        ::metrics::counter!(METRICS_MESSAGES_SENT).increment(1);
        if self.raw_frames {
            let mut inner = self.inner.lock();
            self.write_locked(&mut inner, &payload);
            return;
        }
        if self.immediate_flush {
            let mut inner = self.inner.lock();
            let frame = proto::message_frame(&payload);
            if !self.write_locked(&mut inner, &frame) {
                inner.buffer.push(payload);
            }
        } else {
            {
                let mut inner = self.inner.lock();
                inner.buffer.push(payload);
                if inner.flush_scheduled || inner.send_transport.is_none() {
                    return;
                }
                inner.flush_scheduled = true;
            }
            let session = Arc::clone(self);
            tokio::spawn(async move {
                session.inner.lock().flush_scheduled = false;
                session.flush();
            });
        }
    }

    /// Coalesce all buffered payloads into one array frame and write it.
    /// The buffer is kept when no write is possible.
    pub(crate) fn flush(&self) {
        let mut inner = self.inner.lock();
        if inner.send_transport.is_none() || inner.buffer.is_empty() {
            return;
        }
        let frame = proto::array_frame(&inner.buffer);
        if self.write_locked(&mut inner, &frame) {
            inner.buffer.clear();
        }
    }

    /// Write a heartbeat frame. Failure is silent: if the session has
    /// actually died the next GC pass reaps it.
    pub(crate) fn send_heartbeat(&self) {
        let mut inner = self.inner.lock();
        self.write_locked(&mut inner, proto::HEARTBEAT_FRAME);
    }

    /// Write a protocol frame through the attached send transport,
    /// bypassing the buffer (open and close frames).
    pub(crate) fn write_frame(&self, frame: &str) -> bool {
        let mut inner = self.inner.lock();
        self.write_locked(&mut inner, frame)
    }

    fn write_locked(&self, inner: &mut Inner, frame: &str) -> bool {
        let Some(sink) = inner.send_transport.as_mut() else {
            return false;
        };
        if !sink.try_write(frame) {
            return false;
        }
        self.touch_locked(inner);
        true
    }

    /// Bump the session TTL.
    pub(crate) fn touch(&self) {
        let mut inner = self.inner.lock();
        self.touch_locked(&mut inner);
    }

    fn touch_locked(&self, inner: &mut Inner) {
        inner.expires_at = if self.ttl.is_zero() {
            0
        } else {
            now_ms() + self.ttl.as_millis() as u64
        };
    }

    /// Reset the expiry to `delay` from now; a zero delay means never.
    pub(crate) fn set_expiry(&self, delay: Duration) {
        let mut inner = self.inner.lock();
        Self::set_expiry_locked(&mut inner, delay);
    }

    fn set_expiry_locked(inner: &mut Inner, delay: Duration) {
        inner.expires_at = if delay.is_zero() {
            0
        } else {
            now_ms() + delay.as_millis() as u64
        };
    }

    /// Whether the session is eligible for garbage collection. Closing
    /// and closed sessions are always expired; the flag is monotone.
    pub(crate) fn has_expired(&self, now: u64) -> bool {
        let inner = self.inner.lock();
        if matches!(inner.state, SessionState::Closing | SessionState::Closed) {
            return true;
        }
        inner.expires_at != 0 && inner.expires_at <= now
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("state", &inner.state)
            .field("sendable", &inner.send_transport.is_some())
            .field("recvable", &inner.recv_transport.is_some())
            .field("buffered", &inner.buffer.len())
            .finish()
    }
}
