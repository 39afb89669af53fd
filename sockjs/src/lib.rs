#![deny(missing_docs)]
//! A [SockJS](https://github.com/sockjs/sockjs-protocol) server library
//! for `axum`.
//!
//! SockJS emulates a bidirectional, low-latency browser connection over
//! a family of HTTP fallbacks when a real WebSocket is not available.
//! This crate implements the server side: seven transports (WebSocket,
//! raw WebSocket, XHR polling, XHR streaming, EventSource, HtmlFile and
//! JSONP polling, with separate XHR/JSONP send channels) multiplexed
//! onto one session machinery, plus the static bootstrap pages the
//! protocol requires (`/`, `/info`, `/iframe*.html`, `/chunking_test`).
//!
//! The main entry point is [`Endpoint`]: it owns the session pool and
//! settings for one mounted SockJS application and hands out an
//! [`axum::Router`] via [`Endpoint::routes`] that the hosting
//! application nests under a prefix of its choosing. Applications
//! implement [`Connection`] for their per-session logic and a
//! [`ConnectionFactory`] to mint connections; each connection talks back
//! through its [`Conn`] handle.
//!
//! ```no_run
//! use std::sync::Arc;
//! use sockjs::{Conn, Connection, ConnectionFactory, Endpoint, SockJsConfig, SockJsServer};
//!
//! struct Echo(Conn);
//!
//! #[async_trait::async_trait]
//! impl Connection for Echo {
//!     async fn on_message(&self, message: String) -> eyre::Result<()> {
//!         self.0.send(&message);
//!         Ok(())
//!     }
//! }
//!
//! struct EchoFactory;
//!
//! impl ConnectionFactory for EchoFactory {
//!     fn connect(&self, conn: Conn) -> Arc<dyn Connection> {
//!         Arc::new(Echo(conn))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> eyre::Result<()> {
//!     let endpoint = Endpoint::new(SockJsConfig::default(), Arc::new(EchoFactory));
//!     let mut server = SockJsServer::new();
//!     server.add_endpoint(endpoint, "/echo")?;
//!     server.listen(([127, 0, 0, 1], 8080).into()).await
//! }
//! ```
//!
//! For polling transports a session outlives many HTTP requests; the
//! pool's garbage collector reaps sessions whose clients stopped coming
//! back, and its heartbeat ticker keeps long-lived responses warm. Both
//! tickers run as background tasks owned by the endpoint and stop when
//! the endpoint is stopped or dropped.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::routing::{get, post};
use eyre::WrapErr as _;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub(crate) mod api;
pub mod config;
mod connection;
pub mod metrics;
pub mod proto;
mod session;

pub use config::SockJsConfig;
pub use connection::{Conn, Connection, ConnectionFactory, ConnectionInfo, ConnectionService};
pub use proto::CloseReason;
pub use session::{Session, SessionError, SessionState};

use crate::metrics::{METRICS_SESSIONS_ACTIVE, METRICS_SESSIONS_CREATED};
use crate::session::pool::SessionPool;

/// Shared state behind one endpoint: settings, the session pool, the
/// active-session map used for broadcasts and the application service.
pub(crate) struct EndpointInner {
    config: SockJsConfig,
    service: ConnectionService,
    pool: SessionPool,
    active_sessions: Mutex<HashMap<String, Arc<Session>>>,
    cancel: Mutex<CancellationToken>,
    started: AtomicBool,
}

impl EndpointInner {
    pub(crate) fn config(&self) -> &SockJsConfig {
        &self.config
    }

    pub(crate) fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.pool.get(session_id)
    }

    /// Create a pooled session and bind its application connection.
    pub(crate) fn create_session(
        self: &Arc<Self>,
        session_id: &str,
        conn_info: ConnectionInfo,
    ) -> Result<Arc<Session>, SessionError> {
        let session = Session::new(session_id, &self.config, Arc::downgrade(self));
        session.set_conn_info(conn_info);
        let conn = self.service.connect(Conn {
            session: Arc::clone(&session),
        });
        session.bind(conn);
        self.pool.add(&session)?;
        ::metrics::counter!(METRICS_SESSIONS_CREATED).increment(1);
        Ok(session)
    }

    /// Create a WebSocket session. Never pooled: the TCP lifecycle is
    /// authoritative, so there is nothing for the GC to do.
    pub(crate) fn create_ws_session(
        self: &Arc<Self>,
        session_id: &str,
        conn_info: ConnectionInfo,
    ) -> Arc<Session> {
        let session = Session::new(session_id, &self.config, Arc::downgrade(self));
        session.set_conn_info(conn_info);
        let conn = self.service.connect(Conn {
            session: Arc::clone(&session),
        });
        session.bind(conn);
        ::metrics::counter!(METRICS_SESSIONS_CREATED).increment(1);
        session
    }

    /// Create a raw-WebSocket session: constant `"raw"` id, no framing.
    pub(crate) fn create_raw_session(self: &Arc<Self>, conn_info: ConnectionInfo) -> Arc<Session> {
        let session = Session::raw(&self.config, Arc::downgrade(self));
        session.set_conn_info(conn_info);
        let conn = self.service.connect(Conn {
            session: Arc::clone(&session),
        });
        session.bind(conn);
        ::metrics::counter!(METRICS_SESSIONS_CREATED).increment(1);
        session
    }

    /// A session completed its opening handshake.
    pub(crate) fn session_opened(&self, session: &Arc<Session>) {
        self.active_sessions
            .lock()
            .insert(session.session_id().to_owned(), Arc::clone(session));
        ::metrics::gauge!(METRICS_SESSIONS_ACTIVE).increment(1);
    }

    /// A session closed; it no longer takes part in broadcasts.
    pub(crate) fn session_closed(&self, session: &Arc<Session>) {
        if self
            .active_sessions
            .lock()
            .remove(session.session_id())
            .is_some()
        {
            ::metrics::gauge!(METRICS_SESSIONS_ACTIVE).decrement(1);
        }
    }

    /// Send `message` to every active session except the excluded ids.
    pub(crate) fn broadcast(&self, message: &str, exclude: Option<&HashSet<String>>) {
        let payload = proto::encode(message);
        let sessions: Vec<Arc<Session>> = self.active_sessions.lock().values().cloned().collect();
        for session in sessions {
            if exclude.is_some_and(|exclude| exclude.contains(session.session_id())) {
                continue;
            }
            if session.is_raw() {
                session.send(message);
            } else {
                session.send_encoded(payload.clone());
            }
        }
    }
}

impl Drop for EndpointInner {
    fn drop(&mut self) {
        self.cancel.lock().cancel();
    }
}

/// One mounted SockJS application: a settings map, a session pool with
/// its GC and heartbeat tickers, and the application connection factory.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    /// Create an endpoint and start its pool timers.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(config: SockJsConfig, service: ConnectionService) -> Self {
        let pool = SessionPool::new(config.session_check_interval, config.heartbeat_delay);
        let endpoint = Self {
            inner: Arc::new(EndpointInner {
                config,
                service,
                pool,
                active_sessions: Mutex::new(HashMap::new()),
                cancel: Mutex::new(CancellationToken::new()),
                started: AtomicBool::new(false),
            }),
        };
        endpoint.start();
        endpoint
    }

    /// The settings governing this endpoint.
    pub fn config(&self) -> &SockJsConfig {
        self.inner.config()
    }

    /// Start session management. Idempotent.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let cancel = CancellationToken::new();
        *self.inner.cancel.lock() = cancel.clone();
        self.inner.pool.start(&cancel);
        self.inner.service.on_started();
    }

    /// Stop session management: drain every pooled session with
    /// `3000 "Go away!"` and stop the timers. Idempotent.
    pub async fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.service.on_stopping();
        self.inner.cancel.lock().cancel();
        self.inner.pool.stop().await;
        self.inner.active_sessions.lock().clear();
        self.inner.service.on_stopped();
    }

    /// Look up a session by id.
    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.inner.get_session(session_id)
    }

    /// Send `message` to every active session except the excluded ids.
    pub fn broadcast(&self, message: &str, exclude: Option<&HashSet<String>>) {
        self.inner.broadcast(message, exclude);
    }

    /// The route table of this endpoint, rooted at `/`. Nest it under
    /// the prefix of your choosing.
    ///
    /// Transports listed in `disabled_transports` are left out; the send
    /// channels are always routed.
    pub fn routes(&self) -> Router {
        let config = self.inner.config();
        let mut router = Router::new()
            .route("/", get(api::static_pages::greeting))
            .route(
                "/info",
                get(api::static_pages::info).options(api::static_pages::info_options),
            )
            .route(
                "/chunking_test",
                post(api::static_pages::chunking_test)
                    .options(api::static_pages::chunking_test_options),
            )
            .route("/websocket", get(api::websocket::raw_websocket))
            .route("/{file}", get(api::static_pages::iframe))
            .route(
                "/{server}/{session}/xhr_send",
                post(api::xhr::xhr_send).options(api::common::preflight_post),
            )
            .route(
                "/{server}/{session}/jsonp_send",
                post(api::jsonp::jsonp_send).options(api::common::preflight_post),
            );
        if config.transport_enabled("xhr") {
            router = router.route(
                "/{server}/{session}/xhr",
                post(api::xhr::xhr_poll).options(api::common::preflight_post),
            );
        }
        if config.transport_enabled("xhr_streaming") {
            router = router.route(
                "/{server}/{session}/xhr_streaming",
                post(api::xhr::xhr_streaming).options(api::common::preflight_post),
            );
        }
        if config.transport_enabled("eventsource") {
            router = router.route(
                "/{server}/{session}/eventsource",
                get(api::eventsource::eventsource),
            );
        }
        if config.transport_enabled("htmlfile") {
            router = router.route(
                "/{server}/{session}/htmlfile",
                get(api::htmlfile::htmlfile),
            );
        }
        if config.transport_enabled("jsonp") {
            router = router.route("/{server}/{session}/jsonp", get(api::jsonp::jsonp_poll));
        }
        if config.transport_enabled("websocket") {
            router = router.route(
                "/{server}/{session}/websocket",
                get(api::websocket::sockjs_websocket),
            );
        }
        router.with_state(Arc::clone(&self.inner))
    }
}

/// Owns a router and a set of endpoints mounted at URL prefixes.
///
/// Convenience wrapper for applications that have no HTTP surface of
/// their own; embedders with an existing `axum` application can skip it
/// and nest [`Endpoint::routes`] directly.
pub struct SockJsServer {
    router: Router,
    endpoints: HashMap<String, Endpoint>,
    started: bool,
}

impl Default for SockJsServer {
    fn default() -> Self {
        Self::new()
    }
}

impl SockJsServer {
    /// An empty server with no endpoints.
    pub fn new() -> Self {
        Self {
            router: Router::new(),
            endpoints: HashMap::new(),
            started: false,
        }
    }

    /// Mount `endpoint` at `prefix`. Duplicate prefixes fail fast.
    pub fn add_endpoint(&mut self, endpoint: Endpoint, prefix: &str) -> eyre::Result<()> {
        let prefix = format!("/{}", prefix.trim_matches('/'));
        if self.endpoints.contains_key(&prefix) {
            eyre::bail!("endpoint {prefix:?} already defined");
        }
        if self.started {
            endpoint.start();
        }
        self.router = std::mem::take(&mut self.router).nest(&prefix, endpoint.routes());
        self.endpoints.insert(prefix, endpoint);
        Ok(())
    }

    /// Stop and unmount the endpoint at `prefix`.
    ///
    /// The route table of a built router cannot shrink, so the routes
    /// stay in place but refuse new sessions once the endpoint stopped.
    pub async fn remove_endpoint(&mut self, prefix: &str) -> eyre::Result<()> {
        let prefix = format!("/{}", prefix.trim_matches('/'));
        let endpoint = self
            .endpoints
            .remove(&prefix)
            .ok_or_else(|| eyre::eyre!("endpoint {prefix:?} not found"))?;
        endpoint.stop().await;
        Ok(())
    }

    /// Start every mounted endpoint. Idempotent.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        for endpoint in self.endpoints.values() {
            endpoint.start();
        }
    }

    /// Stop every mounted endpoint, draining their sessions.
    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        for endpoint in self.endpoints.values() {
            endpoint.stop().await;
        }
    }

    /// The assembled router, for embedding or for test harnesses.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Bind `addr` and serve until the process is stopped.
    ///
    /// Honors `disable_nagle` by setting TCP_NODELAY on accepted
    /// connections when any mounted endpoint asks for it.
    pub async fn listen(mut self, addr: SocketAddr) -> eyre::Result<()> {
        self.start();
        let nodelay = self
            .endpoints
            .values()
            .any(|endpoint| endpoint.config().disable_nagle);
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .wrap_err("while binding listener")?;
        tracing::info!(
            "listening on {}",
            listener.local_addr().wrap_err("while reading local addr")?
        );
        let router = self.router.clone().layer(TraceLayer::new_for_http());
        use axum::serve::ListenerExt;
        axum::serve(
            listener.tap_io(move |stream| {
                if nodelay
                    && let Err(err) = stream.set_nodelay(true)
                {
                    tracing::trace!("failed to set TCP_NODELAY: {err}");
                }
            }),
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .wrap_err("while serving")
    }
}
