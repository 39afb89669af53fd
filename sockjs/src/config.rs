//! Endpoint configuration.
//!
//! Every setting can be supplied on the command line or through a
//! `SOCKJS_*` environment variable; hosting applications with their own
//! CLI can embed [`SockJsConfig`] with `#[clap(flatten)]`.

use std::time::Duration;

use clap::Parser;

/// Default location of the SockJS client, interpolated into the iframe
/// bootstrap page.
pub const DEFAULT_SOCKJS_URL: &str = "https://cdn.jsdelivr.net/sockjs/0.3.4/sockjs.min.js";

/// Settings governing one SockJS endpoint.
#[derive(Parser, Debug, Clone)]
pub struct SockJsConfig {
    /// How often the session pool garbage collector runs.
    ///
    /// Larger values require more RAM on busy servers.
    #[clap(
        long,
        env = "SOCKJS_SESSION_CHECK_INTERVAL",
        default_value = "1s",
        value_parser = humantime::parse_duration
    )]
    pub session_check_interval: Duration,

    /// Heartbeat period, and the ping interval of WebSocket transports.
    ///
    /// Do not change this value unless you are absolutely sure the new
    /// value works with the deployed clients.
    #[clap(
        long,
        env = "SOCKJS_HEARTBEAT_DELAY",
        default_value = "25s",
        value_parser = humantime::parse_duration
    )]
    pub heartbeat_delay: Duration,

    /// How long after a heartbeat a session may stay silent before it is
    /// considered dead. Added to the heartbeat delay to form the session
    /// TTL.
    #[clap(
        long,
        env = "SOCKJS_HEARTBEAT_TIMEOUT",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub heartbeat_timeout: Duration,

    /// Grace window after a transport detaches during which a polling
    /// client may reconnect and resume the session.
    #[clap(
        long,
        env = "SOCKJS_DISCONNECT_DELAY",
        default_value = "5s",
        value_parser = humantime::parse_duration
    )]
    pub disconnect_delay: Duration,

    /// Transport names to remove from the route table.
    #[clap(long, env = "SOCKJS_DISABLED_TRANSPORTS", value_delimiter = ',')]
    pub disabled_transports: Vec<String>,

    /// SockJS client location, used by the iframe transports.
    #[clap(long, env = "SOCKJS_URL", default_value = DEFAULT_SOCKJS_URL)]
    pub sockjs_url: String,

    /// Byte budget of streaming transport responses. Once a response has
    /// carried this many bytes it is finished and the client reconnects.
    #[clap(long, env = "SOCKJS_RESPONSE_LIMIT", default_value = "131072")]
    pub response_limit: usize,

    /// Whether to echo the JSESSIONID cookie for load-balancer affinity.
    /// Also reflected in the `cookie_needed` field of `/info`.
    #[clap(
        long,
        env = "SOCKJS_COOKIE_AFFINITY",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub cookie_affinity: bool,

    /// Flush on every `send` instead of queueing until the next scheduled
    /// flush. Disabling reduces syscalls under high fanout.
    #[clap(
        long,
        env = "SOCKJS_IMMEDIATE_FLUSH",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub immediate_flush: bool,

    /// Set TCP_NODELAY on accepted connections.
    #[clap(
        long,
        env = "SOCKJS_DISABLE_NAGLE",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub disable_nagle: bool,

    /// Pin each session to the IP address that created it; polling
    /// requests from other addresses are rejected.
    #[clap(
        long,
        env = "SOCKJS_VERIFY_IP",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub verify_ip: bool,

    /// Allowed origins for WebSocket connections: `*` accepts everything,
    /// otherwise a comma-separated list of `host:port` origins
    /// (same-origin connections are always accepted).
    #[clap(long, env = "SOCKJS_WEBSOCKET_ALLOW_ORIGIN", default_value = "*")]
    pub websocket_allow_origin: String,
}

impl Default for SockJsConfig {
    fn default() -> Self {
        Self::parse_from(["sockjs"])
    }
}

impl SockJsConfig {
    /// TTL applied to a session whenever it is touched by I/O.
    pub(crate) fn session_ttl(&self) -> Duration {
        self.heartbeat_delay + self.heartbeat_timeout
    }

    pub(crate) fn transport_enabled(&self, name: &str) -> bool {
        !self.disabled_transports.iter().any(|t| t == name)
    }

    /// Whether the `/info` document should advertise WebSocket support.
    pub fn websocket_enabled(&self) -> bool {
        self.transport_enabled("websocket")
    }
}
