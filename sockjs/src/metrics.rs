//! Metrics definitions for the SockJS server.
//!
//! All keys used by the library, plus [`describe_metrics`] to attach
//! metadata through the `metrics` facade. Hosting applications install
//! whatever recorder/exporter they like.

/// Gauge: sessions currently active (open frame delivered, not closed).
pub const METRICS_SESSIONS_ACTIVE: &str = "sockjs.sessions.active";
/// Counter: sessions created, pooled or not.
pub const METRICS_SESSIONS_CREATED: &str = "sockjs.sessions.created";
/// Counter: sessions reaped by the pool garbage collector.
pub const METRICS_SESSIONS_EXPIRED: &str = "sockjs.sessions.expired";
/// Counter: messages dispatched to application connections.
pub const METRICS_MESSAGES_RECEIVED: &str = "sockjs.messages.received";
/// Counter: messages submitted by application connections.
pub const METRICS_MESSAGES_SENT: &str = "sockjs.messages.sent";

/// Describe all metrics used by the library.
pub fn describe_metrics() {
    metrics::describe_gauge!(
        METRICS_SESSIONS_ACTIVE,
        metrics::Unit::Count,
        "Number of currently active sessions"
    );

    metrics::describe_counter!(
        METRICS_SESSIONS_CREATED,
        metrics::Unit::Count,
        "Number of sessions created"
    );

    metrics::describe_counter!(
        METRICS_SESSIONS_EXPIRED,
        metrics::Unit::Count,
        "Number of sessions reaped by the garbage collector"
    );

    metrics::describe_counter!(
        METRICS_MESSAGES_RECEIVED,
        metrics::Unit::Count,
        "Number of messages received from clients"
    );

    metrics::describe_counter!(
        METRICS_MESSAGES_SENT,
        metrics::Unit::Count,
        "Number of messages sent by the application"
    );
}
