//! Plumbing shared by every transport handler: response preambles
//! (CORS, caching, JSESSIONID, keep-alive), remote address extraction,
//! payload decoding, JSONP callback validation and the session
//! bind/detach protocol.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, SystemTime};

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, StatusCode, Version, header};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use percent_encoding::percent_decode_str;
use regex::Regex;
use tokio::sync::{mpsc, oneshot};

use crate::EndpointInner;
use crate::api::errors::TransportError;
use crate::connection::ConnectionInfo;
use crate::proto::{self, CloseReason};
use crate::session::{
    FrameEncoding, SendSink, Session, SessionState, TransportCaps, next_transport_id,
};

/// Client-side cache lifetime for cacheable responses, one year.
pub(crate) const CACHE_TIME: Duration = Duration::from_secs(31_536_000);

pub(crate) const SESSION_COOKIE: &str = "JSESSIONID";

static CALLBACK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9\-_.]+$").expect("valid regex"));

/// Remote address of the caller: the first `X-Forwarded-For` hop when
/// present, otherwise the peer address recorded at accept time.
pub(crate) struct RemoteIp(pub String);

impl<S> FromRequestParts<S> for RemoteIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_owned());
        if let Some(ip) = forwarded {
            return Ok(Self(ip));
        }
        let ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "0.0.0.0".to_owned());
        Ok(Self(ip))
    }
}

/// Cache policy of a response.
#[derive(Clone, Copy)]
pub(crate) enum Cache {
    Forever,
    Never,
}

/// What the response preamble should carry, mirroring the per-transport
/// flags of the HTTP surface.
pub(crate) struct Preamble {
    pub cors: bool,
    pub cookie: bool,
    pub cache: Cache,
    pub content_type: Option<&'static str>,
}

/// Assemble the response headers every transport response starts with.
pub(crate) fn response_preamble(
    endpoint: &EndpointInner,
    request_headers: &HeaderMap,
    jar: &CookieJar,
    version: Version,
    preamble: Preamble,
) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(content_type) = preamble.content_type {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_str(&format!("{content_type}; charset=UTF-8"))
                .expect("static content type"),
        );
    }
    if preamble.cors {
        let origin = request_headers
            .get(header::ORIGIN)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("*"));
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
        if let Some(requested) = request_headers.get(header::ACCESS_CONTROL_REQUEST_HEADERS) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
        }
    }
    if preamble.cookie && endpoint.config().cookie_affinity {
        let value = jar
            .get(SESSION_COOKIE)
            .map(|cookie| cookie.value().to_owned())
            .unwrap_or_else(|| "dummy".to_owned());
        if let Ok(value) = HeaderValue::from_str(&format!("{SESSION_COOKIE}={value}; Path=/")) {
            headers.insert(header::SET_COOKIE, value);
        }
    }
    match preamble.cache {
        Cache::Forever => insert_cache_forever(&mut headers),
        Cache::Never => {
            headers.insert(
                header::CACHE_CONTROL,
                HeaderValue::from_static(
                    "no-store, no-cache, no-transform, must-revalidate, max-age=0",
                ),
            );
        }
    }
    if version < Version::HTTP_11 {
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    }
    headers
}

fn insert_cache_forever(headers: &mut HeaderMap) {
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_str(&format!("max-age={}, public", CACHE_TIME.as_secs()))
            .expect("static cache header"),
    );
    let expires = httpdate::fmt_http_date(SystemTime::now() + CACHE_TIME);
    if let Ok(expires) = HeaderValue::from_str(&expires) {
        headers.insert(header::EXPIRES, expires);
    }
    headers.insert(
        header::ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_str(&CACHE_TIME.as_secs().to_string()).expect("static cache header"),
    );
}

/// Answer an `OPTIONS` preflight: 204, CORS echo, cached for a year.
pub(crate) fn preflight(
    endpoint: &EndpointInner,
    request_headers: &HeaderMap,
    jar: &CookieJar,
    version: Version,
    allowed_methods: &'static str,
) -> Response {
    let mut headers = response_preamble(
        endpoint,
        request_headers,
        jar,
        version,
        Preamble {
            cors: true,
            cookie: true,
            cache: Cache::Forever,
            content_type: None,
        },
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(allowed_methods),
    );
    headers.insert(header::ALLOW, HeaderValue::from_static(allowed_methods));
    (StatusCode::NO_CONTENT, headers).into_response()
}

/// `OPTIONS` handler for the POST transport routes.
pub(crate) async fn preflight_post(
    axum::extract::State(endpoint): axum::extract::State<Arc<EndpointInner>>,
    headers: HeaderMap,
    jar: CookieJar,
    version: Version,
) -> Response {
    preflight(&endpoint, &headers, &jar, version, "OPTIONS, POST")
}

/// Server and session id segments may be anything that is non-empty and
/// dot-free.
pub(crate) fn valid_session_segment(segment: &str) -> bool {
    !segment.is_empty() && !segment.contains('.')
}

/// Validate the JSONP `c` callback parameter.
pub(crate) fn verify_callback(
    arguments: &HashMap<String, String>,
) -> Result<String, TransportError> {
    let callback = arguments
        .get("c")
        .ok_or(TransportError::MissingCallback)?;
    if !CALLBACK_RE.is_match(callback) {
        return Err(TransportError::InvalidCallback);
    }
    Ok(callback.clone())
}

/// Decode the body of a send request into its messages.
///
/// Accepts a JSON array of strings, or a form-encoded body of the shape
/// `d=<percent-encoded JSON array>`.
pub(crate) fn decode_body(
    content_type: Option<&HeaderValue>,
    body: &[u8],
) -> Result<Vec<String>, TransportError> {
    if body.is_empty() {
        return Err(TransportError::PayloadExpected);
    }
    let content_type = content_type
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if content_type.starts_with("application/x-www-form-urlencoded") {
        let text = std::str::from_utf8(body).map_err(|_| TransportError::BrokenJson)?;
        let Some(encoded) = text.strip_prefix("d=") else {
            return Err(TransportError::PayloadExpected);
        };
        let unplused = encoded.replace('+', " ");
        let decoded = percent_decode_str(&unplused)
            .decode_utf8()
            .map_err(|_| TransportError::BrokenJson)?;
        if decoded.is_empty() {
            return Err(TransportError::PayloadExpected);
        }
        Ok(proto::decode_payload(decoded.as_bytes())?)
    } else {
        Ok(proto::decode_payload(body)?)
    }
}

/// Snapshot the request for the application's open callback.
pub(crate) fn make_conn_info(
    ip: String,
    request_headers: &HeaderMap,
    arguments: HashMap<String, String>,
    jar: &CookieJar,
    path: String,
) -> ConnectionInfo {
    let cookies = jar
        .iter()
        .map(|cookie| (cookie.name().to_owned(), cookie.value().to_owned()))
        .collect();
    ConnectionInfo {
        ip,
        cookies,
        arguments,
        headers: request_headers.clone(),
        path,
    }
}

/// A transport's claim on a session. Dropping the guard without
/// `detach()` means the request was aborted: the session is closed with
/// `1002 "Connection interrupted"`.
pub(crate) struct BoundTransport {
    session: Arc<Session>,
    transport_id: u64,
    finished: bool,
}

impl BoundTransport {
    fn new(session: Arc<Session>, transport_id: u64) -> Self {
        Self {
            session,
            transport_id,
            finished: false,
        }
    }

    /// Release the slot after the request finished normally; starts the
    /// disconnect grace window.
    pub(crate) fn detach(mut self) {
        self.finished = true;
        self.session.detach_transport(self.transport_id);
    }
}

impl Drop for BoundTransport {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let session = Arc::clone(&self.session);
        let transport_id = self.transport_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                session.close_with(1002, "Connection interrupted").await;
                session.detach_transport(transport_id);
            });
        }
    }
}

/// The readable half handed to a send-capable request.
pub(crate) enum SendChannel {
    Single(oneshot::Receiver<String>),
    Stream(mpsc::UnboundedReceiver<String>),
}

pub(crate) enum SendMode {
    /// One frame per request (XHR polling, JSONP polling).
    Single,
    /// Stream frames until `budget` encoded bytes went out.
    Stream { budget: i64 },
}

pub(crate) struct SendBind {
    pub session: Arc<Session>,
    pub bound: BoundTransport,
    pub channel: SendChannel,
}

/// The binding protocol of send-capable transports: look up or create
/// the session, pin the IP, relay pending close frames, claim the send
/// slot, emit the open frame on first bind, flush the outbound buffer.
pub(crate) async fn bind_send_transport(
    endpoint: &Arc<EndpointInner>,
    session_id: &str,
    encoding: FrameEncoding,
    mode: SendMode,
    conn_info: ConnectionInfo,
) -> Result<SendBind, TransportError> {
    if !valid_session_segment(session_id) {
        return Err(TransportError::InvalidSessionId);
    }
    let session = match endpoint.get_session(session_id) {
        Some(session) => {
            verify_ip(endpoint, &session, &conn_info)?;
            session
        }
        None => endpoint.create_session(session_id, conn_info)?,
    };

    match session.state() {
        SessionState::Closing => {
            let reason = session.close_reason().unwrap_or_else(CloseReason::go_away);
            session.did_close();
            return Err(TransportError::Gone(reason));
        }
        SessionState::Closed => {
            let reason = session.close_reason().unwrap_or_else(CloseReason::go_away);
            return Err(TransportError::Gone(reason));
        }
        SessionState::New | SessionState::Open => {}
    }

    let transport_id = next_transport_id();
    let (sink, channel) = match mode {
        SendMode::Single => {
            let (sink, rx) = SendSink::single(transport_id, encoding);
            (sink, SendChannel::Single(rx))
        }
        SendMode::Stream { budget } => {
            let (sink, rx) = SendSink::stream(transport_id, encoding, Some(budget));
            (sink, SendChannel::Stream(rx))
        }
    };
    session.attach_transport(transport_id, TransportCaps::SEND, Some(sink))?;
    let bound = BoundTransport::new(Arc::clone(&session), transport_id);

    if session.state() == SessionState::New {
        session.write_frame(proto::OPEN_FRAME);
        if let Err(err) = session.open().await {
            tracing::debug!(session_id, "open raced with another transport: {err}");
        }
    }

    session.flush();
    Ok(SendBind {
        session,
        bound,
        channel,
    })
}

/// The binding protocol of receive-only transports: the session must
/// already exist.
pub(crate) async fn bind_recv_transport(
    endpoint: &Arc<EndpointInner>,
    session_id: &str,
    conn_info: ConnectionInfo,
) -> Result<(Arc<Session>, BoundTransport), TransportError> {
    if !valid_session_segment(session_id) {
        return Err(TransportError::InvalidSessionId);
    }
    let session = endpoint
        .get_session(session_id)
        .ok_or(TransportError::SessionNotFound)?;
    verify_ip(endpoint, &session, &conn_info)?;
    if session.is_closed() {
        return Err(TransportError::SessionNotFound);
    }
    let transport_id = next_transport_id();
    session.attach_transport(transport_id, TransportCaps::RECV, None)?;
    let bound = BoundTransport::new(Arc::clone(&session), transport_id);
    if session.state() == SessionState::New {
        // no send capability, so no open frame; the callback order is
        // still open-before-message
        if let Err(err) = session.open().await {
            tracing::debug!(session_id, "open raced with another transport: {err}");
        }
    }
    Ok((session, bound))
}

fn verify_ip(
    endpoint: &EndpointInner,
    session: &Session,
    conn_info: &ConnectionInfo,
) -> Result<(), TransportError> {
    if !endpoint.config().verify_ip {
        return Ok(());
    }
    match session.conn_info() {
        Some(stored) if stored.ip != conn_info.ip => Err(TransportError::IpMismatch),
        _ => Ok(()),
    }
}

/// Respond with the single frame of a polling request.
pub(crate) async fn single_frame_response(
    bind: SendBind,
    headers: HeaderMap,
    encoding: &FrameEncoding,
) -> Response {
    let SendBind {
        bound, channel, ..
    } = bind;
    let SendChannel::Single(rx) = channel else {
        unreachable!("polling transports bind single-frame sinks");
    };
    match rx.await {
        Ok(frame) => {
            bound.detach();
            (headers, frame).into_response()
        }
        Err(_) => {
            // slot dropped without a frame: the session went away under us
            bound.detach();
            (
                headers,
                encoding.encode(&CloseReason::interrupted().frame()),
            )
                .into_response()
        }
    }
}

/// Render a bind failure in the framing of the transport that hit it.
/// Close-frame errors complete with HTTP 200; the rest keep their HTTP
/// status.
pub(crate) fn frame_error_response(
    err: TransportError,
    headers: HeaderMap,
    encoding: &FrameEncoding,
    prelude: Option<&str>,
) -> Response {
    match err.close_reason() {
        Some(reason) => {
            let mut body = prelude.unwrap_or_default().to_owned();
            body.push_str(&encoding.encode(&reason.frame()));
            (headers, body).into_response()
        }
        None => err.into_response(),
    }
}

/// Body of a streaming transport response: the prelude, then frames from
/// the session until `limit` encoded bytes went out or the session's
/// sink closed. The transport detaches when the stream ends; dropping
/// the body early lets the bound guard flag the abort.
pub(crate) fn streaming_body(
    prelude: String,
    channel: SendChannel,
    bound: BoundTransport,
    limit: i64,
) -> Body {
    let SendChannel::Stream(rx) = channel else {
        unreachable!("streaming transports bind stream sinks");
    };

    struct StreamState {
        rx: mpsc::UnboundedReceiver<String>,
        bound: Option<BoundTransport>,
        remaining: i64,
        done: bool,
    }

    let state = StreamState {
        rx,
        bound: Some(bound),
        remaining: limit,
        // a prelude alone can spend the whole budget
        done: limit <= 0,
    };

    let frames = futures::stream::unfold(
        (state, Some(prelude)),
        |(mut state, prelude)| async move {
            if let Some(prelude) = prelude {
                return Some((
                    Ok::<Bytes, Infallible>(Bytes::from(prelude)),
                    (state, None),
                ));
            }
            if state.done {
                if let Some(bound) = state.bound.take() {
                    bound.detach();
                }
                return None;
            }
            match state.rx.recv().await {
                Some(frame) => {
                    state.remaining -= frame.len() as i64;
                    if state.remaining <= 0 {
                        state.done = true;
                    }
                    Some((Ok(Bytes::from(frame)), (state, None)))
                }
                None => {
                    if let Some(bound) = state.bound.take() {
                        bound.detach();
                    }
                    None
                }
            }
        },
    );
    Body::from_stream(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callback_validation() {
        let mut args = HashMap::new();
        assert!(matches!(
            verify_callback(&args),
            Err(TransportError::MissingCallback)
        ));
        args.insert("c".to_owned(), "my.Callback_0-1".to_owned());
        assert_eq!(verify_callback(&args).unwrap(), "my.Callback_0-1");
        args.insert("c".to_owned(), "alert();".to_owned());
        assert!(matches!(
            verify_callback(&args),
            Err(TransportError::InvalidCallback)
        ));
    }

    #[test]
    fn session_segments_must_be_dot_free() {
        assert!(valid_session_segment("abc123"));
        assert!(!valid_session_segment(""));
        assert!(!valid_session_segment("a.b"));
    }

    #[test]
    fn form_encoded_bodies_are_unquoted() {
        let body = b"d=%5B%22a+b%22%5D";
        let messages = decode_body(
            Some(&HeaderValue::from_static(
                "application/x-www-form-urlencoded",
            )),
            body,
        )
        .unwrap();
        assert_eq!(messages, vec!["a b"]);
    }

    #[test]
    fn json_bodies_pass_through() {
        let messages = decode_body(None, b"[\"x\"]").unwrap();
        assert_eq!(messages, vec!["x"]);
        assert!(matches!(
            decode_body(None, b""),
            Err(TransportError::PayloadExpected)
        ));
        assert!(matches!(
            decode_body(None, b"{\"x\":1}"),
            Err(TransportError::BrokenJson)
        ));
    }
}
