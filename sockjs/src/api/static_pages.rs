//! The static part of the URL surface: greeting page, `/info` document,
//! iframe bootstrap and the chunking probe.

use std::convert::Infallible;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, Version, header};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use regex::Regex;
use serde::Serialize;

use crate::EndpointInner;
use crate::api::common::{Cache, Preamble, preflight, response_preamble};

static IFRAME_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^iframe[0-9\-.a-z_]*\.html$").expect("valid regex"));

const IFRAME_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta http-equiv="X-UA-Compatible" content="IE=edge" />
  <meta http-equiv="Content-Type" content="text/html; charset=UTF-8" />
  <script src="%SOCKJS_URL%"></script>
  <script>
    document.domain = document.domain;
    SockJS.bootstrap_iframe();
  </script>
</head>
<body>
  <h2>Don't panic!</h2>
  <p>This is a SockJS hidden iframe. It's used for cross domain magic.</p>
</body>
</html>"#;

/// `GET <prefix>/` – the greeting page.
pub(crate) async fn greeting(
    State(endpoint): State<Arc<EndpointInner>>,
    headers: HeaderMap,
    jar: CookieJar,
    version: Version,
) -> Response {
    let headers = response_preamble(
        &endpoint,
        &headers,
        &jar,
        version,
        Preamble {
            cors: false,
            cookie: false,
            cache: Cache::Forever,
            content_type: Some("text/plain"),
        },
    );
    (headers, "Welcome to SockJS!\n").into_response()
}

#[derive(Serialize)]
struct Info {
    websocket: bool,
    cookie_needed: bool,
    origins: [&'static str; 1],
    entropy: u32,
}

/// `GET <prefix>/info` – transport capabilities of this endpoint; never
/// cached, fresh entropy on every request.
pub(crate) async fn info(
    State(endpoint): State<Arc<EndpointInner>>,
    headers: HeaderMap,
    jar: CookieJar,
    version: Version,
) -> Response {
    let headers = response_preamble(
        &endpoint,
        &headers,
        &jar,
        version,
        Preamble {
            cors: true,
            cookie: false,
            cache: Cache::Never,
            content_type: Some("application/json"),
        },
    );
    let config = endpoint.config();
    let info = Info {
        websocket: config.websocket_enabled(),
        cookie_needed: config.cookie_affinity,
        origins: ["*:*"],
        entropy: rand::random(),
    };
    let body = serde_json::to_string(&info).expect("info always encodes");
    (headers, body).into_response()
}

/// `OPTIONS <prefix>/info` preflight.
pub(crate) async fn info_options(
    State(endpoint): State<Arc<EndpointInner>>,
    headers: HeaderMap,
    jar: CookieJar,
    version: Version,
) -> Response {
    preflight(&endpoint, &headers, &jar, version, "OPTIONS, GET")
}

/// `GET <prefix>/iframe[version].html` – the hidden-iframe bootstrap
/// page, served with an MD5 `ETag` so clients can revalidate cheaply.
pub(crate) async fn iframe(
    State(endpoint): State<Arc<EndpointInner>>,
    Path(file): Path<String>,
    headers: HeaderMap,
    jar: CookieJar,
    version: Version,
) -> Response {
    if !IFRAME_NAME_RE.is_match(&file) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let body = IFRAME_TEMPLATE.replace("%SOCKJS_URL%", &endpoint.config().sockjs_url);
    let etag = format!("{:x}", md5::compute(body.as_bytes()));

    if let Some(check) = headers.get(header::IF_NONE_MATCH).and_then(|v| v.to_str().ok())
        && check == etag
    {
        return StatusCode::NOT_MODIFIED.into_response();
    }

    let mut headers = response_preamble(
        &endpoint,
        &headers,
        &jar,
        version,
        Preamble {
            cors: false,
            cookie: false,
            cache: Cache::Forever,
            content_type: Some("text/html"),
        },
    );
    if let Ok(etag) = HeaderValue::from_str(&etag) {
        headers.insert(header::ETAG, etag);
    }
    (headers, body).into_response()
}

/// Delays between the timed chunks of the chunking probe.
const CHUNKING_STEPS: [Duration; 5] = [
    Duration::from_millis(5),
    Duration::from_millis(25),
    Duration::from_millis(125),
    Duration::from_millis(625),
    Duration::from_millis(3125),
];

/// `POST <prefix>/chunking_test` – lets the client discover whether the
/// network path delivers chunked responses incrementally. Sends `h\n`,
/// then 2048 spaces plus `h\n`, then `h\n` after each configured delay.
pub(crate) async fn chunking_test(
    State(endpoint): State<Arc<EndpointInner>>,
    headers: HeaderMap,
    jar: CookieJar,
    version: Version,
) -> Response {
    let headers = response_preamble(
        &endpoint,
        &headers,
        &jar,
        version,
        Preamble {
            cors: true,
            cookie: false,
            cache: Cache::Never,
            content_type: Some("application/javascript"),
        },
    );

    let chunks = futures::stream::unfold(0usize, |step| async move {
        let chunk = match step {
            0 => "h\n".to_owned(),
            1 => {
                let mut chunk = " ".repeat(2048);
                chunk.push_str("h\n");
                chunk
            }
            n if n - 2 < CHUNKING_STEPS.len() => {
                tokio::time::sleep(CHUNKING_STEPS[n - 2]).await;
                "h\n".to_owned()
            }
            _ => return None,
        };
        Some((Ok::<Bytes, Infallible>(Bytes::from(chunk)), step + 1))
    });
    (headers, Body::from_stream(chunks)).into_response()
}

/// `OPTIONS <prefix>/chunking_test` preflight.
pub(crate) async fn chunking_test_options(
    State(endpoint): State<Arc<EndpointInner>>,
    headers: HeaderMap,
    jar: CookieJar,
    version: Version,
) -> Response {
    preflight(&endpoint, &headers, &jar, version, "OPTIONS, POST")
}
