//! EventSource (Server-Sent Events) transport.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{OriginalUri, Path, Query, State};
use axum::http::{HeaderMap, Version};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;

use crate::EndpointInner;
use crate::api::common::{
    Cache, Preamble, RemoteIp, SendBind, SendMode, bind_send_transport, frame_error_response,
    make_conn_info, response_preamble, streaming_body,
};
use crate::session::FrameEncoding;

const PREAMBLE: &str = "\r\n";

/// `GET <prefix>/<server>/<session>/eventsource` – frames are delivered
/// as `data:` events until the response byte budget is spent.
pub(crate) async fn eventsource(
    State(endpoint): State<Arc<EndpointInner>>,
    Path((_server_id, session_id)): Path<(String, String)>,
    RemoteIp(ip): RemoteIp,
    Query(arguments): Query<HashMap<String, String>>,
    OriginalUri(uri): OriginalUri,
    jar: CookieJar,
    version: Version,
    headers: HeaderMap,
) -> Response {
    let response_headers = response_preamble(
        &endpoint,
        &headers,
        &jar,
        version,
        Preamble {
            cors: true,
            cookie: true,
            cache: Cache::Never,
            content_type: Some("text/event-stream"),
        },
    );
    let budget = endpoint.config().response_limit as i64 - PREAMBLE.len() as i64;
    let conn_info = make_conn_info(ip, &headers, arguments, &jar, uri.path().to_owned());
    match bind_send_transport(
        &endpoint,
        &session_id,
        FrameEncoding::EventSource,
        SendMode::Stream { budget },
        conn_info,
    )
    .await
    {
        Ok(SendBind { bound, channel, .. }) => {
            let body = streaming_body(PREAMBLE.to_owned(), channel, bound, budget);
            (response_headers, body).into_response()
        }
        Err(err) => frame_error_response(
            err,
            response_headers,
            &FrameEncoding::EventSource,
            Some(PREAMBLE),
        ),
    }
}
