//! XHR transports: long-polling, the send channel and streaming.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{OriginalUri, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, Version, header};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;

use crate::EndpointInner;
use crate::api::common::{
    Cache, Preamble, RemoteIp, SendBind, SendMode, bind_recv_transport, bind_send_transport,
    decode_body, frame_error_response, make_conn_info, response_preamble, single_frame_response,
    streaming_body,
};
use crate::api::errors::TransportError;
use crate::session::FrameEncoding;

fn streaming_prelude() -> String {
    let mut prelude = "h".repeat(2048);
    prelude.push('\n');
    prelude
}

/// `POST <prefix>/<server>/<session>/xhr` – long poll: the response is
/// the next frame of the session.
pub(crate) async fn xhr_poll(
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
            content_type: Some("application/javascript"),
        },
    );
    let conn_info = make_conn_info(ip, &headers, arguments, &jar, uri.path().to_owned());
    match bind_send_transport(
        &endpoint,
        &session_id,
        FrameEncoding::Newline,
        SendMode::Single,
        conn_info,
    )
    .await
    {
        Ok(bind) => single_frame_response(bind, response_headers, &FrameEncoding::Newline).await,
        Err(err) => frame_error_response(err, response_headers, &FrameEncoding::Newline, None),
    }
}

/// `POST <prefix>/<server>/<session>/xhr_send` – the receive channel of
/// the XHR transports; 204 on success.
pub(crate) async fn xhr_send(
    State(endpoint): State<Arc<EndpointInner>>,
    Path((_server_id, session_id)): Path<(String, String)>,
    RemoteIp(ip): RemoteIp,
    Query(arguments): Query<HashMap<String, String>>,
    OriginalUri(uri): OriginalUri,
    jar: CookieJar,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
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
            content_type: Some("text/plain"),
        },
    );
    let conn_info = make_conn_info(ip, &headers, arguments, &jar, uri.path().to_owned());
    let (session, bound) =
        match bind_recv_transport(&endpoint, &session_id, conn_info).await {
            Ok(bind) => bind,
            Err(err) => {
                return frame_error_response(err, response_headers, &FrameEncoding::Raw, None);
            }
        };
    let messages = match decode_body(headers.get(header::CONTENT_TYPE), &body) {
        Ok(messages) => messages,
        Err(err) => {
            tracing::debug!(session_id, "failed to decode payload: {err}");
            bound.detach();
            return err.into_response();
        }
    };
    if let Err(err) = session.dispatch(messages).await {
        tracing::error!(session_id, "failed to dispatch messages: {err:?}");
        session.close().await;
        bound.detach();
        return TransportError::Dispatch.into_response();
    }
    bound.detach();
    (StatusCode::NO_CONTENT, response_headers).into_response()
}

/// `POST <prefix>/<server>/<session>/xhr_streaming` – a 2 KiB prelude
/// defeats client-side buffering, then frames stream until the response
/// byte budget is spent.
pub(crate) async fn xhr_streaming(
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
            content_type: Some("application/javascript"),
        },
    );
    let prelude = streaming_prelude();
    let budget = endpoint.config().response_limit as i64 - prelude.len() as i64;
    let conn_info = make_conn_info(ip, &headers, arguments, &jar, uri.path().to_owned());
    match bind_send_transport(
        &endpoint,
        &session_id,
        FrameEncoding::Newline,
        SendMode::Stream { budget },
        conn_info,
    )
    .await
    {
        Ok(SendBind { bound, channel, .. }) => {
            let body = streaming_body(prelude, channel, bound, budget);
            (response_headers, body).into_response()
        }
        Err(err) => frame_error_response(
            err,
            response_headers,
            &FrameEncoding::Newline,
            Some(prelude.as_str()),
        ),
    }
}
