//! JSONP polling transport and its send channel.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{OriginalUri, Path, Query, State};
use axum::http::{HeaderMap, Version, header};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;

use crate::EndpointInner;
use crate::api::common::{
    Cache, Preamble, RemoteIp, SendMode, bind_recv_transport, bind_send_transport, decode_body,
    frame_error_response, make_conn_info, response_preamble, single_frame_response,
    verify_callback,
};
use crate::api::errors::TransportError;
use crate::session::FrameEncoding;

/// `GET <prefix>/<server>/<session>/jsonp?c=<callback>` – one frame per
/// request, wrapped in the validated callback.
pub(crate) async fn jsonp_poll(
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
            cors: false,
            cookie: true,
            cache: Cache::Never,
            content_type: Some("application/javascript"),
        },
    );
    let callback = match verify_callback(&arguments) {
        Ok(callback) => callback,
        Err(err) => return err.into_response(),
    };
    let encoding = FrameEncoding::Jsonp(callback);
    let conn_info = make_conn_info(ip, &headers, arguments, &jar, uri.path().to_owned());
    match bind_send_transport(
        &endpoint,
        &session_id,
        encoding.clone(),
        SendMode::Single,
        conn_info,
    )
    .await
    {
        Ok(bind) => single_frame_response(bind, response_headers, &encoding).await,
        Err(err) => frame_error_response(err, response_headers, &encoding, None),
    }
}

/// `POST <prefix>/<server>/<session>/jsonp_send` – accepts JSON bodies
/// or `d=`-style form bodies; responds `ok`.
pub(crate) async fn jsonp_send(
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
    (response_headers, "ok").into_response()
}
