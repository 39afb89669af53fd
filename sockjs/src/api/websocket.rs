//! WebSocket transports: the framed SockJS one and the raw variant.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{OriginalUri, Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;

use crate::EndpointInner;
use crate::api::common::{RemoteIp, make_conn_info, valid_session_segment};
use crate::connection::ConnectionInfo;
use crate::proto::{self, CloseReason};
use crate::session::{FrameEncoding, SendSink, Session, TransportCaps, next_transport_id};

/// Same-origin connections are always accepted; everything else is
/// checked against the configured allow list.
fn origin_allowed(endpoint: &EndpointInner, headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return true;
    };
    let netloc = origin
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(origin)
        .to_ascii_lowercase();
    if let Some(host) = headers.get(header::HOST).and_then(|v| v.to_str().ok())
        && host.eq_ignore_ascii_case(&netloc)
    {
        return true;
    }
    let allowed = &endpoint.config().websocket_allow_origin;
    if allowed == "*" {
        return true;
    }
    allowed
        .split(',')
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(&netloc))
}

/// `GET <prefix>/<server>/<session>/websocket` – the SockJS WebSocket
/// transport. The session lives and dies with the TCP connection and is
/// never pooled.
pub(crate) async fn sockjs_websocket(
    State(endpoint): State<Arc<EndpointInner>>,
    Path((_server_id, session_id)): Path<(String, String)>,
    RemoteIp(ip): RemoteIp,
    Query(arguments): Query<HashMap<String, String>>,
    OriginalUri(uri): OriginalUri,
    jar: CookieJar,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !valid_session_segment(&session_id) {
        return StatusCode::NOT_FOUND.into_response();
    }
    if !origin_allowed(&endpoint, &headers) {
        return StatusCode::FORBIDDEN.into_response();
    }
    let conn_info = make_conn_info(ip, &headers, arguments, &jar, uri.path().to_owned());
    ws.on_failed_upgrade(|err| {
        tracing::warn!("could not establish websocket connection: {err:?}");
    })
    .on_upgrade(move |socket| async move {
        let session = endpoint.create_ws_session(&session_id, conn_info);
        drive_socket(endpoint, session, socket, Framing::SockJs).await;
    })
}

/// `GET <prefix>/websocket` – no framing at all: every outbound `send`
/// is one text frame, every inbound text frame is one message.
pub(crate) async fn raw_websocket(
    State(endpoint): State<Arc<EndpointInner>>,
    RemoteIp(ip): RemoteIp,
    Query(arguments): Query<HashMap<String, String>>,
    OriginalUri(uri): OriginalUri,
    jar: CookieJar,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !origin_allowed(&endpoint, &headers) {
        return StatusCode::FORBIDDEN.into_response();
    }
    let conn_info = make_conn_info(ip, &headers, arguments, &jar, uri.path().to_owned());
    ws.on_failed_upgrade(|err| {
        tracing::warn!("could not establish websocket connection: {err:?}");
    })
    .on_upgrade(move |socket| async move {
        let session = endpoint.create_raw_session(conn_info);
        drive_socket(endpoint, session, socket, Framing::Raw).await;
    })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Framing {
    SockJs,
    Raw,
}

/// The whole life of one WebSocket connection: open handshake, then a
/// select loop over outbound frames, inbound messages and the ping
/// timer. Pongs (and inbound messages) keep the session alive.
async fn drive_socket(
    endpoint: Arc<EndpointInner>,
    session: Arc<Session>,
    mut socket: WebSocket,
    framing: Framing,
) {
    let transport_id = next_transport_id();
    let (sink, mut rx) = SendSink::stream(transport_id, FrameEncoding::Raw, None);
    if let Err(err) = session.attach_transport(transport_id, TransportCaps::BOTH, Some(sink)) {
        tracing::error!(session_id = %session.session_id(), "websocket bind failed: {err}");
        return;
    }

    if framing == Framing::SockJs
        && socket
            .send(Message::Text(proto::OPEN_FRAME.into()))
            .await
            .is_err()
    {
        session.close_with(1002, "Connection interrupted").await;
        session.detach_transport(transport_id);
        return;
    }
    if let Err(err) = session.open().await {
        tracing::debug!(session_id = %session.session_id(), "websocket open failed: {err}");
    }
    session.flush();

    let mut ping = tokio::time::interval(endpoint.config().heartbeat_delay);
    ping.tick().await;

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if socket.send(Message::Text(frame.into())).await.is_err() {
                        session.close_with(1002, "Connection interrupted").await;
                        break;
                    }
                }
                None => {
                    // the session is gone; finish the closing handshake
                    let reason = session.close_reason().unwrap_or_else(CloseReason::go_away);
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code: close_code::NORMAL,
                            reason: reason.message.into(),
                        })))
                        .await;
                    break;
                }
            },
            message = socket.recv() => match message {
                Some(Ok(Message::Text(text))) => {
                    if text.is_empty() {
                        continue;
                    }
                    let messages = match framing {
                        Framing::Raw => Ok(vec![text.as_str().to_owned()]),
                        Framing::SockJs => proto::decode_websocket_text(text.as_str()),
                    };
                    match messages {
                        Ok(messages) => {
                            if let Err(err) = session.dispatch(messages).await {
                                tracing::error!(
                                    session_id = %session.session_id(),
                                    "failed to dispatch message: {err:?}"
                                );
                                session.close().await;
                            }
                        }
                        Err(err) => {
                            tracing::debug!(
                                session_id = %session.session_id(),
                                "failed to decode message: {err}"
                            );
                            session.close().await;
                        }
                    }
                }
                Some(Ok(Message::Pong(_))) => session.touch(),
                // the websocket layer answers pings by itself
                Some(Ok(Message::Ping(_))) => {}
                Some(Ok(Message::Binary(_))) => {
                    tracing::debug!("binary messages are not supported");
                }
                Some(Ok(Message::Close(_))) | None => {
                    session.close().await;
                    break;
                }
                Some(Err(err)) => {
                    tracing::debug!(session_id = %session.session_id(), "websocket error: {err}");
                    session.close_with(1002, "Connection interrupted").await;
                    break;
                }
            },
            _ = ping.tick() => {
                if socket.send(Message::Ping(Bytes::new())).await.is_err() {
                    session.close_with(1002, "Connection interrupted").await;
                    break;
                }
            }
        }
    }
    session.detach_transport(transport_id);
}
