//! HtmlFile streaming transport: an HTML page whose `<script>` chunks
//! call back into a parent-frame JSONP function.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{OriginalUri, Path, Query, State};
use axum::http::{HeaderMap, Version};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;

use crate::EndpointInner;
use crate::api::common::{
    Cache, Preamble, RemoteIp, SendBind, SendMode, bind_send_transport, frame_error_response,
    make_conn_info, response_preamble, streaming_body, verify_callback,
};
use crate::session::FrameEncoding;

const HTMLFILE_HEAD: &str = r#"<!doctype html>
<html><head>
  <meta http-equiv="X-UA-Compatible" content="IE=edge" />
  <meta http-equiv="Content-Type" content="text/html; charset=UTF-8" />
</head><body><h2>Don't panic!</h2>
  <script>
    document.domain = document.domain;
    var c = parent.%CALLBACK%;
    c.start();
    function p(d) {c.message(d);};
    window.onload = function() {c.stop();};
  </script>
"#;

/// The prelude must be large enough to make browsers start rendering.
fn htmlfile_prelude(callback: &str) -> String {
    let mut head = HTMLFILE_HEAD.replace("%CALLBACK%", callback);
    while head.len() < 1024 {
        head.push(' ');
    }
    head.push_str("\r\n\r\n");
    head
}

/// `GET <prefix>/<server>/<session>/htmlfile?c=<callback>`.
pub(crate) async fn htmlfile(
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
            content_type: Some("text/html"),
        },
    );
    let callback = match verify_callback(&arguments) {
        Ok(callback) => callback,
        Err(err) => return err.into_response(),
    };
    let prelude = htmlfile_prelude(&callback);
    let budget = endpoint.config().response_limit as i64 - prelude.len() as i64;
    let conn_info = make_conn_info(ip, &headers, arguments, &jar, uri.path().to_owned());
    match bind_send_transport(
        &endpoint,
        &session_id,
        FrameEncoding::HtmlFile,
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
            &FrameEncoding::HtmlFile,
            Some(prelude.as_str()),
        ),
    }
}
