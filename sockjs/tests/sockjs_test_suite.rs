use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use clap::Parser as _;
use http::StatusCode;
use serde_json::Value;
use sockjs::SockJsConfig;

use crate::setup::{default_app, echo_app, fast_config};

mod setup;

#[tokio::test]
async fn greeting_page() {
    let app = default_app();
    let response = app.server.get("/echo/").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), "Welcome to SockJS!\n");
    let headers = response.headers();
    assert!(
        headers.get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/plain")
    );
    assert!(
        headers.get("cache-control")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("max-age=31536000")
    );
}

#[tokio::test]
async fn info_document_shape() {
    let app = default_app();
    let response = app
        .server
        .get("/echo/info")
        .add_header("origin", "http://example.com")
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let info: Value = serde_json::from_str(&response.text()).unwrap();
    let object = info.as_object().unwrap();
    let mut keys: Vec<&str> = object.keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(keys, ["cookie_needed", "entropy", "origins", "websocket"]);
    assert_eq!(object["websocket"], Value::Bool(true));
    assert_eq!(object["cookie_needed"], Value::Bool(true));
    assert_eq!(object["origins"], serde_json::json!(["*:*"]));
    assert!(object["entropy"].as_u64().unwrap() <= u64::from(u32::MAX));

    let headers = response.headers();
    assert!(
        headers.get("cache-control")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("no-cache")
    );
    assert_eq!(
        headers.get("access-control-allow-origin").unwrap().to_str().unwrap(),
        "http://example.com"
    );
    assert_eq!(
        headers.get("access-control-allow-credentials").unwrap().to_str().unwrap(),
        "true"
    );
}

#[tokio::test]
async fn info_entropy_is_fresh_per_request() {
    let app = default_app();
    let first: Value = serde_json::from_str(&app.server.get("/echo/info").await.text()).unwrap();
    let second: Value = serde_json::from_str(&app.server.get("/echo/info").await.text()).unwrap();
    // a collision of two fresh 32-bit draws is vanishingly unlikely
    assert_ne!(first["entropy"], second["entropy"]);
}

#[tokio::test]
async fn info_preflight() {
    let app = default_app();
    let response = app.server.method(http::Method::OPTIONS, "/echo/info").await;
    assert_eq!(response.status_code(), StatusCode::NO_CONTENT);
    let headers = response.headers();
    assert_eq!(
        headers.get("access-control-allow-methods").unwrap().to_str().unwrap(),
        "OPTIONS, GET"
    );
    assert!(
        headers.get("cache-control")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("max-age=31536000")
    );
}

#[tokio::test]
async fn iframe_page_and_etag_revalidation() {
    let app = default_app();
    let response = app.server.get("/echo/iframe.html").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body = response.text();
    assert!(body.contains("sockjs.min.js"));
    assert!(body.contains("SockJS.bootstrap_iframe()"));
    let etag = response
        .headers()
        .get("etag")
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();

    let cached = app
        .server
        .get("/echo/iframe-1.2.3.html")
        .add_header("if-none-match", etag)
        .await;
    assert_eq!(cached.status_code(), StatusCode::NOT_MODIFIED);

    let missing = app.server.get("/echo/iframe-evil").await;
    assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);
    let missing = app.server.get("/echo/other.html").await;
    assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn xhr_round_trip() {
    let app = default_app();
    let open = app.server.post("/echo/000/s1/xhr").await;
    assert_eq!(open.status_code(), StatusCode::OK);
    assert_eq!(open.text(), "o\n");
    assert!(
        open.headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("application/javascript")
    );

    let send = app
        .server
        .post("/echo/000/s1/xhr_send")
        .json(&serde_json::json!(["hello"]))
        .await;
    assert_eq!(send.status_code(), StatusCode::NO_CONTENT);

    let poll = app.server.post("/echo/000/s1/xhr").await;
    assert_eq!(poll.text(), "a[\"hello\"]\n");
}

#[tokio::test]
async fn xhr_send_without_session_is_404() {
    let app = default_app();
    let response = app
        .server
        .post("/echo/000/nosession/xhr_send")
        .json(&serde_json::json!(["hello"]))
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn xhr_send_rejects_broken_payloads() {
    let app = default_app();
    assert_eq!(app.server.post("/echo/000/s1/xhr").await.text(), "o\n");

    let broken = app.server.post("/echo/000/s1/xhr_send").text("not json").await;
    assert_eq!(broken.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(broken.text(), "Broken JSON encoding.");

    let empty = app.server.post("/echo/000/s1/xhr_send").await;
    assert_eq!(empty.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(empty.text(), "Payload expected.");
}

#[tokio::test]
async fn session_ids_with_dots_are_rejected() {
    let app = default_app();
    let response = app.server.post("/echo/000/s.1/xhr").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn binding_conflict_yields_2010() {
    let app = default_app();
    assert_eq!(app.server.post("/echo/000/s1/xhr").await.text(), "o\n");

    let server = Arc::clone(&app.server);
    let waiting_poll = tokio::spawn(async move { server.post("/echo/000/s1/xhr").await.text() });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let conflict = app.server.post("/echo/000/s1/xhr").await;
    assert_eq!(conflict.status_code(), StatusCode::OK);
    assert_eq!(conflict.text(), "c[2010,\"Another connection still open\"]\n");

    // closing the session hands the waiting poll its close frame
    let send = app
        .server
        .post("/echo/000/s1/xhr_send")
        .json(&serde_json::json!(["close"]))
        .await;
    assert_eq!(send.status_code(), StatusCode::NO_CONTENT);
    assert_eq!(waiting_poll.await.unwrap(), "c[3000,\"Go away!\"]\n");

    // while the session lingers in its terminal state, polls keep
    // receiving the close frame
    let gone = app.server.post("/echo/000/s1/xhr").await;
    assert_eq!(gone.text(), "c[3000,\"Go away!\"]\n");
}

#[tokio::test]
async fn ip_pinning_rejects_other_addresses() {
    let app = default_app();
    let open = app
        .server
        .post("/echo/000/s1/xhr")
        .add_header("x-forwarded-for", "10.0.0.1")
        .await;
    assert_eq!(open.text(), "o\n");

    let mismatch = app
        .server
        .post("/echo/000/s1/xhr")
        .add_header("x-forwarded-for", "10.0.0.2")
        .await;
    assert_eq!(mismatch.status_code(), StatusCode::OK);
    assert_eq!(mismatch.text(), "c[2010,\"IP session mismatch\"]\n");

    let same = app
        .server
        .post("/echo/000/s1/xhr_send")
        .add_header("x-forwarded-for", "10.0.0.1")
        .json(&serde_json::json!(["still here"]))
        .await;
    assert_eq!(same.status_code(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn session_expires_without_reconnect() {
    let app = echo_app(fast_config());
    assert_eq!(app.server.post("/echo/000/s1/xhr").await.text(), "o\n");
    assert!(app.endpoint.get_session("s1").is_some());

    // disconnect delay is 100ms and the GC runs every 50ms
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(app.endpoint.get_session("s1").is_none());

    // the id is free again; a new poll starts a new session
    assert_eq!(app.server.post("/echo/000/s1/xhr").await.text(), "o\n");
}

#[tokio::test]
async fn heartbeat_reaches_waiting_polls() {
    let app = echo_app(fast_config());
    assert_eq!(app.server.post("/echo/000/s1/xhr").await.text(), "o\n");
    let poll = app.server.post("/echo/000/s1/xhr").await;
    assert_eq!(poll.text(), "h\n");
}

#[tokio::test]
async fn jsessionid_cookie_is_echoed() {
    let app = default_app();
    let fresh = app.server.post("/echo/000/s1/xhr").await;
    assert_eq!(
        fresh.headers().get("set-cookie").unwrap().to_str().unwrap(),
        "JSESSIONID=dummy; Path=/"
    );
    let returning = app
        .server
        .post("/echo/000/s1/xhr")
        .add_header("cookie", "JSESSIONID=abc")
        .await;
    assert_eq!(
        returning.headers().get("set-cookie").unwrap().to_str().unwrap(),
        "JSESSIONID=abc; Path=/"
    );
}

#[tokio::test]
async fn xhr_streaming_prelude_and_byte_budget() {
    // budget of prelude + one open frame, inclusive of the prelude
    let config = SockJsConfig::parse_from(["sockjs", "--response-limit", "2051"]);
    let app = echo_app(config);
    let response = app.server.post("/echo/000/s1/xhr_streaming").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let mut expected = "h".repeat(2048);
    expected.push('\n');
    expected.push_str("o\n");
    assert_eq!(response.text(), expected);
}

#[tokio::test]
async fn xhr_streaming_conflict_and_close_frame() {
    let app = default_app();
    let server = Arc::clone(&app.server);
    let streaming = tokio::spawn(async move {
        server.post("/echo/000/s1/xhr_streaming").await.text()
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let conflict = app.server.post("/echo/000/s1/xhr_streaming").await;
    let mut expected = "h".repeat(2048);
    expected.push('\n');
    assert_eq!(
        conflict.text(),
        format!("{expected}c[2010,\"Another connection still open\"]\n")
    );

    let send = app
        .server
        .post("/echo/000/s1/xhr_send")
        .json(&serde_json::json!(["close"]))
        .await;
    assert_eq!(send.status_code(), StatusCode::NO_CONTENT);

    let body = streaming.await.unwrap();
    assert_eq!(body, format!("{expected}o\nc[3000,\"Go away!\"]\n"));
}

#[tokio::test]
async fn eventsource_frames_are_sse_events() {
    // "\r\n" preamble plus one "data: o\r\n\r\n" event
    let config = SockJsConfig::parse_from(["sockjs", "--response-limit", "13"]);
    let app = echo_app(config);
    let response = app.server.get("/echo/000/s1/eventsource").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.text(), "\r\ndata: o\r\n\r\n");
    assert!(
        response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );
}

#[tokio::test]
async fn htmlfile_prelude_and_script_frames() {
    // 1028 bytes of prelude plus one 28-byte script block
    let config = SockJsConfig::parse_from(["sockjs", "--response-limit", "1056"]);
    let app = echo_app(config);
    let response = app.server.get("/echo/000/s1/htmlfile?c=cb").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body = response.text();
    assert!(body.starts_with("<!doctype html>"));
    assert!(body.contains("var c = parent.cb;"));
    assert!(body.ends_with("<script>\np(\"o\");\n</script>\r\n"));

    let missing = app.server.get("/echo/000/s2/htmlfile").await;
    assert_eq!(missing.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(missing.text(), "\"callback\" parameter required");
}

#[tokio::test]
async fn jsonp_round_trip() {
    let app = default_app();
    let open = app.server.get("/echo/000/s1/jsonp?c=callback").await;
    assert_eq!(open.status_code(), StatusCode::OK);
    assert_eq!(open.text(), "/**/callback(\"o\");\r\n");

    let send = app
        .server
        .post("/echo/000/s1/jsonp_send")
        .text("d=%5B%22hi%22%5D")
        .content_type("application/x-www-form-urlencoded")
        .await;
    assert_eq!(send.status_code(), StatusCode::OK);
    assert_eq!(send.text(), "ok");

    let poll = app.server.get("/echo/000/s1/jsonp?c=callback").await;
    assert_eq!(poll.text(), "/**/callback(\"a[\\\"hi\\\"]\");\r\n");
}

#[tokio::test]
async fn jsonp_requires_a_valid_callback() {
    let app = default_app();
    let missing = app.server.get("/echo/000/s1/jsonp").await;
    assert_eq!(missing.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(missing.text(), "\"callback\" parameter required");

    let invalid = app.server.get("/echo/000/s1/jsonp?c=alert()").await;
    assert_eq!(invalid.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(invalid.text(), "invalid \"callback\" parameter");
}

#[tokio::test]
async fn websocket_round_trip_and_close() {
    let app = default_app();
    let mut ws = app
        .server
        .get_websocket("/echo/000/s1/websocket")
        .await
        .into_websocket()
        .await;
    ws.assert_receive_text("o").await;
    ws.send_text("[\"hi\"]").await;
    ws.assert_receive_text("a[\"hi\"]").await;
    // a bare JSON string is coerced to a one-element list
    ws.send_text("\"solo\"").await;
    ws.assert_receive_text("a[\"solo\"]").await;

    ws.send_text("[\"close\"]").await;
    ws.assert_receive_text("c[3000,\"Go away!\"]").await;
}

#[tokio::test]
async fn raw_websocket_echoes_verbatim() {
    let app = default_app();
    let mut ws = app
        .server
        .get_websocket("/echo/websocket")
        .await
        .into_websocket()
        .await;
    // no open frame and no framing at all
    ws.send_text("hello").await;
    ws.assert_receive_text("hello").await;
}

#[tokio::test]
async fn broadcast_reaches_all_active_sessions() {
    let app = default_app();
    assert_eq!(app.server.post("/echo/000/s1/xhr").await.text(), "o\n");
    assert_eq!(app.server.post("/echo/000/s2/xhr").await.text(), "o\n");

    let send = app
        .server
        .post("/echo/000/s1/xhr_send")
        .json(&serde_json::json!(["broadcast:news"]))
        .await;
    assert_eq!(send.status_code(), StatusCode::NO_CONTENT);

    assert_eq!(
        app.server.post("/echo/000/s1/xhr").await.text(),
        "a[\"news\"]\n"
    );
    assert_eq!(
        app.server.post("/echo/000/s2/xhr").await.text(),
        "a[\"news\"]\n"
    );
}

#[tokio::test]
async fn disabled_transports_are_not_routed() {
    let config = SockJsConfig::parse_from([
        "sockjs",
        "--disabled-transports",
        "websocket,xhr_streaming",
    ]);
    let app = echo_app(config);

    let info: Value = serde_json::from_str(&app.server.get("/echo/info").await.text()).unwrap();
    assert_eq!(info["websocket"], Value::Bool(false));

    let response = app.server.post("/echo/000/s1/xhr_streaming").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    let response = app.server.get("/echo/000/s1/websocket").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    // the rest of the table is untouched
    assert_eq!(app.server.post("/echo/000/s1/xhr").await.text(), "o\n");
}

#[tokio::test]
async fn chunking_test_streams_the_fixed_sequence() {
    let app = default_app();
    let response = app.server.post("/echo/chunking_test").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let mut expected = String::from("h\n");
    expected.push_str(&" ".repeat(2048));
    expected.push_str("h\n");
    for _ in 0..5 {
        expected.push_str("h\n");
    }
    assert_eq!(response.text(), expected);
}

#[tokio::test]
async fn endpoint_stop_drains_sessions_and_fires_hooks() {
    let app = default_app();
    assert_eq!(app.factory.started.load(Ordering::SeqCst), 1);
    assert_eq!(app.server.post("/echo/000/s1/xhr").await.text(), "o\n");
    assert!(app.endpoint.get_session("s1").is_some());

    app.endpoint.stop().await;
    assert_eq!(app.factory.stopping.load(Ordering::SeqCst), 1);
    assert_eq!(app.factory.stopped.load(Ordering::SeqCst), 1);
    assert!(app.endpoint.get_session("s1").is_none());

    // a stopped endpoint refuses new sessions
    let refused = app.server.post("/echo/000/s2/xhr").await;
    assert_eq!(refused.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn duplicate_prefixes_fail_fast() {
    use sockjs::{Endpoint, SockJsServer};
    let endpoint = Endpoint::new(SockJsConfig::default(), Arc::new(setup::EchoFactory::default()));
    let mut server = SockJsServer::new();
    server.add_endpoint(endpoint.clone(), "/echo").unwrap();
    assert!(server.add_endpoint(endpoint, "/echo").is_err());
}
