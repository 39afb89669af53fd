use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use axum_test::TestServer;
use clap::Parser as _;
use sockjs::{
    Conn, Connection, ConnectionFactory, ConnectionInfo, Endpoint, SockJsConfig, SockJsServer,
};

/// Echoes every message back; a few magic messages drive session-level
/// behavior from the client side.
pub struct EchoConn {
    conn: Conn,
}

#[async_trait]
impl Connection for EchoConn {
    async fn on_open(&self, _info: &ConnectionInfo) -> eyre::Result<()> {
        Ok(())
    }

    async fn on_message(&self, message: String) -> eyre::Result<()> {
        match message.as_str() {
            "close" => self.conn.close().await,
            message => {
                if let Some(broadcast) = message.strip_prefix("broadcast:") {
                    self.conn.broadcast(broadcast, None);
                } else {
                    self.conn.send(message);
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct EchoFactory {
    pub started: AtomicUsize,
    pub stopping: AtomicUsize,
    pub stopped: AtomicUsize,
}

impl ConnectionFactory for EchoFactory {
    fn connect(&self, conn: Conn) -> Arc<dyn Connection> {
        Arc::new(EchoConn { conn })
    }

    fn on_started(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_stopping(&self) {
        self.stopping.fetch_add(1, Ordering::SeqCst);
    }

    fn on_stopped(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Short timers so expiry scenarios finish in test time.
pub fn fast_config() -> SockJsConfig {
    SockJsConfig::parse_from([
        "sockjs",
        "--session-check-interval",
        "50ms",
        "--heartbeat-delay",
        "200ms",
        "--heartbeat-timeout",
        "100ms",
        "--disconnect-delay",
        "100ms",
    ])
}

pub struct TestApp {
    pub server: Arc<TestServer>,
    pub endpoint: Endpoint,
    pub factory: Arc<EchoFactory>,
}

/// An echo application mounted at `/echo`.
pub fn echo_app(config: SockJsConfig) -> TestApp {
    let factory = Arc::new(EchoFactory::default());
    let endpoint = Endpoint::new(config, factory.clone());
    let mut server = SockJsServer::new();
    server
        .add_endpoint(endpoint.clone(), "/echo")
        .expect("fresh prefix");
    let server = TestServer::builder()
        .http_transport()
        .build(server.router())
        .expect("can build test server");
    TestApp {
        server: Arc::new(server),
        endpoint,
        factory,
    }
}

pub fn default_app() -> TestApp {
    echo_app(SockJsConfig::default())
}
