//! Minimal chat server: every message is broadcast to every connected
//! client, joins and leaves are announced.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use sockjs::{
    Conn, Connection, ConnectionFactory, ConnectionInfo, Endpoint, SockJsConfig, SockJsServer,
};

#[derive(Parser, Debug)]
struct ChatArgs {
    /// Address to listen on.
    #[clap(long, env = "CHAT_BIND_ADDR", default_value = "127.0.0.1:8080")]
    bind_addr: SocketAddr,

    #[clap(flatten)]
    sockjs: SockJsConfig,
}

struct ChatConnection {
    conn: Conn,
}

#[async_trait]
impl Connection for ChatConnection {
    async fn on_open(&self, info: &ConnectionInfo) -> eyre::Result<()> {
        tracing::info!(ip = %info.ip, session_id = %self.conn.session_id(), "joined");
        self.conn.broadcast("Someone joined.", None);
        Ok(())
    }

    async fn on_message(&self, message: String) -> eyre::Result<()> {
        self.conn.broadcast(&message, None);
        Ok(())
    }

    async fn on_close(&self) {
        tracing::info!(session_id = %self.conn.session_id(), "left");
        self.conn.broadcast("Someone left.", None);
    }
}

struct ChatFactory;

impl ConnectionFactory for ChatFactory {
    fn connect(&self, conn: Conn) -> Arc<dyn Connection> {
        Arc::new(ChatConnection { conn })
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sockjs=debug".into()),
        )
        .init();

    let args = ChatArgs::parse();
    sockjs::metrics::describe_metrics();

    let endpoint = Endpoint::new(args.sockjs, Arc::new(ChatFactory));
    let mut server = SockJsServer::new();
    server.add_endpoint(endpoint, "/chat")?;
    server.listen(args.bind_addr).await
}
