// ABOUTME: Demo driving a connection through the handshake and one query against a live node
// ABOUTME: Run with: cargo run --example handshake -- --addr 127.0.0.1:9042

use std::net::SocketAddr;
use std::sync::Arc;

use argh::FromArgs;
use tokio::sync::mpsc;

use cqlink::{
    Consistency, ConnectionId, ConnectionObserver, DriverConfig, DriverError, EventLoopGroup,
    Host, Request,
};

#[derive(FromArgs)]
/// Connect to a CQL node, handshake, and run a single query.
struct Args {
    /// node address, e.g. 127.0.0.1:9042
    #[argh(option, default = "\"127.0.0.1:9042\".parse().unwrap()")]
    addr: SocketAddr,

    /// query to execute once the connection is ready
    #[argh(
        option,
        default = "String::from(\"SELECT cluster_name FROM system.local\")"
    )]
    query: String,
}

struct ConnectSignal {
    tx: mpsc::UnboundedSender<Option<String>>,
}

impl ConnectionObserver for ConnectSignal {
    fn on_connected(&self, conn: ConnectionId, error: Option<&DriverError>) {
        tracing::info!(%conn, ok = error.is_none(), "connect finished");
        let _ = self.tx.send(error.map(|e| e.to_string()));
    }

    fn on_keyspace_changed(&self, conn: ConnectionId, keyspace: &str) {
        tracing::info!(%conn, keyspace, "keyspace changed");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let args: Args = argh::from_env();

    let group = EventLoopGroup::new(DriverConfig::default())?;
    let (tx, mut connected) = mpsc::unbounded_channel();
    let conn = group.connect(Host::from(args.addr), Arc::new(ConnectSignal { tx }));

    match connected.recv().await {
        Some(None) => tracing::info!("handshake complete"),
        Some(Some(error)) => {
            tracing::error!(error, "handshake failed");
            return Err(error.into());
        }
        None => return Err("connection dropped".into()),
    }

    let response = group.submit(&conn, Request::query(&args.query, Consistency::One))?;
    match response.await? {
        Ok(result) => tracing::info!(?result, "query finished"),
        Err(error) => tracing::error!(%error, "query failed"),
    }

    group.shutdown();
    Ok(())
}
