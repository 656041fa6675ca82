//! `meshd` - demo CLI wiring for the meshd cluster-membership core.
//!
//! The SWIM-style gossip transport itself is out of scope for the core
//! crate; this binary stands in a [`NullTransport`] so the lifecycle
//! commands below (`join`/`leave`/`info`) can be exercised without a real
//! network.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use meshd_core::config::Config;
use meshd_core::error::Result as MeshResult;
use meshd_core::node::{Node, NodeDeps};
use meshd_core::transport::TransportHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meshd", version, about = "cluster-membership demo node")]
struct Cli {
    /// Name this node advertises to the cluster
    #[arg(long, default_value = "node-1")]
    name: String,

    /// Address to bind the (stubbed) transport to
    #[arg(long, default_value = "127.0.0.1:7946")]
    bind: SocketAddr,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join an existing cluster through one or more seed addresses
    Join {
        #[arg(required = true)]
        addresses: Vec<SocketAddr>,
    },
    /// Leave the cluster gracefully
    Leave,
    /// Print the local member table
    Info,
}

struct NullTransport {
    addr: SocketAddr,
}

#[async_trait]
impl TransportHandle for NullTransport {
    async fn join(&self, addresses: &[SocketAddr], _ignore_old: bool) -> MeshResult<usize> {
        info!(count = addresses.len(), "join requested against stub transport");
        Ok(addresses.len())
    }

    async fn broadcast_leave(&self) -> MeshResult<()> {
        Ok(())
    }

    async fn shutdown(&self) {}

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn send_to(&self, addr: SocketAddr, bytes: Vec<u8>) -> MeshResult<()> {
        info!(%addr, bytes = bytes.len(), "unicast requested against stub transport");
        Ok(())
    }

    async fn reconnect(&self, name: &str, addr: SocketAddr) -> MeshResult<()> {
        info!(name, %addr, "reconnect requested against stub transport");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = Config::default();
    config.node_name = cli.name.clone();
    config.bind_addr = cli.bind;

    let deps = NodeDeps {
        transport: Arc::new(NullTransport { addr: cli.bind }),
    };

    let (node, mut events) = Node::create(config, deps).context("failed to create node")?;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                meshd_core::node::OutboundEvent::Member { kind, member } => {
                    info!(?kind, name = %member.name, "membership event");
                }
                meshd_core::node::OutboundEvent::User(event) => {
                    info!(name = %event.name, ltime = event.ltime, "user event");
                }
                meshd_core::node::OutboundEvent::Query { name, payload, handle, .. } => {
                    info!(name = %name, bytes = payload.len(), "query received");
                    // The demo CLI has no query handlers of its own; drop the
                    // handle without responding rather than holding it open.
                    drop(handle);
                }
            }
        }
    });

    match cli.command {
        Commands::Join { addresses } => {
            let contacted = node.join(&addresses, false).await?;
            println!("contacted {contacted} peer(s)");
        }
        Commands::Leave => {
            node.leave().await?;
            println!("left the cluster");
        }
        Commands::Info => {
            for member in node.members() {
                println!("{}\t{}\t{}", member.name, member.addr, member.status);
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
