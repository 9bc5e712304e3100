use anyhow::{bail, Result};
use chat_raft_project::config::ClusterConfig;
use chat_raft_project::raft::{RaftConfig, RaftNode};
use chat_raft_project::router::Router;
use chat_raft_project::store::Store;
use chat_raft_project::{
    read_frame, write_frame, ClientRequest, RaftMessage, RAFT_PORT_OFFSET,
};
use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

#[derive(Parser)]
#[command(version, about = "One node of the replicated chat cluster", long_about = None)]
struct Cli {
    /// This node's id, as listed in the cluster config
    #[arg(long)]
    node_id: String,

    /// Path to the JSON cluster config (node id -> "host:port")
    #[arg(long)]
    config: PathBuf,

    /// Directory holding this node's durable state
    #[arg(long)]
    data_dir: PathBuf,

    /// Application listen port; Raft listens on port + 1000
    #[arg(long)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let cluster = ClusterConfig::load(&cli.config)?;
    if !cluster.contains(&cli.node_id) {
        bail!(
            "node id '{}' does not appear in '{}'",
            cli.node_id,
            cli.config.display()
        );
    }

    let store = Store::open(&cli.data_dir)?;
    let raft_config = RaftConfig::new(cli.node_id.clone(), cluster.raft_peers_of(&cli.node_id)?);
    let node = Arc::new(RaftNode::new(raft_config, store)?);
    Arc::clone(&node).start().await;

    // Raft traffic on its own port, one connection per RPC.
    let raft_port = cli.port + RAFT_PORT_OFFSET;
    let raft_node = Arc::clone(&node);
    tokio::spawn(async move {
        if let Err(e) = run_raft_listener(raft_port, raft_node).await {
            error!("raft listener failed: {:#}", e);
            std::process::exit(1);
        }
    });

    let router = Arc::new(Router::new(Arc::clone(&node), cluster));
    let bind = format!("0.0.0.0:{}", cli.port);
    let listener = TcpListener::bind(&bind).await?;
    info!(
        "[{}] serving clients on {}, raft on port {}",
        cli.node_id, bind, raft_port
    );

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let router = Arc::clone(&router);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, router).await {
                        error!("client {} failed: {:#}", addr, e);
                    }
                });
            }
            Err(e) => error!("failed to accept client connection: {}", e),
        }
    }
}

async fn run_raft_listener(port: u16, node: Arc<RaftNode>) -> Result<()> {
    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("[{}] raft listener on port {}", node.config.node_id, port);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let node = Arc::clone(&node);
                tokio::spawn(async move {
                    if let Err(e) = handle_raft_connection(stream, node).await {
                        error!("raft connection failed: {:#}", e);
                    }
                });
            }
            Err(e) => error!("failed to accept raft connection: {}", e),
        }
    }
}

async fn handle_raft_connection(mut stream: TcpStream, node: Arc<RaftNode>) -> Result<()> {
    let message: RaftMessage = read_frame(&mut stream).await?;
    match node.handle_raft_message(message).await {
        Ok(Some(response)) => write_frame(&mut stream, &response).await,
        Ok(None) => Ok(()),
        Err(e) => {
            // A durable-write failure mid-RPC; do not acknowledge it.
            error!(
                "[{}] fatal while handling raft rpc: {:#}",
                node.config.node_id, e
            );
            std::process::exit(1);
        }
    }
}

/// One client request per connection: read the frame, answer it, done.
async fn handle_client(mut stream: TcpStream, router: Arc<Router>) -> Result<()> {
    let request: ClientRequest = read_frame(&mut stream).await?;
    let response = router.handle(request).await;
    write_frame(&mut stream, &response).await
}
