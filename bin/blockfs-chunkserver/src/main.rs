//! blockfs chunkserver - data node daemon
//!
//! This binary holds blocks on local disks, serves reads, accepts
//! pipelined replicated writes, and reconciles its inventory with the
//! nameserver.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tonic::transport::Server;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use blockfs_common::ChunkServerConfig;
use blockfs_node::counters::Counters;
use blockfs_node::manager::open_manager;
use blockfs_node::pool::TaskPool;
use blockfs_node::replica::PullReplicator;
use blockfs_node::reporter::Reporter;
use blockfs_node::rpc::{NameServerApi, PeerChannel, TonicNameServer, TonicPeers};
use blockfs_node::service::ChunkServerImpl;
use blockfs_node::web::{serve_status_page, StatusState};
use blockfs_proto::chunkserver::chunk_server_server::ChunkServerServer;

#[derive(Parser, Debug)]
#[command(name = "blockfs-chunkserver")]
#[command(about = "blockfs chunk-serving data node")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/blockfs/chunkserver.toml")]
    config: String,

    /// Comma-separated store directories (overrides the config file)
    #[arg(long)]
    block_store_path: Option<String>,

    /// Nameserver host (overrides the config file)
    #[arg(long)]
    nameserver: Option<String>,

    /// Port to listen on (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Status page port
    #[arg(long, default_value = "8080")]
    status_port: u16,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ChunkServerConfig::load(&args.config)
        .with_context(|| format!("load config {}", args.config))?;
    if let Some(paths) = args.block_store_path {
        config.block_store_path = paths;
    }
    if let Some(nameserver) = args.nameserver {
        config.nameserver = nameserver;
    }
    if let Some(port) = args.port {
        config.chunkserver_port = port;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting blockfs chunkserver");
    info!("config file: {}", args.config);
    info!("store paths: {}", config.block_store_path);
    info!("nameserver: {}", config.nameserver_addr());

    // Registry and meta store; failure here is fatal.
    let counters = Arc::new(Counters::default());
    let manager = Arc::new(
        open_manager(&config, Arc::clone(&counters)).context("initialize block manager")?,
    );

    let work_pool = TaskPool::new(
        "work",
        config.chunkserver_work_thread_num,
        config.chunkserver_max_pending_buffers.max(16) as usize,
    );
    let read_pool = TaskPool::new("read", config.chunkserver_read_thread_num, 1024);
    let write_pool = TaskPool::new("write", config.chunkserver_write_thread_num, 1024);
    let heartbeat_pool = TaskPool::new("heartbeat", 1, 8);

    let peers: Arc<dyn PeerChannel> = Arc::new(TonicPeers::new());
    let ns: Arc<dyn NameServerApi> = Arc::new(TonicNameServer::new(config.nameserver_addr()));

    let replicator = Arc::new(PullReplicator::new(
        Arc::clone(&manager),
        Arc::clone(&peers),
        Arc::clone(&ns),
    ));

    let data_server_addr = format!(
        "{}:{}",
        hostname().unwrap_or_else(|| "127.0.0.1".to_string()),
        config.chunkserver_port
    );
    let reporter = Reporter::new(
        Arc::clone(&manager),
        Arc::clone(&ns),
        replicator,
        Arc::clone(&counters),
        Arc::clone(&work_pool),
        Arc::clone(&write_pool),
        heartbeat_pool,
        data_server_addr,
        config.heartbeat_interval * 1000,
        config.blockreport_interval * 1000,
        config.blockreport_size,
    );
    let mut fatal_report = reporter.shutdown_signal();

    let service = ChunkServerImpl::new(
        Arc::clone(&manager),
        Arc::clone(&counters),
        peers,
        Arc::clone(&reporter),
        work_pool,
        read_pool,
        write_pool,
        config.chunkserver_max_pending_buffers,
        config.write_buf_size,
    );
    service.start();

    // Status page runs beside the data path.
    let status_state = Arc::new(StatusState {
        counters,
        manager,
        start_time: Instant::now(),
    });
    let status_port = args.status_port;
    tokio::spawn(async move {
        if let Err(e) = serve_status_page(status_port, status_state).await {
            error!("status page error: {}", e);
        }
    });

    let addr: SocketAddr = format!("0.0.0.0:{}", config.chunkserver_port)
        .parse()
        .context("parse listen address")?;
    info!("starting gRPC server on {}", addr);

    let grpc = ChunkServerServer::new(service.clone())
        .max_decoding_message_size(64 * 1024 * 1024)
        .max_encoding_message_size(64 * 1024 * 1024);

    Server::builder()
        .add_service(grpc)
        .serve_with_shutdown(addr, async {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutting down on signal");
                }
                _ = fatal_report.changed() => {
                    error!("nameserver rejected this node, shutting down");
                }
            }
        })
        .await
        .context("gRPC server")?;

    // Drain the pools before the registry goes away.
    service.stop().await;
    info!("chunkserver shut down gracefully");

    Ok(())
}

fn hostname() -> Option<String> {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
