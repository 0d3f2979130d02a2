mod args_parse;

use std::fs::read_to_string;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use halyard_node::node_metrics::init_metrics;
use halyard_node::{NodeService, PeerServer, ServiceConfiguration, TcpTransport};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::args_parse::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Parse command line arguments
    let args = Args::parse();

    // Load the configuration from the specified YAML file
    let config_content = read_to_string(Path::new(&args.config_file))
        .context(format!("Failed to read config file {}", args.config_file))?;
    let mut service_config = ServiceConfiguration::from_yaml(&config_content)?;

    // If `data_dir` is provided via command-line args, override the value from the config file
    if let Some(data_dir) = args.data_dir {
        service_config.data_dir = PathBuf::from(data_dir);
    }

    let endpoint = service_config.endpoint(&args.node_id)?.clone();

    // If `peer_addr` is provided via command-line args, override the value from the config file
    let peer_addr: SocketAddr = match args.peer_addr {
        Some(addr) => addr
            .parse()
            .context(format!("Failed to parse into Socket address: {}", addr))?,
        None => endpoint.peer_addr,
    };

    // If `prom_exporter` is provided via command-line args, override the value from the config file
    let prom_exporter: Option<SocketAddr> = match args.prom_exporter {
        Some(addr) => Some(
            addr.parse()
                .context(format!("Failed to parse into Socket address: {}", addr))?,
        ),
        None => endpoint.prom_exporter,
    };

    // Init metrics with or without prometheus exporter
    init_metrics(prom_exporter, &args.node_id);

    let node_config = service_config.node_config(&args.node_id)?;
    let transport = Arc::new(TcpTransport::new(
        args.node_id.clone(),
        service_config.peer_addrs(),
    ));

    info!(
        "Opening Halyard node {} ({}) of cluster {}",
        args.node_id, endpoint.role, service_config.cluster_name
    );
    let node = NodeService::open(node_config, transport)
        .await
        .context("Failed to open node storage")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = PeerServer::bind(peer_addr, node.handler())
        .await
        .context(format!("Failed to bind peer listener on {}", peer_addr))?;
    let server_task = tokio::spawn(server.serve(shutdown_rx));

    node.start().await;
    info!("Halyard node {} has started successfully on {}", args.node_id, peer_addr);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down Halyard node {}", args.node_id);
    shutdown_tx.send_replace(true);
    node.stop().await;
    let _ = server_task.await;

    Ok(())
}
