use clap::Parser;

const EXAMPLES_TEXT: &str = r#"
EXAMPLES:
    # Run node_0 of the cluster described in the config file
    halyard-node --config-file config/halyard_cluster.yml --node-id node_0

    # Override the peer listener and expose Prometheus metrics
    halyard-node --config-file config/halyard_cluster.yml --node-id node_1 \
        --peer-addr 0.0.0.0:7101 --prom-exporter 0.0.0.0:9101
"#;

#[derive(Debug, Parser)]
#[command(name = "halyard-node", about = "Halyard replicated key-value store node")]
#[command(after_help = EXAMPLES_TEXT)]
pub(crate) struct Args {
    #[arg(long, help = "Path to the cluster config file (required)")]
    pub(crate) config_file: String,

    #[arg(long, help = "Which cluster member this process runs")]
    pub(crate) node_id: String,

    #[arg(long, help = "Peer listener address (overrides the config file)")]
    pub(crate) peer_addr: Option<String>,

    #[arg(long, help = "Prometheus exporter http address")]
    pub(crate) prom_exporter: Option<String>,

    #[arg(long, help = "Data directory root (overrides data_dir)")]
    pub(crate) data_dir: Option<String>,
}
