use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};

pub(crate) struct Metric {
    pub name: &'static str,
    description: &'static str,
}

pub(crate) const COUNTERS: [Metric; 7] = [
    ELECTION_ROUNDS_TOTAL,
    LEASE_RENEWALS_TOTAL,
    LEASE_RELINQUISH_TOTAL,
    CLIENT_OPS_TOTAL,
    REPLICATION_APPEND_TOTAL,
    CATCHUP_BATCHES_TOTAL,
    PEER_REQUESTS_TOTAL,
];
pub(crate) const GAUGES: [Metric; 4] = [
    ELECTION_STATE,
    ELECTION_EPOCH,
    APPLIED_INDEX,
    NODE_HALTED,
];
pub(crate) const HISTOGRAMS: [Metric; 2] = [CLIENT_OP_LATENCY_MS, REPLICATION_COMMIT_LATENCY_MS];

// ELECTION Metrics --------------------------

pub(crate) const ELECTION_STATE: Metric = Metric {
    name: "halyard_election_state",
    description: "Election state of this node (0=no master known,1=master,2=slave)",
};

pub(crate) const ELECTION_EPOCH: Metric = Metric {
    name: "halyard_election_epoch",
    description: "Highest lease epoch this node has promised or held",
};

pub(crate) const ELECTION_ROUNDS_TOTAL: Metric = Metric {
    name: "halyard_election_rounds_total",
    description: "Total election rounds run by this node, labelled by result",
};

pub(crate) const LEASE_RENEWALS_TOTAL: Metric = Metric {
    name: "halyard_lease_renewals_total",
    description: "Total lease renewal rounds run by the master, labelled by result",
};

pub(crate) const LEASE_RELINQUISH_TOTAL: Metric = Metric {
    name: "halyard_lease_relinquish_total",
    description: "Total leases handed over to the preferred master",
};

// CLIENT Metrics --------------------------

pub(crate) const CLIENT_OPS_TOTAL: Metric = Metric {
    name: "halyard_client_ops_total",
    description: "Total client operations executed, labelled by op and result",
};

pub(crate) const CLIENT_OP_LATENCY_MS: Metric = Metric {
    name: "halyard_client_op_latency_ms",
    description: "Latency of client operations in milliseconds",
};

// REPLICATION Metrics --------------------------

pub(crate) const REPLICATION_APPEND_TOTAL: Metric = Metric {
    name: "halyard_replication_append_total",
    description: "Total AppendEntries / InstallSnapshot calls sent by the master, labelled by result",
};

pub(crate) const REPLICATION_COMMIT_LATENCY_MS: Metric = Metric {
    name: "halyard_replication_commit_latency_ms",
    description: "Time from local append to majority acknowledgement in milliseconds",
};

pub(crate) const APPLIED_INDEX: Metric = Metric {
    name: "halyard_applied_index",
    description: "Highest log index applied to the key space",
};

pub(crate) const CATCHUP_BATCHES_TOTAL: Metric = Metric {
    name: "halyard_catchup_batches_total",
    description: "Total catchup batches served or received, labelled by side and kind",
};

// NODE Metrics --------------------------

pub(crate) const PEER_REQUESTS_TOTAL: Metric = Metric {
    name: "halyard_peer_requests_total",
    description: "Total peer requests handled, labelled by kind",
};

pub(crate) const NODE_HALTED: Metric = Metric {
    name: "halyard_node_halted",
    description: "1 once the node halted after a fatal storage failure",
};

pub fn init_metrics(prom_addr: Option<std::net::SocketAddr>, node_id: &str) {
    info!("initializing metrics exporter");

    if let Some(addr) = prom_addr {
        if let Err(e) = PrometheusBuilder::new()
            .with_http_listener(addr)
            .add_global_label("node", node_id.to_string())
            .install()
        {
            warn!(error = %e, "failed to install Prometheus recorder");
        }
    }

    for name in COUNTERS {
        register_counter(name)
    }

    for name in GAUGES {
        register_gauge(name)
    }

    for name in HISTOGRAMS {
        register_histogram(name)
    }

    halyard_persistent_storage::persistent_metrics::describe_metrics();
}

fn register_counter(metric: Metric) {
    metrics::describe_counter!(metric.name, metric.description);
    let _counter = metrics::counter!(metric.name);
}

fn register_gauge(metric: Metric) {
    metrics::describe_gauge!(metric.name, metric.description);
    let _gauge = metrics::gauge!(metric.name);
}

fn register_histogram(metric: Metric) {
    metrics::describe_histogram!(metric.name, metric.description);
    let _histogram = metrics::histogram!(metric.name);
}
