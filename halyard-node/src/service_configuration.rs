use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use halyard_core::{ClusterView, NodeId, NodeRole};
use serde::{Deserialize, Serialize};

use crate::node_config::{ElectionMode, NodeConfig, DEFAULT_MAX_VALUE_SIZE};

/// configuration settings loaded from the config file
#[derive(Debug, Serialize, Deserialize)]
pub struct LoadConfiguration {
    /// Halyard cluster name
    pub cluster_name: String,
    /// Root directory; every node keeps its files under `<data_dir>/<node>`
    pub data_dir: String,
    /// Master lease duration in milliseconds (defaults to 3000)
    pub lease_ms: Option<u64>,
    /// Election mode, e.g. `{ mode: preferred, node: node_0 }` (defaults to elected)
    #[serde(default)]
    pub election: ElectionMode,
    /// Values above this many bytes are rejected (defaults to 8 MiB)
    pub max_value_size: Option<usize>,
    /// Write-ahead log tuning
    #[serde(default)]
    pub wal: WalNode,
    /// Learner catchup tuning
    #[serde(default)]
    pub catchup: CatchupNode,
    /// Cluster members
    pub nodes: Vec<NodeEntry>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WalNode {
    pub entries_per_segment: Option<u64>,
    pub cache_capacity: Option<usize>,
    /// Entries folded per collapse chunk
    pub collapse_chunk_size: Option<usize>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CatchupNode {
    pub batch_entries: Option<usize>,
    pub subscribe_wait_ms: Option<u64>,
}

/// One cluster member as written in the config file
#[derive(Debug, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: NodeId,
    pub role: NodeRole,
    /// Hostname or IP address the peer listener binds to
    pub host: String,
    /// Peer transport port
    pub port: u16,
    /// Prometheus metrics exporter port (optional)
    pub prometheus: Option<u16>,
    /// Catchup sources of a learner, tried in order (defaults to the voters)
    #[serde(default)]
    pub targets: Vec<NodeId>,
}

/// Resolved settings of one cluster member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEndpoint {
    pub role: NodeRole,
    pub peer_addr: SocketAddr,
    pub prom_exporter: Option<SocketAddr>,
    pub targets: Vec<NodeId>,
}

/// configuration settings for a Halyard cluster, resolved from the file
#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceConfiguration {
    pub cluster_name: String,
    pub data_dir: PathBuf,
    pub lease_duration: Duration,
    pub election_mode: ElectionMode,
    pub max_value_size: usize,
    pub entries_per_segment: u64,
    pub cache_capacity: usize,
    pub collapse_chunk_size: usize,
    pub batch_entries: usize,
    pub subscribe_wait: Duration,
    pub nodes: BTreeMap<NodeId, NodeEndpoint>,
}

/// Implementing the TryFrom trait to transform LoadConfiguration into ServiceConfiguration
impl TryFrom<LoadConfiguration> for ServiceConfiguration {
    type Error = anyhow::Error;

    fn try_from(config: LoadConfiguration) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        for entry in config.nodes {
            let peer_addr: SocketAddr = format!("{}:{}", entry.host, entry.port)
                .parse()
                .context(format!("Failed to create peer address for {}", entry.id))?;
            let prom_exporter = match entry.prometheus {
                Some(port) => Some(
                    format!("{}:{}", entry.host, port)
                        .parse()
                        .context(format!("Failed to create prom_exporter for {}", entry.id))?,
                ),
                None => None,
            };
            let endpoint = NodeEndpoint {
                role: entry.role,
                peer_addr,
                prom_exporter,
                targets: entry.targets,
            };
            if nodes.insert(entry.id.clone(), endpoint).is_some() {
                return Err(anyhow!("node {} is listed twice", entry.id));
            }
        }
        if !nodes.values().any(|n| n.role.is_voter()) {
            return Err(anyhow!("cluster {} has no voting node", config.cluster_name));
        }
        for (id, node) in &nodes {
            if let Some(missing) = node.targets.iter().find(|t| !nodes.contains_key(*t)) {
                return Err(anyhow!("node {} targets unknown node {}", id, missing));
            }
        }
        match &config.election {
            ElectionMode::Forced(n) | ElectionMode::Preferred(n) if !nodes.get(n).is_some_and(|e| e.role.is_voter()) => {
                return Err(anyhow!("election node {} is not a voting member", n));
            }
            _ => {}
        }

        Ok(ServiceConfiguration {
            cluster_name: config.cluster_name,
            data_dir: PathBuf::from(config.data_dir),
            lease_duration: Duration::from_millis(config.lease_ms.unwrap_or(3000)),
            election_mode: config.election,
            max_value_size: config.max_value_size.unwrap_or(DEFAULT_MAX_VALUE_SIZE),
            entries_per_segment: config.wal.entries_per_segment.unwrap_or(10_000),
            cache_capacity: config.wal.cache_capacity.unwrap_or(1024),
            collapse_chunk_size: config.wal.collapse_chunk_size.unwrap_or(256),
            batch_entries: config.catchup.batch_entries.unwrap_or(512),
            subscribe_wait: Duration::from_millis(config.catchup.subscribe_wait_ms.unwrap_or(500)),
            nodes,
        })
    }
}

impl ServiceConfiguration {
    /// Parse a YAML document and resolve it.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let load: LoadConfiguration = serde_yaml::from_str(content).context("Failed to parse configuration")?;
        load.try_into()
    }

    pub fn cluster_view(&self) -> ClusterView {
        self.nodes
            .iter()
            .fold(ClusterView::new(), |view, (id, n)| view.with_node(id.clone(), n.role))
    }

    pub fn peer_addrs(&self) -> HashMap<NodeId, SocketAddr> {
        self.nodes
            .iter()
            .map(|(id, n)| (id.clone(), n.peer_addr))
            .collect()
    }

    pub fn endpoint(&self, node: &str) -> Result<&NodeEndpoint> {
        self.nodes
            .get(node)
            .ok_or_else(|| anyhow!("node {} is not part of cluster {}", node, self.cluster_name))
    }

    /// Runtime settings of `node`, with its files under `<data_dir>/<node>`.
    pub fn node_config(&self, node: &str) -> Result<NodeConfig> {
        let endpoint = self.endpoint(node)?;
        let mut config = NodeConfig::new(
            node,
            NodeConfig::node_dir(&self.data_dir, node),
            self.cluster_view(),
        )
        .with_lease_duration(self.lease_duration)
        .with_election_mode(self.election_mode.clone())
        .with_entries_per_segment(self.entries_per_segment)
        .with_max_value_size(self.max_value_size)
        .with_learner_targets(endpoint.targets.clone());
        config.cache_capacity = self.cache_capacity;
        config.collapse_chunk_size = self.collapse_chunk_size;
        config.batch_entries = self.batch_entries;
        config.subscribe_wait = self.subscribe_wait;
        Ok(config)
    }
}
