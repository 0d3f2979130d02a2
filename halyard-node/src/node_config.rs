use std::path::{Path, PathBuf};
use std::time::Duration;

use halyard_core::{ClusterView, NodeId, NodeRole};
use serde::{Deserialize, Serialize};

/// Largest value a single `Set` may carry unless configured otherwise.
pub const DEFAULT_MAX_VALUE_SIZE: usize = 8 * 1024 * 1024;

/// Who may campaign for the master lease.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", content = "node", rename_all = "snake_case")]
pub enum ElectionMode {
    /// Any voter may run.
    #[default]
    Elected,
    /// Only this node ever campaigns.
    Forced(NodeId),
    /// Any voter may run, but everyone else yields to this node once it is
    /// alive and caught up.
    Preferred(NodeId),
}

impl ElectionMode {
    pub fn may_campaign(&self, node: &str) -> bool {
        match self {
            ElectionMode::Forced(only) => only == node,
            _ => true,
        }
    }

    pub fn preferred(&self) -> Option<&str> {
        match self {
            ElectionMode::Preferred(node) | ElectionMode::Forced(node) => Some(node),
            ElectionMode::Elected => None,
        }
    }

    pub fn is_preferred(&self, node: &str) -> bool {
        self.preferred() == Some(node)
    }
}

/// Runtime settings of a single node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    /// Root of this node's files: `log/`, `tlog/` (WAL) and `db/` (snapshots).
    pub data_dir: PathBuf,
    pub cluster: ClusterView,
    pub lease_duration: Duration,
    pub election_mode: ElectionMode,
    pub entries_per_segment: u64,
    pub cache_capacity: usize,
    pub max_value_size: usize,
    /// Entries per AppendEntries / catchup batch.
    pub batch_entries: usize,
    /// Long-poll wait of a streaming learner.
    pub subscribe_wait: Duration,
    /// Catchup sources of a learner, tried in order.
    pub learner_targets: Vec<NodeId>,
    pub collapse_chunk_size: usize,
}

impl NodeConfig {
    pub fn new(node_id: impl Into<NodeId>, data_dir: impl Into<PathBuf>, cluster: ClusterView) -> Self {
        Self {
            node_id: node_id.into(),
            data_dir: data_dir.into(),
            cluster,
            lease_duration: Duration::from_secs(3),
            election_mode: ElectionMode::Elected,
            entries_per_segment: 10_000,
            cache_capacity: 1024,
            max_value_size: DEFAULT_MAX_VALUE_SIZE,
            batch_entries: 512,
            subscribe_wait: Duration::from_millis(500),
            learner_targets: Vec::new(),
            collapse_chunk_size: 256,
        }
    }

    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration = lease;
        self
    }

    pub fn with_election_mode(mut self, mode: ElectionMode) -> Self {
        self.election_mode = mode;
        self
    }

    pub fn with_entries_per_segment(mut self, n: u64) -> Self {
        self.entries_per_segment = n.max(1);
        self
    }

    pub fn with_max_value_size(mut self, limit: usize) -> Self {
        self.max_value_size = limit;
        self
    }

    pub fn with_learner_targets(mut self, targets: Vec<NodeId>) -> Self {
        self.learner_targets = targets;
        self
    }

    pub fn role(&self) -> NodeRole {
        self.cluster.role_of(&self.node_id).unwrap_or(NodeRole::Learner)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("log")
    }

    pub fn tlog_dir(&self) -> PathBuf {
        self.data_dir.join("tlog")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    pub fn election_checkpoint(&self) -> PathBuf {
        self.log_dir().join("election.ckpt")
    }

    /// The holder renews three times per lease.
    pub fn renew_interval(&self) -> Duration {
        self.lease_duration / 3
    }

    /// Upper bound on a single peer call made on behalf of the lease.
    pub fn rpc_timeout(&self) -> Duration {
        (self.lease_duration / 4).max(Duration::from_millis(20))
    }

    /// Sources the learner pulls from: the configured targets, else every voter.
    pub fn catchup_sources(&self) -> Vec<NodeId> {
        if self.learner_targets.is_empty() {
            self.cluster.voters()
        } else {
            self.learner_targets.clone()
        }
    }

    pub fn node_dir(root: &Path, node: &str) -> PathBuf {
        root.join(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_mode_restricts_campaigns() {
        let mode = ElectionMode::Forced("node_1".into());
        assert!(mode.may_campaign("node_1"));
        assert!(!mode.may_campaign("node_0"));
        assert!(ElectionMode::Elected.may_campaign("node_0"));
        assert!(ElectionMode::Preferred("node_2".into()).may_campaign("node_0"));
        assert!(ElectionMode::Preferred("node_2".into()).is_preferred("node_2"));
    }

    #[test]
    fn learners_fall_back_to_voters() {
        let cluster = ClusterView::new()
            .with_node("node_0", NodeRole::Master)
            .with_node("node_1", NodeRole::Slave)
            .with_node("node_2", NodeRole::Learner);
        let cfg = NodeConfig::new("node_2", "/tmp/x", cluster);
        assert_eq!(cfg.role(), NodeRole::Learner);
        assert_eq!(cfg.catchup_sources(), vec!["node_0".to_string(), "node_1".to_string()]);

        let cfg = cfg.with_learner_targets(vec!["node_1".into()]);
        assert_eq!(cfg.catchup_sources(), vec!["node_1".to_string()]);
    }

    #[test]
    fn election_mode_from_yaml() {
        let mode: ElectionMode = serde_yaml::from_str("mode: preferred\nnode: node_0\n").unwrap();
        assert_eq!(mode, ElectionMode::Preferred("node_0".into()));
        let mode: ElectionMode = serde_yaml::from_str("mode: elected\n").unwrap();
        assert_eq!(mode, ElectionMode::Elected);
    }
}
