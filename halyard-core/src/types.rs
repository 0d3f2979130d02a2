use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Cluster-unique node name, e.g. `"node_0"`.
pub type NodeId = String;

/// Role a node plays in the cluster.
///
/// `Master` and `Slave` are voters and may both hold the lease over time;
/// `Learner` receives entries but never votes, never campaigns and never
/// serves writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeRole {
    Master,
    Slave,
    Learner,
}

impl NodeRole {
    pub fn is_voter(&self) -> bool {
        !matches!(self, NodeRole::Learner)
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Master => write!(f, "master"),
            NodeRole::Slave => write!(f, "slave"),
            NodeRole::Learner => write!(f, "learner"),
        }
    }
}

/// Static membership of a cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterView {
    pub nodes: BTreeMap<NodeId, NodeRole>,
}

impl ClusterView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node(mut self, id: impl Into<NodeId>, role: NodeRole) -> Self {
        self.nodes.insert(id.into(), role);
        self
    }

    pub fn insert(&mut self, id: impl Into<NodeId>, role: NodeRole) {
        self.nodes.insert(id.into(), role);
    }

    pub fn role_of(&self, id: &str) -> Option<NodeRole> {
        self.nodes.get(id).copied()
    }

    /// Nodes that take part in elections, in name order.
    pub fn voters(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, role)| role.is_voter())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn learners(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|(_, role)| !role.is_voter())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Majority of voters: `voters / 2 + 1`.
    pub fn quorum(&self) -> usize {
        self.voters().len() / 2 + 1
    }

    pub fn is_voter(&self, id: &str) -> bool {
        self.role_of(id).map(|r| r.is_voter()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn learners_do_not_count_towards_quorum() {
        let view = ClusterView::new()
            .with_node("node_0", NodeRole::Slave)
            .with_node("node_1", NodeRole::Slave)
            .with_node("node_2", NodeRole::Slave)
            .with_node("learner_0", NodeRole::Learner);

        assert_eq!(view.voters(), vec!["node_0", "node_1", "node_2"]);
        assert_eq!(view.learners(), vec!["learner_0"]);
        assert_eq!(view.quorum(), 2);
        assert!(!view.is_voter("learner_0"));
        assert!(!view.is_voter("missing"));
    }

    #[test]
    fn single_node_quorum_is_one() {
        let view = ClusterView::new().with_node("solo", NodeRole::Master);
        assert_eq!(view.quorum(), 1);
    }
}
