use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use halyard_core::{
    ClusterUtilization, ClusterView, LocalNetwork, NodeId, NodeRole, ProcessControl, Result, StoreError,
};
use tokio::sync::Mutex;
use tracing::info;

use crate::node::wait_until;
use crate::node_config::NodeConfig;
use crate::node_service::NodeService;

type Customize = Arc<dyn Fn(NodeConfig) -> NodeConfig + Send + Sync>;

/// A whole cluster inside one process, wired through a [`LocalNetwork`].
///
/// Every node keeps its files under `<root>/<node>`, so a stopped node can
/// be restarted from disk.
pub struct LocalCluster {
    root: PathBuf,
    network: LocalNetwork,
    view: Mutex<ClusterView>,
    customize: Customize,
    running: Mutex<BTreeMap<NodeId, NodeService>>,
}

impl std::fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCluster")
            .field("root", &self.root)
            .field("network", &self.network)
            .finish()
    }
}

impl LocalCluster {
    /// Start every node of `view`; `customize` adjusts each node's config.
    pub async fn start<F>(root: impl AsRef<Path>, view: ClusterView, customize: F) -> Result<Self>
    where
        F: Fn(NodeConfig) -> NodeConfig + Send + Sync + 'static,
    {
        let cluster = Self {
            root: root.as_ref().to_path_buf(),
            network: LocalNetwork::new(),
            view: Mutex::new(view.clone()),
            customize: Arc::new(customize),
            running: Mutex::new(BTreeMap::new()),
        };
        for node in view.nodes.keys() {
            cluster.start_node(node).await?;
        }
        info!(target = "replication", nodes = view.nodes.len(), "local cluster started");
        Ok(cluster)
    }

    pub fn network(&self) -> &LocalNetwork {
        &self.network
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn view(&self) -> ClusterView {
        self.view.lock().await.clone()
    }

    pub async fn node_config(&self, node: &str) -> NodeConfig {
        let view = self.view.lock().await.clone();
        let base = NodeConfig::new(node, NodeConfig::node_dir(&self.root, node), view);
        (self.customize)(base)
    }

    /// Open `node` from its directory, register it on the network and start
    /// its background loop.
    pub async fn start_node(&self, node: &str) -> Result<NodeService> {
        let mut running = self.running.lock().await;
        if let Some(service) = running.get(node) {
            return Ok(service.clone());
        }
        let config = self.node_config(node).await;
        let transport = Arc::new(self.network.endpoint(node));
        let service = NodeService::open(config, transport).await?;
        self.network.register(node, service.handler());
        service.start().await;
        running.insert(node.to_string(), service.clone());
        info!(target = "replication", node, "local node started");
        Ok(service)
    }

    pub async fn stop_node(&self, node: &str) {
        let service = self.running.lock().await.remove(node);
        self.network.unregister(node);
        if let Some(service) = service {
            service.stop().await;
            info!(target = "replication", node, "local node stopped");
        }
    }

    pub async fn restart_node(&self, node: &str) -> Result<NodeService> {
        self.stop_node(node).await;
        self.start_node(node).await
    }

    /// Join a new node; existing members keep their view, which is enough
    /// for learners since they never vote.
    pub async fn add_node(&self, node: &str, role: NodeRole) -> Result<NodeService> {
        self.view.lock().await.insert(node, role);
        self.start_node(node).await
    }

    pub async fn node(&self, node: &str) -> Option<NodeService> {
        self.running.lock().await.get(node).cloned()
    }

    pub async fn running_nodes(&self) -> Vec<NodeService> {
        self.running.lock().await.values().cloned().collect()
    }

    /// The running node currently holding a valid lease.
    pub async fn master(&self) -> Option<NodeService> {
        for service in self.running_nodes().await {
            if service.is_master().await {
                return Some(service);
            }
        }
        None
    }

    /// Wait until some running node holds the lease and has opened its epoch.
    pub async fn wait_for_master(&self, timeout: Duration) -> Result<NodeService> {
        let found = wait_until(timeout, || async move {
            match self.master().await {
                Some(master) => master.applied_index() == master.last_index(),
                None => false,
            }
        })
        .await;
        match (found, self.master().await) {
            (true, Some(master)) => Ok(master),
            _ => Err(StoreError::NotMaster(None)),
        }
    }

    /// Wait until `node` is master.
    pub async fn wait_for_master_named(&self, node: &str, timeout: Duration) -> Result<NodeService> {
        let found = wait_until(timeout, || async move {
            match self.node(node).await {
                Some(service) => service.is_master().await,
                None => false,
            }
        })
        .await;
        match (found, self.node(node).await) {
            (true, Some(service)) => Ok(service),
            (_, current) => {
                let master = match current {
                    Some(service) => service.who_master().await,
                    None => None,
                };
                Err(StoreError::NotMaster(master))
            }
        }
    }

    /// Collapse on every running node.
    pub async fn collapse(&self, keep_segments: usize) -> Vec<(NodeId, Result<()>)> {
        let mut out = Vec::new();
        for service in self.running_nodes().await {
            let res = service.collapse(keep_segments).await.map(|_| ());
            out.push((service.id().to_string(), res));
        }
        out
    }

    /// Disk usage of every running node.
    pub async fn utilization(&self) -> Result<ClusterUtilization> {
        let mut total = ClusterUtilization::default();
        for service in self.running_nodes().await {
            let usage = service.storage_utilization().await?;
            total.nodes.insert(service.id().to_string(), usage);
        }
        Ok(total)
    }

    pub async fn stop_all(&self) {
        let nodes: Vec<NodeId> = self.running.lock().await.keys().cloned().collect();
        for node in nodes {
            self.stop_node(&node).await;
        }
    }
}

impl ProcessControl for LocalCluster {
    fn is_running(&self, node: &str) -> bool {
        self.network.is_running(node)
    }
}
