use std::sync::Arc;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tracing::trace;

use crate::errors::Result;
use crate::peer::{unreachable, PeerHandler, PeerRequest, PeerResponse, PeerTransport, ProcessControl};
use crate::types::NodeId;

/// In-process message bus connecting the nodes of a test cluster.
///
/// A node is "running" while its handler is registered. Requests are
/// delivered on a spawned task, so a caller that gives up waiting never
/// cancels a request the receiver has already started to handle.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    handlers: Arc<DashMap<NodeId, Arc<dyn PeerHandler>>>,
    isolated: Arc<DashSet<NodeId>>,
}

impl std::fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalNetwork")
            .field("running", &self.running())
            .field("isolated", &self.isolated.len())
            .finish()
    }
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: impl Into<NodeId>, handler: Arc<dyn PeerHandler>) {
        self.handlers.insert(node.into(), handler);
    }

    pub fn unregister(&self, node: &str) {
        self.handlers.remove(node);
    }

    /// Cut `node` off from every peer without stopping it.
    pub fn isolate(&self, node: impl Into<NodeId>) {
        self.isolated.insert(node.into());
    }

    pub fn heal(&self, node: &str) {
        self.isolated.remove(node);
    }

    pub fn running(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.handlers.iter().map(|e| e.key().clone()).collect();
        nodes.sort();
        nodes
    }

    /// Transport used by `node` to reach its peers.
    pub fn endpoint(&self, node: impl Into<NodeId>) -> LocalTransport {
        LocalTransport {
            me: node.into(),
            network: self.clone(),
        }
    }
}

impl ProcessControl for LocalNetwork {
    fn is_running(&self, node: &str) -> bool {
        self.handlers.contains_key(node)
    }
}

#[derive(Debug, Clone)]
pub struct LocalTransport {
    me: NodeId,
    network: LocalNetwork,
}

impl LocalTransport {
    pub fn node(&self) -> &str {
        &self.me
    }
}

#[async_trait]
impl PeerTransport for LocalTransport {
    async fn call(&self, to: &str, request: PeerRequest) -> Result<PeerResponse> {
        // a stopped node cannot send either
        if !self.network.is_running(&self.me) {
            return Err(unreachable(to, "sender is not running"));
        }
        if self.network.isolated.contains(&self.me) || self.network.isolated.contains(to) {
            return Err(unreachable(to, "link down"));
        }
        let handler = match self.network.handlers.get(to) {
            Some(h) => Arc::clone(h.value()),
            None => return Err(unreachable(to, "node is not running")),
        };

        trace!(target = "peer", from = %self.me, to = %to, kind = request.kind(), "local call");
        let from = self.me.clone();
        let task = tokio::spawn(async move { handler.handle(&from, request).await });
        task.await.map_err(|e| unreachable(to, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StoreError;

    struct Echo(NodeId);

    #[async_trait]
    impl PeerHandler for Echo {
        async fn handle(&self, from: &str, request: PeerRequest) -> PeerResponse {
            match request {
                PeerRequest::Status => PeerResponse::Error(StoreError::NotElected(format!(
                    "{} asked {}",
                    from, self.0
                ))),
                _ => PeerResponse::Relinquished,
            }
        }
    }

    #[tokio::test]
    async fn delivers_to_registered_handlers_only() {
        let net = LocalNetwork::new();
        net.register("a", Arc::new(Echo("a".into())));
        net.register("b", Arc::new(Echo("b".into())));

        let a = net.endpoint("a");
        let resp = a.call("b", PeerRequest::Status).await.unwrap();
        assert_eq!(
            resp,
            PeerResponse::Error(StoreError::NotElected("a asked b".into()))
        );

        net.unregister("b");
        assert!(!net.is_running("b"));
        assert!(a.call("b", PeerRequest::Status).await.is_err());

        // stopped sender
        let b = net.endpoint("b");
        assert!(b.call("a", PeerRequest::Status).await.is_err());
    }

    #[tokio::test]
    async fn isolation_drops_both_directions() {
        let net = LocalNetwork::new();
        net.register("a", Arc::new(Echo("a".into())));
        net.register("b", Arc::new(Echo("b".into())));
        net.isolate("a");

        assert!(net.endpoint("a").call("b", PeerRequest::Status).await.is_err());
        assert!(net.endpoint("b").call("a", PeerRequest::Status).await.is_err());

        net.heal("a");
        assert!(net.endpoint("b").call("a", PeerRequest::Status).await.is_ok());
        assert_eq!(net.running(), vec!["a", "b"]);
    }
}
