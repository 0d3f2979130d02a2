use std::sync::Arc;
use std::time::{Duration, Instant};

use halyard_core::peer::NodeStatus;
use halyard_core::{
    NodeId, NodeRole, OpCategory, Operation, PeerHandler, PeerTransport, Result, Statistics,
    StorageUtilization, StoreError,
};
use halyard_persistent_storage::utilization::dir_size;
use halyard_persistent_storage::{ChunkHook, CollapseReport};
use metrics::{counter, histogram};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::catchup::{run_learner, CatchupState};
use crate::election::ElectionState;
use crate::node::NodeShared;
use crate::node_config::NodeConfig;
use crate::node_metrics::{CLIENT_OPS_TOTAL, CLIENT_OP_LATENCY_MS};

/// A Halyard node: client operations, peer handling and the background
/// election or catchup loop.
///
/// Cloning is cheap; every clone drives the same node.
#[derive(Debug, Clone)]
pub struct NodeService {
    shared: Arc<NodeShared>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    catchup: watch::Receiver<CatchupState>,
    catchup_tx: Arc<watch::Sender<CatchupState>>,
}

impl NodeService {
    /// Open the node's storage under `config.data_dir`. Call [`start`](Self::start)
    /// once its handler is reachable by peers.
    pub async fn open(config: NodeConfig, transport: Arc<dyn PeerTransport>) -> Result<Self> {
        let shared = NodeShared::open(config, transport).await?;
        let (catchup_tx, catchup) = watch::channel(CatchupState::Bootstrapping);
        Ok(Self {
            shared,
            tasks: Arc::new(Mutex::new(Vec::new())),
            catchup,
            catchup_tx: Arc::new(catchup_tx),
        })
    }

    /// Inbound side for the transport.
    pub fn handler(&self) -> Arc<dyn PeerHandler> {
        self.shared.clone()
    }

    /// Spawn the election loop (voters) or the catchup loop (learners).
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }
        let shutdown = self.shared.shutdown_signal();
        let shared = Arc::clone(&self.shared);
        let handle = if self.shared.config.role().is_voter() {
            let elector = self.shared.elector.clone();
            tokio::spawn(async move { elector.run(shared, shutdown).await })
        } else {
            let state_tx = Arc::clone(&self.catchup_tx);
            tokio::spawn(async move { run_learner(shared, state_tx, shutdown).await })
        };
        tasks.push(handle);
        info!(target = "replication", node = %self.id(), role = %self.role(), "node started");
    }

    /// Stop background work and flush storage. The node stays readable from
    /// disk by a later [`open`](Self::open).
    pub async fn stop(&self) {
        self.shared.shutdown().await;
        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        info!(target = "replication", node = %self.id(), "node stopped");
    }

    pub fn id(&self) -> &str {
        &self.shared.config.node_id
    }

    pub fn role(&self) -> NodeRole {
        self.shared.config.role()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    pub fn is_halted(&self) -> bool {
        self.shared.is_halted()
    }

    // Client operations ---------------------------------------------------

    pub async fn set(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<()> {
        let op = Operation::set(key, value);
        self.timed(OpCategory::Set, self.shared.write(|_| Ok((vec![op], ()))))
            .await
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.timed(OpCategory::Get, async {
            self.shared.check_running()?;
            let applied = self.shared.state.read().await;
            applied
                .get(key)
                .cloned()
                .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))
        })
        .await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.timed(OpCategory::Get, async {
            self.shared.check_running()?;
            Ok(self.shared.state.read().await.contains(key))
        })
        .await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let op = Operation::delete(key);
        self.timed(OpCategory::Delete, self.shared.write(|_| Ok((vec![op], ()))))
            .await
    }

    /// Values of `keys` in order; fails on the first missing key.
    pub async fn multi_get(&self, keys: &[&str]) -> Result<Vec<Vec<u8>>> {
        self.timed(OpCategory::MultiGet, async {
            self.shared.check_running()?;
            let applied = self.shared.state.read().await;
            keys.iter()
                .map(|key| {
                    applied
                        .get(key)
                        .cloned()
                        .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))
                })
                .collect()
        })
        .await
    }

    /// Set `key` to `wanted` (delete it for `None`) when its current value
    /// equals `expected`. Returns the value found, whether or not it matched.
    pub async fn test_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        wanted: Option<Vec<u8>>,
    ) -> Result<Option<Vec<u8>>> {
        self.timed(
            OpCategory::TestAndSet,
            self.shared.write(|applied| {
                let current = applied.get(key).cloned();
                if current.as_deref() != expected {
                    return Ok((Vec::new(), current));
                }
                let op = match wanted {
                    Some(value) => Operation::set(key, value),
                    None if current.is_some() => Operation::delete(key),
                    None => return Ok((Vec::new(), current)),
                };
                Ok((vec![op], current))
            }),
        )
        .await
    }

    /// Fail with `AssertionFailed` unless `key` currently holds `expected`.
    pub async fn assert(&self, key: &str, expected: Option<Vec<u8>>) -> Result<()> {
        let op = Operation::assert(key, expected);
        self.timed(OpCategory::Other, self.shared.write(|_| Ok((vec![op], ()))))
            .await
    }

    /// Validate and log `ops` as one atomic entry.
    pub async fn sequence(&self, ops: Vec<Operation>) -> Result<()> {
        self.timed(OpCategory::Sequence, self.shared.write(|_| Ok((ops, ()))))
            .await
    }

    /// Key/value pairs between `first` and `last` in key order.
    pub async fn range(
        &self,
        first: Option<&str>,
        first_inclusive: bool,
        last: Option<&str>,
        last_inclusive: bool,
        max: Option<usize>,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        self.timed(OpCategory::Other, async {
            self.shared.check_running()?;
            let applied = self.shared.state.read().await;
            Ok(applied.range(first, first_inclusive, last, last_inclusive, max))
        })
        .await
    }

    pub async fn prefix_keys(&self, prefix: &str, max: Option<usize>) -> Result<Vec<String>> {
        self.timed(OpCategory::Other, async {
            self.shared.check_running()?;
            Ok(self.shared.state.read().await.prefix_keys(prefix, max))
        })
        .await
    }

    pub async fn key_count(&self) -> Result<usize> {
        self.shared.check_running()?;
        Ok(self.shared.state.read().await.len())
    }

    // Cluster and maintenance --------------------------------------------

    pub async fn who_master(&self) -> Option<NodeId> {
        self.shared.who_master().await
    }

    pub async fn is_master(&self) -> bool {
        self.shared.master_lease().await.is_ok()
    }

    pub async fn election_state(&self) -> ElectionState {
        self.shared.elector.get_state().await
    }

    pub fn catchup_state(&self) -> Option<CatchupState> {
        (!self.role().is_voter()).then(|| *self.catchup.borrow())
    }

    /// Wait until the learner loop reports `state`, up to `timeout`.
    pub async fn wait_for_catchup(&self, state: CatchupState, timeout: Duration) -> bool {
        let mut rx = self.catchup.clone();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == state))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    pub async fn status(&self) -> NodeStatus {
        self.shared.status().await
    }

    pub fn last_index(&self) -> u64 {
        self.shared.wal.last_index()
    }

    pub fn first_index(&self) -> u64 {
        self.shared.wal.first_index()
    }

    pub fn applied_index(&self) -> u64 {
        self.shared.state.applied_index()
    }

    /// Timing statistics with `node_is` filled in for this node and, on the
    /// master, every follower it replicates to.
    pub async fn statistics(&self) -> Statistics {
        let mut stats = self.shared.stats.lock().await.clone();
        stats.observe_node(self.id(), self.shared.wal.last_index());
        if self.shared.master_lease().await.is_ok() {
            for (peer, matched) in self.shared.replicator.match_indices().await {
                stats.observe_node(peer, matched);
            }
        }
        stats
    }

    pub async fn reset_statistics(&self) {
        self.shared.stats.lock().await.reset();
    }

    /// Bytes used by node logs, WAL segments and snapshots.
    pub async fn storage_utilization(&self) -> Result<StorageUtilization> {
        let log = dir_size(&self.shared.config.log_dir()).await?;
        Ok(StorageUtilization {
            log,
            tlog: self.shared.wal.disk_usage().await,
            db: self.shared.snapshots.disk_usage().await,
        })
    }

    /// Fold all but the newest `keep_segments` WAL segments into a new
    /// snapshot. Fails with `CollapseInProgress` while another collapse (or
    /// a snapshot install) runs on this node.
    pub async fn collapse(&self, keep_segments: usize) -> Result<CollapseReport> {
        self.shared.check_running()?;
        let applied = self.shared.state.applied_index();
        match self.shared.collapser.collapse(keep_segments.max(1), applied).await {
            Ok(report) => Ok(report),
            Err(e) => {
                let err = StoreError::from(e);
                self.shared.halt_if_fatal(&err).await;
                Err(err)
            }
        }
    }

    pub fn is_collapsing(&self) -> bool {
        self.shared.collapser.is_busy()
    }

    /// Delay every collapse chunk by `delay`; `None` or zero disables it.
    pub async fn set_collapse_slowdown(&self, delay: Option<Duration>) {
        self.shared.collapser.set_slowdown(delay).await;
    }

    pub async fn set_collapse_hook(&self, hook: Arc<dyn ChunkHook>) {
        self.shared.collapser.set_hook(hook).await;
    }

    async fn timed<T>(&self, category: OpCategory, op: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        let started = Instant::now();
        let res = op.await;
        let elapsed = started.elapsed();
        self.shared.stats.lock().await.record(category, elapsed);

        let outcome = match &res {
            Ok(_) => "ok",
            Err(StoreError::NotMaster(_)) => "not_master",
            Err(_) => "error",
        };
        counter!(CLIENT_OPS_TOTAL.name, "op" => category.info_name(), "result" => outcome).increment(1);
        histogram!(CLIENT_OP_LATENCY_MS.name, "op" => category.info_name()).record(elapsed.as_secs_f64() * 1000.0);
        if let Err(e) = &res {
            if matches!(e, StoreError::Fatal(_) | StoreError::Halted) {
                warn!(target = "replication", node = %self.id(), error = %e, "client operation hit a halted node");
            }
        }
        res
    }
}
