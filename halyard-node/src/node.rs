use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use halyard_core::peer::NodeStatus;
use halyard_core::{
    Lease, NodeId, NodeRole, Operation, PeerHandler, PeerRequest, PeerResponse, PeerTransport, Result,
    Statistics, StoreError,
};
use halyard_persistent_storage::{Collapser, SnapshotStore, Wal, WalConfig};
use metrics::{counter, gauge};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::catchup::LearnerPins;
use crate::election::{ElectionHost, Elector, Voter};
use crate::node_config::NodeConfig;
use crate::node_metrics::{NODE_HALTED, PEER_REQUESTS_TOTAL};
use crate::replication::Replicator;
use crate::sequence::SequenceExecutor;
use crate::state_machine::{AppliedState, StateMachine};

fn storage_err(e: std::io::Error) -> StoreError {
    StoreError::Storage(e.to_string())
}

/// Everything one running node owns, shared between the client executor,
/// the peer handler and the background election and catchup tasks.
pub(crate) struct NodeShared {
    pub(crate) config: Arc<NodeConfig>,
    pub(crate) wal: Wal,
    pub(crate) snapshots: Arc<SnapshotStore>,
    pub(crate) collapser: Arc<Collapser>,
    pub(crate) state: StateMachine,
    pub(crate) executor: SequenceExecutor,
    pub(crate) voter: Arc<Voter>,
    pub(crate) elector: Elector,
    pub(crate) transport: Arc<dyn PeerTransport>,
    pub(crate) replicator: Replicator,
    pub(crate) learner_pins: LearnerPins,
    pub(crate) stats: Mutex<Statistics>,
    /// Serializes log writers: client writes on the master, replication and
    /// catchup on followers and learners.
    pub(crate) write_lock: Mutex<()>,
    pub(crate) commit_index: AtomicU64,
    /// Epoch whose `MasterSet` entry is committed.
    opened_epoch: AtomicU64,
    heartbeat_busy: AtomicBool,
    halted: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    me: Weak<NodeShared>,
}

impl std::fmt::Debug for NodeShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeShared")
            .field("node_id", &self.config.node_id)
            .field("role", &self.config.role())
            .field("last_index", &self.wal.last_index())
            .field("applied_index", &self.state.applied_index())
            .field("halted", &self.is_halted())
            .finish()
    }
}

impl NodeShared {
    /// Open local storage and rebuild the key space. Nothing runs yet.
    pub(crate) async fn open(config: NodeConfig, transport: Arc<dyn PeerTransport>) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        tokio::fs::create_dir_all(config.log_dir()).await.map_err(storage_err)?;

        let mut wal_config = WalConfig::new(config.tlog_dir()).with_entries_per_segment(config.entries_per_segment);
        wal_config.cache_capacity = config.cache_capacity;
        let wal = Wal::open(wal_config).await?;
        let snapshots = Arc::new(SnapshotStore::open(config.db_dir()).await?);

        // a snapshot installed from a peer may be ahead of a WAL that was not reset yet
        let active = snapshots.active().await;
        if active.up_to_index() > wal.last_index() {
            warn!(
                target = "replication",
                node = %config.node_id,
                snapshot_up_to = active.up_to_index(),
                wal_last = wal.last_index(),
                "wal behind the active snapshot, resetting it"
            );
            wal.reset(active.up_to_index(), active.epoch).await?;
        }
        drop(active);

        let collapser = Arc::new(
            Collapser::new(wal.clone(), Arc::clone(&snapshots)).with_chunk_size(config.collapse_chunk_size),
        );
        let replay_log = config.role() == NodeRole::Learner;
        let state = StateMachine::rebuild(&wal, &snapshots, replay_log).await?;
        let voter = Arc::new(
            Voter::open(
                config.node_id.clone(),
                config.election_checkpoint(),
                config.lease_duration,
            )
            .await?,
        );
        let elector = Elector::new(Arc::clone(&config), Arc::clone(&voter), Arc::clone(&transport));
        let replicator = Replicator::new(
            Arc::clone(&config),
            wal.clone(),
            Arc::clone(&snapshots),
            Arc::clone(&transport),
        );
        let commit_index = state.applied_index();
        let (shutdown_tx, _) = watch::channel(false);
        gauge!(NODE_HALTED.name).set(0.0);

        info!(
            target = "replication",
            node = %config.node_id,
            role = %config.role(),
            first_index = wal.first_index(),
            last_index = wal.last_index(),
            applied_index = commit_index,
            "node storage opened"
        );

        Ok(Arc::new_cyclic(|me| NodeShared {
            executor: SequenceExecutor::new(config.max_value_size),
            learner_pins: LearnerPins::new(config.lease_duration * 4),
            config,
            wal,
            snapshots,
            collapser,
            state,
            voter,
            elector,
            transport,
            replicator,
            stats: Mutex::new(Statistics::new()),
            write_lock: Mutex::new(()),
            commit_index: AtomicU64::new(commit_index),
            opened_epoch: AtomicU64::new(0),
            heartbeat_busy: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            shutdown_tx,
            me: me.clone(),
        }))
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Stop background tasks and flush the WAL.
    pub(crate) async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        self.wal.shutdown().await;
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Stop serving for good after a storage failure the node cannot recover from.
    pub(crate) async fn halt(&self, reason: &str) {
        if self.halted.swap(true, Ordering::AcqRel) {
            return;
        }
        error!(target = "replication", node = %self.config.node_id, reason, "fatal storage failure, node halted");
        gauge!(NODE_HALTED.name).set(1.0);
        self.elector.step_down().await;
        self.shutdown_tx.send_replace(true);
    }

    /// Halt on `Fatal`; returns whether the node is now halted.
    pub(crate) async fn halt_if_fatal(&self, err: &StoreError) -> bool {
        match err {
            StoreError::Fatal(reason) => {
                self.halt(reason).await;
                true
            }
            StoreError::Halted => true,
            _ => false,
        }
    }

    pub(crate) fn check_running(&self) -> Result<()> {
        if self.is_halted() || self.wal.is_poisoned() {
            return Err(StoreError::Halted);
        }
        Ok(())
    }

    pub(crate) async fn who_master(&self) -> Option<NodeId> {
        if self.config.role() == NodeRole::Learner {
            return self.voter.observed().await.map(|l| l.holder);
        }
        self.elector.who_master().await
    }

    /// The lease this node holds, or `NotMaster` naming the master it knows.
    pub(crate) async fn master_lease(&self) -> Result<Lease> {
        if self.config.role().is_voter() {
            if let Some(lease) = self.elector.current_lease().await {
                if lease.is_held_by(&self.config.node_id) {
                    return Ok(lease);
                }
            }
        }
        Err(StoreError::NotMaster(self.who_master().await))
    }

    /// Run one client write on the master.
    ///
    /// `build` sees the applied key space and returns the operations to log
    /// plus the value handed back to the client. The batch is validated as a
    /// whole; on success exactly one entry is appended, replicated to a
    /// majority and applied before this returns.
    pub(crate) async fn write<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(&AppliedState) -> Result<(Vec<Operation>, T)>,
    {
        self.check_running()?;
        self.master_lease().await?;
        let _writer = self.write_lock.lock().await;
        let lease = self.master_lease().await?;
        self.settle(&lease).await?;

        // the lease must still be ours when the entry is created
        let lease = self.master_lease().await?;
        let (op, out) = {
            let applied = self.state.read().await;
            let (ops, out) = build(&applied)?;
            (self.executor.execute(&applied.state, ops)?, out)
        };
        if let Some(op) = op {
            let index = self.append(lease.epoch, op).await?;
            self.commit(&lease, index).await?;
        }
        Ok(out)
    }

    /// Make the log this master inherited durable: commit its `MasterSet`
    /// for the epoch, or an indeterminate tail left by an aborted write.
    /// Caller holds the write lock.
    async fn settle(&self, lease: &Lease) -> Result<()> {
        if self.opened_epoch.load(Ordering::Acquire) != lease.epoch {
            let index = self
                .append(
                    lease.epoch,
                    Operation::MasterSet {
                        master: self.config.node_id.clone(),
                        epoch: lease.epoch,
                    },
                )
                .await?;
            self.commit(lease, index).await?;
            self.opened_epoch.store(lease.epoch, Ordering::Release);
            info!(target = "replication", node = %self.config.node_id, epoch = lease.epoch, index, "master opened epoch");
            return Ok(());
        }
        let last = self.wal.last_index();
        if self.commit_index.load(Ordering::Acquire) < last {
            debug!(target = "replication", node = %self.config.node_id, upto = last, "committing indeterminate tail");
            self.commit(lease, last).await?;
        }
        Ok(())
    }

    async fn append(&self, epoch: u64, op: Operation) -> Result<u64> {
        match self.wal.append(epoch, op).await {
            Ok(index) => Ok(index),
            Err(e) => {
                let err = StoreError::from(e);
                self.halt_if_fatal(&err).await;
                Err(err)
            }
        }
    }

    async fn commit(&self, lease: &Lease, upto: u64) -> Result<()> {
        let commit = self.commit_index.load(Ordering::Acquire);
        match self.replicator.replicate(lease.epoch, upto, commit).await {
            Ok(()) => self.advance_commit(upto).await,
            Err(StoreError::NotMaster(_)) => {
                warn!(target = "replication", node = %self.config.node_id, epoch = lease.epoch, "deposed while replicating");
                self.elector.step_down().await;
                Err(StoreError::NotMaster(self.who_master().await))
            }
            Err(e) => Err(e),
        }
    }

    /// Raise the commit index and apply through it.
    pub(crate) async fn advance_commit(&self, upto: u64) -> Result<()> {
        self.commit_index.fetch_max(upto, Ordering::AcqRel);
        self.state.apply_from_wal(&self.wal, upto).await?;
        Ok(())
    }

    /// Drop our own lease when a peer shows a newer epoch.
    pub(crate) async fn yield_to_newer_master(&self, epoch: u64) {
        if let Some(lease) = self.elector.current_lease().await {
            if lease.epoch < epoch {
                warn!(target = "election", node = %self.config.node_id, held = lease.epoch, seen = epoch, "newer master seen, stepping down");
                self.elector.step_down().await;
            }
        }
    }

    pub(crate) async fn status(&self) -> NodeStatus {
        NodeStatus {
            node: self.config.node_id.clone(),
            role: self.config.role(),
            master: self.who_master().await,
            epoch: self.voter.promised_epoch().await,
            last_index: self.wal.last_index(),
            applied_index: self.state.applied_index(),
            first_index: self.wal.first_index(),
        }
    }

    async fn dispatch(&self, request: PeerRequest) -> Result<PeerResponse> {
        match request {
            PeerRequest::Prepare(req) => {
                if !self.config.role().is_voter() {
                    return Err(StoreError::NotElected(format!("{} is a learner", self.config.node_id)));
                }
                let local_last = self.log_position().await;
                Ok(PeerResponse::Vote(self.voter.on_prepare(&req, local_last).await?))
            }
            PeerRequest::Renew(req) => {
                self.yield_to_newer_master(req.epoch).await;
                let resp = self.voter.on_renew(&req, self.wal.last_index()).await?;
                Ok(PeerResponse::Renewed(resp))
            }
            PeerRequest::Relinquish { epoch, holder } => {
                self.voter.on_relinquish(epoch, &holder).await;
                Ok(PeerResponse::Relinquished)
            }
            PeerRequest::AppendEntries(req) => self.on_append_entries(req).await,
            PeerRequest::InstallSnapshot(req) => self.on_install_snapshot(req).await,
            PeerRequest::Catchup(req) => Ok(PeerResponse::Entries(self.serve_catchup(req).await?)),
            PeerRequest::Subscribe(req) => Ok(PeerResponse::Entries(self.serve_subscribe(req).await?)),
            PeerRequest::Status => Ok(PeerResponse::Status(self.status().await)),
        }
    }
}

#[async_trait]
impl PeerHandler for NodeShared {
    async fn handle(&self, from: &str, request: PeerRequest) -> PeerResponse {
        let kind = request.kind();
        counter!(PEER_REQUESTS_TOTAL.name, "kind" => kind).increment(1);
        if self.check_running().is_err() {
            return PeerResponse::Error(StoreError::Halted);
        }
        match self.dispatch(request).await {
            Ok(resp) => resp,
            Err(e) => {
                if self.halt_if_fatal(&e).await {
                    return PeerResponse::Error(StoreError::Halted);
                }
                debug!(target = "replication", node = %self.config.node_id, from, kind, error = %e, "peer request failed");
                PeerResponse::Error(e)
            }
        }
    }
}

#[async_trait]
impl ElectionHost for NodeShared {
    async fn log_position(&self) -> (u64, u64) {
        (self.wal.last_epoch().await, self.wal.last_index())
    }

    fn commit_index(&self) -> u64 {
        self.commit_index.load(Ordering::Acquire)
    }

    fn is_halted(&self) -> bool {
        NodeShared::is_halted(self)
    }

    async fn on_elected(&self, lease: &Lease) {
        self.replicator.reset().await;
        let Some(shared) = self.me.upgrade() else { return };
        let lease = lease.clone();
        // open the epoch right away so followers learn the new master
        tokio::spawn(async move {
            let _writer = shared.write_lock.lock().await;
            if let Err(e) = shared.settle(&lease).await {
                if !shared.halt_if_fatal(&e).await {
                    warn!(target = "replication", node = %shared.config.node_id, epoch = lease.epoch, error = %e, "could not open epoch yet");
                }
            }
        });
    }

    async fn on_demoted(&self) {
        info!(target = "election", node = %self.config.node_id, "no longer master");
    }

    async fn heartbeat(&self, lease: &Lease) {
        if self.heartbeat_busy.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(shared) = self.me.upgrade() else {
            self.heartbeat_busy.store(false, Ordering::Release);
            return;
        };
        let epoch = lease.epoch;
        tokio::spawn(async move {
            let commit = shared.commit_index.load(Ordering::Acquire);
            shared.replicator.heartbeat(epoch, commit).await;
            shared.heartbeat_busy.store(false, Ordering::Release);
        });
    }

    async fn caught_up(&self, node: &str) -> bool {
        let commit = self.commit_index.load(Ordering::Acquire);
        self.replicator.caught_up(node, commit).await
    }
}

/// Poll `check` every few milliseconds until it holds or `timeout` passes.
pub(crate) async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
