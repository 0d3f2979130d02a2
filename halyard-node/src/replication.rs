use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant as StdInstant;

use futures::stream::{FuturesUnordered, StreamExt};
use halyard_core::peer::{
    unreachable, AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
};
use halyard_core::{NodeId, PeerRequest, PeerResponse, PeerTransport, Result, StoreError};
use halyard_persistent_storage::{PersistentStorageError, SnapshotStore, StoredSnapshot, Wal};
use metrics::{counter, histogram};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::node::NodeShared;
use crate::node_config::NodeConfig;
use crate::node_metrics::{REPLICATION_APPEND_TOTAL, REPLICATION_COMMIT_LATENCY_MS};

/// Master's view of one follower.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PeerProgress {
    /// Next index to send.
    pub(crate) next_index: u64,
    /// Highest index known to match the master's log.
    pub(crate) match_index: u64,
    pub(crate) last_contact: Option<Instant>,
}

/// Pushes the master's log to every other voter.
///
/// Each follower is driven by at most one exchange at a time; its progress
/// survives between writes and heartbeats and is reset on every new epoch.
pub(crate) struct Replicator {
    config: Arc<NodeConfig>,
    wal: Wal,
    snapshots: Arc<SnapshotStore>,
    transport: Arc<dyn PeerTransport>,
    peers: BTreeMap<NodeId, Mutex<PeerProgress>>,
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("node_id", &self.config.node_id)
            .field("peers", &self.peers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Replicator {
    pub(crate) fn new(
        config: Arc<NodeConfig>,
        wal: Wal,
        snapshots: Arc<SnapshotStore>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        let peers = config
            .cluster
            .voters()
            .into_iter()
            .filter(|v| *v != config.node_id)
            .map(|v| {
                let progress = PeerProgress {
                    next_index: 1,
                    match_index: 0,
                    last_contact: None,
                };
                (v, Mutex::new(progress))
            })
            .collect();
        Self {
            config,
            wal,
            snapshots,
            transport,
            peers,
        }
    }

    /// Forget follower positions; a new master starts optimistic at its own tail.
    pub(crate) async fn reset(&self) {
        let next_index = self.wal.last_index() + 1;
        for progress in self.peers.values() {
            *progress.lock().await = PeerProgress {
                next_index,
                match_index: 0,
                last_contact: None,
            };
        }
    }

    /// Ship everything up to `upto` and wait until a majority of voters,
    /// this node included, holds it.
    pub(crate) async fn replicate(&self, epoch: u64, upto: u64, commit_index: u64) -> Result<()> {
        let needed = self.config.cluster.quorum();
        let started = StdInstant::now();
        // the local append already counts
        let mut acked = 1usize;
        let mut deposed = false;

        let mut calls: FuturesUnordered<_> = self
            .peers
            .keys()
            .map(|peer| self.sync_peer(peer, epoch, upto, commit_index))
            .collect();
        while acked < needed {
            let Some(res) = calls.next().await else { break };
            match res {
                Ok(matched) if matched >= upto => acked += 1,
                Ok(_) => {}
                Err(StoreError::NotMaster(_)) => deposed = true,
                Err(e) => trace!(target = "replication", error = %e, "follower did not acknowledge"),
            }
        }
        drop(calls);

        if deposed {
            return Err(StoreError::NotMaster(None));
        }
        if acked < needed {
            return Err(StoreError::QuorumUnavailable { granted: acked, needed });
        }
        histogram!(REPLICATION_COMMIT_LATENCY_MS.name).record(started.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    /// Best-effort sync of every follower; carries the commit index along.
    pub(crate) async fn heartbeat(&self, epoch: u64, commit_index: u64) {
        let upto = commit_index;
        let calls: FuturesUnordered<_> = self
            .peers
            .keys()
            .map(|peer| async move {
                if let Err(e) = self.sync_peer(peer, epoch, upto, commit_index).await {
                    trace!(target = "replication", peer = %peer, error = %e, "heartbeat not acknowledged");
                }
            })
            .collect();
        calls.collect::<Vec<()>>().await;
    }

    /// Whether `peer` answered within the last lease and matches `commit_index`.
    pub(crate) async fn caught_up(&self, peer: &str, commit_index: u64) -> bool {
        let Some(progress) = self.peers.get(peer) else {
            return false;
        };
        let Ok(progress) = progress.try_lock() else {
            return false;
        };
        let recent = progress
            .last_contact
            .is_some_and(|t| t.elapsed() < self.config.lease_duration);
        recent && progress.match_index >= commit_index
    }

    /// Last index known to match on each follower.
    pub(crate) async fn match_indices(&self) -> Vec<(NodeId, u64)> {
        let mut out = Vec::with_capacity(self.peers.len());
        for (peer, progress) in &self.peers {
            out.push((peer.clone(), progress.lock().await.match_index));
        }
        out
    }

    /// Bring one follower up to `upto`; returns its match index.
    async fn sync_peer(&self, peer: &str, epoch: u64, upto: u64, commit_index: u64) -> Result<u64> {
        let Some(slot) = self.peers.get(peer) else {
            return Err(unreachable(peer, "not a voter"));
        };
        let mut progress = slot.lock().await;
        loop {
            if progress.next_index < self.wal.first_index() {
                let installed = self.send_snapshot(peer, epoch).await?;
                progress.match_index = installed;
                progress.next_index = installed + 1;
                progress.last_contact = Some(Instant::now());
                continue;
            }

            let prev_index = progress.next_index - 1;
            let Some(prev_epoch) = self.wal.epoch_at(prev_index).await else {
                // prev fell below the WAL base
                progress.next_index = 0;
                continue;
            };
            let to = upto.min(prev_index + self.config.batch_entries as u64);
            let entries = if progress.next_index <= to {
                match self.wal.entries(progress.next_index, to).await {
                    Ok(entries) => entries,
                    Err(PersistentStorageError::Truncated { .. }) => {
                        progress.next_index = 0;
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            } else {
                Vec::new()
            };
            let sent = entries.len() as u64;

            let req = AppendEntriesRequest {
                epoch,
                master: self.config.node_id.clone(),
                prev_index,
                prev_epoch,
                entries,
                commit_index,
            };
            let resp = match self.call(peer, PeerRequest::AppendEntries(req)).await {
                Ok(PeerResponse::Appended(resp)) => resp,
                Ok(other) => {
                    counter!(REPLICATION_APPEND_TOTAL.name, "result" => "error").increment(1);
                    return Err(unreachable(peer, format!("unexpected response {other:?}")));
                }
                Err(e) => {
                    counter!(REPLICATION_APPEND_TOTAL.name, "result" => "error").increment(1);
                    return Err(e);
                }
            };
            progress.last_contact = Some(Instant::now());

            if resp.epoch > epoch {
                counter!(REPLICATION_APPEND_TOTAL.name, "result" => "deposed").increment(1);
                warn!(target = "replication", peer, epoch, follower_epoch = resp.epoch, "follower knows a newer epoch");
                return Err(StoreError::NotMaster(None));
            }
            if resp.success {
                counter!(REPLICATION_APPEND_TOTAL.name, "result" => "ok").increment(1);
                progress.match_index = prev_index + sent;
                progress.next_index = progress.match_index + 1;
                if progress.match_index >= upto {
                    return Ok(progress.match_index);
                }
            } else {
                counter!(REPLICATION_APPEND_TOTAL.name, "result" => "mismatch").increment(1);
                let hint = (resp.last_index + 1).min(prev_index).max(1);
                debug!(target = "replication", peer, prev_index, next_index = hint, "follower log mismatch, backing up");
                progress.next_index = hint;
            }
        }
    }

    async fn send_snapshot(&self, peer: &str, epoch: u64) -> Result<u64> {
        let active = self.snapshots.active().await;
        let req = InstallSnapshotRequest {
            epoch,
            master: self.config.node_id.clone(),
            snapshot: active.snapshot.clone(),
            snapshot_epoch: active.epoch,
        };
        info!(target = "replication", peer, up_to_index = active.up_to_index(), "follower is behind the log, sending snapshot");
        drop(active);
        match self.call(peer, PeerRequest::InstallSnapshot(req)).await? {
            PeerResponse::SnapshotInstalled { last_index } => {
                counter!(REPLICATION_APPEND_TOTAL.name, "result" => "snapshot").increment(1);
                Ok(last_index)
            }
            other => Err(unreachable(peer, format!("unexpected response {other:?}"))),
        }
    }

    async fn call(&self, to: &str, req: PeerRequest) -> Result<PeerResponse> {
        match tokio::time::timeout(self.config.lease_duration, self.transport.call(to, req)).await {
            Ok(resp) => resp?.into_result(),
            Err(_) => Err(unreachable(to, "timed out")),
        }
    }
}

// Follower side ----------------------------------------------------------

impl NodeShared {
    pub(crate) async fn on_append_entries(&self, req: AppendEntriesRequest) -> Result<PeerResponse> {
        if let Some(promised) = self.voter.admit(req.epoch, &req.master).await? {
            return Ok(PeerResponse::Appended(AppendEntriesResponse {
                success: false,
                last_index: self.wal.last_index(),
                epoch: promised,
            }));
        }
        self.yield_to_newer_master(req.epoch).await;

        let _guard = self.write_lock.lock().await;
        let last = self.wal.last_index();
        let refuse = |hint: u64| {
            PeerResponse::Appended(AppendEntriesResponse {
                success: false,
                last_index: hint,
                epoch: req.epoch,
            })
        };
        if req.prev_index > last {
            return Ok(refuse(last));
        }
        match self.wal.epoch_at(req.prev_index).await {
            Some(e) if e != req.prev_epoch => return Ok(refuse(req.prev_index.saturating_sub(1))),
            // matching, or below our base and therefore committed
            _ => {}
        }

        let matched_through = req.prev_index + req.entries.len() as u64;
        let mut fresh = Vec::with_capacity(req.entries.len());
        let mut diverged = false;
        for entry in req.entries {
            if !diverged && entry.index <= self.wal.last_index() {
                match self.wal.epoch_at(entry.index).await {
                    Some(e) if e != entry.epoch => {
                        if entry.index <= self.state.applied_index() {
                            return Err(StoreError::Fatal(format!(
                                "master rewrites applied entry {}",
                                entry.index
                            )));
                        }
                        self.wal.truncate_suffix(entry.index - 1).await?;
                        diverged = true;
                    }
                    _ => continue,
                }
            }
            fresh.push(entry);
        }
        if !fresh.is_empty() {
            self.wal.append_replicated(fresh).await?;
        }

        let commit = req.commit_index.min(matched_through);
        self.advance_commit(commit).await?;
        Ok(PeerResponse::Appended(AppendEntriesResponse {
            success: true,
            last_index: self.wal.last_index(),
            epoch: req.epoch,
        }))
    }

    pub(crate) async fn on_install_snapshot(&self, req: InstallSnapshotRequest) -> Result<PeerResponse> {
        if let Some(promised) = self.voter.admit(req.epoch, &req.master).await? {
            debug!(target = "replication", master = %req.master, epoch = req.epoch, promised, "snapshot from a stale master refused");
            return Err(StoreError::NotMaster(None));
        }
        self.yield_to_newer_master(req.epoch).await;

        let _guard = self.write_lock.lock().await;
        let up_to = req.snapshot.up_to_index;
        if up_to <= self.state.applied_index() {
            return Ok(PeerResponse::SnapshotInstalled { last_index: up_to });
        }
        self.install_remote_snapshot(req.snapshot, req.snapshot_epoch).await?;
        Ok(PeerResponse::SnapshotInstalled { last_index: up_to })
    }

    /// Replace local state with a snapshot received from a peer: snapshot
    /// file first, then the WAL base, then the in-memory key space.
    pub(crate) async fn install_remote_snapshot(
        &self,
        snapshot: halyard_core::Snapshot,
        epoch: u64,
    ) -> Result<()> {
        let _exclusive = self.collapser.try_acquire()?;
        let up_to = snapshot.up_to_index;
        let stored = self
            .snapshots
            .install(StoredSnapshot { snapshot, epoch }, "remote")
            .await?;
        self.wal.reset(up_to, epoch).await?;
        self.state.reset(&stored.snapshot, epoch).await;
        self.commit_index.fetch_max(up_to, std::sync::atomic::Ordering::AcqRel);
        info!(target = "replication", node = %self.config.node_id, up_to_index = up_to, epoch, "installed snapshot from peer");
        Ok(())
    }
}
