use std::path::PathBuf;
use std::time::Duration;

use halyard_core::peer::{RenewRequest, RenewResponse, VoteRequest, VoteResponse};
use halyard_core::{Lease, NodeId};
use halyard_persistent_storage::{read_checkpoint, write_checkpoint, ElectionCheckpoint, PersistentStorageError};
use metrics::gauge;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::node_metrics::ELECTION_EPOCH;

/// Last time the preferred node asked for a vote, with its log position.
#[derive(Debug, Clone, Copy)]
struct PreferredSighting {
    at: Instant,
    last_epoch: u64,
    last_index: u64,
}

#[derive(Debug, Default)]
struct VoterState {
    promised_epoch: u64,
    promised_to: Option<NodeId>,
    /// Lease this voter believes in, measured from when it granted or renewed it.
    observed: Option<Lease>,
    preferred_seen: Option<PreferredSighting>,
    commit_hint: u64,
}

/// Acceptor side of the lease protocol.
///
/// Every promise is persisted before the answer leaves, so a restarted
/// voter never grants the same epoch twice. For one lease after start it
/// refuses every vote: it may have forgotten a lease it granted.
#[derive(Debug)]
pub(crate) struct Voter {
    node_id: NodeId,
    ckpt_path: PathBuf,
    lease_duration: Duration,
    quiet_until: Instant,
    state: Mutex<VoterState>,
}

impl Voter {
    pub(crate) async fn open(
        node_id: NodeId,
        ckpt_path: PathBuf,
        lease_duration: Duration,
    ) -> Result<Self, PersistentStorageError> {
        let ckpt: ElectionCheckpoint = read_checkpoint(&ckpt_path).await?.unwrap_or_default();
        if ckpt.promised_epoch > 0 {
            info!(
                target = "election",
                node = %node_id,
                promised_epoch = ckpt.promised_epoch,
                promised_to = ?ckpt.promised_to,
                "restored election promise"
            );
        }
        gauge!(ELECTION_EPOCH.name).set(ckpt.promised_epoch as f64);
        Ok(Self {
            node_id,
            ckpt_path,
            lease_duration,
            quiet_until: Instant::now() + lease_duration,
            state: Mutex::new(VoterState {
                promised_epoch: ckpt.promised_epoch,
                promised_to: ckpt.promised_to,
                ..Default::default()
            }),
        })
    }

    pub(crate) fn quiet_until(&self) -> Instant {
        self.quiet_until
    }

    pub(crate) fn in_quiet_period(&self) -> bool {
        Instant::now() < self.quiet_until
    }

    pub(crate) async fn promised_epoch(&self) -> u64 {
        self.state.lock().await.promised_epoch
    }

    pub(crate) async fn commit_hint(&self) -> u64 {
        self.state.lock().await.commit_hint
    }

    /// The lease this voter currently believes in, if still valid.
    pub(crate) async fn observed(&self) -> Option<Lease> {
        self.state.lock().await.observed.clone().filter(Lease::is_valid)
    }

    /// Record a master announced by a catchup source (learners only).
    pub(crate) async fn observe(&self, holder: NodeId, epoch: u64) {
        let mut state = self.state.lock().await;
        if state.observed.as_ref().is_some_and(|l| l.epoch > epoch) {
            return;
        }
        state.observed = Some(Lease::new(holder, epoch, Instant::now() + self.lease_duration, false));
    }

    /// Whether a non-preferred node should hold back its candidacy: the
    /// preferred node asked for votes within the last lease with a log at
    /// least as up to date as ours.
    pub(crate) async fn defers_to_preferred(&self, last_epoch: u64, last_index: u64) -> bool {
        let state = self.state.lock().await;
        match state.preferred_seen {
            Some(seen) => {
                seen.at.elapsed() < self.lease_duration
                    && (seen.last_epoch, seen.last_index) >= (last_epoch, last_index)
            }
            None => false,
        }
    }

    pub(crate) async fn on_prepare(
        &self,
        req: &VoteRequest,
        local_last: (u64, u64),
    ) -> Result<VoteResponse, PersistentStorageError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if req.preferred {
            state.preferred_seen = Some(PreferredSighting {
                at: now,
                last_epoch: req.last_epoch,
                last_index: req.last_index,
            });
        }

        let refusal = if now < self.quiet_until {
            Some("voter is in its startup quiet period".to_string())
        } else if req.epoch <= state.promised_epoch {
            Some(format!(
                "epoch {} already promised to {}",
                state.promised_epoch,
                state.promised_to.as_deref().unwrap_or("nobody")
            ))
        } else if let Some(lease) = state
            .observed
            .as_ref()
            .filter(|l| l.is_valid_at(now) && l.holder != req.candidate)
        {
            Some(format!("lease held by {} at epoch {}", lease.holder, lease.epoch))
        } else if (req.last_epoch, req.last_index) < local_last {
            Some(format!(
                "candidate log ({}, {}) behind ({}, {})",
                req.last_epoch, req.last_index, local_last.0, local_last.1
            ))
        } else {
            None
        };

        if let Some(reason) = refusal {
            debug!(
                target = "election",
                voter = %self.node_id,
                candidate = %req.candidate,
                epoch = req.epoch,
                reason = %reason,
                "vote refused"
            );
            return Ok(VoteResponse {
                granted: false,
                voter: self.node_id.clone(),
                promised_epoch: state.promised_epoch,
                last_index: local_last.1,
                reason: Some(reason),
            });
        }

        self.promise(&mut state, req.epoch, &req.candidate).await?;
        state.observed = Some(Lease::new(
            req.candidate.clone(),
            req.epoch,
            now + self.lease_duration,
            req.preferred,
        ));
        debug!(target = "election", voter = %self.node_id, candidate = %req.candidate, epoch = req.epoch, "vote granted");
        Ok(VoteResponse {
            granted: true,
            voter: self.node_id.clone(),
            promised_epoch: req.epoch,
            last_index: local_last.1,
            reason: None,
        })
    }

    pub(crate) async fn on_renew(
        &self,
        req: &RenewRequest,
        last_index: u64,
    ) -> Result<RenewResponse, PersistentStorageError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        if req.epoch < state.promised_epoch {
            return Ok(RenewResponse {
                accepted: false,
                voter: self.node_id.clone(),
                promised_epoch: state.promised_epoch,
                last_index,
            });
        }
        if req.epoch > state.promised_epoch {
            self.promise(&mut state, req.epoch, &req.holder).await?;
        }
        state.observed = Some(Lease::new(
            req.holder.clone(),
            req.epoch,
            now + self.lease_duration,
            req.preferred,
        ));
        state.commit_hint = state.commit_hint.max(req.commit_index);
        Ok(RenewResponse {
            accepted: true,
            voter: self.node_id.clone(),
            promised_epoch: req.epoch,
            last_index,
        })
    }

    /// The holder gave its lease up; forget it so a new round can start at once.
    pub(crate) async fn on_relinquish(&self, epoch: u64, holder: &str) {
        let mut state = self.state.lock().await;
        if state
            .observed
            .as_ref()
            .is_some_and(|l| l.epoch == epoch && l.holder == holder)
        {
            state.observed = None;
            info!(target = "election", voter = %self.node_id, holder, epoch, "lease relinquished");
        }
    }

    /// Gate for replication traffic from `master` at `epoch`.
    ///
    /// Returns `Ok(None)` when admitted, `Ok(Some(promised))` when the sender
    /// is stale. A newer epoch is adopted and persisted.
    pub(crate) async fn admit(&self, epoch: u64, master: &str) -> Result<Option<u64>, PersistentStorageError> {
        let mut state = self.state.lock().await;
        if epoch < state.promised_epoch {
            return Ok(Some(state.promised_epoch));
        }
        if epoch > state.promised_epoch {
            self.promise(&mut state, epoch, master).await?;
        }
        if state.observed.as_ref().map_or(true, |l| l.epoch < epoch) {
            state.observed = Some(Lease::new(master, epoch, Instant::now() + self.lease_duration, false));
        }
        Ok(None)
    }

    async fn promise(&self, state: &mut VoterState, epoch: u64, to: &str) -> Result<(), PersistentStorageError> {
        let ckpt = ElectionCheckpoint {
            promised_epoch: epoch,
            promised_to: Some(to.to_string()),
        };
        write_checkpoint(&self.ckpt_path, &ckpt).await?;
        state.promised_epoch = epoch;
        state.promised_to = ckpt.promised_to;
        gauge!(ELECTION_EPOCH.name).set(epoch as f64);
        Ok(())
    }
}
