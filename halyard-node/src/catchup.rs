use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use halyard_core::peer::{CatchupBatch, CatchupRequest, SubscribeRequest};
use halyard_core::{NodeId, PeerRequest, PeerResponse, Result, StoreError};
use halyard_persistent_storage::{PersistentStorageError, PinGuard, Wal};
use metrics::counter;
use rand::{rng, Rng};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::node::NodeShared;
use crate::node_metrics::CATCHUP_BATCHES_TOTAL;

/// Where a learner stands relative to its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatchupState {
    /// Pulling full batches, possibly starting from the source's snapshot.
    Bootstrapping,
    /// Close behind; long-polling for new entries.
    Streaming,
    /// Holds everything the source had applied at the last answer.
    CaughtUp,
}

/// WAL pins held on behalf of learners, so a collapse on the source never
/// removes entries a learner is about to ask for.
///
/// A pin lives until the learner's next request or the TTL, whichever
/// comes first.
#[derive(Debug)]
pub(crate) struct LearnerPins {
    pins: DashMap<NodeId, (PinGuard, Instant)>,
    ttl: Duration,
}

impl LearnerPins {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            pins: DashMap::new(),
            ttl,
        }
    }

    pub(crate) fn pin(&self, wal: &Wal, learner: &str, index: u64) {
        self.pins
            .insert(learner.to_string(), (wal.pin(index), Instant::now()));
    }

    /// Drop pins of learners that went quiet.
    pub(crate) fn sweep(&self) {
        let ttl = self.ttl;
        self.pins.retain(|learner, (_, at)| {
            let keep = at.elapsed() < ttl;
            if !keep {
                debug!(target = "catchup", learner = %learner, "learner pin expired");
            }
            keep
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.pins.len()
    }
}

// Source side ------------------------------------------------------------

impl NodeShared {
    /// Serve applied entries from `from_index`, starting with the active
    /// snapshot when that range was already collapsed.
    pub(crate) async fn serve_catchup(&self, req: CatchupRequest) -> Result<CatchupBatch> {
        self.learner_pins.sweep();
        let from = req.from_index.max(1);
        let max = req.max_entries.clamp(1, self.config.batch_entries.max(1));

        // a collapse may race with the read below; retry from the newer snapshot
        for _ in 0..3 {
            // pin first, so truncation cannot pass `from` once checked
            self.learner_pins.pin(&self.wal, &req.learner, from);

            let mut snapshot = None;
            let mut start = from;
            if from < self.wal.first_index() {
                let active = self.snapshots.active().await;
                start = active.up_to_index() + 1;
                self.learner_pins.pin(&self.wal, &req.learner, start);
                snapshot = Some((active.snapshot.clone(), active.epoch));
            }

            let applied = self.state.applied_index();
            let to = applied.min(start + max as u64 - 1);
            let entries = if start <= to {
                match self.wal.entries(start, to).await {
                    Ok(entries) => entries,
                    Err(PersistentStorageError::Truncated { .. }) => continue,
                    Err(e) => return Err(e.into()),
                }
            } else {
                Vec::new()
            };
            let next = entries.last().map_or(start, |e| e.index + 1);
            self.learner_pins.pin(&self.wal, &req.learner, next);

            counter!(CATCHUP_BATCHES_TOTAL.name, "side" => "source").increment(1);
            debug!(
                target = "catchup",
                learner = %req.learner,
                from,
                entries = entries.len(),
                with_snapshot = snapshot.is_some(),
                source_last_index = applied,
                "served catchup batch"
            );
            return Ok(CatchupBatch {
                entries,
                snapshot,
                source_last_index: applied,
                master: self.who_master().await,
            });
        }
        Err(StoreError::CollapseInProgress)
    }

    /// Long-poll: wait up to `wait_ms` for entries past `from_index - 1`.
    pub(crate) async fn serve_subscribe(&self, req: SubscribeRequest) -> Result<CatchupBatch> {
        let mut applied = self.state.watch_applied();
        if *applied.borrow_and_update() < req.from_index {
            let wait = Duration::from_millis(req.wait_ms);
            let _ = tokio::time::timeout(wait, async {
                while applied.changed().await.is_ok() {
                    if *applied.borrow_and_update() >= req.from_index {
                        break;
                    }
                }
            })
            .await;
        }
        self.serve_catchup(CatchupRequest {
            learner: req.learner,
            from_index: req.from_index,
            max_entries: req.max_entries,
        })
        .await
    }

    // Learner side -------------------------------------------------------

    /// Fold one batch into the local log and key space; returns the next state.
    pub(crate) async fn absorb(&self, source: &str, batch: CatchupBatch) -> Result<CatchupState> {
        let _guard = self.write_lock.lock().await;
        if let Some((snapshot, epoch)) = batch.snapshot {
            if snapshot.up_to_index > self.state.applied_index() {
                info!(target = "catchup", source, up_to_index = snapshot.up_to_index, "bootstrapping from source snapshot");
                self.install_remote_snapshot(snapshot, epoch).await?;
            }
        }

        let received = batch.entries.len();
        if let Some(last) = batch.entries.last() {
            let upto = last.index;
            let fresh: Vec<_> = batch
                .entries
                .into_iter()
                .filter(|e| e.index > self.state.applied_index())
                .collect();
            if !fresh.is_empty() {
                self.wal.append_replicated(fresh).await?;
            }
            self.state.apply_from_wal(&self.wal, upto).await?;
            self.commit_index
                .fetch_max(self.state.applied_index(), std::sync::atomic::Ordering::AcqRel);
        }
        if let Some(master) = batch.master {
            let epoch = self.state.read().await.epoch;
            self.voter.observe(master, epoch).await;
        }
        self.stats
            .lock()
            .await
            .observe_node(source, batch.source_last_index);
        counter!(CATCHUP_BATCHES_TOTAL.name, "side" => "learner").increment(1);

        let applied = self.state.applied_index();
        Ok(if applied >= batch.source_last_index {
            CatchupState::CaughtUp
        } else if received >= self.config.batch_entries {
            CatchupState::Bootstrapping
        } else {
            CatchupState::Streaming
        })
    }
}

/// Learner loop: bootstrap from a source, then stream from it. On any error
/// the learner falls back to bootstrapping from the next source in order.
pub(crate) async fn run_learner(
    shared: Arc<NodeShared>,
    state_tx: Arc<watch::Sender<CatchupState>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let sources = shared.config.catchup_sources();
    let me = shared.config.node_id.clone();
    if sources.is_empty() {
        warn!(target = "catchup", node = %me, "learner has no catchup sources");
        return;
    }
    info!(target = "catchup", node = %me, sources = ?sources, "learner started");

    let mut turn = 0usize;
    let mut failures = 0u32;
    loop {
        if *shutdown.borrow() || shared.is_halted() {
            break;
        }
        let source = &sources[turn % sources.len()];
        let from_index = shared.state.applied_index() + 1;
        let current = *state_tx.borrow();
        let request = match current {
            CatchupState::Bootstrapping => PeerRequest::Catchup(CatchupRequest {
                learner: me.clone(),
                from_index,
                max_entries: shared.config.batch_entries,
            }),
            CatchupState::Streaming | CatchupState::CaughtUp => PeerRequest::Subscribe(SubscribeRequest {
                learner: me.clone(),
                from_index,
                wait_ms: shared.config.subscribe_wait.as_millis() as u64,
                max_entries: shared.config.batch_entries,
            }),
        };
        let deadline = shared.config.subscribe_wait + shared.config.lease_duration;

        let outcome = tokio::select! {
            _ = shutdown.changed() => break,
            res = tokio::time::timeout(deadline, shared.transport.call(source, request)) => res,
        };
        let result = match outcome {
            Ok(Ok(PeerResponse::Entries(batch))) => shared.absorb(source, batch).await,
            Ok(Ok(other)) => Err(StoreError::Transport(format!("{source}: unexpected response {other:?}"))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(StoreError::Transport(format!("{source}: timed out"))),
        };

        match result {
            Ok(next) => {
                failures = 0;
                if next != current {
                    debug!(target = "catchup", node = %me, source = %source, from = ?current, to = ?next, "catchup state changed");
                    state_tx.send_replace(next);
                }
            }
            Err(e) => {
                if shared.halt_if_fatal(&e).await {
                    break;
                }
                failures += 1;
                warn!(target = "catchup", node = %me, source = %source, error = %e, "catchup from source failed, trying the next one");
                state_tx.send_replace(CatchupState::Bootstrapping);
                turn += 1;
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(retry_delay(shared.config.lease_duration, failures)) => {}
                }
            }
        }
    }
    debug!(target = "catchup", node = %me, "learner stopped");
}

/// Linear backoff capped at one lease, with 50-100% jitter.
fn retry_delay(lease: Duration, failures: u32) -> Duration {
    let base = (lease / 10).max(Duration::from_millis(10));
    let delay = (base * failures.min(10)).min(lease);
    let factor = rng().random_range(0.5..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}
