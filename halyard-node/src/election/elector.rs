use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use halyard_core::peer::{RenewRequest, VoteRequest};
use halyard_core::{Lease, NodeId, PeerRequest, PeerResponse, PeerTransport, Result, StoreError};
use metrics::{counter, gauge};
use rand::{rng, Rng};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::voter::Voter;
use super::ElectionState;
use crate::node_config::NodeConfig;
use crate::node_metrics::{ELECTION_ROUNDS_TOTAL, ELECTION_STATE, LEASE_RELINQUISH_TOTAL, LEASE_RENEWALS_TOTAL};

/// What the elector needs from the node it runs in.
#[async_trait]
pub(crate) trait ElectionHost: Send + Sync + 'static {
    /// `(last_epoch, last_index)` of the local log.
    async fn log_position(&self) -> (u64, u64);
    fn commit_index(&self) -> u64;
    fn is_halted(&self) -> bool;
    async fn on_elected(&self, lease: &Lease);
    async fn on_demoted(&self);
    /// Called after every successful renewal.
    async fn heartbeat(&self, lease: &Lease);
    /// Whether `node` is reachable and holds every committed entry.
    async fn caught_up(&self, node: &str) -> bool;
}

/// Candidate and holder side of the lease protocol.
///
/// A node holds at most one lease; it counts as master only while that
/// lease is valid. The holder's lease starts when it sent the round, so it
/// always expires before the voters' view of it.
#[derive(Clone)]
pub struct Elector {
    config: Arc<NodeConfig>,
    voter: Arc<Voter>,
    transport: Arc<dyn PeerTransport>,
    lease: Arc<RwLock<Option<Lease>>>,
    state: Arc<Mutex<ElectionState>>,
    voters: Arc<Vec<NodeId>>,
    highest_epoch_seen: Arc<AtomicU64>,
    failed_rounds: Arc<AtomicU64>,
}

impl std::fmt::Debug for Elector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Elector")
            .field("node_id", &self.config.node_id)
            .field("mode", &self.config.election_mode)
            .finish()
    }
}

impl Elector {
    pub(crate) fn new(config: Arc<NodeConfig>, voter: Arc<Voter>, transport: Arc<dyn PeerTransport>) -> Self {
        Self {
            voters: Arc::new(config.cluster.voters()),
            config,
            voter,
            transport,
            lease: Arc::new(RwLock::new(None)),
            state: Arc::new(Mutex::new(ElectionState::NoMaster)),
            highest_epoch_seen: Arc::new(AtomicU64::new(0)),
            failed_rounds: Arc::new(AtomicU64::new(0)),
        }
    }

    fn me(&self) -> &str {
        &self.config.node_id
    }

    /// Our own lease, if we hold a valid one.
    pub async fn current_lease(&self) -> Option<Lease> {
        self.lease.read().await.clone().filter(Lease::is_valid)
    }

    pub async fn who_master(&self) -> Option<NodeId> {
        if let Some(lease) = self.current_lease().await {
            return Some(lease.holder);
        }
        self.voter.observed().await.map(|l| l.holder)
    }

    pub async fn get_state(&self) -> ElectionState {
        self.state.lock().await.clone()
    }

    async fn set_state(&self, new_state: ElectionState) {
        let mut state = self.state.lock().await;
        if *state != new_state {
            *state = new_state;
            // 0 = no master known, 1 = master, 2 = slave
            let value = match *state {
                ElectionState::NoMaster => 0.0,
                ElectionState::Leading => 1.0,
                ElectionState::Following => 2.0,
            };
            gauge!(ELECTION_STATE.name).set(value);
        }
    }

    /// Drive elections until `shutdown` flips or the host halts.
    pub(crate) async fn run(self, host: Arc<dyn ElectionHost>, mut shutdown: watch::Receiver<bool>) {
        info!(target = "election", node = %self.me(), mode = ?self.config.election_mode, "election loop started");
        loop {
            if *shutdown.borrow() || host.is_halted() {
                break;
            }
            let pause = self.step(host.as_ref()).await;
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        self.lease.write().await.take();
        self.set_state(ElectionState::NoMaster).await;
        debug!(target = "election", node = %self.me(), "election loop stopped");
    }

    /// One pass of the loop; returns how long to wait before the next one.
    async fn step(&self, host: &dyn ElectionHost) -> Duration {
        let renew_every = self.config.renew_interval();

        let held = self.lease.read().await.clone();
        if let Some(lease) = held {
            if !lease.is_valid() {
                warn!(target = "election", node = %self.me(), epoch = lease.epoch, "lease expired before renewal, stepping down");
                self.demote(host).await;
                return self.backoff();
            }
            match self.renew(&lease, host.commit_index()).await {
                Ok(renewed) => {
                    host.heartbeat(&renewed).await;
                    if let Some(preferred) = self.config.election_mode.preferred() {
                        if preferred != self.me() && host.caught_up(preferred).await {
                            self.relinquish(&renewed).await;
                            host.on_demoted().await;
                            return renew_every;
                        }
                    }
                }
                Err(StoreError::LeaseExpired) => {
                    self.demote(host).await;
                    return self.backoff();
                }
                Err(e) => {
                    debug!(target = "election", node = %self.me(), error = %e, "renewal round missed a majority");
                }
            }
            return renew_every;
        }

        let observed = self.voter.observed().await;
        let state = match &observed {
            Some(_) => ElectionState::Following,
            None => ElectionState::NoMaster,
        };
        self.set_state(state).await;

        if self.voter.in_quiet_period() {
            return self.voter.quiet_until().saturating_duration_since(Instant::now()) + self.jitter();
        }
        if !self.config.election_mode.may_campaign(self.me()) {
            return renew_every;
        }

        // the preferred node keeps asking while someone else holds the lease,
        // so the holder and the voters know it is around
        let is_preferred = self.config.election_mode.is_preferred(self.me());
        if let Some(lease) = observed {
            if lease.holder != self.me() {
                // someone won; the next vacancy starts a fresh backoff
                self.failed_rounds.store(0, Ordering::Relaxed);
                if !is_preferred {
                    return lease.remaining() + self.jitter();
                }
            }
        }

        let (last_epoch, last_index) = host.log_position().await;
        if self.config.election_mode.preferred().is_some()
            && !is_preferred
            && self.voter.defers_to_preferred(last_epoch, last_index).await
        {
            debug!(target = "election", node = %self.me(), "deferring to the preferred master");
            return renew_every;
        }

        match self.campaign(last_epoch, last_index).await {
            Ok(lease) => {
                self.failed_rounds.store(0, Ordering::Relaxed);
                host.on_elected(&lease).await;
                renew_every
            }
            Err(e) => {
                debug!(target = "election", node = %self.me(), error = %e, "election round failed");
                if is_preferred {
                    renew_every
                } else {
                    self.backoff()
                }
            }
        }
    }

    /// Ask every voter for the next epoch. Elected on a majority of grants.
    pub(crate) async fn campaign(&self, last_epoch: u64, last_index: u64) -> Result<Lease> {
        let promised = self.voter.promised_epoch().await;
        let epoch = promised.max(self.highest_epoch_seen.load(Ordering::Acquire)) + 1;
        let preferred = self.config.election_mode.is_preferred(self.me());
        let req = VoteRequest {
            epoch,
            candidate: self.config.node_id.clone(),
            last_index,
            last_epoch,
            preferred,
        };
        let needed = self.config.cluster.quorum();
        let sent_at = Instant::now();

        // our own promise is persisted before anyone else is asked
        let own = self.voter.on_prepare(&req, (last_epoch, last_index)).await?;
        self.highest_epoch_seen.fetch_max(own.promised_epoch, Ordering::AcqRel);
        let mut granted = usize::from(own.granted);
        let mut granted_by = Vec::new();

        let mut rounds: FuturesUnordered<_> = self
            .peers()
            .map(|voter| self.call(voter, PeerRequest::Prepare(req.clone())))
            .collect();
        while granted < needed {
            let Some(resp) = rounds.next().await else { break };
            match resp {
                Ok(PeerResponse::Vote(vote)) => {
                    self.highest_epoch_seen.fetch_max(vote.promised_epoch, Ordering::AcqRel);
                    if vote.granted {
                        granted += 1;
                        granted_by.push(vote.voter);
                    }
                }
                Ok(other) => debug!(target = "election", response = ?other, "unexpected prepare response"),
                Err(e) => debug!(target = "election", error = %e, "prepare failed"),
            }
        }
        drop(rounds);

        let lease = Lease::new(self.config.node_id.clone(), epoch, sent_at + self.config.lease_duration, preferred);
        if granted < needed || !lease.is_valid() {
            counter!(ELECTION_ROUNDS_TOTAL.name, "result" => "lost").increment(1);
            self.retract(epoch, &granted_by).await;
            return Err(StoreError::QuorumUnavailable { granted, needed });
        }

        *self.lease.write().await = Some(lease.clone());
        self.set_state(ElectionState::Leading).await;
        counter!(ELECTION_ROUNDS_TOTAL.name, "result" => "won").increment(1);
        info!(target = "election", node = %self.me(), epoch, granted, needed, preferred, "elected master");
        Ok(lease)
    }

    /// Extend `lease` by a majority of renew acks.
    ///
    /// A missed majority is `QuorumUnavailable` while the lease still runs and
    /// `LeaseExpired` once it is gone.
    pub(crate) async fn renew(&self, lease: &Lease, commit_index: u64) -> Result<Lease> {
        let req = RenewRequest {
            epoch: lease.epoch,
            holder: lease.holder.clone(),
            commit_index,
            preferred: lease.preferred,
        };
        let needed = self.config.cluster.quorum();
        let sent_at = Instant::now();

        let own = self.voter.on_renew(&req, commit_index).await?;
        let mut accepted = usize::from(own.accepted);
        let mut deposed = own.promised_epoch > lease.epoch;

        let mut acks: FuturesUnordered<_> = self
            .peers()
            .map(|voter| self.call(voter, PeerRequest::Renew(req.clone())))
            .collect();
        while accepted < needed {
            let Some(resp) = acks.next().await else { break };
            match resp {
                Ok(PeerResponse::Renewed(ack)) if ack.accepted => accepted += 1,
                Ok(PeerResponse::Renewed(ack)) => {
                    self.highest_epoch_seen.fetch_max(ack.promised_epoch, Ordering::AcqRel);
                    if ack.promised_epoch > lease.epoch {
                        deposed = true;
                    }
                }
                Ok(other) => debug!(target = "election", response = ?other, "unexpected renew response"),
                Err(e) => debug!(target = "election", error = %e, "renew failed"),
            }
        }
        drop(acks);

        if accepted >= needed && !deposed {
            let renewed = lease.renewed(sent_at + self.config.lease_duration);
            let mut slot = self.lease.write().await;
            // a concurrent relinquish or demotion wins
            if slot.as_ref().map(|l| l.epoch) != Some(lease.epoch) {
                return Err(StoreError::LeaseExpired);
            }
            *slot = Some(renewed.clone());
            counter!(LEASE_RENEWALS_TOTAL.name, "result" => "ok").increment(1);
            return Ok(renewed);
        }

        counter!(LEASE_RENEWALS_TOTAL.name, "result" => "missed").increment(1);
        if deposed || !lease.is_valid() {
            return Err(StoreError::LeaseExpired);
        }
        Err(StoreError::QuorumUnavailable {
            granted: accepted,
            needed,
        })
    }

    /// Give the lease up so the preferred node can take over at once.
    pub(crate) async fn relinquish(&self, lease: &Lease) {
        self.lease.write().await.take();
        self.set_state(ElectionState::NoMaster).await;
        self.voter.on_relinquish(lease.epoch, &lease.holder).await;
        let calls: FuturesUnordered<_> = self
            .peers()
            .map(|voter| async move {
                let req = PeerRequest::Relinquish {
                    epoch: lease.epoch,
                    holder: lease.holder.clone(),
                };
                if let Err(e) = self.call(voter, req).await {
                    debug!(target = "election", to = %voter, error = %e, "relinquish not delivered");
                }
            })
            .collect();
        calls.collect::<Vec<()>>().await;
        counter!(LEASE_RELINQUISH_TOTAL.name).increment(1);
        info!(target = "election", node = %self.me(), epoch = lease.epoch, "relinquished lease to the preferred master");
    }

    /// Withdraw the grants of a lost round at `epoch`.
    ///
    /// No lease exists at that epoch. Voters forget the grant but keep the
    /// promise, so the next candidate needs a higher epoch.
    async fn retract(&self, epoch: u64, granted_by: &[NodeId]) {
        self.voter.on_relinquish(epoch, self.me()).await;
        let calls: FuturesUnordered<_> = granted_by
            .iter()
            .map(|voter| async move {
                let req = PeerRequest::Relinquish {
                    epoch,
                    holder: self.config.node_id.clone(),
                };
                if let Err(e) = self.call(voter, req).await {
                    debug!(target = "election", to = %voter, error = %e, "retraction not delivered");
                }
            })
            .collect();
        calls.collect::<Vec<()>>().await;
        debug!(target = "election", node = %self.me(), epoch, voters = granted_by.len(), "retracted lost round");
    }

    /// Drop our lease without telling anyone; it simply runs out on the voters.
    pub(crate) async fn step_down(&self) {
        if self.lease.write().await.take().is_some() {
            self.set_state(ElectionState::NoMaster).await;
        }
    }

    async fn demote(&self, host: &dyn ElectionHost) {
        self.step_down().await;
        host.on_demoted().await;
    }

    fn peers(&self) -> impl Iterator<Item = &NodeId> + '_ {
        self.voters.iter().filter(move |v| **v != self.config.node_id)
    }

    async fn call(&self, to: &str, req: PeerRequest) -> Result<PeerResponse> {
        match tokio::time::timeout(self.config.rpc_timeout(), self.transport.call(to, req)).await {
            Ok(resp) => resp?.into_result(),
            Err(_) => Err(halyard_core::peer::unreachable(to, "timed out")),
        }
    }

    fn jitter(&self) -> Duration {
        let max = (self.config.lease_duration / 4).as_millis().max(1) as u64;
        Duration::from_millis(rng().random_range(0..=max))
    }

    /// Linear backoff capped at one lease, drawn uniformly from
    /// `[base / 2, backoff]` so competing candidates spread out.
    fn backoff(&self) -> Duration {
        let attempt = self.failed_rounds.fetch_add(1, Ordering::Relaxed);
        backoff_window(self.config.lease_duration, attempt)
    }
}

/// Retry window after `attempt` failed rounds.
pub(crate) fn backoff_window(lease: Duration, attempt: u64) -> Duration {
    let base = (lease / 8).as_millis().max(1) as u64;
    let cap = lease.as_millis().max(1) as u64;
    let backoff = base.saturating_mul(attempt + 1).min(cap);
    Duration::from_millis(rng().random_range(base / 2..=backoff))
}
