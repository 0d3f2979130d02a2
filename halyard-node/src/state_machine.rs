use std::ops::Bound;

use halyard_core::{apply_operation, KeyValueState, LogEntry, Snapshot};
use halyard_persistent_storage::{PersistentStorageError, SnapshotStore, Wal};
use metrics::gauge;
use tokio::sync::{watch, RwLock, RwLockReadGuard};
use tracing::{debug, info};

use crate::node_metrics::APPLIED_INDEX;

/// The key space plus the log position it reflects.
#[derive(Debug, Default, Clone)]
pub struct AppliedState {
    pub state: KeyValueState,
    pub index: u64,
    pub epoch: u64,
}

impl AppliedState {
    pub fn get(&self, key: &str) -> Option<&Vec<u8>> {
        self.state.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// Ordered pairs between `first` and `last`; `None` leaves that end open.
    pub fn range(
        &self,
        first: Option<&str>,
        first_inclusive: bool,
        last: Option<&str>,
        last_inclusive: bool,
        max: Option<usize>,
    ) -> Vec<(String, Vec<u8>)> {
        let lower = match first {
            Some(k) if first_inclusive => Bound::Included(k),
            Some(k) => Bound::Excluded(k),
            None => Bound::Unbounded,
        };
        let upper = match last {
            Some(k) if last_inclusive => Bound::Included(k),
            Some(k) => Bound::Excluded(k),
            None => Bound::Unbounded,
        };
        if let (Some(lo), Some(hi)) = (first, last) {
            // BTreeMap::range panics on inverted bounds
            if lo > hi || (lo == hi && !(first_inclusive && last_inclusive)) {
                return Vec::new();
            }
        }
        self.state
            .range::<str, _>((lower, upper))
            .take(max.unwrap_or(usize::MAX))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn prefix_keys(&self, prefix: &str, max: Option<usize>) -> Vec<String> {
        self.state
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(max.unwrap_or(usize::MAX))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// Applies committed log entries to the in-memory key space.
///
/// Application is idempotent by index: entries at or below the applied
/// index are skipped, and application stops at the first gap.
#[derive(Debug)]
pub struct StateMachine {
    inner: RwLock<AppliedState>,
    applied_tx: watch::Sender<u64>,
}

impl StateMachine {
    pub fn from_snapshot(snapshot: &Snapshot, epoch: u64) -> Self {
        let (applied_tx, _) = watch::channel(snapshot.up_to_index);
        Self {
            inner: RwLock::new(AppliedState {
                state: snapshot.state.clone(),
                index: snapshot.up_to_index,
                epoch,
            }),
            applied_tx,
        }
    }

    /// Load the active snapshot and, with `replay_log`, every entry in the WAL.
    ///
    /// Only a node whose log holds nothing but committed entries (a learner)
    /// may replay its whole log; voters wait for the master's commit index.
    pub async fn rebuild(
        wal: &Wal,
        snapshots: &SnapshotStore,
        replay_log: bool,
    ) -> Result<Self, PersistentStorageError> {
        let active = snapshots.active().await;
        let machine = Self::from_snapshot(&active.snapshot, active.epoch);
        drop(active);
        if replay_log {
            machine.apply_from_wal(wal, wal.last_index()).await?;
        }
        info!(
            target = "replication",
            applied_index = machine.applied_index(),
            replay_log,
            "state machine rebuilt"
        );
        Ok(machine)
    }

    pub fn applied_index(&self) -> u64 {
        *self.applied_tx.borrow()
    }

    pub fn watch_applied(&self) -> watch::Receiver<u64> {
        self.applied_tx.subscribe()
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, AppliedState> {
        self.inner.read().await
    }

    pub async fn apply(&self, entries: &[LogEntry]) -> usize {
        let mut inner = self.inner.write().await;
        let mut applied = 0;
        for entry in entries {
            if entry.index <= inner.index {
                continue;
            }
            if entry.index != inner.index + 1 {
                debug!(target = "replication", expected = inner.index + 1, found = entry.index, "apply stopped at gap");
                break;
            }
            apply_operation(&mut inner.state, &entry.payload);
            inner.index = entry.index;
            inner.epoch = entry.epoch;
            applied += 1;
        }
        if applied > 0 {
            self.publish(inner.index);
        }
        applied
    }

    /// Apply WAL entries up to `upto`. Fails with `Truncated` when the next
    /// entry was already collapsed away; the caller installs a snapshot then.
    pub async fn apply_from_wal(&self, wal: &Wal, upto: u64) -> Result<u64, PersistentStorageError> {
        let from = self.applied_index() + 1;
        let upto = upto.min(wal.last_index());
        if from > upto {
            return Ok(self.applied_index());
        }
        let entries = wal.entries(from, upto).await?;
        self.apply(&entries).await;
        Ok(self.applied_index())
    }

    /// Replace the key space with an installed snapshot.
    pub async fn reset(&self, snapshot: &Snapshot, epoch: u64) {
        let mut inner = self.inner.write().await;
        inner.state = snapshot.state.clone();
        inner.index = snapshot.up_to_index;
        inner.epoch = epoch;
        self.publish(inner.index);
    }

    fn publish(&self, index: u64) {
        self.applied_tx.send_replace(index);
        gauge!(APPLIED_INDEX.name).set(index as f64);
    }
}
