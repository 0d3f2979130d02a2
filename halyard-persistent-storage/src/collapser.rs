use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use metrics::{counter, histogram};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::errors::{PersistentStorageError, Result};
use crate::persistent_metrics::{COLLAPSE_LATENCY_MS, COLLAPSE_TOTAL};
use crate::snapshot_store::{SnapshotStore, StoredSnapshot};
use crate::wal::Wal;

/// Called before every chunk of entries is folded into the new snapshot.
#[async_trait]
pub trait ChunkHook: Send + Sync + 'static {
    async fn before_chunk(&self, chunk: usize, next_index: u64);
}

/// Sleep before each chunk. A zero duration means no delay.
#[derive(Debug, Clone, Copy, Default)]
pub struct Slowdown(pub Duration);

#[async_trait]
impl ChunkHook for Slowdown {
    async fn before_chunk(&self, _chunk: usize, _next_index: u64) {
        if !self.0.is_zero() {
            tokio::time::sleep(self.0).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollapseReport {
    /// Entries below this index were folded (or already covered).
    pub target: u64,
    pub snapshot_up_to: u64,
    pub folded_entries: u64,
    pub chunks: usize,
    pub removed_segments: usize,
    pub elapsed: Duration,
}

/// Exclusive right to rewrite the snapshot and WAL prefix; released on drop.
#[derive(Debug)]
pub struct CollapseGuard<'a>(&'a AtomicBool);

impl Drop for CollapseGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Folds a WAL prefix into the snapshot store and truncates the log.
///
/// At most one collapse runs at a time; a concurrent attempt fails at once
/// with `CollapseInProgress` instead of waiting.
pub struct Collapser {
    wal: Wal,
    snapshots: Arc<SnapshotStore>,
    busy: AtomicBool,
    chunk_size: usize,
    hook: RwLock<Arc<dyn ChunkHook>>,
}

impl std::fmt::Debug for Collapser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collapser")
            .field("busy", &self.is_busy())
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl Collapser {
    pub fn new(wal: Wal, snapshots: Arc<SnapshotStore>) -> Self {
        Self {
            wal,
            snapshots,
            busy: AtomicBool::new(false),
            chunk_size: 256,
            hook: RwLock::new(Arc::new(Slowdown::default())),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub async fn set_hook(&self, hook: Arc<dyn ChunkHook>) {
        *self.hook.write().await = hook;
    }

    /// `None` or zero disables the delay.
    pub async fn set_slowdown(&self, delay: Option<Duration>) {
        self.set_hook(Arc::new(Slowdown(delay.unwrap_or_default()))).await;
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Take the exclusive flag without collapsing, e.g. while installing a
    /// snapshot received from a peer.
    pub fn try_acquire(&self) -> Result<CollapseGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| CollapseGuard(&self.busy))
            .map_err(|_| PersistentStorageError::CollapseInProgress)
    }

    /// Fold everything except the newest `keep_segments` segments, never past
    /// `applied_index`.
    ///
    /// Steps: fold into a copy of the active snapshot, install it durably,
    /// then truncate the WAL prefix. A failure before the install leaves the
    /// old snapshot and the full log untouched.
    pub async fn collapse(&self, keep_segments: usize, applied_index: u64) -> Result<CollapseReport> {
        let _busy = match self.try_acquire() {
            Ok(guard) => guard,
            Err(e) => {
                counter!(COLLAPSE_TOTAL.name, "result" => "rejected").increment(1);
                warn!(target = "collapser", "collapse rejected: another collapse is running");
                return Err(e);
            }
        };

        let started = Instant::now();
        let res = self.run(keep_segments.max(1), applied_index, started).await;
        match &res {
            Ok(report) => {
                counter!(COLLAPSE_TOTAL.name, "result" => "ok").increment(1);
                histogram!(COLLAPSE_LATENCY_MS.name).record(report.elapsed.as_secs_f64() * 1000.0);
                info!(
                    target = "collapser",
                    target_index = report.target,
                    snapshot_up_to = report.snapshot_up_to,
                    folded = report.folded_entries,
                    chunks = report.chunks,
                    removed_segments = report.removed_segments,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "collapse finished"
                );
            }
            Err(e) => {
                counter!(COLLAPSE_TOTAL.name, "result" => "error").increment(1);
                warn!(target = "collapser", error = %e, "collapse failed");
            }
        }
        res
    }

    async fn run(&self, keep_segments: usize, applied_index: u64, started: Instant) -> Result<CollapseReport> {
        let segments = self.wal.segments().await;
        let boundary = if segments.len() > keep_segments {
            segments[segments.len() - keep_segments].first_index
        } else {
            self.wal.first_index()
        };
        let target = boundary.min(applied_index + 1);

        let base = self.snapshots.active().await;
        let mut folded_entries = 0u64;
        let mut chunks = 0usize;
        let mut snapshot_up_to = base.up_to_index();

        if target > base.up_to_index() + 1 {
            let from = base.up_to_index() + 1;
            let mut next = StoredSnapshot::clone(&base);
            drop(base);

            let hook = Arc::clone(&*self.hook.read().await);
            let mut stream = self.wal.read(from, target - 1).await?.chunks(self.chunk_size);
            let mut next_index = from;
            while let Some(chunk) = stream.next().await {
                hook.before_chunk(chunks, next_index).await;
                chunks += 1;
                for item in chunk {
                    let entry = item?;
                    if next.snapshot.fold(&entry) {
                        next.epoch = entry.epoch;
                        folded_entries += 1;
                    }
                    next_index = entry.index + 1;
                }
                debug!(target = "collapser", chunk = chunks, next_index, "folded chunk");
            }
            if next.snapshot.up_to_index != target - 1 {
                return Err(PersistentStorageError::Gap {
                    expected: target - 1,
                    found: next.snapshot.up_to_index,
                });
            }
            snapshot_up_to = next.snapshot.up_to_index;
            self.snapshots.install(next, "collapse").await?;
        }

        // also finishes a truncation an earlier crash interrupted
        let truncate_to = target.min(snapshot_up_to + 1);
        let removed_segments = self.wal.truncate_prefix(truncate_to).await?;

        Ok(CollapseReport {
            target,
            snapshot_up_to,
            folded_entries,
            chunks,
            removed_segments,
            elapsed: started.elapsed(),
        })
    }
}
