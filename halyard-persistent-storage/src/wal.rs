use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::{Stream, TryStreamExt};
use halyard_core::{LogEntry, Operation};
use metrics::counter;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::checkpoint::{read_checkpoint, write_checkpoint, WalCheckpoint};
use crate::errors::{PersistentStorageError, Result};
use crate::persistent_metrics::{WAL_APPEND_TOTAL, WAL_SEGMENT_DELETE_TOTAL};
use crate::utilization::files_size;

mod cache;
mod reader;
mod recovery;
mod writer;
use cache::Cache;
use reader::SegmentRead;
use writer::{segment_path, CutPoint, Frame, LogCommand, WriterInit};

#[cfg(test)]
mod cache_test;

/// Lazy, finite stream of log entries in index order.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<LogEntry>> + Send>>;

#[derive(Debug, Clone)]
pub struct WalConfig {
    pub dir: PathBuf,
    /// Rotate to a new `wal.<seq>.log` after this many entries.
    pub entries_per_segment: u64,
    pub cache_capacity: usize,
    pub max_batch_bytes: usize,
    pub broadcast_capacity: usize,
}

impl WalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            entries_per_segment: 10_000,
            cache_capacity: 1024,
            max_batch_bytes: 64 * 1024,
            broadcast_capacity: 1024,
        }
    }

    pub fn with_entries_per_segment(mut self, n: u64) -> Self {
        self.entries_per_segment = n.max(1);
        self
    }

    pub fn with_cache_capacity(mut self, n: usize) -> Self {
        self.cache_capacity = n;
        self
    }

    fn checkpoint_path(&self) -> PathBuf {
        self.dir.join("wal.ckpt")
    }
}

/// One `wal.<seq>.log` file and the indices it holds.
///
/// `last_index < first_index` marks a segment with no live entries yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMeta {
    pub seq: u64,
    pub path: PathBuf,
    pub first_index: u64,
    pub last_index: u64,
}

impl SegmentMeta {
    pub fn len(&self) -> u64 {
        if self.last_index >= self.first_index {
            self.last_index - self.first_index + 1
        } else {
            0
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
struct Layout {
    segments: Vec<SegmentMeta>,
    /// First index of every run of equal epochs.
    epochs: BTreeMap<u64, u64>,
    base: WalCheckpoint,
    last_epoch: u64,
}

impl Layout {
    fn epoch_at(&self, index: u64, last_index: u64) -> Option<u64> {
        if index == self.base.base_index {
            return Some(self.base.base_epoch);
        }
        if index < self.base.base_index || index > last_index {
            return None;
        }
        self.epochs.range(..=index).next_back().map(|(_, e)| *e)
    }
}

/// Keeps an index pinned while alive; prefix truncation never deletes a
/// pinned index.
#[derive(Debug)]
pub struct PinGuard {
    pins: Arc<DashMap<u64, usize>>,
    index: u64,
}

impl PinGuard {
    pub fn index(&self) -> u64 {
        self.index
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        let mut emptied = false;
        if let Some(mut count) = self.pins.get_mut(&self.index) {
            *count = count.saturating_sub(1);
            emptied = *count == 0;
        }
        if emptied {
            self.pins.remove_if(&self.index, |_, c| *c == 0);
        }
    }
}

#[derive(Debug)]
struct WalInner {
    config: WalConfig,
    layout: Mutex<Layout>,
    cache: Mutex<Cache>,
    pins: Arc<DashMap<u64, usize>>,
    poisoned: Arc<AtomicBool>,
    live_tx: broadcast::Sender<LogEntry>,
    first_index: AtomicU64,
    last_index: AtomicU64,
    // serializes appends and suffix rewrites
    append_lock: Mutex<()>,
    ckpt_lock: Mutex<()>,
    cmd_tx: mpsc::Sender<LogCommand>,
}

/// Segmented write-ahead log with CRC32-protected frames, group-committed
/// fsync, an in-memory tail cache and a live broadcast of new entries.
///
/// Indices are assigned here and never renumbered; collapse only removes
/// whole segments from the front.
#[derive(Debug, Clone)]
pub struct Wal {
    inner: Arc<WalInner>,
}

impl Wal {
    /// Open (or create) the WAL in `cfg.dir`, recovering existing segments.
    pub async fn open(cfg: WalConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&cfg.dir).await?;
        let base: WalCheckpoint = read_checkpoint(&cfg.checkpoint_path()).await?.unwrap_or_default();
        let recovered = recovery::recover(&cfg.dir, base, cfg.cache_capacity).await?;

        let mut cache = Cache::new();
        for entry in recovered.tail {
            cache.insert(entry);
        }

        let (live_tx, _rx) = broadcast::channel(cfg.broadcast_capacity.max(1));
        let (cmd_tx, cmd_rx) = mpsc::channel(8192);
        let poisoned = Arc::new(AtomicBool::new(false));

        info!(
            target = "wal",
            wal_dir = %cfg.dir.display(),
            entries_per_segment = cfg.entries_per_segment,
            cache_capacity = cfg.cache_capacity,
            max_batch_bytes = cfg.max_batch_bytes,
            first_index = base.base_index + 1,
            last_index = recovered.last_index,
            "WAL configuration applied"
        );

        let init = WriterInit {
            dir: cfg.dir.clone(),
            max_batch_bytes: cfg.max_batch_bytes,
            poisoned: Arc::clone(&poisoned),
        };
        tokio::spawn(async move {
            writer::run(init, cmd_rx).await;
        });

        Ok(Self {
            inner: Arc::new(WalInner {
                layout: Mutex::new(Layout {
                    segments: recovered.segments,
                    epochs: recovered.epochs,
                    base,
                    last_epoch: recovered.last_epoch,
                }),
                cache: Mutex::new(cache),
                pins: Arc::new(DashMap::new()),
                poisoned,
                live_tx,
                first_index: AtomicU64::new(base.base_index + 1),
                last_index: AtomicU64::new(recovered.last_index),
                append_lock: Mutex::new(()),
                ckpt_lock: Mutex::new(()),
                cmd_tx,
                config: cfg,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.config.dir
    }

    /// Index of the newest durable entry, or the snapshot base when empty.
    pub fn last_index(&self) -> u64 {
        self.inner.last_index.load(Ordering::Acquire)
    }

    /// Oldest index still readable from the log.
    pub fn first_index(&self) -> u64 {
        self.inner.first_index.load(Ordering::Acquire)
    }

    pub async fn last_epoch(&self) -> u64 {
        self.inner.layout.lock().await.last_epoch
    }

    /// Epoch of the entry at `index`; the base index reports the snapshot's epoch.
    pub async fn epoch_at(&self, index: u64) -> Option<u64> {
        let layout = self.inner.layout.lock().await;
        layout.epoch_at(index, self.last_index())
    }

    pub async fn base(&self) -> WalCheckpoint {
        self.inner.layout.lock().await.base
    }

    pub fn is_poisoned(&self) -> bool {
        self.inner.poisoned.load(Ordering::Acquire)
    }

    /// Append `op` under `epoch` at the next index and return that index.
    ///
    /// Returns once the entry is durable. Authority to write is the caller's
    /// business.
    pub async fn append(&self, epoch: u64, op: Operation) -> Result<u64> {
        let _guard = self.inner.append_lock.lock().await;
        let entry = LogEntry::new(self.last_index() + 1, epoch, op)?;
        self.persist(vec![entry]).await
    }

    /// Append entries received from the master.
    ///
    /// Indices already present with the same epoch are skipped, so
    /// re-delivery is harmless. A conflicting epoch must be resolved with
    /// [`Wal::truncate_suffix`] first.
    pub async fn append_replicated(&self, entries: Vec<LogEntry>) -> Result<u64> {
        let _guard = self.inner.append_lock.lock().await;
        let last = self.last_index();
        let mut fresh = Vec::with_capacity(entries.len());
        {
            let layout = self.inner.layout.lock().await;
            let mut expected = last + 1;
            for entry in entries {
                if !entry.verify() {
                    return Err(PersistentStorageError::Corrupt(format!(
                        "checksum mismatch on replicated entry {}",
                        entry.index
                    )));
                }
                if entry.index <= last {
                    match layout.epoch_at(entry.index, last) {
                        Some(e) if e == entry.epoch => continue,
                        None if entry.index < layout.base.base_index => continue,
                        _ => {
                            return Err(PersistentStorageError::Corrupt(format!(
                                "replicated entry {} conflicts with local epoch",
                                entry.index
                            )))
                        }
                    }
                }
                if entry.index != expected {
                    return Err(PersistentStorageError::Gap {
                        expected,
                        found: entry.index,
                    });
                }
                expected += 1;
                fresh.push(entry);
            }
        }
        if fresh.is_empty() {
            return Ok(last);
        }
        self.persist(fresh).await
    }

    /// Frame, persist and publish contiguous `entries` starting at
    /// `last_index + 1`. Caller holds `append_lock`.
    async fn persist(&self, entries: Vec<LogEntry>) -> Result<u64> {
        if self.is_poisoned() {
            return Err(PersistentStorageError::Poisoned("wal writer failed earlier".to_string()));
        }
        let per_segment = self.inner.config.entries_per_segment;

        // plan segment placement without publishing anything yet
        let (frames, placement) = {
            let layout = self.inner.layout.lock().await;
            let tail = layout
                .segments
                .last()
                .cloned()
                .ok_or_else(|| PersistentStorageError::Corrupt("wal has no segments".to_string()))?;
            let mut seq = tail.seq;
            let mut in_segment = tail.len();
            let mut frames = Vec::with_capacity(entries.len());
            let mut placement = Vec::with_capacity(entries.len());
            for entry in &entries {
                if in_segment >= per_segment {
                    seq += 1;
                    in_segment = 0;
                }
                in_segment += 1;
                frames.push(Frame {
                    seq,
                    index: entry.index,
                    bytes: bincode::serialize(entry)?,
                });
                placement.push(seq);
            }
            (frames, placement)
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner
            .cmd_tx
            .send(LogCommand::Append { frames, ack: ack_tx })
            .await
            .map_err(|_| PersistentStorageError::WriterClosed)?;
        ack_rx.await.map_err(|_| PersistentStorageError::WriterClosed)??;

        // durable: publish to layout, cache and live readers
        let last = {
            let mut layout = self.inner.layout.lock().await;
            for (entry, seq) in entries.iter().zip(placement) {
                let needs_new = layout.segments.last().map(|s| s.seq != seq).unwrap_or(true);
                if needs_new {
                    layout.segments.push(SegmentMeta {
                        seq,
                        path: segment_path(&self.inner.config.dir, seq),
                        first_index: entry.index,
                        last_index: entry.index - 1,
                    });
                }
                if let Some(seg) = layout.segments.last_mut() {
                    seg.last_index = entry.index;
                }
                if entry.epoch != layout.last_epoch || layout.epochs.is_empty() {
                    layout.epochs.insert(entry.index, entry.epoch);
                }
                layout.last_epoch = entry.epoch;
            }
            let last = entries.last().map(|e| e.index).unwrap_or_else(|| self.last_index());
            self.inner.last_index.store(last, Ordering::Release);
            last
        };
        {
            let mut cache = self.inner.cache.lock().await;
            for entry in &entries {
                cache.insert(entry.clone());
            }
            cache.evict_to(self.inner.config.cache_capacity);
        }
        counter!(WAL_APPEND_TOTAL.name).increment(entries.len() as u64);
        for entry in entries {
            // no receivers is fine
            let _ = self.inner.live_tx.send(entry);
        }
        Ok(last)
    }

    /// Pin `index` so prefix truncation keeps it readable.
    pub fn pin(&self, index: u64) -> PinGuard {
        *self.inner.pins.entry(index).or_insert(0) += 1;
        PinGuard {
            pins: Arc::clone(&self.inner.pins),
            index,
        }
    }

    pub fn lowest_pin(&self) -> Option<u64> {
        self.inner.pins.iter().map(|e| *e.key()).min()
    }

    /// Stream entries with index in `[from, to]` (clamped to the last index).
    ///
    /// Fails with `Truncated` when `from` was already collapsed away. The
    /// stream pins `from` until dropped.
    pub async fn read(&self, from: u64, to: u64) -> Result<LogStream> {
        let from = from.max(1);
        let (pin, plan, cached) = {
            // pinned under the layout lock so truncation sees it before it plans
            let layout = self.inner.layout.lock().await;
            let pin = self.pin(from);
            let first = self.first_index();
            if from < first {
                return Err(PersistentStorageError::Truncated {
                    requested: from,
                    first,
                });
            }
            let to = to.min(self.last_index());
            if from > to {
                (pin, Vec::new(), Vec::new())
            } else {
                let cache = self.inner.cache.lock().await;
                let cache_first = cache.first_index().unwrap_or(u64::MAX);
                let cached = if cache_first <= to {
                    cache.range(from.max(cache_first), to)
                } else {
                    Vec::new()
                };
                let file_to = to.min(cache_first.saturating_sub(1));
                let plan: Vec<SegmentRead> = layout
                    .segments
                    .iter()
                    .filter(|s| !s.is_empty() && s.last_index >= from && s.first_index <= file_to)
                    .map(|s| SegmentRead {
                        path: s.path.clone(),
                        from: from.max(s.first_index),
                        to: file_to.min(s.last_index),
                    })
                    .collect();
                (pin, plan, cached)
            }
        };
        Ok(reader::build_range_stream(plan, cached, pin))
    }

    /// Collect entries in `[from, to]`.
    pub async fn entries(&self, from: u64, to: u64) -> Result<Vec<LogEntry>> {
        self.read(from, to).await?.try_collect().await
    }

    pub async fn entry(&self, index: u64) -> Result<Option<LogEntry>> {
        if let Some(hit) = self.inner.cache.lock().await.get(index) {
            return Ok(Some(hit));
        }
        Ok(self.entries(index, index).await?.into_iter().next())
    }

    /// Receive every entry appended from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.inner.live_tx.subscribe()
    }

    /// Replay from `from` and then follow live appends.
    pub async fn tail(&self, from: u64) -> Result<LogStream> {
        let rx = self.subscribe();
        let history = self.read(from, u64::MAX).await?;
        Ok(reader::build_tail_stream(history, from.max(1), rx))
    }

    pub async fn segments(&self) -> Vec<SegmentMeta> {
        self.inner.layout.lock().await.segments.clone()
    }

    /// Bytes used by segment files and the WAL checkpoint.
    pub async fn disk_usage(&self) -> u64 {
        let mut paths: Vec<PathBuf> = self.segments().await.into_iter().map(|s| s.path).collect();
        paths.push(self.inner.config.checkpoint_path());
        files_size(&paths).await
    }

    async fn store_base(&self, base: WalCheckpoint) -> Result<()> {
        let _ckpt = self.inner.ckpt_lock.lock().await;
        write_checkpoint(&self.inner.config.checkpoint_path(), &base).await
    }

    /// Delete whole segments below `min(target, lowest pin)`.
    ///
    /// The active segment is never deleted. Entries up to the new base must
    /// already be covered by the active snapshot. Returns the number of
    /// segments removed.
    pub async fn truncate_prefix(&self, target: u64) -> Result<usize> {
        let (removed, base, effective) = {
            let mut layout = self.inner.layout.lock().await;
            let effective = self.lowest_pin().map_or(target, |p| p.min(target));
            let keep_from = layout
                .segments
                .iter()
                .position(|s| s.last_index + 1 > effective || s.is_empty())
                .unwrap_or(layout.segments.len())
                .min(layout.segments.len().saturating_sub(1));
            if keep_from == 0 {
                return Ok(0);
            }
            let removed: Vec<SegmentMeta> = layout.segments.drain(..keep_from).collect();
            let new_base_index = removed.last().map(|s| s.last_index).unwrap_or(layout.base.base_index);
            let new_base_epoch = layout
                .epoch_at(new_base_index, self.last_index())
                .unwrap_or(layout.base.base_epoch);
            let first = new_base_index + 1;
            if first <= self.last_index() {
                if let Some(epoch) = layout.epoch_at(first, self.last_index()) {
                    let mut rest = layout.epochs.split_off(&first);
                    rest.entry(first).or_insert(epoch);
                    layout.epochs = rest;
                }
            } else {
                layout.epochs.clear();
            }
            layout.base = WalCheckpoint {
                base_index: new_base_index,
                base_epoch: new_base_epoch,
            };
            self.inner.first_index.store(first, Ordering::Release);
            (removed, layout.base, effective)
        };
        self.inner.cache.lock().await.evict_below(base.base_index + 1);
        self.store_base(base).await?;

        for seg in &removed {
            match tokio::fs::remove_file(&seg.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(target = "wal", file = %seg.path.display(), error = %e, "failed to delete collapsed segment");
                    return Err(e.into());
                }
            }
            counter!(WAL_SEGMENT_DELETE_TOTAL.name, "reason" => "collapse").increment(1);
        }
        info!(target = "wal", removed = removed.len(), target_index = target, effective, first_index = base.base_index + 1, "truncated wal prefix");
        Ok(removed.len())
    }

    /// Drop every entry after `keep_through` (divergent follower suffix).
    pub async fn truncate_suffix(&self, keep_through: u64) -> Result<()> {
        let _guard = self.inner.append_lock.lock().await;
        let last = self.last_index();
        if keep_through >= last {
            return Ok(());
        }
        let (keep, remove) = {
            let mut layout = self.inner.layout.lock().await;
            if keep_through < layout.base.base_index {
                return Err(PersistentStorageError::Truncated {
                    requested: keep_through,
                    first: layout.base.base_index + 1,
                });
            }
            let keep_count = layout
                .segments
                .iter()
                .take_while(|s| s.first_index <= keep_through || s.first_index == layout.base.base_index + 1)
                .count()
                .max(1);
            let removed: Vec<SegmentMeta> = layout.segments.drain(keep_count..).collect();
            let kept = layout
                .segments
                .last_mut()
                .ok_or_else(|| PersistentStorageError::Corrupt("wal has no segments".to_string()))?;
            kept.last_index = kept.last_index.min(keep_through).max(kept.first_index - 1);
            let cut = CutPoint {
                seq: kept.seq,
                keep_through,
            };
            let _ = layout.epochs.split_off(&(keep_through + 1));
            layout.last_epoch = layout.epoch_at(keep_through, keep_through).unwrap_or(layout.base.base_epoch);
            self.inner.last_index.store(keep_through, Ordering::Release);
            (cut, removed.into_iter().map(|s| s.path).collect::<Vec<_>>())
        };
        self.inner.cache.lock().await.truncate_after(keep_through);
        warn!(target = "wal", keep_through, dropped = last - keep_through, "truncating divergent wal suffix");
        counter!(WAL_SEGMENT_DELETE_TOTAL.name, "reason" => "truncate").increment(remove.len() as u64);
        self.send_truncate(Some(keep), remove).await
    }

    /// Discard the whole log and restart it right after `base_index`, whose
    /// entry (now inside an installed snapshot) had `base_epoch`.
    pub async fn reset(&self, base_index: u64, base_epoch: u64) -> Result<()> {
        let _guard = self.inner.append_lock.lock().await;
        let base = WalCheckpoint {
            base_index,
            base_epoch,
        };
        let remove = {
            let mut layout = self.inner.layout.lock().await;
            let next_seq = layout.segments.last().map(|s| s.seq + 1).unwrap_or(1);
            let old: Vec<PathBuf> = layout.segments.drain(..).map(|s| s.path).collect();
            layout.segments.push(SegmentMeta {
                seq: next_seq,
                path: segment_path(&self.inner.config.dir, next_seq),
                first_index: base_index + 1,
                last_index: base_index,
            });
            layout.epochs.clear();
            layout.base = base;
            layout.last_epoch = base_epoch;
            self.inner.first_index.store(base_index + 1, Ordering::Release);
            self.inner.last_index.store(base_index, Ordering::Release);
            old
        };
        self.inner.cache.lock().await.clear();
        self.store_base(base).await?;
        info!(target = "wal", base_index, base_epoch, removed = remove.len(), "reset wal to snapshot base");
        counter!(WAL_SEGMENT_DELETE_TOTAL.name, "reason" => "reset").increment(remove.len() as u64);
        self.send_truncate(None, remove).await
    }

    async fn send_truncate(&self, keep: Option<CutPoint>, remove: Vec<PathBuf>) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inner
            .cmd_tx
            .send(LogCommand::Truncate {
                keep,
                remove,
                ack: ack_tx,
            })
            .await
            .map_err(|_| PersistentStorageError::WriterClosed)?;
        ack_rx.await.map_err(|_| PersistentStorageError::WriterClosed)?
    }

    /// Graceful shutdown: flush pending data and stop the writer task.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        // writer may already be gone
        let _ = self.inner.cmd_tx.send(LogCommand::Shutdown(tx)).await;
        let _ = rx.await;
        debug!(target = "wal", dir = %self.inner.config.dir.display(), "wal shut down");
    }
}
