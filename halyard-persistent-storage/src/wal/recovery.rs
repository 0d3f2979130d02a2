use std::collections::{BTreeMap, VecDeque};
use std::path::Path;

use halyard_core::LogEntry;
use metrics::counter;
use tokio::fs::OpenOptions;
use tracing::{info, warn};

use super::writer::segment_path;
use super::SegmentMeta;
use crate::checkpoint::WalCheckpoint;
use crate::errors::{PersistentStorageError, Result};
use crate::frames;
use crate::persistent_metrics::{WAL_RECOVERY_TRUNCATED_BYTES, WAL_SEGMENT_DELETE_TOTAL};

/// What a scan of the WAL directory found.
#[derive(Debug)]
pub(crate) struct Recovered {
    pub segments: Vec<SegmentMeta>,
    pub epochs: BTreeMap<u64, u64>,
    pub last_index: u64,
    pub last_epoch: u64,
    /// Newest entries, oldest first, to seed the cache.
    pub tail: Vec<LogEntry>,
}

/// Parse `wal.<seq>.log` into `seq`.
pub(crate) fn parse_segment_name(name: &str) -> Option<u64> {
    name.strip_prefix("wal.")?.strip_suffix(".log")?.parse().ok()
}

async fn list_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut seqs = Vec::new();
    let mut rd = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = rd.next_entry().await? {
        if let Some(seq) = entry.file_name().to_str().and_then(parse_segment_name) {
            seqs.push(seq);
        }
    }
    seqs.sort_unstable();
    Ok(seqs)
}

/// Scan every segment in order, validating frames and entry checksums.
///
/// The first torn or corrupt frame ends the log: its segment is cut there
/// and every later segment is deleted. Segments wholly covered by the
/// checkpoint base are deleted as well.
pub(crate) async fn recover(dir: &Path, base: WalCheckpoint, cache_capacity: usize) -> Result<Recovered> {
    let seqs = list_segments(dir).await?;
    let mut segments = Vec::new();
    let mut epochs = BTreeMap::new();
    let mut tail: VecDeque<LogEntry> = VecDeque::with_capacity(cache_capacity);
    let mut last_index = base.base_index;
    let mut last_epoch = base.base_epoch;
    let mut stopped = false;

    for (pos, seq) in seqs.iter().copied().enumerate() {
        let path = segment_path(dir, seq);
        if stopped {
            warn!(target = "wal", file = %path.display(), "removing segment after corrupt tail");
            tokio::fs::remove_file(&path).await?;
            counter!(WAL_SEGMENT_DELETE_TOTAL.name, "reason" => "recovery").increment(1);
            continue;
        }

        let buf = tokio::fs::read(&path).await?;
        let mut valid_end = 0usize;
        let mut seg_first: Option<u64> = None;
        let mut seg_last: Option<u64> = None;
        for frame in frames::frames(&buf) {
            let entry: LogEntry = match bincode::deserialize(frame.payload) {
                Ok(e) => e,
                Err(_) => break,
            };
            if entry.index != frame.index || !entry.verify() {
                break;
            }
            if entry.index > base.base_index {
                if entry.index != last_index + 1 {
                    return Err(PersistentStorageError::Gap {
                        expected: last_index + 1,
                        found: entry.index,
                    });
                }
                if entry.epoch != last_epoch || epochs.is_empty() {
                    epochs.insert(entry.index, entry.epoch);
                }
                last_index = entry.index;
                last_epoch = entry.epoch;
                if tail.len() == cache_capacity {
                    tail.pop_front();
                }
                if cache_capacity > 0 {
                    tail.push_back(entry);
                }
            }
            seg_first.get_or_insert(frame.index);
            seg_last = Some(frame.index);
            valid_end = frame.end;
        }

        if valid_end < buf.len() {
            let dropped = (buf.len() - valid_end) as u64;
            warn!(target = "wal", file = %path.display(), valid_end, dropped, "truncating torn wal tail");
            let f = OpenOptions::new().write(true).open(&path).await?;
            f.set_len(valid_end as u64).await?;
            f.sync_data().await?;
            counter!(WAL_RECOVERY_TRUNCATED_BYTES.name).increment(dropped);
            stopped = true;
        }

        let is_last = pos + 1 == seqs.len() || stopped;
        let covered = seg_last.map(|l| l <= base.base_index).unwrap_or(true);
        if covered && !is_last {
            tokio::fs::remove_file(&path).await?;
            counter!(WAL_SEGMENT_DELETE_TOTAL.name, "reason" => "recovery").increment(1);
            continue;
        }

        let first_index = seg_first.unwrap_or(base.base_index + 1).max(base.base_index + 1);
        let last = seg_last.unwrap_or(first_index - 1).max(first_index - 1);
        segments.push(SegmentMeta {
            seq,
            path,
            first_index,
            last_index: last,
        });
    }

    if segments.is_empty() {
        segments.push(SegmentMeta {
            seq: seqs.last().map(|s| s + 1).unwrap_or(1),
            path: segment_path(dir, seqs.last().map(|s| s + 1).unwrap_or(1)),
            first_index: base.base_index + 1,
            last_index: base.base_index,
        });
    }

    info!(
        target = "wal",
        dir = %dir.display(),
        segments = segments.len(),
        base_index = base.base_index,
        last_index,
        last_epoch,
        "recovered wal"
    );
    Ok(Recovered {
        segments,
        epochs,
        last_index,
        last_epoch,
        tail: tail.into_iter().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::parse_segment_name;

    #[test]
    fn segment_names() {
        assert_eq!(parse_segment_name("wal.1.log"), Some(1));
        assert_eq!(parse_segment_name("wal.42.log"), Some(42));
        assert_eq!(parse_segment_name("wal.log"), None);
        assert_eq!(parse_segment_name("wal.x.log"), None);
        assert_eq!(parse_segment_name("snapshot.3.db"), None);
    }
}
