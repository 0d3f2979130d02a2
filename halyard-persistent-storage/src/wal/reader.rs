use std::path::Path;

use futures::stream::{self, StreamExt};
use halyard_core::LogEntry;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use super::{LogStream, PinGuard};
use crate::errors::{PersistentStorageError, Result};
use crate::frames;

/// Read and decode entries with index in `[from, to]` from the segment at `path`.
///
/// Frames are `[u64 index][u32 len][u32 crc][bincode LogEntry]`. Reading stops
/// at EOF, at the first torn or CRC-mismatching frame, or past `to`.
pub(crate) async fn read_segment_range(path: &Path, from: u64, to: u64) -> Result<Vec<LogEntry>> {
    let buf = tokio::fs::read(path).await?;
    let mut out = Vec::new();
    let mut consumed = 0usize;
    for frame in frames::frames(&buf) {
        consumed = frame.end;
        if frame.index > to {
            break;
        }
        if frame.index < from {
            continue;
        }
        let entry: LogEntry = bincode::deserialize(frame.payload)?;
        if entry.index != frame.index || !entry.verify() {
            return Err(PersistentStorageError::Corrupt(format!(
                "entry checksum mismatch at index {} in {}",
                frame.index,
                path.display()
            )));
        }
        out.push(entry);
    }
    if consumed < buf.len() && out.last().map(|e| e.index < to).unwrap_or(true) {
        warn!(target = "wal", path = %path.display(), at = consumed, "stopped segment replay at an invalid frame");
    }
    Ok(out)
}

/// A planned read of one segment.
#[derive(Debug, Clone)]
pub(crate) struct SegmentRead {
    pub path: std::path::PathBuf,
    pub from: u64,
    pub to: u64,
}

/// Lazily stream `plan` segment by segment, then `cached` (already ordered and
/// strictly after the planned file range).
///
/// The stream holds `pin` until it is dropped, so prefix truncation cannot
/// delete a segment the stream has yet to open.
pub(crate) fn build_range_stream(plan: Vec<SegmentRead>, cached: Vec<LogEntry>, pin: PinGuard) -> LogStream {
    let expected_first = plan
        .first()
        .map(|s| s.from)
        .or_else(|| cached.first().map(|e| e.index));

    let files = stream::iter(plan)
        .then(|seg| async move {
            let res = read_segment_range(&seg.path, seg.from, seg.to).await;
            if let Ok(entries) = &res {
                debug!(target = "wal", file = %seg.path.display(), from = seg.from, to = seg.to, count = entries.len(), "replayed frames from segment");
            }
            res
        })
        .flat_map(|res| match res {
            Ok(entries) => stream::iter(entries.into_iter().map(Ok).collect::<Vec<_>>()),
            Err(e) => stream::iter(vec![Err(e)]),
        });
    let tail = stream::iter(cached.into_iter().map(Ok));

    // enforce gaplessness across files and cache
    let mut next = expected_first;
    let checked = files.chain(tail).map(move |item| {
        let _hold = &pin;
        match item {
            Ok(entry) => match next {
                Some(expected) if entry.index != expected => Err(PersistentStorageError::Gap {
                    expected,
                    found: entry.index,
                }),
                _ => {
                    next = Some(entry.index + 1);
                    Ok(entry)
                }
            },
            Err(e) => Err(e),
        }
    });
    Box::pin(checked)
}

/// Replay `history` then follow `rx`, yielding every entry from `from` on
/// exactly once and in order.
pub(crate) fn build_tail_stream(
    history: LogStream,
    from: u64,
    rx: broadcast::Receiver<LogEntry>,
) -> LogStream {
    let mut next = from;
    let live = BroadcastStream::new(rx).filter_map(|item| async move {
        match item {
            Ok(entry) => Some(Ok(entry)),
            Err(e) => Some(Err(PersistentStorageError::Corrupt(format!(
                "live tail lagged: {}",
                e
            )))),
        }
    });
    let stream = history.chain(live).filter_map(move |item| {
        let out = match item {
            Ok(entry) if entry.index < next => None,
            Ok(entry) => {
                next = entry.index + 1;
                Some(Ok(entry))
            }
            Err(e) => Some(Err(e)),
        };
        async move { out }
    });
    Box::pin(stream)
}
