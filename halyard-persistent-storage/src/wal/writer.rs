use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::errors::{PersistentStorageError, Result};
use crate::frames;
use crate::persistent_metrics::{
    WAL_APPEND_BYTES_TOTAL, WAL_FSYNC_LATENCY_MS, WAL_FSYNC_TOTAL, WAL_SEGMENT_ROTATE_TOTAL,
};

/// One encoded entry bound for segment `seq`.
#[derive(Debug)]
pub(crate) struct Frame {
    pub seq: u64,
    pub index: u64,
    pub bytes: Vec<u8>,
}

/// Cut a segment right after `keep_through`.
#[derive(Debug)]
pub(crate) struct CutPoint {
    pub seq: u64,
    pub keep_through: u64,
}

/// Commands sent from the `Wal` front end to the background writer task.
///
/// The writer owns every open file handle. Appends are acknowledged only
/// after their bytes reached disk with `sync_data`.
#[derive(Debug)]
pub(crate) enum LogCommand {
    Append {
        frames: Vec<Frame>,
        ack: oneshot::Sender<Result<()>>,
    },
    /// Cut the segment named by `keep` and delete `remove`.
    Truncate {
        keep: Option<CutPoint>,
        remove: Vec<PathBuf>,
        ack: oneshot::Sender<Result<()>>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Init parameters for the writer task captured at WAL startup.
pub(crate) struct WriterInit {
    pub dir: PathBuf,
    pub max_batch_bytes: usize,
    pub poisoned: Arc<AtomicBool>,
}

pub(crate) fn segment_path(dir: &std::path::Path, seq: u64) -> PathBuf {
    dir.join(format!("wal.{}.log", seq))
}

/// Writer-owned state (no locking). Lives entirely inside the writer task.
struct WriterState {
    dir: PathBuf,
    current: Option<(u64, BufWriter<tokio::fs::File>)>,
    write_buf: Vec<u8>,
    max_batch_bytes: usize,
    poisoned: Arc<AtomicBool>,
    poison_reason: Option<String>,
}

impl WriterState {
    fn check_poisoned(&self) -> Result<()> {
        match &self.poison_reason {
            Some(reason) => Err(PersistentStorageError::Poisoned(reason.clone())),
            None => Ok(()),
        }
    }

    fn poison(&mut self, err: &PersistentStorageError) {
        error!(target = "wal", error = %err, "wal write failed; refusing further appends");
        self.poison_reason = Some(err.to_string());
        self.poisoned.store(true, Ordering::Release);
    }

    /// Make segment `seq` the open file, syncing the one it replaces.
    async fn switch_to(&mut self, seq: u64) -> Result<()> {
        if matches!(&self.current, Some((cur, _)) if *cur == seq) {
            return Ok(());
        }
        let rotated = self.current.is_some();
        self.flush_and_sync().await?;
        let path = segment_path(&self.dir, seq);
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        self.current = Some((seq, BufWriter::new(f)));
        if rotated {
            counter!(WAL_SEGMENT_ROTATE_TOTAL.name).increment(1);
            debug!(target = "wal", seq, file = %path.display(), "rotated wal segment");
        }
        Ok(())
    }

    async fn flush_and_sync(&mut self) -> Result<()> {
        if let Some((_, writer)) = self.current.as_mut() {
            if !self.write_buf.is_empty() {
                writer.write_all(&self.write_buf).await?;
                self.write_buf.clear();
            }
            writer.flush().await?;
            writer.get_ref().sync_data().await?;
        }
        Ok(())
    }

    /// Frame and persist a group of appends, then sync once for all of them.
    async fn process_appends(&mut self, batch: Vec<Frame>) -> Result<()> {
        self.check_poisoned()?;
        let started = Instant::now();
        let mut bytes_total = 0usize;
        for frame in batch {
            self.switch_to(frame.seq).await?;
            frames::encode_frame(&mut self.write_buf, frame.index, &frame.bytes);
            bytes_total += frames::FRAME_HEADER_SIZE + frame.bytes.len();
            if self.write_buf.len() >= self.max_batch_bytes {
                if let Some((_, writer)) = self.current.as_mut() {
                    writer.write_all(&self.write_buf).await?;
                    self.write_buf.clear();
                }
            }
        }
        self.flush_and_sync().await?;
        counter!(WAL_APPEND_BYTES_TOTAL.name).increment(bytes_total as u64);
        counter!(WAL_FSYNC_TOTAL.name).increment(1);
        histogram!(WAL_FSYNC_LATENCY_MS.name).record(started.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    async fn process_truncate(&mut self, keep: Option<CutPoint>, remove: Vec<PathBuf>) -> Result<()> {
        self.check_poisoned()?;
        self.flush_and_sync().await?;
        // reopen lazily on the next append
        self.current = None;

        for path in &remove {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!(target = "wal", file = %path.display(), "removed wal segment"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(cut) = keep {
            let path = segment_path(&self.dir, cut.seq);
            let buf = match tokio::fs::read(&path).await {
                Ok(buf) => buf,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            let end = frames::frames(&buf)
                .take_while(|f| f.index <= cut.keep_through)
                .last()
                .map(|f| f.end)
                .unwrap_or(0);
            let f = OpenOptions::new().write(true).open(&path).await?;
            f.set_len(end as u64).await?;
            f.sync_data().await?;
            info!(target = "wal", file = %path.display(), keep_through = cut.keep_through, len = end, "truncated wal segment");
        }
        Ok(())
    }
}

/// Background writer task entrypoint.
///
/// Processes commands until `Shutdown`. Consecutive queued appends are
/// drained into one group and made durable with a single `sync_data`. The
/// first I/O failure poisons the writer: that append and every later one fail.
pub(crate) async fn run(init: WriterInit, mut rx: mpsc::Receiver<LogCommand>) {
    let mut state = WriterState {
        dir: init.dir,
        current: None,
        write_buf: Vec::with_capacity(init.max_batch_bytes),
        max_batch_bytes: init.max_batch_bytes,
        poisoned: init.poisoned,
        poison_reason: None,
    };
    debug!(target = "wal", dir = %state.dir.display(), max_batch = state.max_batch_bytes, "writer task started");

    let mut pending: Option<LogCommand> = None;
    loop {
        let cmd = match pending.take() {
            Some(cmd) => cmd,
            None => match rx.recv().await {
                Some(cmd) => cmd,
                None => break,
            },
        };
        match cmd {
            LogCommand::Append { frames, ack } => {
                let mut batch = frames;
                let mut acks = vec![ack];
                // group commit whatever is already queued behind us
                while let Ok(next) = rx.try_recv() {
                    match next {
                        LogCommand::Append { frames, ack } => {
                            batch.extend(frames);
                            acks.push(ack);
                        }
                        other => {
                            pending = Some(other);
                            break;
                        }
                    }
                }
                let res = state.process_appends(batch).await;
                if let Err(e) = &res {
                    if !matches!(e, PersistentStorageError::Poisoned(_)) {
                        state.poison(e);
                    }
                }
                for ack in acks {
                    let reply = match &res {
                        Ok(()) => Ok(()),
                        Err(_) => state.check_poisoned(),
                    };
                    let _ = ack.send(reply);
                }
            }
            LogCommand::Truncate { keep, remove, ack } => {
                let res = state.process_truncate(keep, remove).await;
                if let Err(e) = &res {
                    if !matches!(e, PersistentStorageError::Poisoned(_)) {
                        state.poison(e);
                    }
                }
                let _ = ack.send(res);
            }
            LogCommand::Shutdown(ack_tx) => {
                if let Err(e) = state.flush_and_sync().await {
                    warn!(target = "wal", error = ?e, "flush on shutdown failed");
                }
                let _ = ack_tx.send(());
                debug!(target = "wal", "writer task shutting down");
                break;
            }
        }
    }
}
