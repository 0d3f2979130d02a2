use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use halyard_core::Snapshot;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::errors::{PersistentStorageError, Result};
use crate::persistent_metrics::SNAPSHOT_INSTALL_TOTAL;
use crate::utilization::files_size;

/// A snapshot together with the epoch of its last covered entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub snapshot: Snapshot,
    pub epoch: u64,
}

impl StoredSnapshot {
    pub fn up_to_index(&self) -> u64 {
        self.snapshot.up_to_index
    }
}

fn snapshot_path(dir: &Path, up_to: u64) -> PathBuf {
    dir.join(format!("snapshot.{}.db", up_to))
}

fn parse_snapshot_name(name: &str) -> Option<u64> {
    name.strip_prefix("snapshot.")?.strip_suffix(".db")?.parse().ok()
}

fn encode(stored: &StoredSnapshot) -> Result<Vec<u8>> {
    let body = bincode::serialize(stored)?;
    let mut out = Vec::with_capacity(body.len() + 4);
    out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

fn decode(bytes: &[u8]) -> Result<StoredSnapshot> {
    if bytes.len() < 4 {
        return Err(PersistentStorageError::Corrupt("snapshot file too short".to_string()));
    }
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&bytes[..4]);
    let body = &bytes[4..];
    if crc32fast::hash(body) != u32::from_le_bytes(crc) {
        return Err(PersistentStorageError::Corrupt("snapshot crc mismatch".to_string()));
    }
    Ok(bincode::deserialize(body)?)
}

#[derive(Debug)]
struct Active {
    stored: Arc<StoredSnapshot>,
    path: Option<PathBuf>,
}

/// Durable home of the node's single active snapshot.
///
/// Installing a new snapshot never disturbs readers of the old one: the
/// superseded `Arc` stays valid for whoever holds it, and its file is only
/// deleted once the last holder lets go.
#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
    active: RwLock<Active>,
    retired: Mutex<Vec<(Weak<StoredSnapshot>, PathBuf)>>,
}

impl SnapshotStore {
    /// Open the store in `dir`, loading the newest valid snapshot file.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut found: Vec<(u64, PathBuf)> = Vec::new();
        let mut rd = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = rd.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with("snapshot.") && name.ends_with(".tmp") {
                tokio::fs::remove_file(entry.path()).await?;
                continue;
            }
            if let Some(up_to) = parse_snapshot_name(name) {
                found.push((up_to, entry.path()));
            }
        }
        found.sort_by(|a, b| b.0.cmp(&a.0));

        let mut active = Active {
            stored: Arc::new(StoredSnapshot::default()),
            path: None,
        };
        for (up_to, path) in found {
            if active.path.is_some() {
                tokio::fs::remove_file(&path).await?;
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match decode(&bytes) {
                Ok(stored) => {
                    info!(target = "snapshot", file = %path.display(), up_to, keys = stored.snapshot.len(), "loaded snapshot");
                    active = Active {
                        stored: Arc::new(stored),
                        path: Some(path),
                    };
                }
                Err(e) => {
                    warn!(target = "snapshot", file = %path.display(), error = %e, "discarding unreadable snapshot");
                    tokio::fs::remove_file(&path).await?;
                }
            }
        }

        Ok(Self {
            dir,
            active: RwLock::new(active),
            retired: Mutex::new(Vec::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The active snapshot; holding the `Arc` keeps it (and its file) alive.
    pub async fn active(&self) -> Arc<StoredSnapshot> {
        Arc::clone(&self.active.read().await.stored)
    }

    pub async fn up_to_index(&self) -> u64 {
        self.active.read().await.stored.snapshot.up_to_index
    }

    /// Persist `stored` (tmp, fsync, rename) and make it the active snapshot.
    pub async fn install(&self, stored: StoredSnapshot, source: &'static str) -> Result<Arc<StoredSnapshot>> {
        let up_to = stored.snapshot.up_to_index;
        let path = snapshot_path(&self.dir, up_to);
        let tmp = path.with_extension("db.tmp");
        let bytes = encode(&stored)?;

        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .await?;
        f.write_all(&bytes).await?;
        f.flush().await?;
        f.sync_all().await?;
        drop(f);
        tokio::fs::rename(&tmp, &path).await?;
        if let Ok(d) = tokio::fs::File::open(&self.dir).await {
            // directory fsync makes the rename durable where supported
            let _ = d.sync_all().await;
        }

        let stored = Arc::new(stored);
        let previous = {
            let mut active = self.active.write().await;
            std::mem::replace(
                &mut *active,
                Active {
                    stored: Arc::clone(&stored),
                    path: Some(path.clone()),
                },
            )
        };
        if let Some(old_path) = previous.path {
            if old_path != path {
                self.retired
                    .lock()
                    .await
                    .push((Arc::downgrade(&previous.stored), old_path));
            }
        }
        drop(previous.stored);
        counter!(SNAPSHOT_INSTALL_TOTAL.name, "source" => source).increment(1);
        info!(target = "snapshot", file = %path.display(), up_to, keys = stored.snapshot.len(), size = bytes.len(), "installed snapshot");

        self.gc().await?;
        Ok(stored)
    }

    /// Delete files of retired snapshots nobody holds anymore. Returns how
    /// many retired snapshots are still referenced.
    pub async fn gc(&self) -> Result<usize> {
        let mut retired = self.retired.lock().await;
        let mut still_held = Vec::new();
        for (weak, path) in retired.drain(..) {
            if weak.strong_count() > 0 {
                still_held.push((weak, path));
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(target = "snapshot", file = %path.display(), "removed retired snapshot"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(target = "snapshot", file = %path.display(), error = %e, "failed to remove retired snapshot");
                    still_held.push((weak, path));
                }
            }
        }
        *retired = still_held;
        Ok(retired.len())
    }

    /// Bytes used by the active and all retained snapshot files.
    pub async fn disk_usage(&self) -> u64 {
        let mut paths: Vec<PathBuf> = self
            .retired
            .lock()
            .await
            .iter()
            .map(|(_, p)| p.clone())
            .collect();
        if let Some(p) = self.active.read().await.path.clone() {
            paths.push(p);
        }
        files_size(&paths).await
    }
}
