use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::errors::Result;

/// Where the WAL begins: everything up to `base_index` lives in the active
/// snapshot, and `base_epoch` is the epoch of that last covered entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalCheckpoint {
    pub base_index: u64,
    pub base_epoch: u64,
}

/// Voter promises that must survive a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionCheckpoint {
    /// Highest epoch this node has granted or campaigned for.
    pub promised_epoch: u64,
    pub promised_to: Option<String>,
}

/// Atomically persist `value` with `bincode` at `path` via tmp+rename.
pub async fn write_checkpoint<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = bincode::serialize(value)?;
    let tmp = path.with_extension("ckpt.tmp");
    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)
        .await
        .map_err(|e| {
            warn!(target = "checkpoint", path = %tmp.display(), error = %e, "open checkpoint tmp failed");
            e
        })?;
    f.write_all(&bytes).await?;
    f.flush().await?;
    f.sync_data().await?;
    tokio::fs::rename(&tmp, path).await.map_err(|e| {
        warn!(target = "checkpoint", from = %tmp.display(), to = %path.display(), error = %e, "rename checkpoint failed");
        e
    })?;
    debug!(target = "checkpoint", path = %path.display(), size = bytes.len(), "wrote checkpoint");
    Ok(())
}

/// Read a checkpoint written by [`write_checkpoint`]; `None` if absent.
pub async fn read_checkpoint<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => {
            let value = bincode::deserialize(&bytes).map_err(|e| {
                warn!(target = "checkpoint", path = %path.display(), error = %e, "checkpoint parse failed");
                e
            })?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_checkpoint_reads_as_none() {
        let tmp = TempDir::new().unwrap();
        let got: Option<WalCheckpoint> = read_checkpoint(&tmp.path().join("wal.ckpt")).await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn checkpoint_overwrite_leaves_no_tmp() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("election.ckpt");

        for epoch in 1..=3u64 {
            let ckpt = ElectionCheckpoint {
                promised_epoch: epoch,
                promised_to: Some(format!("node_{epoch}")),
            };
            write_checkpoint(&path, &ckpt).await.unwrap();
        }

        let got: ElectionCheckpoint = read_checkpoint(&path).await.unwrap().unwrap();
        assert_eq!(got.promised_epoch, 3);
        assert_eq!(got.promised_to.as_deref(), Some("node_3"));
        assert!(!path.with_extension("ckpt.tmp").exists());
    }
}
