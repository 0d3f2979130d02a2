use std::path::{Path, PathBuf};

use crate::errors::Result;

/// Total size in bytes of the regular files directly inside `dir`.
///
/// A missing directory counts as empty.
pub async fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0u64;
    let mut rd = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = rd.next_entry().await? {
        let meta = entry.metadata().await?;
        if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}

/// Sum of the sizes of `paths`, skipping files that no longer exist.
pub async fn files_size(paths: &[PathBuf]) -> u64 {
    let mut total = 0u64;
    for path in paths {
        if let Ok(meta) = tokio::fs::metadata(path).await {
            total += meta.len();
        }
    }
    total
}
