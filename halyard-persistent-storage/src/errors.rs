use halyard_core::StoreError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PersistentStorageError>;

#[derive(Debug, Error)]
pub enum PersistentStorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("corrupt data: {0}")]
    Corrupt(String),
    #[error("log gap: expected index {expected}, found {found}")]
    Gap { expected: u64, found: u64 },
    #[error("index {requested} was collapsed; first available index is {first}")]
    Truncated { requested: u64, first: u64 },
    #[error("wal poisoned: {0}")]
    Poisoned(String),
    #[error("a collapse is already in progress")]
    CollapseInProgress,
    #[error("wal writer channel closed")]
    WriterClosed,
}

impl PersistentStorageError {
    /// Errors after which the WAL can no longer be trusted to persist appends.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PersistentStorageError::Poisoned(_) | PersistentStorageError::WriterClosed
        )
    }
}

impl From<PersistentStorageError> for StoreError {
    fn from(err: PersistentStorageError) -> Self {
        match err {
            PersistentStorageError::CollapseInProgress => StoreError::CollapseInProgress,
            e if e.is_fatal() => StoreError::Fatal(e.to_string()),
            e => StoreError::Storage(e.to_string()),
        }
    }
}
