use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::NodeId;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by a Halyard node.
///
/// Client-facing kinds (`KeyNotFound`, `AssertionFailed`, `ValueTooLarge`,
/// `NotMaster`) are passed through untranslated, so they derive `Serialize`
/// and travel as-is between peers.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreError {
    #[error("not master (current master: {})", master_name(.0))]
    NotMaster(Option<NodeId>),

    #[error("master lease expired")]
    LeaseExpired,

    #[error("assertion failed for key '{0}'")]
    AssertionFailed(String),

    #[error("key not found: '{0}'")]
    KeyNotFound(String),

    #[error("value too large: {size} bytes exceeds the {limit} bytes ceiling")]
    ValueTooLarge { size: usize, limit: usize },

    #[error("a collapse is already in progress")]
    CollapseInProgress,

    #[error("quorum unavailable: {granted} of {needed} required acknowledgements")]
    QuorumUnavailable { granted: usize, needed: usize },

    #[error("not elected: {0}")]
    NotElected(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("fatal storage failure: {0}")]
    Fatal(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("node is halted after a fatal storage failure")]
    Halted,
}

fn master_name(master: &Option<NodeId>) -> &str {
    master.as_deref().unwrap_or("unknown")
}

impl StoreError {
    /// The key carried by `KeyNotFound` / `AssertionFailed`, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            StoreError::KeyNotFound(key) | StoreError::AssertionFailed(key) => Some(key),
            _ => None,
        }
    }

    /// Errors after which the caller may retry against the same or another node.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::NotMaster(_)
                | StoreError::LeaseExpired
                | StoreError::QuorumUnavailable { .. }
                | StoreError::CollapseInProgress
                | StoreError::Transport(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_not_found_echoes_exact_key() {
        let err = StoreError::KeyNotFound("non-existing".to_string());
        assert_eq!(err.key(), Some("non-existing"));
        assert_eq!(err.to_string(), "key not found: 'non-existing'");
    }

    #[test]
    fn not_master_names_known_master() {
        let err = StoreError::NotMaster(Some("node_1".to_string()));
        assert_eq!(err.to_string(), "not master (current master: node_1)");
        assert_eq!(
            StoreError::NotMaster(None).to_string(),
            "not master (current master: unknown)"
        );
    }

    #[test]
    fn retryable_kinds() {
        assert!(StoreError::LeaseExpired.is_retryable());
        assert!(StoreError::CollapseInProgress.is_retryable());
        assert!(!StoreError::AssertionFailed("k".into()).is_retryable());
        assert!(!StoreError::Fatal("disk".into()).is_retryable());
    }
}
