use serde::{Deserialize, Serialize};

use crate::operation::{apply_operation, KeyValueState, LogEntry};

/// Materialized state covering every log entry up to and including
/// `up_to_index`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub up_to_index: u64,
    pub state: KeyValueState,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Fold `entry` into the snapshot. Entries at or below `up_to_index`
    /// are already covered and are skipped.
    pub fn fold(&mut self, entry: &LogEntry) -> bool {
        if entry.index <= self.up_to_index {
            return false;
        }
        apply_operation(&mut self.state, &entry.payload);
        self.up_to_index = entry.index;
        true
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Operation;

    #[test]
    fn fold_skips_covered_entries() {
        let mut snap = Snapshot::empty();
        assert!(snap.fold(&LogEntry::new(1, 1, Operation::set("a", b"1".to_vec())).unwrap()));
        assert!(snap.fold(&LogEntry::new(2, 1, Operation::set("a", b"2".to_vec())).unwrap()));
        assert!(!snap.fold(&LogEntry::new(1, 1, Operation::set("a", b"stale".to_vec())).unwrap()));

        assert_eq!(snap.up_to_index, 2);
        assert_eq!(snap.state.get("a"), Some(&b"2".to_vec()));
    }
}
