use std::collections::BTreeMap;

use halyard_core::LogEntry;

/// Ordered in-memory cache of recent entries keyed by log index.
///
/// Backed by a `BTreeMap`, so iteration is naturally sorted by index. Serves
/// replication and catchup reads near the tail without touching disk.
#[derive(Debug, Default)]
pub(crate) struct Cache {
    map: BTreeMap<u64, LogEntry>,
}

impl Cache {
    pub(crate) fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn insert(&mut self, entry: LogEntry) {
        self.map.insert(entry.index, entry);
    }

    /// Evict the oldest entries until the cache holds at most `capacity` items.
    pub(crate) fn evict_to(&mut self, capacity: usize) {
        while self.map.len() > capacity {
            if self.map.pop_first().is_none() {
                break;
            }
        }
    }

    /// Drop every entry with index `< first`.
    pub(crate) fn evict_below(&mut self, first: u64) {
        self.map = self.map.split_off(&first);
    }

    /// Drop every entry with index `> last`.
    pub(crate) fn truncate_after(&mut self, last: u64) {
        let _ = self.map.split_off(&(last.saturating_add(1)));
    }

    pub(crate) fn clear(&mut self) {
        self.map.clear();
    }

    pub(crate) fn first_index(&self) -> Option<u64> {
        self.map.keys().next().copied()
    }

    pub(crate) fn get(&self, index: u64) -> Option<LogEntry> {
        self.map.get(&index).cloned()
    }

    /// Entries in `[from, to]`, ascending.
    pub(crate) fn range(&self, from: u64, to: u64) -> Vec<LogEntry> {
        if from > to {
            return Vec::new();
        }
        self.map.range(from..=to).map(|(_, e)| e.clone()).collect()
    }
}
