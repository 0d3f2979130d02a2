use std::collections::BTreeMap;
use std::iter::Sum;
use std::ops::Add;

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Bytes on disk for one node, split by what they hold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUtilization {
    /// Node log files.
    pub log: u64,
    /// Write-ahead log segments.
    pub tlog: u64,
    /// Snapshot files.
    pub db: u64,
}

impl StorageUtilization {
    pub fn total(&self) -> u64 {
        self.log + self.tlog + self.db
    }
}

impl Add for StorageUtilization {
    type Output = StorageUtilization;

    fn add(self, rhs: Self) -> Self::Output {
        StorageUtilization {
            log: self.log + rhs.log,
            tlog: self.tlog + rhs.tlog,
            db: self.db + rhs.db,
        }
    }
}

impl Sum for StorageUtilization {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(StorageUtilization::default(), |acc, u| acc + u)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterUtilization {
    pub nodes: BTreeMap<NodeId, StorageUtilization>,
}

impl ClusterUtilization {
    pub fn total(&self) -> StorageUtilization {
        self.nodes.values().copied().sum()
    }
}
