//! Shared types of the Halyard replicated key-value store.
//!
//! The logged [`Operation`] and [`LogEntry`], the master [`Lease`], the
//! client-facing [`StoreError`] and the peer messaging traits live here so the
//! storage and node crates agree on one vocabulary.

mod errors;
pub use errors::{Result, StoreError};

pub mod types;
pub use types::{ClusterView, NodeId, NodeRole};

mod operation;
pub use operation::{apply_operation, KeyValueState, LogEntry, Operation};

mod snapshot;
pub use snapshot::Snapshot;

mod lease;
pub use lease::Lease;

pub mod statistics;
pub use statistics::{OpCategory, Statistics, TimingAggregate};

mod utilization;
pub use utilization::{ClusterUtilization, StorageUtilization};

pub mod peer;
pub use peer::{PeerHandler, PeerRequest, PeerResponse, PeerTransport, ProcessControl};

mod local_network;
pub use local_network::{LocalNetwork, LocalTransport};
