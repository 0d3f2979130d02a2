//! Node-to-node messages and the traits that carry them.
//!
//! Nodes never share memory: every interaction between two nodes is a
//! [`PeerRequest`] answered by a [`PeerResponse`], delivered by a
//! [`PeerTransport`] to the receiver's [`PeerHandler`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, StoreError};
use crate::operation::LogEntry;
use crate::snapshot::Snapshot;
use crate::types::{NodeId, NodeRole};

/// Candidate asking for a vote (`Prepare`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub epoch: u64,
    pub candidate: NodeId,
    pub last_index: u64,
    pub last_epoch: u64,
    pub preferred: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub granted: bool,
    pub voter: NodeId,
    /// Highest epoch the voter has promised so far.
    pub promised_epoch: u64,
    pub last_index: u64,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewRequest {
    pub epoch: u64,
    pub holder: NodeId,
    pub commit_index: u64,
    pub preferred: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewResponse {
    pub accepted: bool,
    pub voter: NodeId,
    pub promised_epoch: u64,
    pub last_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub epoch: u64,
    pub master: NodeId,
    pub prev_index: u64,
    pub prev_epoch: u64,
    pub entries: Vec<LogEntry>,
    pub commit_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub success: bool,
    /// Follower's last index after handling the request.
    pub last_index: u64,
    /// Highest epoch the follower has seen; a larger value deposes the sender.
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub epoch: u64,
    pub master: NodeId,
    pub snapshot: Snapshot,
    /// Epoch of the entry at `snapshot.up_to_index` on the sender.
    pub snapshot_epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchupRequest {
    pub learner: NodeId,
    pub from_index: u64,
    pub max_entries: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub learner: NodeId,
    pub from_index: u64,
    pub wait_ms: u64,
    pub max_entries: usize,
}

/// Entries served to a catching-up node.
///
/// When the requested range was already collapsed the batch starts with the
/// source's active `snapshot`; entries then continue from
/// `snapshot.up_to_index + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchupBatch {
    pub entries: Vec<LogEntry>,
    pub snapshot: Option<(Snapshot, u64)>,
    /// Highest applied index on the source when the batch was built.
    pub source_last_index: u64,
    pub master: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node: NodeId,
    pub role: NodeRole,
    pub master: Option<NodeId>,
    pub epoch: u64,
    pub last_index: u64,
    pub applied_index: u64,
    pub first_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRequest {
    Prepare(VoteRequest),
    Renew(RenewRequest),
    Relinquish { epoch: u64, holder: NodeId },
    AppendEntries(AppendEntriesRequest),
    InstallSnapshot(InstallSnapshotRequest),
    Catchup(CatchupRequest),
    Subscribe(SubscribeRequest),
    Status,
}

impl PeerRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            PeerRequest::Prepare(_) => "prepare",
            PeerRequest::Renew(_) => "renew",
            PeerRequest::Relinquish { .. } => "relinquish",
            PeerRequest::AppendEntries(_) => "append_entries",
            PeerRequest::InstallSnapshot(_) => "install_snapshot",
            PeerRequest::Catchup(_) => "catchup",
            PeerRequest::Subscribe(_) => "subscribe",
            PeerRequest::Status => "status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerResponse {
    Vote(VoteResponse),
    Renewed(RenewResponse),
    Relinquished,
    Appended(AppendEntriesResponse),
    SnapshotInstalled { last_index: u64 },
    Entries(CatchupBatch),
    Status(NodeStatus),
    Error(StoreError),
}

impl PeerResponse {
    /// Turn an `Error` response into `Err`, leaving other variants untouched.
    pub fn into_result(self) -> Result<PeerResponse> {
        match self {
            PeerResponse::Error(err) => Err(err),
            other => Ok(other),
        }
    }
}

/// Outbound side of peer messaging.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    /// Deliver `request` to node `to` and wait for its answer.
    async fn call(&self, to: &str, request: PeerRequest) -> Result<PeerResponse>;
}

/// Inbound side of peer messaging, implemented by a running node.
#[async_trait]
pub trait PeerHandler: Send + Sync + 'static {
    async fn handle(&self, from: &str, request: PeerRequest) -> PeerResponse;
}

/// Liveness view over cluster processes.
pub trait ProcessControl: Send + Sync {
    fn is_running(&self, node: &str) -> bool;
}

/// Shorthand for a transport failure reaching `to`.
pub fn unreachable(to: &str, reason: impl std::fmt::Display) -> StoreError {
    StoreError::Transport(format!("{to}: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_becomes_err() {
        let resp = PeerResponse::Error(StoreError::NotMaster(None));
        assert_eq!(resp.into_result(), Err(StoreError::NotMaster(None)));

        let ok = PeerResponse::Relinquished.into_result();
        assert_eq!(ok, Ok(PeerResponse::Relinquished));
    }

    #[test]
    fn requests_survive_bincode() {
        let req = PeerRequest::AppendEntries(AppendEntriesRequest {
            epoch: 4,
            master: "node_0".into(),
            prev_index: 9,
            prev_epoch: 3,
            entries: vec![LogEntry::new(10, 4, crate::Operation::delete("k")).unwrap()],
            commit_index: 9,
        });
        let bytes = bincode::serialize(&req).unwrap();
        let back: PeerRequest = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, req);
        assert_eq!(back.kind(), "append_entries");
    }
}
