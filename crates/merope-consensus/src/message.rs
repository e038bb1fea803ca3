use openraft::error::{InstallSnapshotError, RaftError};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use serde::{Deserialize, Serialize};

use merope_types::{DbError, ReplicaId, ShardId};

use crate::types::MeropeRaft;

/// A raft RPC addressed to one replica of a shard.
#[derive(Debug, Serialize, Deserialize)]
pub struct RaftRequest {
    pub shard_id: ShardId,
    pub from_addr: String,
    pub to: ReplicaId,
    pub rpc: RaftRpc,
}

#[derive(Debug, Serialize, Deserialize)]
pub enum RaftRpc {
    Vote(VoteRequest<ReplicaId>),
    AppendEntries(AppendEntriesRequest<MeropeRaft>),
    InstallSnapshot(InstallSnapshotRequest<MeropeRaft>),
}

#[derive(Debug, Serialize, Deserialize)]
pub enum RaftReply {
    Vote(Result<VoteResponse<ReplicaId>, RaftError<ReplicaId>>),
    AppendEntries(Result<AppendEntriesResponse<ReplicaId>, RaftError<ReplicaId>>),
    InstallSnapshot(
        Result<InstallSnapshotResponse<ReplicaId>, RaftError<ReplicaId, InstallSnapshotError>>,
    ),
    /// The addressed replica is not running on the receiving host.
    NoReplica,
    /// The sender was removed from the shard and must not come back.
    Removed,
}

impl RaftRequest {
    pub fn encode(&self) -> Result<Vec<u8>, DbError> {
        merope_storage::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DbError> {
        merope_storage::decode(bytes)
    }
}

impl RaftReply {
    pub fn encode(&self) -> Result<Vec<u8>, DbError> {
        merope_storage::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DbError> {
        merope_storage::decode(bytes)
    }
}
