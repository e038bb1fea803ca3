//! openraft type configuration for shard replicas.

use std::fmt;
use std::io::Cursor;

use openraft::{Entry, RaftTypeConfig};
use serde::{Deserialize, Serialize};

use merope_types::{ClientId, DbError, KvResponse, Proposal, ReplicaId, SessionOp};

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct MeropeRaft;

impl RaftTypeConfig for MeropeRaft {
    type D = Command;
    type R = ApplyResult;
    type NodeId = ReplicaId;
    type Node = ReplicaNode;
    type Entry = Entry<Self>;
    type SnapshotData = Cursor<Vec<u8>>;
    type AsyncRuntime = openraft::TokioRuntime;
    type Responder = openraft::impls::OneshotResponder<Self>;
}

/// Application payload of a normal log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Proposal(Proposal),
    Session(SessionOp),
}

/// What applying a committed entry produced for its proposer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ApplyResult {
    #[default]
    Empty,
    Kv(Vec<KvResponse>),
    Session(ClientId),
    /// Replicated business error: every replica reached the same verdict.
    Failed(DbError),
}

/// Membership entry of one replica: where its host listens and whether it
/// votes without keeping data.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicaNode {
    pub addr: String,
    pub witness: bool,
}

impl ReplicaNode {
    pub fn new(addr: impl Into<String>) -> Self {
        ReplicaNode { addr: addr.into(), witness: false }
    }

    pub fn witness(addr: impl Into<String>) -> Self {
        ReplicaNode { addr: addr.into(), witness: true }
    }
}

impl fmt::Display for ReplicaNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.witness {
            write!(f, "{} (witness)", self.addr)
        } else {
            f.write_str(&self.addr)
        }
    }
}
