use serde::{Deserialize, Serialize};

use crate::{ClientId, KvResponse, ReplicaId, ShardId};

/// Result of applying one proposal to a shard state machine.
///
/// Business failures are part of the replicated outcome and are cached in
/// the session table, so they travel inside the `Ok` of storage calls.
pub type CommandOutcome = Result<Vec<KvResponse>, DbError>;

/// Which subsystem an error originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorDomain {
    Session,
    KeyValue,
    RaftControl,
    RaftCluster,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbError {
    #[error("operation timed out; it may or may not have been applied")]
    Timeout,
    #[error("stale config change id: expected {expected}, current {current}")]
    StaleConfig { expected: u64, current: u64 },
    #[error("command {series_id} of client {client_id} was already acknowledged")]
    DuplicateCommand { client_id: ClientId, series_id: u64 },
    #[error("client {client_id} has no registered session")]
    UnknownSession { client_id: ClientId },
    #[error("not the leader; leader: {leader_id:?}")]
    NotLeader { leader_id: Option<ReplicaId> },
    #[error("no quorum available")]
    NoQuorum,
    #[error("aborted: {0}")]
    Aborted(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("shard {shard_id} is not running on this host")]
    ShardNotFound { shard_id: ShardId },
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not empty: {0}")]
    NotEmpty(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("replica stopped")]
    Terminated,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("consensus error: {0}")]
    Consensus(String),
}

impl DbError {
    pub fn domain(&self) -> ErrorDomain {
        match self {
            DbError::DuplicateCommand { .. } | DbError::UnknownSession { .. } => {
                ErrorDomain::Session
            }
            DbError::Aborted(_)
            | DbError::NotFound(_)
            | DbError::AlreadyExists(_)
            | DbError::NotEmpty(_)
            | DbError::InvalidArgument(_) => ErrorDomain::KeyValue,
            DbError::Timeout
            | DbError::NotLeader { .. }
            | DbError::NoQuorum
            | DbError::Rejected(_)
            | DbError::Terminated
            | DbError::Storage(_)
            | DbError::Consensus(_) => ErrorDomain::RaftControl,
            DbError::StaleConfig { .. }
            | DbError::ShardNotFound { .. }
            | DbError::FailedPrecondition(_) => ErrorDomain::RaftCluster,
        }
    }

    /// Stable snake_case name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            DbError::Timeout => "timeout",
            DbError::StaleConfig { .. } => "stale_config",
            DbError::DuplicateCommand { .. } => "duplicate_command",
            DbError::UnknownSession { .. } => "unknown_session",
            DbError::NotLeader { .. } => "not_leader",
            DbError::NoQuorum => "no_quorum",
            DbError::Aborted(_) => "aborted",
            DbError::NotFound(_) => "not_found",
            DbError::ShardNotFound { .. } => "shard_not_found",
            DbError::AlreadyExists(_) => "already_exists",
            DbError::NotEmpty(_) => "not_empty",
            DbError::InvalidArgument(_) => "invalid_argument",
            DbError::FailedPrecondition(_) => "failed_precondition",
            DbError::Rejected(_) => "rejected",
            DbError::Terminated => "terminated",
            DbError::Storage(_) => "storage",
            DbError::Consensus(_) => "consensus",
        }
    }
}
