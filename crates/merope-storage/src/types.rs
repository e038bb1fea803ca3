use merope_types::{AccountDescriptor, BucketDescriptor, KeyValue};

/// Identity of a log entry: the term and node of the leader that proposed
/// it, and its position in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct EntryId {
    pub term: u64,
    pub node_id: u64,
    pub index: u64,
}

/// A single entry in the Raft log.
///
/// The payload is encoded by the consensus layer; storage only orders
/// entries by `index`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub data: Vec<u8>,
}

/// Last vote cast or received by a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VoteRecord {
    pub term: u64,
    pub node_id: u64,
    /// `true` once a quorum granted the vote.
    pub committed: bool,
}

/// Raft state that must survive a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct HardState {
    pub vote: Option<VoteRecord>,
    pub committed: Option<EntryId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct LogState {
    /// Smallest index currently in the log (`None` if log is empty).
    pub first_index: Option<u64>,
    /// Largest index currently in the log (`None` if log is empty).
    pub last_index: Option<u64>,
    /// Last entry that has been purged (compacted into a snapshot).
    pub last_purged: Option<EntryId>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SnapshotMeta {
    pub last_log: Option<EntryId>,
    /// UUID v4 string identifying this snapshot.
    pub snapshot_id: String,
    /// Cluster membership at `last_log`, encoded by the consensus layer.
    pub membership: Vec<u8>,
}

/// A full shard snapshot: raft metadata plus the replicated state.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

/// Backend-independent dump of one shard's state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub(crate) struct SnapshotContents {
    pub revision: i64,
    pub accounts: Vec<AccountDescriptor>,
    pub buckets: Vec<BucketRecord>,
    pub keys: Vec<KeyRecord>,
}

/// Stored bucket value, carrying its own coordinates.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub(crate) struct BucketRecord {
    pub account_id: u64,
    pub name: String,
    pub descriptor: BucketDescriptor,
}

/// Stored key value, carrying its own coordinates.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub(crate) struct KeyRecord {
    pub account_id: u64,
    pub bucket: String,
    pub kv: KeyValue,
}
