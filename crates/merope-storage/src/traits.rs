use std::future::Future;

use merope_types::{
    AccountDescriptor, BucketDescriptor, CommandOutcome, DbError, KeyValue, KvCommand, ShardId,
};

use crate::types::{EntryId, HardState, LogEntry, LogState, Snapshot};

/// Persistent storage for the Raft logs of the shards hosted on a node.
///
/// Methods use RPITIT (`-> impl Future + Send`) so callers can stay generic
/// without an `async-trait` dependency.
///
/// This crate does not depend on `openraft`; the adapter lives in
/// `merope-consensus`.
pub trait LogStorage: Send + Sync + 'static {
    /// Return first index, last index, and last purged index for the shard.
    fn log_state(&self, shard_id: ShardId)
        -> impl Future<Output = Result<LogState, DbError>> + Send;

    /// Return the entry at `index`, or `None` if it has been purged or does
    /// not exist.
    fn get_entry(&self, shard_id: ShardId, index: u64)
        -> impl Future<Output = Result<Option<LogEntry>, DbError>> + Send;

    /// Return all entries in the inclusive range `[from, to_inclusive]`.
    fn get_entries(&self, shard_id: ShardId, from: u64, to_inclusive: u64)
        -> impl Future<Output = Result<Vec<LogEntry>, DbError>> + Send;

    /// Append entries, overwriting any existing entry at the same index.
    fn append(&self, shard_id: ShardId, entries: Vec<LogEntry>)
        -> impl Future<Output = Result<(), DbError>> + Send;

    /// Delete all entries with `index >= from_index` (conflict resolution).
    fn truncate(&self, shard_id: ShardId, from_index: u64)
        -> impl Future<Output = Result<(), DbError>> + Send;

    /// Delete all entries with `index <= up_to.index` and record `up_to` as
    /// the last purged entry.
    fn purge(&self, shard_id: ShardId, up_to: EntryId)
        -> impl Future<Output = Result<(), DbError>> + Send;

    /// Durably persist the vote and the committed entry. Called before a
    /// vote is granted.
    fn save_hard_state(&self, shard_id: ShardId, state: HardState)
        -> impl Future<Output = Result<(), DbError>> + Send;

    fn read_hard_state(&self, shard_id: ShardId)
        -> impl Future<Output = Result<Option<HardState>, DbError>> + Send;

    /// Replace the shard's latest snapshot.
    fn save_snapshot(&self, shard_id: ShardId, snapshot: Snapshot)
        -> impl Future<Output = Result<(), DbError>> + Send;

    fn read_snapshot(&self, shard_id: ShardId)
        -> impl Future<Output = Result<Option<Snapshot>, DbError>> + Send;

    /// Drop every entry, the hard state and the snapshot of the shard.
    fn remove_shard(&self, shard_id: ShardId)
        -> impl Future<Output = Result<(), DbError>> + Send;
}

/// Account, bucket and key state of a shard.
///
/// Implementations must apply a command list atomically: a business error
/// from any command leaves the state untouched.
pub trait StateMachineStore: Send + Sync + 'static {
    /// Apply committed commands stamped with the proposer's clock.
    ///
    /// The outer error is a storage failure; the inner outcome is the
    /// replicated result returned to the proposer.
    fn apply(&self, shard_id: ShardId, timestamp_ns: i64, cmds: Vec<KvCommand>)
        -> impl Future<Output = Result<CommandOutcome, DbError>> + Send;

    fn get_account(&self, shard_id: ShardId, account_id: u64)
        -> impl Future<Output = Result<Option<AccountDescriptor>, DbError>> + Send;

    fn get_bucket(&self, shard_id: ShardId, account_id: u64, name: &str)
        -> impl Future<Output = Result<Option<BucketDescriptor>, DbError>> + Send;

    fn get_key(&self, shard_id: ShardId, account_id: u64, bucket: &str, key: &[u8])
        -> impl Future<Output = Result<Option<KeyValue>, DbError>> + Send;

    /// Serialize the shard's state into snapshot data.
    fn build_snapshot(&self, shard_id: ShardId)
        -> impl Future<Output = Result<Vec<u8>, DbError>> + Send;

    /// Replace the shard's state with snapshot data from `build_snapshot`.
    fn install_snapshot(&self, shard_id: ShardId, data: Vec<u8>)
        -> impl Future<Output = Result<(), DbError>> + Send;

    /// Delete all state of the shard.
    fn remove_shard(&self, shard_id: ShardId)
        -> impl Future<Output = Result<(), DbError>> + Send;
}
