use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;

use merope_types::{
    AccountDescriptor, BucketDescriptor, CommandOutcome, DbError, KeyValue, KvCommand, ShardId,
};

use crate::apply::{execute, StateView, WriteSet};
use crate::traits::{LogStorage, StateMachineStore};
use crate::types::{
    BucketRecord, EntryId, HardState, KeyRecord, LogEntry, LogState, Snapshot, SnapshotContents,
};
use crate::{decode, encode};

// ---------------------------------------------------------------------------
// MemLogStorage
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ShardLog {
    entries: BTreeMap<u64, LogEntry>,
    last_purged: Option<EntryId>,
    hard_state: Option<HardState>,
    snapshot: Option<Snapshot>,
}

/// In-memory `LogStorage` keeping one `BTreeMap` per shard.
///
/// Used by `storage.in_memory` hosts and tests; not persisted across process
/// restarts.
#[derive(Clone, Default)]
pub struct MemLogStorage {
    inner: Arc<RwLock<HashMap<ShardId, ShardLog>>>,
}

impl MemLogStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStorage for MemLogStorage {
    async fn log_state(&self, shard_id: ShardId) -> Result<LogState, DbError> {
        let g = self.inner.read().await;
        Ok(g.get(&shard_id)
            .map(|log| LogState {
                first_index: log.entries.keys().next().copied(),
                last_index: log.entries.keys().next_back().copied(),
                last_purged: log.last_purged,
            })
            .unwrap_or_default())
    }

    async fn get_entry(&self, shard_id: ShardId, index: u64) -> Result<Option<LogEntry>, DbError> {
        let g = self.inner.read().await;
        Ok(g.get(&shard_id).and_then(|log| log.entries.get(&index).cloned()))
    }

    async fn get_entries(
        &self,
        shard_id: ShardId,
        from: u64,
        to_inclusive: u64,
    ) -> Result<Vec<LogEntry>, DbError> {
        if from > to_inclusive {
            return Ok(Vec::new());
        }
        let g = self.inner.read().await;
        Ok(g.get(&shard_id)
            .map(|log| log.entries.range(from..=to_inclusive).map(|(_, e)| e.clone()).collect())
            .unwrap_or_default())
    }

    async fn append(&self, shard_id: ShardId, entries: Vec<LogEntry>) -> Result<(), DbError> {
        let mut g = self.inner.write().await;
        let log = g.entry(shard_id).or_default();
        for entry in entries {
            log.entries.insert(entry.index, entry);
        }
        Ok(())
    }

    async fn truncate(&self, shard_id: ShardId, from_index: u64) -> Result<(), DbError> {
        let mut g = self.inner.write().await;
        if let Some(log) = g.get_mut(&shard_id) {
            log.entries.retain(|&idx, _| idx < from_index);
        }
        Ok(())
    }

    async fn purge(&self, shard_id: ShardId, up_to: EntryId) -> Result<(), DbError> {
        let mut g = self.inner.write().await;
        let log = g.entry(shard_id).or_default();
        log.entries.retain(|&idx, _| idx > up_to.index);
        log.last_purged = Some(up_to);
        Ok(())
    }

    async fn save_hard_state(&self, shard_id: ShardId, state: HardState) -> Result<(), DbError> {
        self.inner.write().await.entry(shard_id).or_default().hard_state = Some(state);
        Ok(())
    }

    async fn read_hard_state(&self, shard_id: ShardId) -> Result<Option<HardState>, DbError> {
        Ok(self.inner.read().await.get(&shard_id).and_then(|log| log.hard_state))
    }

    async fn save_snapshot(&self, shard_id: ShardId, snapshot: Snapshot) -> Result<(), DbError> {
        self.inner.write().await.entry(shard_id).or_default().snapshot = Some(snapshot);
        Ok(())
    }

    async fn read_snapshot(&self, shard_id: ShardId) -> Result<Option<Snapshot>, DbError> {
        Ok(self.inner.read().await.get(&shard_id).and_then(|log| log.snapshot.clone()))
    }

    async fn remove_shard(&self, shard_id: ShardId) -> Result<(), DbError> {
        self.inner.write().await.remove(&shard_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemStateMachine
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemShard {
    accounts: BTreeMap<u64, AccountDescriptor>,
    buckets: BTreeMap<(u64, String), BucketDescriptor>,
    keys: BTreeMap<(u64, String, Vec<u8>), KeyValue>,
    revision: i64,
}

impl StateView for MemShard {
    fn account(&self, account_id: u64) -> Result<Option<AccountDescriptor>, DbError> {
        Ok(self.accounts.get(&account_id).cloned())
    }

    fn bucket(&self, account_id: u64, name: &str) -> Result<Option<BucketDescriptor>, DbError> {
        Ok(self.buckets.get(&(account_id, name.to_owned())).cloned())
    }

    fn key(&self, account_id: u64, bucket: &str, key: &[u8]) -> Result<Option<KeyValue>, DbError> {
        Ok(self.keys.get(&(account_id, bucket.to_owned(), key.to_vec())).cloned())
    }

    fn revision(&self) -> Result<i64, DbError> {
        Ok(self.revision)
    }
}

impl MemShard {
    fn commit(&mut self, writes: WriteSet) {
        for (id, account) in writes.accounts {
            match account {
                Some(a) => self.accounts.insert(id, a),
                None => self.accounts.remove(&id),
            };
        }
        for (k, bucket) in writes.buckets {
            match bucket {
                Some(b) => self.buckets.insert(k, b),
                None => self.buckets.remove(&k),
            };
        }
        for (k, kv) in writes.keys {
            match kv {
                Some(v) => self.keys.insert(k, v),
                None => self.keys.remove(&k),
            };
        }
        if let Some(rev) = writes.revision {
            self.revision = rev;
        }
    }

    fn contents(&self) -> SnapshotContents {
        SnapshotContents {
            revision: self.revision,
            accounts: self.accounts.values().cloned().collect(),
            buckets: self
                .buckets
                .iter()
                .map(|((account_id, name), d)| BucketRecord {
                    account_id: *account_id,
                    name: name.clone(),
                    descriptor: d.clone(),
                })
                .collect(),
            keys: self
                .keys
                .iter()
                .map(|((account_id, bucket, _), kv)| KeyRecord {
                    account_id: *account_id,
                    bucket: bucket.clone(),
                    kv: kv.clone(),
                })
                .collect(),
        }
    }

    fn from_contents(contents: SnapshotContents) -> Self {
        MemShard {
            accounts: contents.accounts.into_iter().map(|a| (a.account_id, a)).collect(),
            buckets: contents
                .buckets
                .into_iter()
                .map(|r| ((r.account_id, r.name), r.descriptor))
                .collect(),
            keys: contents
                .keys
                .into_iter()
                .map(|r| ((r.account_id, r.bucket, r.kv.key.clone()), r.kv))
                .collect(),
            revision: contents.revision,
        }
    }
}

/// In-memory `StateMachineStore`; backs `TEST` shards and in-memory hosts.
#[derive(Clone, Default)]
pub struct MemStateMachine {
    inner: Arc<RwLock<HashMap<ShardId, MemShard>>>,
}

impl MemStateMachine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateMachineStore for MemStateMachine {
    async fn apply(
        &self,
        shard_id: ShardId,
        timestamp_ns: i64,
        cmds: Vec<KvCommand>,
    ) -> Result<CommandOutcome, DbError> {
        let mut g = self.inner.write().await;
        let shard = g.entry(shard_id).or_default();
        let (outcome, writes) = execute(&*shard, timestamp_ns, &cmds)?;
        shard.commit(writes);
        Ok(outcome)
    }

    async fn get_account(
        &self,
        shard_id: ShardId,
        account_id: u64,
    ) -> Result<Option<AccountDescriptor>, DbError> {
        let g = self.inner.read().await;
        Ok(g.get(&shard_id).and_then(|s| s.accounts.get(&account_id).cloned()))
    }

    async fn get_bucket(
        &self,
        shard_id: ShardId,
        account_id: u64,
        name: &str,
    ) -> Result<Option<BucketDescriptor>, DbError> {
        match self.inner.read().await.get(&shard_id) {
            Some(s) => s.bucket(account_id, name),
            None => Ok(None),
        }
    }

    async fn get_key(
        &self,
        shard_id: ShardId,
        account_id: u64,
        bucket: &str,
        key: &[u8],
    ) -> Result<Option<KeyValue>, DbError> {
        match self.inner.read().await.get(&shard_id) {
            Some(s) => s.key(account_id, bucket, key),
            None => Ok(None),
        }
    }

    async fn build_snapshot(&self, shard_id: ShardId) -> Result<Vec<u8>, DbError> {
        let g = self.inner.read().await;
        let contents = g.get(&shard_id).map(MemShard::contents).unwrap_or_default();
        encode(&contents)
    }

    async fn install_snapshot(&self, shard_id: ShardId, data: Vec<u8>) -> Result<(), DbError> {
        let contents: SnapshotContents = decode(&data)?;
        self.inner.write().await.insert(shard_id, MemShard::from_contents(contents));
        Ok(())
    }

    async fn remove_shard(&self, shard_id: ShardId) -> Result<(), DbError> {
        self.inner.write().await.remove(&shard_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use merope_types::KvResponse;

    use super::*;
    use crate::types::{SnapshotMeta, VoteRecord};

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry { index, term, data: vec![index as u8] }
    }

    fn create_account(id: u64) -> KvCommand {
        KvCommand::CreateAccount { account_id: id, owner: "alice".into() }
    }

    fn create_bucket(id: u64, name: &str) -> KvCommand {
        KvCommand::CreateBucket { account_id: id, name: name.into(), owner: "alice".into() }
    }

    fn put(id: u64, bucket: &str, key: &str, value: &str) -> KvCommand {
        KvCommand::PutKey {
            account_id: id,
            bucket: bucket.into(),
            key: key.as_bytes().to_vec(),
            value: value.as_bytes().to_vec(),
            lease: 0,
        }
    }

    fn put_response(outcome: CommandOutcome) -> KeyValue {
        match outcome.unwrap().pop() {
            Some(KvResponse::Put(kv)) => kv,
            other => panic!("unexpected response: {other:?}"),
        }
    }

    // -----------------------------------------------------------------------
    // MemLogStorage
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn log_append_truncate_purge() {
        let log = MemLogStorage::new();
        let shard = 7u64;

        log.append(shard, vec![entry(1, 1), entry(2, 1), entry(3, 2)]).await.unwrap();
        let state = log.log_state(shard).await.unwrap();
        assert_eq!(state.first_index, Some(1));
        assert_eq!(state.last_index, Some(3));

        assert_eq!(log.get_entries(shard, 2, 3).await.unwrap().len(), 2);
        assert!(log.get_entries(shard, 3, 2).await.unwrap().is_empty());

        log.truncate(shard, 3).await.unwrap();
        assert_eq!(log.log_state(shard).await.unwrap().last_index, Some(2));

        let purged = EntryId { term: 1, node_id: 1, index: 1 };
        log.purge(shard, purged).await.unwrap();
        let state = log.log_state(shard).await.unwrap();
        assert_eq!(state.first_index, Some(2));
        assert_eq!(state.last_purged, Some(purged));
        assert!(log.get_entry(shard, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn log_shards_are_isolated() {
        let log = MemLogStorage::new();
        log.append(1, vec![entry(1, 1)]).await.unwrap();
        log.append(2, vec![entry(1, 5), entry(2, 5)]).await.unwrap();

        assert_eq!(log.get_entry(1, 1).await.unwrap().unwrap().term, 1);
        assert_eq!(log.get_entry(2, 1).await.unwrap().unwrap().term, 5);

        log.remove_shard(2).await.unwrap();
        assert_eq!(log.log_state(2).await.unwrap(), LogState::default());
        assert_eq!(log.log_state(1).await.unwrap().last_index, Some(1));
    }

    #[tokio::test]
    async fn log_hard_state_and_snapshot() {
        let log = MemLogStorage::new();
        assert!(log.read_hard_state(1).await.unwrap().is_none());

        let hs = HardState {
            vote: Some(VoteRecord { term: 4, node_id: 2, committed: true }),
            committed: Some(EntryId { term: 4, node_id: 2, index: 9 }),
        };
        log.save_hard_state(1, hs).await.unwrap();
        assert_eq!(log.read_hard_state(1).await.unwrap(), Some(hs));

        let snapshot = Snapshot {
            meta: SnapshotMeta {
                last_log: Some(EntryId { term: 4, node_id: 2, index: 9 }),
                snapshot_id: "s".into(),
                membership: vec![7],
            },
            data: vec![1, 2, 3],
        };
        log.save_snapshot(1, snapshot.clone()).await.unwrap();
        assert_eq!(log.read_snapshot(1).await.unwrap(), Some(snapshot));
    }

    // -----------------------------------------------------------------------
    // MemStateMachine
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn sm_put_tracks_versions_and_revisions() {
        let sm = MemStateMachine::new();
        let shard = 1u64;
        sm.apply(shard, 100, vec![create_account(1), create_bucket(1, "b")])
            .await
            .unwrap()
            .unwrap();

        let first = put_response(sm.apply(shard, 200, vec![put(1, "b", "k", "v1")]).await.unwrap());
        assert_eq!(first.version, 1);
        assert_eq!(first.create_revision, first.mod_revision);

        let second =
            put_response(sm.apply(shard, 300, vec![put(1, "b", "k", "v22")]).await.unwrap());
        assert_eq!(second.version, 2);
        assert_eq!(second.create_revision, first.create_revision);
        assert!(second.mod_revision > first.mod_revision);

        let bucket = sm.get_bucket(shard, 1, "b").await.unwrap().unwrap();
        assert_eq!(bucket.key_count, 1);
        assert_eq!(bucket.size, 3);
        assert_eq!(bucket.last_updated_ns, 300);

        let stored = sm.get_key(shard, 1, "b", b"k").await.unwrap().unwrap();
        assert_eq!(stored, second);
    }

    #[tokio::test]
    async fn sm_delete_bucket_requires_empty() {
        let sm = MemStateMachine::new();
        let shard = 1u64;
        sm.apply(shard, 1, vec![create_account(1), create_bucket(1, "b"), put(1, "b", "k", "v")])
            .await
            .unwrap()
            .unwrap();

        let outcome = sm
            .apply(shard, 2, vec![KvCommand::DeleteBucket { account_id: 1, name: "b".into() }])
            .await
            .unwrap();
        assert!(matches!(outcome, Err(DbError::NotEmpty(_))));
        assert!(sm.get_bucket(shard, 1, "b").await.unwrap().is_some());

        let outcome = sm
            .apply(
                shard,
                3,
                vec![KvCommand::DeleteAccount { account_id: 1, owner: "alice".into() }],
            )
            .await
            .unwrap();
        assert!(matches!(outcome, Err(DbError::NotEmpty(_))));

        let deleted = sm
            .apply(shard, 4, vec![
                KvCommand::DeleteKey { account_id: 1, bucket: "b".into(), key: b"k".to_vec() },
                KvCommand::DeleteBucket { account_id: 1, name: "b".into() },
                KvCommand::DeleteAccount { account_id: 1, owner: "alice".into() },
            ])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deleted, vec![
            KvResponse::KeyDeleted { found: true },
            KvResponse::BucketDeleted,
            KvResponse::AccountDeleted,
        ]);
        assert!(sm.get_account(shard, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sm_batch_is_all_or_nothing() {
        let sm = MemStateMachine::new();
        let shard = 1u64;
        sm.apply(shard, 1, vec![create_account(1), create_bucket(1, "b")])
            .await
            .unwrap()
            .unwrap();

        let outcome = sm
            .apply(shard, 2, vec![put(1, "b", "k", "v"), put(1, "missing", "k", "v")])
            .await
            .unwrap();
        assert!(matches!(outcome, Err(DbError::NotFound(_))));
        assert!(sm.get_key(shard, 1, "b", b"k").await.unwrap().is_none());
        assert_eq!(sm.get_bucket(shard, 1, "b").await.unwrap().unwrap().key_count, 0);
    }

    #[tokio::test]
    async fn sm_batch_sees_its_own_writes() {
        let sm = MemStateMachine::new();
        let responses = sm
            .apply(1, 1, vec![
                create_account(5),
                create_bucket(5, "b"),
                put(5, "b", "k", "a"),
                put(5, "b", "k", "b"),
            ])
            .await
            .unwrap()
            .unwrap();
        match &responses[3] {
            KvResponse::Put(kv) => assert_eq!(kv.version, 2),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sm_duplicate_account_is_rejected() {
        let sm = MemStateMachine::new();
        sm.apply(1, 1, vec![create_account(1)]).await.unwrap().unwrap();
        let outcome = sm.apply(1, 2, vec![create_account(1)]).await.unwrap();
        assert!(matches!(outcome, Err(DbError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn sm_snapshot_round_trip() {
        let sm = MemStateMachine::new();
        sm.apply(1, 1, vec![create_account(1), create_bucket(1, "b"), put(1, "b", "k", "v")])
            .await
            .unwrap()
            .unwrap();
        let data = sm.build_snapshot(1).await.unwrap();

        let restored = MemStateMachine::new();
        restored.install_snapshot(9, data).await.unwrap();
        assert_eq!(
            restored.get_key(9, 1, "b", b"k").await.unwrap(),
            sm.get_key(1, 1, "b", b"k").await.unwrap()
        );

        let next = put_response(restored.apply(9, 2, vec![put(1, "b", "k2", "v")]).await.unwrap());
        let prev = sm.get_key(1, 1, "b", b"k").await.unwrap().unwrap();
        assert!(next.mod_revision > prev.mod_revision);
    }
}
