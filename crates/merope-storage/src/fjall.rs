use std::path::Path;
use std::sync::Arc;

use merope_types::{
    AccountDescriptor, BucketDescriptor, CommandOutcome, DbError, KeyValue, KvCommand, ShardId,
};

use crate::apply::{execute, StateView};
use crate::keys::{account_key, bucket_key, kv_key, meta_key, raft_log_key, shard_prefix};
use crate::traits::{LogStorage, StateMachineStore};
use crate::types::{
    BucketRecord, EntryId, HardState, KeyRecord, LogEntry, LogState, Snapshot, SnapshotContents,
};
use crate::{decode, encode};

const HARD_STATE: &str = "hard_state";
const SNAPSHOT: &str = "snapshot";
const LAST_PURGED: &str = "last_purged";
const REVISION: &str = "revision";

fn fjall_err(e: fjall::Error) -> DbError {
    DbError::Storage(e.to_string())
}

fn join_err(e: tokio::task::JoinError) -> DbError {
    DbError::Storage(e.to_string())
}

// ---------------------------------------------------------------------------
// FjallStore: shared handle wrapping all keyspaces
// ---------------------------------------------------------------------------

/// Shared storage handle.
///
/// All keyspaces live in a single fjall `Database` so that cross-keyspace
/// write batches are atomic.
pub struct FjallStore {
    pub db: fjall::Database,
    /// Raft log entries: `shard(8) ++ index(8)` → bincode(LogEntry)
    pub raft_log: fjall::Keyspace,
    /// `shard(8) ++ account(8)` → bincode(AccountDescriptor)
    pub accounts: fjall::Keyspace,
    /// `shard(8) ++ account(8) ++ name` → bincode(BucketRecord)
    pub buckets: fjall::Keyspace,
    /// `shard(8) ++ account(8) ++ len(2) ++ bucket ++ key` → bincode(KeyRecord)
    pub kv: fjall::Keyspace,
    /// Per-shard metadata: `shard(8) ++ label_utf8` → bincode(value)
    pub meta: fjall::Keyspace,
}

impl FjallStore {
    /// Open (or create) a `FjallStore` at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>, DbError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let raft_log =
            db.keyspace("raft_log", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let accounts =
            db.keyspace("accounts", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let buckets =
            db.keyspace("buckets", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let kv = db.keyspace("kv", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let meta = db.keyspace("meta", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        tracing::debug!(path = %path.display(), "fjall store opened");
        Ok(Arc::new(FjallStore { db, raft_log, accounts, buckets, kv, meta }))
    }

    /// Sync the journal to disk.
    pub fn persist(&self) -> Result<(), DbError> {
        self.db.persist(fjall::PersistMode::SyncAll).map_err(fjall_err)
    }

    fn meta_get<T: for<'de> serde::Deserialize<'de>>(
        &self,
        shard_id: ShardId,
        label: &str,
    ) -> Result<Option<T>, DbError> {
        match self.meta.get(meta_key(shard_id, label)).map_err(fjall_err)? {
            Some(b) => Ok(Some(decode::<T>(&b)?)),
            None => Ok(None),
        }
    }
}

/// All keys of `shard_id` in `keyspace`.
fn shard_keys(keyspace: &fjall::Keyspace, shard_id: ShardId) -> Result<Vec<Vec<u8>>, DbError> {
    keyspace
        .prefix(shard_prefix(shard_id))
        .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
        .collect()
}

/// All values of `shard_id` in `keyspace`, decoded.
fn shard_values<T: for<'de> serde::Deserialize<'de>>(
    keyspace: &fjall::Keyspace,
    shard_id: ShardId,
) -> Result<Vec<T>, DbError> {
    keyspace
        .prefix(shard_prefix(shard_id))
        .map(|g| g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode::<T>(&v)))
        .collect()
}

// ---------------------------------------------------------------------------
// FjallLogStorage
// ---------------------------------------------------------------------------

/// `LogStorage` backed by fjall.
///
/// All blocking I/O is wrapped in `tokio::task::spawn_blocking`.
#[derive(Clone)]
pub struct FjallLogStorage(pub Arc<FjallStore>);

impl LogStorage for FjallLogStorage {
    async fn log_state(&self, shard_id: ShardId) -> Result<LogState, DbError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<LogState, DbError> {
            let index_of = |k: &[u8]| -> Result<u64, DbError> {
                let idx: [u8; 8] = k[8..16]
                    .try_into()
                    .map_err(|_| DbError::Storage("short raft_log key".into()))?;
                Ok(u64::from_be_bytes(idx))
            };
            let mut iter = store.raft_log.prefix(shard_prefix(shard_id));
            let first_index = match iter.next() {
                Some(g) => Some(index_of(&g.into_inner().map_err(fjall_err)?.0)?),
                None => None,
            };
            let last_index = match iter.next_back() {
                Some(g) => Some(index_of(&g.into_inner().map_err(fjall_err)?.0)?),
                None => first_index,
            };
            let last_purged = store.meta_get::<EntryId>(shard_id, LAST_PURGED)?;
            Ok(LogState { first_index, last_index, last_purged })
        })
        .await
        .map_err(join_err)?
    }

    async fn get_entry(&self, shard_id: ShardId, index: u64) -> Result<Option<LogEntry>, DbError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<LogEntry>, DbError> {
            match store.raft_log.get(raft_log_key(shard_id, index)).map_err(fjall_err)? {
                Some(b) => Ok(Some(decode::<LogEntry>(&b)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(join_err)?
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
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<LogEntry>, DbError> {
            let start = raft_log_key(shard_id, from).to_vec();
            let end = raft_log_key(shard_id, to_inclusive).to_vec();
            store
                .raft_log
                .range(start..=end)
                .map(|g| {
                    g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode::<LogEntry>(&v))
                })
                .collect()
        })
        .await
        .map_err(join_err)?
    }

    async fn append(&self, shard_id: ShardId, entries: Vec<LogEntry>) -> Result<(), DbError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), DbError> {
            let mut batch = store.db.batch();
            for entry in &entries {
                batch.insert(&store.raft_log, raft_log_key(shard_id, entry.index), encode(entry)?);
            }
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn truncate(&self, shard_id: ShardId, from_index: u64) -> Result<(), DbError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), DbError> {
            let start = raft_log_key(shard_id, from_index).to_vec();
            let end = raft_log_key(shard_id, u64::MAX).to_vec();

            let keys: Vec<Vec<u8>> = store
                .raft_log
                .range(start..=end)
                .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
                .collect::<Result<_, _>>()?;

            if !keys.is_empty() {
                let mut batch = store.db.batch();
                for k in keys {
                    batch.remove(&store.raft_log, k);
                }
                batch.commit().map_err(fjall_err)?;
            }
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    async fn purge(&self, shard_id: ShardId, up_to: EntryId) -> Result<(), DbError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), DbError> {
            let start = raft_log_key(shard_id, 0).to_vec();
            let end = raft_log_key(shard_id, up_to.index).to_vec();

            let keys: Vec<Vec<u8>> = store
                .raft_log
                .range(start..=end)
                .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
                .collect::<Result<_, _>>()?;

            let mut batch = store.db.batch();
            for k in keys {
                batch.remove(&store.raft_log, k);
            }
            batch.insert(&store.meta, meta_key(shard_id, LAST_PURGED), encode(&up_to)?);
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn save_hard_state(&self, shard_id: ShardId, state: HardState) -> Result<(), DbError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), DbError> {
            store
                .meta
                .insert(meta_key(shard_id, HARD_STATE), encode(&state)?)
                .map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn read_hard_state(&self, shard_id: ShardId) -> Result<Option<HardState>, DbError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || store.meta_get::<HardState>(shard_id, HARD_STATE))
            .await
            .map_err(join_err)?
    }

    async fn save_snapshot(&self, shard_id: ShardId, snapshot: Snapshot) -> Result<(), DbError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), DbError> {
            store
                .meta
                .insert(meta_key(shard_id, SNAPSHOT), encode(&snapshot)?)
                .map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn read_snapshot(&self, shard_id: ShardId) -> Result<Option<Snapshot>, DbError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || store.meta_get::<Snapshot>(shard_id, SNAPSHOT))
            .await
            .map_err(join_err)?
    }

    async fn remove_shard(&self, shard_id: ShardId) -> Result<(), DbError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), DbError> {
            let keys = shard_keys(&store.raft_log, shard_id)?;
            let mut batch = store.db.batch();
            for k in keys {
                batch.remove(&store.raft_log, k);
            }
            for label in [HARD_STATE, SNAPSHOT, LAST_PURGED] {
                batch.remove(&store.meta, meta_key(shard_id, label));
            }
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }
}

// ---------------------------------------------------------------------------
// FjallStateMachine
// ---------------------------------------------------------------------------

/// Read view of one shard used by the command engine.
struct FjallView<'a> {
    store: &'a FjallStore,
    shard_id: ShardId,
}

impl StateView for FjallView<'_> {
    fn account(&self, account_id: u64) -> Result<Option<AccountDescriptor>, DbError> {
        match self.store.accounts.get(account_key(self.shard_id, account_id)).map_err(fjall_err)? {
            Some(b) => Ok(Some(decode::<AccountDescriptor>(&b)?)),
            None => Ok(None),
        }
    }

    fn bucket(&self, account_id: u64, name: &str) -> Result<Option<BucketDescriptor>, DbError> {
        let key = bucket_key(self.shard_id, account_id, name);
        match self.store.buckets.get(key).map_err(fjall_err)? {
            Some(b) => Ok(Some(decode::<BucketRecord>(&b)?.descriptor)),
            None => Ok(None),
        }
    }

    fn key(&self, account_id: u64, bucket: &str, key: &[u8]) -> Result<Option<KeyValue>, DbError> {
        let key = kv_key(self.shard_id, account_id, bucket, key);
        match self.store.kv.get(key).map_err(fjall_err)? {
            Some(b) => Ok(Some(decode::<KeyRecord>(&b)?.kv)),
            None => Ok(None),
        }
    }

    fn revision(&self) -> Result<i64, DbError> {
        Ok(self.store.meta_get::<i64>(self.shard_id, REVISION)?.unwrap_or(0))
    }
}

/// `StateMachineStore` backed by fjall; backs `KV` shards.
#[derive(Clone)]
pub struct FjallStateMachine {
    pub store: Arc<FjallStore>,
}

impl FjallStateMachine {
    pub fn new(store: Arc<FjallStore>) -> Self {
        FjallStateMachine { store }
    }
}

impl StateMachineStore for FjallStateMachine {
    async fn apply(
        &self,
        shard_id: ShardId,
        timestamp_ns: i64,
        cmds: Vec<KvCommand>,
    ) -> Result<CommandOutcome, DbError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<CommandOutcome, DbError> {
            let view = FjallView { store: &store, shard_id };
            let (outcome, writes) = execute(&view, timestamp_ns, &cmds)?;

            let mut batch = store.db.batch();
            for (account_id, account) in writes.accounts {
                let key = account_key(shard_id, account_id);
                match account {
                    Some(a) => batch.insert(&store.accounts, key, encode(&a)?),
                    None => batch.remove(&store.accounts, key),
                }
            }
            for ((account_id, name), bucket) in writes.buckets {
                let key = bucket_key(shard_id, account_id, &name);
                match bucket {
                    Some(descriptor) => {
                        let record = BucketRecord { account_id, name, descriptor };
                        batch.insert(&store.buckets, key, encode(&record)?)
                    }
                    None => batch.remove(&store.buckets, key),
                }
            }
            for ((account_id, bucket, user_key), kv) in writes.keys {
                let key = kv_key(shard_id, account_id, &bucket, &user_key);
                match kv {
                    Some(kv) => {
                        let record = KeyRecord { account_id, bucket, kv };
                        batch.insert(&store.kv, key, encode(&record)?)
                    }
                    None => batch.remove(&store.kv, key),
                }
            }
            if let Some(revision) = writes.revision {
                batch.insert(&store.meta, meta_key(shard_id, REVISION), encode(&revision)?);
            }
            batch.commit().map_err(fjall_err)?;
            Ok(outcome)
        })
        .await
        .map_err(join_err)?
    }

    async fn get_account(
        &self,
        shard_id: ShardId,
        account_id: u64,
    ) -> Result<Option<AccountDescriptor>, DbError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            FjallView { store: &store, shard_id }.account(account_id)
        })
        .await
        .map_err(join_err)?
    }

    async fn get_bucket(
        &self,
        shard_id: ShardId,
        account_id: u64,
        name: &str,
    ) -> Result<Option<BucketDescriptor>, DbError> {
        let store = self.store.clone();
        let name = name.to_owned();
        tokio::task::spawn_blocking(move || {
            FjallView { store: &store, shard_id }.bucket(account_id, &name)
        })
        .await
        .map_err(join_err)?
    }

    async fn get_key(
        &self,
        shard_id: ShardId,
        account_id: u64,
        bucket: &str,
        key: &[u8],
    ) -> Result<Option<KeyValue>, DbError> {
        let store = self.store.clone();
        let bucket = bucket.to_owned();
        let key = key.to_vec();
        tokio::task::spawn_blocking(move || {
            FjallView { store: &store, shard_id }.key(account_id, &bucket, &key)
        })
        .await
        .map_err(join_err)?
    }

    async fn build_snapshot(&self, shard_id: ShardId) -> Result<Vec<u8>, DbError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<u8>, DbError> {
            let contents = SnapshotContents {
                revision: store.meta_get::<i64>(shard_id, REVISION)?.unwrap_or(0),
                accounts: shard_values(&store.accounts, shard_id)?,
                buckets: shard_values(&store.buckets, shard_id)?,
                keys: shard_values(&store.kv, shard_id)?,
            };
            encode(&contents)
        })
        .await
        .map_err(join_err)?
    }

    async fn install_snapshot(&self, shard_id: ShardId, data: Vec<u8>) -> Result<(), DbError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<(), DbError> {
            let contents: SnapshotContents = decode(&data)?;

            let mut batch = store.db.batch();
            for k in shard_keys(&store.accounts, shard_id)? {
                batch.remove(&store.accounts, k);
            }
            for k in shard_keys(&store.buckets, shard_id)? {
                batch.remove(&store.buckets, k);
            }
            for k in shard_keys(&store.kv, shard_id)? {
                batch.remove(&store.kv, k);
            }
            for account in &contents.accounts {
                batch.insert(
                    &store.accounts,
                    account_key(shard_id, account.account_id),
                    encode(account)?,
                );
            }
            for record in &contents.buckets {
                batch.insert(
                    &store.buckets,
                    bucket_key(shard_id, record.account_id, &record.name),
                    encode(record)?,
                );
            }
            for record in &contents.keys {
                batch.insert(
                    &store.kv,
                    kv_key(shard_id, record.account_id, &record.bucket, &record.kv.key),
                    encode(record)?,
                );
            }
            batch.insert(&store.meta, meta_key(shard_id, REVISION), encode(&contents.revision)?);
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn remove_shard(&self, shard_id: ShardId) -> Result<(), DbError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<(), DbError> {
            let mut batch = store.db.batch();
            for k in shard_keys(&store.accounts, shard_id)? {
                batch.remove(&store.accounts, k);
            }
            for k in shard_keys(&store.buckets, shard_id)? {
                batch.remove(&store.buckets, k);
            }
            for k in shard_keys(&store.kv, shard_id)? {
                batch.remove(&store.kv, k);
            }
            batch.remove(&store.meta, meta_key(shard_id, REVISION));
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
