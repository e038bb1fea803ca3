//! Command execution shared by every state machine backend.
//!
//! Commands run against a read view plus an overlay of their own pending
//! writes; the backend commits the resulting [`WriteSet`] atomically.

use std::collections::BTreeMap;

use merope_types::{
    AccountDescriptor, BucketDescriptor, CommandOutcome, DbError, KeyValue, KvCommand, KvResponse,
};

pub(crate) trait StateView {
    fn account(&self, account_id: u64) -> Result<Option<AccountDescriptor>, DbError>;
    fn bucket(&self, account_id: u64, name: &str) -> Result<Option<BucketDescriptor>, DbError>;
    fn key(&self, account_id: u64, bucket: &str, key: &[u8]) -> Result<Option<KeyValue>, DbError>;
    /// Highest revision handed out so far on the shard.
    fn revision(&self) -> Result<i64, DbError>;
}

/// Pending mutations; `None` marks a deletion.
#[derive(Debug, Default)]
pub(crate) struct WriteSet {
    pub accounts: BTreeMap<u64, Option<AccountDescriptor>>,
    pub buckets: BTreeMap<(u64, String), Option<BucketDescriptor>>,
    pub keys: BTreeMap<(u64, String, Vec<u8>), Option<KeyValue>>,
    pub revision: Option<i64>,
}

struct Overlay<'a, V> {
    base: &'a V,
    writes: WriteSet,
}

impl<V: StateView> StateView for Overlay<'_, V> {
    fn account(&self, account_id: u64) -> Result<Option<AccountDescriptor>, DbError> {
        match self.writes.accounts.get(&account_id) {
            Some(staged) => Ok(staged.clone()),
            None => self.base.account(account_id),
        }
    }

    fn bucket(&self, account_id: u64, name: &str) -> Result<Option<BucketDescriptor>, DbError> {
        match self.writes.buckets.get(&(account_id, name.to_owned())) {
            Some(staged) => Ok(staged.clone()),
            None => self.base.bucket(account_id, name),
        }
    }

    fn key(&self, account_id: u64, bucket: &str, key: &[u8]) -> Result<Option<KeyValue>, DbError> {
        match self.writes.keys.get(&(account_id, bucket.to_owned(), key.to_vec())) {
            Some(staged) => Ok(staged.clone()),
            None => self.base.key(account_id, bucket, key),
        }
    }

    fn revision(&self) -> Result<i64, DbError> {
        match self.writes.revision {
            Some(rev) => Ok(rev),
            None => self.base.revision(),
        }
    }
}

/// Execute `cmds` in order. On the first business error the whole list is
/// discarded and an empty write set is returned with the error as outcome.
pub(crate) fn execute<V: StateView>(
    base: &V,
    timestamp_ns: i64,
    cmds: &[KvCommand],
) -> Result<(CommandOutcome, WriteSet), DbError> {
    let mut overlay = Overlay { base, writes: WriteSet::default() };
    let mut responses = Vec::with_capacity(cmds.len());
    for cmd in cmds {
        match apply_one(&mut overlay, timestamp_ns, cmd) {
            Ok(resp) => responses.push(resp),
            Err(e @ DbError::Storage(_)) => return Err(e),
            Err(e) => return Ok((Err(e), WriteSet::default())),
        }
    }
    Ok((Ok(responses), overlay.writes))
}

fn require_account<V: StateView>(st: &V, account_id: u64) -> Result<AccountDescriptor, DbError> {
    st.account(account_id)?
        .ok_or_else(|| DbError::NotFound(format!("account {account_id}")))
}

fn require_bucket<V: StateView>(
    st: &V,
    account_id: u64,
    name: &str,
) -> Result<BucketDescriptor, DbError> {
    st.bucket(account_id, name)?
        .ok_or_else(|| DbError::NotFound(format!("bucket '{name}' in account {account_id}")))
}

fn apply_one<V: StateView>(
    st: &mut Overlay<'_, V>,
    now: i64,
    cmd: &KvCommand,
) -> Result<KvResponse, DbError> {
    cmd.validate()?;
    match cmd {
        KvCommand::CreateAccount { account_id, owner } => {
            if st.account(*account_id)?.is_some() {
                return Err(DbError::AlreadyExists(format!("account {account_id}")));
            }
            let account = AccountDescriptor {
                account_id: *account_id,
                owner: owner.clone(),
                created_ns: now,
                last_updated_ns: now,
                bucket_count: 0,
                buckets: Vec::new(),
            };
            st.writes.accounts.insert(*account_id, Some(account.clone()));
            Ok(KvResponse::Account(account))
        }

        KvCommand::DeleteAccount { account_id, owner } => {
            let account = require_account(&*st, *account_id)?;
            if account.owner != *owner {
                return Err(DbError::InvalidArgument(format!(
                    "account {account_id} is not owned by '{owner}'"
                )));
            }
            if account.bucket_count > 0 {
                return Err(DbError::NotEmpty(format!(
                    "account {account_id} still has {} buckets",
                    account.bucket_count
                )));
            }
            st.writes.accounts.insert(*account_id, None);
            Ok(KvResponse::AccountDeleted)
        }

        KvCommand::CreateBucket { account_id, name, owner } => {
            let mut account = require_account(&*st, *account_id)?;
            if st.bucket(*account_id, name)?.is_some() {
                return Err(DbError::AlreadyExists(format!(
                    "bucket '{name}' in account {account_id}"
                )));
            }
            let bucket = BucketDescriptor {
                owner: owner.clone(),
                size: 0,
                key_count: 0,
                created_ns: now,
                last_updated_ns: now,
            };
            account.buckets.push(name.clone());
            account.bucket_count = account.buckets.len() as u64;
            account.last_updated_ns = now;
            st.writes.accounts.insert(*account_id, Some(account));
            st.writes.buckets.insert((*account_id, name.clone()), Some(bucket.clone()));
            Ok(KvResponse::Bucket(bucket))
        }

        KvCommand::DeleteBucket { account_id, name } => {
            let mut account = require_account(&*st, *account_id)?;
            let bucket = require_bucket(&*st, *account_id, name)?;
            if bucket.key_count > 0 {
                return Err(DbError::NotEmpty(format!(
                    "bucket '{name}' still holds {} keys",
                    bucket.key_count
                )));
            }
            account.buckets.retain(|b| b != name);
            account.bucket_count = account.buckets.len() as u64;
            account.last_updated_ns = now;
            st.writes.accounts.insert(*account_id, Some(account));
            st.writes.buckets.insert((*account_id, name.clone()), None);
            Ok(KvResponse::BucketDeleted)
        }

        KvCommand::PutKey { account_id, bucket, key, value, lease } => {
            let mut descriptor = require_bucket(&*st, *account_id, bucket)?;
            let revision = st.revision()? + 1;
            let kv = match st.key(*account_id, bucket, key)? {
                Some(current) => {
                    descriptor.size = descriptor
                        .size
                        .saturating_sub(current.value.len() as u64)
                        + value.len() as u64;
                    KeyValue {
                        key: key.clone(),
                        value: value.clone(),
                        create_revision: current.create_revision,
                        mod_revision: revision,
                        version: current.version + 1,
                        lease: *lease,
                    }
                }
                None => {
                    descriptor.key_count += 1;
                    descriptor.size += value.len() as u64;
                    KeyValue {
                        key: key.clone(),
                        value: value.clone(),
                        create_revision: revision,
                        mod_revision: revision,
                        version: 1,
                        lease: *lease,
                    }
                }
            };
            descriptor.last_updated_ns = now;
            st.writes.revision = Some(revision);
            st.writes.buckets.insert((*account_id, bucket.clone()), Some(descriptor));
            st.writes.keys.insert((*account_id, bucket.clone(), key.clone()), Some(kv.clone()));
            Ok(KvResponse::Put(kv))
        }

        KvCommand::DeleteKey { account_id, bucket, key } => {
            let mut descriptor = require_bucket(&*st, *account_id, bucket)?;
            let Some(current) = st.key(*account_id, bucket, key)? else {
                return Ok(KvResponse::KeyDeleted { found: false });
            };
            let revision = st.revision()? + 1;
            descriptor.key_count = descriptor.key_count.saturating_sub(1);
            descriptor.size = descriptor.size.saturating_sub(current.value.len() as u64);
            descriptor.last_updated_ns = now;
            st.writes.revision = Some(revision);
            st.writes.buckets.insert((*account_id, bucket.clone()), Some(descriptor));
            st.writes.keys.insert((*account_id, bucket.clone(), key.clone()), None);
            Ok(KvResponse::KeyDeleted { found: true })
        }
    }
}
