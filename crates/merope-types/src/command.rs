use serde::{Deserialize, Serialize};

use crate::{
    AccountDescriptor, BucketDescriptor, ClientId, DbError, KeyValue, ReplicaId,
    MAX_BUCKET_NAME_BYTES,
};

/// State-mutating operation applied by a shard state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvCommand {
    CreateAccount { account_id: u64, owner: String },
    DeleteAccount { account_id: u64, owner: String },
    CreateBucket { account_id: u64, name: String, owner: String },
    DeleteBucket { account_id: u64, name: String },
    PutKey { account_id: u64, bucket: String, key: Vec<u8>, value: Vec<u8>, lease: i64 },
    DeleteKey { account_id: u64, bucket: String, key: Vec<u8> },
}

impl KvCommand {
    pub fn account_id(&self) -> u64 {
        match self {
            KvCommand::CreateAccount { account_id, .. }
            | KvCommand::DeleteAccount { account_id, .. }
            | KvCommand::CreateBucket { account_id, .. }
            | KvCommand::DeleteBucket { account_id, .. }
            | KvCommand::PutKey { account_id, .. }
            | KvCommand::DeleteKey { account_id, .. } => *account_id,
        }
    }

    /// Shape checks that do not depend on replicated state.
    pub fn validate(&self) -> Result<(), DbError> {
        if self.account_id() == 0 {
            return Err(DbError::InvalidArgument("account id must not be zero".into()));
        }
        match self {
            KvCommand::CreateAccount { owner, .. } | KvCommand::DeleteAccount { owner, .. } => {
                require_owner(owner)
            }
            KvCommand::CreateBucket { name, owner, .. } => {
                validate_bucket_name(name)?;
                require_owner(owner)
            }
            KvCommand::DeleteBucket { name, .. } => validate_bucket_name(name),
            KvCommand::PutKey { bucket, key, .. } | KvCommand::DeleteKey { bucket, key, .. } => {
                validate_bucket_name(bucket)?;
                if key.is_empty() {
                    return Err(DbError::InvalidArgument("key must not be empty".into()));
                }
                Ok(())
            }
        }
    }
}

fn require_owner(owner: &str) -> Result<(), DbError> {
    if owner.is_empty() {
        return Err(DbError::InvalidArgument("owner must not be empty".into()));
    }
    Ok(())
}

pub fn validate_bucket_name(name: &str) -> Result<(), DbError> {
    if name.is_empty() {
        return Err(DbError::InvalidArgument("bucket name must not be empty".into()));
    }
    if name.len() > MAX_BUCKET_NAME_BYTES {
        return Err(DbError::InvalidArgument(format!(
            "bucket name exceeds {MAX_BUCKET_NAME_BYTES} bytes"
        )));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(DbError::InvalidArgument(format!("bucket name '{name}' contains '/' or NUL")));
    }
    Ok(())
}

/// Result of one applied `KvCommand`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvResponse {
    Account(AccountDescriptor),
    AccountDeleted,
    Bucket(BucketDescriptor),
    BucketDeleted,
    Put(KeyValue),
    KeyDeleted { found: bool },
}

/// Session identity carried by every proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionTag {
    pub client_id: ClientId,
    pub series_id: u64,
    pub responded_to: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProposalBody {
    Kv(KvCommand),
    /// Commands committed together; either all apply or none do.
    Batch(Vec<KvCommand>),
}

impl ProposalBody {
    pub fn into_commands(self) -> Vec<KvCommand> {
        match self {
            ProposalBody::Kv(cmd) => vec![cmd],
            ProposalBody::Batch(cmds) => cmds,
        }
    }
}

/// Replicated state machine command.
///
/// `timestamp_ns` is stamped by the proposing leader so every replica records
/// the same creation and update times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub session: SessionTag,
    pub timestamp_ns: i64,
    pub body: ProposalBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionOp {
    Register { client_id: ClientId },
    Unregister { client_id: ClientId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigChangeKind {
    AddReplica,
    AddObserver,
    AddWitness,
    Remove,
}

/// Membership change proposal. `expected_config_change_id` fences the change
/// against concurrent reconfiguration; `None` applies it unconditionally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChange {
    pub kind: ConfigChangeKind,
    pub replica_id: ReplicaId,
    pub address: String,
    pub expected_config_change_id: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_bad_shapes() {
        let zero = KvCommand::CreateAccount { account_id: 0, owner: "o".into() };
        assert!(matches!(zero.validate(), Err(DbError::InvalidArgument(_))));

        let no_owner = KvCommand::CreateAccount { account_id: 1, owner: String::new() };
        assert!(matches!(no_owner.validate(), Err(DbError::InvalidArgument(_))));

        let slash = KvCommand::DeleteBucket { account_id: 1, name: "a/b".into() };
        assert!(matches!(slash.validate(), Err(DbError::InvalidArgument(_))));

        let empty_key = KvCommand::DeleteKey { account_id: 1, bucket: "b".into(), key: vec![] };
        assert!(matches!(empty_key.validate(), Err(DbError::InvalidArgument(_))));

        let ok = KvCommand::PutKey {
            account_id: 1,
            bucket: "b".into(),
            key: b"k".to_vec(),
            value: b"v".to_vec(),
            lease: 0,
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn long_bucket_names_are_rejected() {
        let name = "x".repeat(MAX_BUCKET_NAME_BYTES + 1);
        assert!(validate_bucket_name(&name).is_err());
        assert!(validate_bucket_name(&name[1..]).is_ok());
    }
}
