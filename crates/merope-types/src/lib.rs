mod command;
mod error;
mod model;

pub use command::{
    validate_bucket_name, ConfigChange, ConfigChangeKind, KvCommand, KvResponse, Proposal,
    ProposalBody, SessionOp, SessionTag,
};
pub use error::{CommandOutcome, DbError, ErrorDomain};
pub use model::{
    AccountDescriptor, BucketDescriptor, KeyValue, Membership, ReadMode, Session,
    StateMachineKind, Transaction,
};

pub type ShardId = u64;
pub type ReplicaId = u64;
pub type ClientId = u64;

/// Client id of the no-op session. Commands tagged with it bypass
/// deduplication.
pub const NOOP_CLIENT_ID: ClientId = 0;

/// Maximum accepted bucket name length in bytes.
pub const MAX_BUCKET_NAME_BYTES: usize = 256;
