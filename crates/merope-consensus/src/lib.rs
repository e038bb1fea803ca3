mod config;
mod host;
mod message;
mod network;
mod replica;
mod session;
mod store;
mod transaction;
mod transport;
mod types;

pub use config::{HostConfig, RaftConfig, StorageConfig};
pub use host::{NodeHost, ShardInfo};
pub use message::{RaftReply, RaftRequest, RaftRpc};
pub use replica::{ReplicaStatus, Role, SnapshotOptions};
pub use session::{SessionCheck, SessionTable};
pub use transaction::{TransactionManager, TxnState};
pub use transport::{InboundCall, LocalTransport, Transport};
pub use types::{ApplyResult, Command, MeropeRaft, ReplicaNode};

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock nanoseconds, stamped into proposals by the leader host.
pub(crate) fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}
