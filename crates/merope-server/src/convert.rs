use std::time::Duration;

use merope_consensus::{HostConfig, NodeHost, ShardInfo, Transport};
use merope_proto::server::{
    self as pb, index_state::ResultCode, operation_result, DbError as ProtoDbError, ErrorType,
    ReadConsistency, StateMachineType,
};
use merope_types::{
    AccountDescriptor, BucketDescriptor, DbError, ErrorDomain, KeyValue, KvResponse, Membership,
    ReadMode, Session, ShardId, StateMachineKind, Transaction,
};
use prost::Message;
use tonic::metadata::MetadataValue;
use tonic::{Code, Status};

/// Response metadata naming the current leader replica on `NotLeader`.
pub const LEADER_METADATA_KEY: &str = "merope-leader-id";

pub fn kv_to_proto(kv: KeyValue) -> pb::KeyValue {
    pb::KeyValue {
        key: kv.key,
        create_revision: kv.create_revision,
        mod_revision: kv.mod_revision,
        version: kv.version,
        value: kv.value,
        lease: kv.lease,
    }
}

pub fn account_to_proto(account: AccountDescriptor) -> pb::AccountDescriptor {
    pb::AccountDescriptor {
        account_id: account.account_id,
        owner: account.owner,
        created_ns: account.created_ns,
        last_updated_ns: account.last_updated_ns,
        bucket_count: account.bucket_count,
        buckets: account.buckets,
    }
}

pub fn bucket_to_proto(bucket: BucketDescriptor) -> pb::BucketDescriptor {
    pb::BucketDescriptor {
        owner: bucket.owner,
        size: bucket.size,
        key_count: bucket.key_count,
        created_ns: bucket.created_ns,
        last_updated_ns: bucket.last_updated_ns,
    }
}

pub fn session_from_proto(s: pb::Session) -> Session {
    Session {
        cluster_id: s.cluster_id,
        client_id: s.client_id,
        session_id: s.session_id,
        responded_to: s.responded_to,
    }
}

pub fn session_to_proto(s: Session) -> pb::Session {
    pb::Session {
        cluster_id: s.cluster_id,
        client_id: s.client_id,
        session_id: s.session_id,
        responded_to: s.responded_to,
    }
}

pub fn txn_from_proto(t: pb::Transaction) -> Transaction {
    Transaction {
        shard_id: t.shard_id,
        client_id: t.client_id,
        transaction_id: t.transaction_id,
        responded_to: t.responded_to,
    }
}

pub fn txn_to_proto(t: Transaction) -> pb::Transaction {
    pb::Transaction {
        shard_id: t.shard_id,
        client_id: t.client_id,
        transaction_id: t.transaction_id,
        responded_to: t.responded_to,
    }
}

/// Per-command commit result. Only key writes are staged in transactions.
pub fn operation_result(resp: KvResponse) -> pb::OperationResult {
    let result = match resp {
        KvResponse::Put(kv) => Some(operation_result::Result::Put(kv_to_proto(kv))),
        KvResponse::KeyDeleted { found } => Some(operation_result::Result::DeleteFound(found)),
        _ => None,
    };
    pb::OperationResult { result }
}

pub fn proto_read_consistency(raw: i32) -> ReadMode {
    match ReadConsistency::try_from(raw).unwrap_or(ReadConsistency::Linearizable) {
        ReadConsistency::Linearizable => ReadMode::Linearizable,
        ReadConsistency::Sequential => ReadMode::Sequential,
        ReadConsistency::Eventual => ReadMode::Eventual,
    }
}

pub fn proto_state_machine(raw: i32) -> Result<StateMachineKind, Status> {
    match StateMachineType::try_from(raw) {
        Ok(StateMachineType::Test) => Ok(StateMachineKind::Test),
        Ok(StateMachineType::Kv) => Ok(StateMachineKind::Kv),
        Err(_) => Err(Status::invalid_argument(format!("unknown state machine type {raw}"))),
    }
}

/// Zero means "use the server default".
pub fn request_timeout(timeout_ms: u64, default: Duration) -> Duration {
    if timeout_ms == 0 {
        default
    } else {
        Duration::from_millis(timeout_ms)
    }
}

/// Header describing the local replica of `shard_id`, if it runs here.
pub async fn header<T: Transport>(
    host: &NodeHost<T>,
    shard_id: ShardId,
) -> Option<pb::ResponseHeader> {
    let status = host.watch_status(shard_id).await.ok()?;
    let s = status.borrow();
    Some(pb::ResponseHeader {
        shard_id: s.shard_id,
        replica_id: s.replica_id,
        term: s.term,
        applied_index: s.applied,
    })
}

pub fn host_config_to_proto(c: &HostConfig) -> pb::HostConfig {
    pb::HostConfig {
        deployment_id: c.deployment_id,
        wal_dir: c.wal_dir.clone(),
        host_dir: c.host_dir.clone(),
        rtt_ms: c.rtt_ms,
        raft_address: c.raft_address.clone(),
        address_by_host_id: c.address_by_host_id,
        listen_address: c.listen_address.clone(),
        mutual_tls: c.mutual_tls,
        ca_file: c.ca_file.clone(),
        cert_file: c.cert_file.clone(),
        key_file: c.key_file.clone(),
        enable_metrics: c.enable_metrics,
        notify_commit: c.notify_commit,
        mailbox_capacity: c.mailbox_capacity as u64,
    }
}

pub fn shard_info_to_proto(info: ShardInfo) -> pb::ShardInfo {
    pb::ShardInfo {
        shard_id: info.shard_id,
        replica_id: info.replica_id,
        leader_id: info.leader_id.unwrap_or(0),
        is_leader: info.is_leader,
        is_observer: info.is_observer,
        is_witness: info.is_witness,
        term: info.term,
        commit_index: info.commit,
        applied_index: info.applied,
        config_change_id: info.config_change_id,
        pending_config_change: info.pending_config_change,
    }
}

pub fn membership_to_proto(m: Membership) -> pb::GetShardMembersResponse {
    pb::GetShardMembersResponse {
        config_change_id: m.config_change_id,
        replicas: m.replicas.into_iter().collect(),
        observers: m.observers.into_iter().collect(),
        witnesses: m.witnesses.into_iter().collect(),
        removed: m.removed.into_iter().collect(),
    }
}

/// Outcome code of a ReadIndex request.
pub fn read_index_code(result: &Result<u64, DbError>) -> ResultCode {
    match result {
        Ok(_) => ResultCode::Completed,
        Err(DbError::Timeout) => ResultCode::Timeout,
        Err(DbError::Terminated | DbError::ShardNotFound { .. }) => ResultCode::Terminated,
        Err(DbError::Rejected(_)) => ResultCode::Rejected,
        Err(DbError::NotLeader { .. } | DbError::NoQuorum) => ResultCode::Dropped,
        Err(_) => ResultCode::Aborted,
    }
}

fn error_type(domain: ErrorDomain) -> ErrorType {
    match domain {
        ErrorDomain::Session => ErrorType::Session,
        ErrorDomain::KeyValue => ErrorType::KeyValue,
        ErrorDomain::RaftControl => ErrorType::RaftControl,
        ErrorDomain::RaftCluster => ErrorType::RaftCluster,
    }
}

fn status_code(err: &DbError) -> Code {
    match err {
        DbError::Timeout => Code::DeadlineExceeded,
        DbError::StaleConfig { .. } | DbError::Aborted(_) => Code::Aborted,
        DbError::DuplicateCommand { .. } | DbError::AlreadyExists(_) => Code::AlreadyExists,
        DbError::UnknownSession { .. }
        | DbError::NotEmpty(_)
        | DbError::FailedPrecondition(_) => Code::FailedPrecondition,
        DbError::NotLeader { .. } | DbError::NoQuorum | DbError::Rejected(_) => Code::Unavailable,
        DbError::NotFound(_) | DbError::ShardNotFound { .. } => Code::NotFound,
        DbError::InvalidArgument(_) => Code::InvalidArgument,
        DbError::Terminated => Code::Cancelled,
        DbError::Storage(_) | DbError::Consensus(_) => Code::Internal,
    }
}

/// Map a database error onto a gRPC status. The encoded `DBError` travels
/// in the status details.
pub fn db_to_status(err: DbError) -> Status {
    let message = err.to_string();
    let detail = ProtoDbError {
        r#type: error_type(err.domain()) as i32,
        message: message.clone(),
        kind: err.kind().to_owned(),
    };
    let mut status =
        Status::with_details(status_code(&err), message, detail.encode_to_vec().into());
    if let DbError::NotLeader { leader_id: Some(id) } = err {
        if let Ok(val) = MetadataValue::try_from(id.to_string().as_str()) {
            status.metadata_mut().insert(LEADER_METADATA_KEY, val);
        }
    }
    status
}

/// The `DBError` carried by a status produced by [`db_to_status`].
pub fn status_db_error(status: &Status) -> Option<ProtoDbError> {
    if status.details().is_empty() {
        return None;
    }
    ProtoDbError::decode(status.details()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_carries_leader_hint() {
        let status = db_to_status(DbError::NotLeader { leader_id: Some(3) });
        assert_eq!(status.code(), Code::Unavailable);
        let leader = status.metadata().get(LEADER_METADATA_KEY).unwrap();
        assert_eq!(leader.to_str().unwrap(), "3");

        let detail = status_db_error(&status).unwrap();
        assert_eq!(detail.r#type, ErrorType::RaftControl as i32);
        assert_eq!(detail.kind, DbError::NotLeader { leader_id: None }.kind());
    }

    #[test]
    fn status_codes_follow_error_kind() {
        let cases = [
            (DbError::Timeout, Code::DeadlineExceeded),
            (DbError::StaleConfig { expected: 1, current: 2 }, Code::Aborted),
            (DbError::NotFound("k".into()), Code::NotFound),
            (DbError::NotEmpty("b".into()), Code::FailedPrecondition),
            (DbError::AlreadyExists("a".into()), Code::AlreadyExists),
            (DbError::InvalidArgument("x".into()), Code::InvalidArgument),
            (DbError::Storage("io".into()), Code::Internal),
        ];
        for (err, code) in cases {
            let status = db_to_status(err.clone());
            assert_eq!(status.code(), code, "{err:?}");
            assert_eq!(status_db_error(&status).unwrap().message, err.to_string());
        }
        assert!(status_db_error(&Status::internal("plain")).is_none());
    }

    #[test]
    fn read_index_codes() {
        assert_eq!(read_index_code(&Ok(7)), ResultCode::Completed);
        assert_eq!(read_index_code(&Err(DbError::Timeout)), ResultCode::Timeout);
        assert_eq!(read_index_code(&Err(DbError::NoQuorum)), ResultCode::Dropped);
        assert_eq!(read_index_code(&Err(DbError::Terminated)), ResultCode::Terminated);
        assert_eq!(read_index_code(&Err(DbError::Rejected("w".into()))), ResultCode::Rejected);
    }

    #[test]
    fn zero_timeout_uses_default() {
        let default = Duration::from_secs(3);
        assert_eq!(request_timeout(0, default), default);
        assert_eq!(request_timeout(250, default), Duration::from_millis(250));
    }
}
