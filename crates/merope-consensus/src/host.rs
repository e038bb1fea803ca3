//! The node host: every replica running in this process, the storage they
//! share, and delivery of raft RPCs to them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio::task::JoinHandle;

use merope_storage::fjall::{FjallLogStorage, FjallStateMachine, FjallStore};
use merope_storage::mem::{MemLogStorage, MemStateMachine};
use merope_storage::{
    EntryId, HardState, LogEntry, LogState, LogStorage, Snapshot, StateMachineStore,
};
use merope_types::{
    AccountDescriptor, BucketDescriptor, ClientId, CommandOutcome, ConfigChange, ConfigChangeKind,
    DbError, KeyValue, KvCommand, KvResponse, Membership, Proposal, ProposalBody, ReadMode,
    ReplicaId, Session, SessionOp, SessionTag, ShardId, StateMachineKind, NOOP_CLIENT_ID,
};

use crate::config::{HostConfig, RaftConfig, StorageConfig};
use crate::message::{RaftReply, RaftRequest};
use crate::replica::{Replica, ReplicaStatus, SnapshotOptions};
use crate::transport::{InboundCall, Transport};
use crate::types::{ApplyResult, Command};

// ---------------------------------------------------------------------------
// Storage backends
// ---------------------------------------------------------------------------

/// Log storage shared by every replica of the host.
#[derive(Clone)]
enum LogBackend {
    Mem(MemLogStorage),
    Fjall(FjallLogStorage),
}

macro_rules! delegate_log {
    ($self:ident, $l:ident => $call:expr) => {
        match $self {
            LogBackend::Mem($l) => $call.await,
            LogBackend::Fjall($l) => $call.await,
        }
    };
}

impl LogStorage for LogBackend {
    async fn log_state(&self, shard_id: ShardId) -> Result<LogState, DbError> {
        delegate_log!(self, l => l.log_state(shard_id))
    }

    async fn get_entry(
        &self,
        shard_id: ShardId,
        index: u64,
    ) -> Result<Option<LogEntry>, DbError> {
        delegate_log!(self, l => l.get_entry(shard_id, index))
    }

    async fn get_entries(
        &self,
        shard_id: ShardId,
        from: u64,
        to_inclusive: u64,
    ) -> Result<Vec<LogEntry>, DbError> {
        delegate_log!(self, l => l.get_entries(shard_id, from, to_inclusive))
    }

    async fn append(&self, shard_id: ShardId, entries: Vec<LogEntry>) -> Result<(), DbError> {
        delegate_log!(self, l => l.append(shard_id, entries))
    }

    async fn truncate(&self, shard_id: ShardId, from_index: u64) -> Result<(), DbError> {
        delegate_log!(self, l => l.truncate(shard_id, from_index))
    }

    async fn purge(&self, shard_id: ShardId, up_to: EntryId) -> Result<(), DbError> {
        delegate_log!(self, l => l.purge(shard_id, up_to))
    }

    async fn save_hard_state(&self, shard_id: ShardId, state: HardState) -> Result<(), DbError> {
        delegate_log!(self, l => l.save_hard_state(shard_id, state))
    }

    async fn read_hard_state(&self, shard_id: ShardId) -> Result<Option<HardState>, DbError> {
        delegate_log!(self, l => l.read_hard_state(shard_id))
    }

    async fn save_snapshot(&self, shard_id: ShardId, snapshot: Snapshot) -> Result<(), DbError> {
        delegate_log!(self, l => l.save_snapshot(shard_id, snapshot))
    }

    async fn read_snapshot(&self, shard_id: ShardId) -> Result<Option<Snapshot>, DbError> {
        delegate_log!(self, l => l.read_snapshot(shard_id))
    }

    async fn remove_shard(&self, shard_id: ShardId) -> Result<(), DbError> {
        delegate_log!(self, l => l.remove_shard(shard_id))
    }
}

/// State machine of one shard: `TEST` shards are volatile, `KV` shards live
/// in fjall unless the whole host runs in memory.
#[derive(Clone)]
enum ShardStateMachine {
    Volatile(MemStateMachine),
    Durable(FjallStateMachine),
}

macro_rules! delegate_sm {
    ($self:ident, $s:ident => $call:expr) => {
        match $self {
            ShardStateMachine::Volatile($s) => $call.await,
            ShardStateMachine::Durable($s) => $call.await,
        }
    };
}

impl StateMachineStore for ShardStateMachine {
    async fn apply(
        &self,
        shard_id: ShardId,
        timestamp_ns: i64,
        cmds: Vec<KvCommand>,
    ) -> Result<CommandOutcome, DbError> {
        delegate_sm!(self, s => s.apply(shard_id, timestamp_ns, cmds))
    }

    async fn get_account(
        &self,
        shard_id: ShardId,
        account_id: u64,
    ) -> Result<Option<AccountDescriptor>, DbError> {
        delegate_sm!(self, s => s.get_account(shard_id, account_id))
    }

    async fn get_bucket(
        &self,
        shard_id: ShardId,
        account_id: u64,
        name: &str,
    ) -> Result<Option<BucketDescriptor>, DbError> {
        delegate_sm!(self, s => s.get_bucket(shard_id, account_id, name))
    }

    async fn get_key(
        &self,
        shard_id: ShardId,
        account_id: u64,
        bucket: &str,
        key: &[u8],
    ) -> Result<Option<KeyValue>, DbError> {
        delegate_sm!(self, s => s.get_key(shard_id, account_id, bucket, key))
    }

    async fn build_snapshot(&self, shard_id: ShardId) -> Result<Vec<u8>, DbError> {
        delegate_sm!(self, s => s.build_snapshot(shard_id))
    }

    async fn install_snapshot(&self, shard_id: ShardId, data: Vec<u8>) -> Result<(), DbError> {
        delegate_sm!(self, s => s.install_snapshot(shard_id, data))
    }

    async fn remove_shard(&self, shard_id: ShardId) -> Result<(), DbError> {
        delegate_sm!(self, s => s.remove_shard(shard_id))
    }
}

// ---------------------------------------------------------------------------
// NodeHost
// ---------------------------------------------------------------------------

/// Per-shard view reported by `GetHostInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    pub shard_id: ShardId,
    pub replica_id: ReplicaId,
    pub state_machine: StateMachineKind,
    pub leader_id: Option<ReplicaId>,
    pub is_leader: bool,
    pub is_observer: bool,
    pub is_witness: bool,
    pub term: u64,
    pub commit: u64,
    pub applied: u64,
    pub config_change_id: u64,
    pub pending_config_change: bool,
}

type ShardReplica = Replica<LogBackend, ShardStateMachine>;

struct ReplicaHandle {
    replica_id: ReplicaId,
    kind: StateMachineKind,
    replica: Arc<ShardReplica>,
    status: watch::Receiver<ReplicaStatus>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ReplicaHandle {
    fn running(&self) -> bool {
        self.status.borrow().running
    }
}

pub struct NodeHost<T> {
    config: HostConfig,
    raft: RaftConfig,
    log: LogBackend,
    durable: Option<FjallStateMachine>,
    transport: Arc<T>,
    replicas: RwLock<HashMap<ShardId, ReplicaHandle>>,
}

impl<T: Transport> NodeHost<T> {
    pub async fn open(
        config: HostConfig,
        raft: RaftConfig,
        storage: StorageConfig,
        transport: Arc<T>,
    ) -> Result<Arc<Self>, DbError> {
        config.validate().map_err(DbError::InvalidArgument)?;
        raft.validate().map_err(DbError::InvalidArgument)?;

        let (log, durable) = if storage.in_memory {
            (LogBackend::Mem(MemLogStorage::new()), None)
        } else {
            let path = storage.data_dir.join(&config.wal_dir);
            let store = tokio::task::spawn_blocking(move || FjallStore::open(&path))
                .await
                .map_err(|e| DbError::Storage(e.to_string()))??;
            (
                LogBackend::Fjall(FjallLogStorage(store.clone())),
                Some(FjallStateMachine::new(store)),
            )
        };
        tracing::info!(
            raft_address = %config.raft_address,
            in_memory = storage.in_memory,
            "node host opened"
        );
        Ok(Arc::new(NodeHost {
            config,
            raft,
            log,
            durable,
            transport,
            replicas: RwLock::new(HashMap::new()),
        }))
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn raft_address(&self) -> &str {
        &self.config.raft_address
    }

    /// Answer raft RPCs handed over by a [`LocalTransport`](crate::LocalTransport),
    /// each on its own task.
    pub fn spawn_inbound(
        self: &Arc<Self>,
        mut inbound: mpsc::UnboundedReceiver<InboundCall>,
    ) -> JoinHandle<()> {
        let host: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(call) = inbound.recv().await {
                let Some(host) = host.upgrade() else { break };
                tokio::spawn(async move {
                    let reply = host.handle_raft(call.request).await;
                    let _ = call.reply.send(reply);
                });
            }
        })
    }

    /// Hand a raft RPC to the addressed local replica.
    pub async fn handle_raft(&self, request: RaftRequest) -> RaftReply {
        let replica = {
            let replicas = self.replicas.read().await;
            match replicas.get(&request.shard_id) {
                Some(h) if h.replica_id == request.to && h.running() => h.replica.clone(),
                _ => {
                    tracing::trace!(
                        shard = request.shard_id,
                        to = request.to,
                        "no local replica for raft request"
                    );
                    return RaftReply::NoReplica;
                }
            }
        };
        replica.handle(request).await
    }

    // -----------------------------------------------------------------------
    // Shard lifecycle
    // -----------------------------------------------------------------------

    /// Bootstrap a single-voter shard and wait for it to elect itself.
    pub async fn new_shard(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        kind: StateMachineKind,
        address: Option<&str>,
        timeout: Duration,
    ) -> Result<(), DbError> {
        if replica_id == 0 {
            return Err(DbError::InvalidArgument("replica id must not be zero".into()));
        }
        let replica = {
            let mut replicas = self.replicas.write().await;
            if replicas.get(&shard_id).is_some_and(ReplicaHandle::running) {
                return Err(DbError::AlreadyExists(format!(
                    "shard {shard_id} is running on this host"
                )));
            }
            if self.has_state(shard_id).await? {
                return Err(DbError::AlreadyExists(format!(
                    "shard {shard_id} has data on this host"
                )));
            }
            self.launch(&mut replicas, shard_id, replica_id, kind).await?
        };
        let address = address
            .filter(|a| !a.is_empty())
            .unwrap_or(&self.config.raft_address)
            .to_owned();
        if let Err(e) = replica.bootstrap(address).await {
            if let Some(handle) = self.replicas.write().await.remove(&shard_id) {
                stop_handle(handle).await;
            }
            return Err(e);
        }

        let mut status = replica.subscribe();
        let wait = status.wait_for(|s| s.is_leader() || !s.running);
        let outcome = match tokio::time::timeout(timeout, wait).await {
            Err(_) => Err(DbError::Timeout),
            Ok(Err(_)) => Err(DbError::Terminated),
            Ok(Ok(s)) if !s.running => Err(DbError::Terminated),
            Ok(Ok(_)) => Ok(()),
        };
        if outcome.is_ok() {
            tracing::info!(shard = shard_id, replica = replica_id, ?kind, "shard bootstrapped");
        }
        outcome
    }

    /// Start a replica of an existing shard. `restart` resumes from local
    /// state; otherwise the replica joins with an empty log and waits for
    /// the leader to bring it up to date.
    pub async fn start_replica(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        kind: StateMachineKind,
        restart: bool,
        observer: bool,
    ) -> Result<(), DbError> {
        if replica_id == 0 {
            return Err(DbError::InvalidArgument("replica id must not be zero".into()));
        }
        let mut replicas = self.replicas.write().await;
        if replicas.get(&shard_id).is_some_and(ReplicaHandle::running) {
            return Err(DbError::AlreadyExists(format!(
                "shard {shard_id} is running on this host"
            )));
        }
        let has_state = self.has_state(shard_id).await?;
        if restart && !has_state {
            return Err(DbError::NotFound(format!("no local state for shard {shard_id}")));
        }
        if !restart && has_state {
            return Err(DbError::AlreadyExists(format!("shard {shard_id} has data on this host")));
        }
        self.launch(&mut replicas, shard_id, replica_id, kind).await?;
        tracing::info!(
            shard = shard_id,
            replica = replica_id,
            restart,
            observer,
            "replica started"
        );
        Ok(())
    }

    async fn launch(
        &self,
        replicas: &mut HashMap<ShardId, ReplicaHandle>,
        shard_id: ShardId,
        replica_id: ReplicaId,
        kind: StateMachineKind,
    ) -> Result<Arc<ShardReplica>, DbError> {
        let sm = match (kind, &self.durable) {
            (StateMachineKind::Kv, Some(durable)) => ShardStateMachine::Durable(durable.clone()),
            _ => ShardStateMachine::Volatile(MemStateMachine::new()),
        };
        let replica = Replica::open(
            shard_id,
            replica_id,
            self.config.raft_address.clone(),
            &self.raft,
            self.config.tick(),
            self.log.clone(),
            sm,
            self.transport.clone(),
        )
        .await?;
        let status = replica.subscribe();
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(replica.clone().run(stopped));
        if let Some(old) = replicas.remove(&shard_id) {
            stop_handle(old).await;
        }
        replicas.insert(
            shard_id,
            ReplicaHandle { replica_id, kind, replica: replica.clone(), status, stop, task },
        );
        Ok(replica)
    }

    async fn has_state(&self, shard_id: ShardId) -> Result<bool, DbError> {
        Ok(self.log.log_state(shard_id).await?.last_index.is_some()
            || self.log.read_hard_state(shard_id).await?.is_some()
            || self.log.read_snapshot(shard_id).await?.is_some())
    }

    /// Stop the local replica; its data stays on disk.
    pub async fn stop_replica(&self, shard_id: ShardId) -> Result<(), DbError> {
        let handle = self
            .replicas
            .write()
            .await
            .remove(&shard_id)
            .ok_or(DbError::ShardNotFound { shard_id })?;
        stop_handle(handle).await;
        Ok(())
    }

    /// Delete every trace of the shard from this host.
    pub async fn remove_data(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
    ) -> Result<(), DbError> {
        let mut replicas = self.replicas.write().await;
        if let Some(handle) = replicas.get(&shard_id) {
            if handle.running() {
                return Err(DbError::FailedPrecondition(format!(
                    "replica {} of shard {shard_id} is still running",
                    handle.replica_id
                )));
            }
            if handle.replica_id != replica_id {
                return Err(DbError::InvalidArgument(format!(
                    "shard {shard_id} on this host is replica {}, not {replica_id}",
                    handle.replica_id
                )));
            }
        }
        if let Some(handle) = replicas.remove(&shard_id) {
            stop_handle(handle).await;
        }
        self.log.remove_shard(shard_id).await?;
        if let Some(durable) = &self.durable {
            durable.remove_shard(shard_id).await?;
        }
        tracing::info!(shard = shard_id, replica = replica_id, "replica data removed");
        Ok(())
    }

    /// Stop every local replica and wait for their tasks.
    pub async fn stop(&self) {
        let handles: Vec<ReplicaHandle> =
            self.replicas.write().await.drain().map(|(_, h)| h).collect();
        for handle in handles {
            stop_handle(handle).await;
        }
        if let Some(durable) = &self.durable {
            let store = durable.store.clone();
            match tokio::task::spawn_blocking(move || store.persist()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "failed to flush storage"),
                Err(e) => tracing::warn!(error = %e, "storage flush task failed"),
            }
        }
        tracing::info!("node host stopped");
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn watch_status(
        &self,
        shard_id: ShardId,
    ) -> Result<watch::Receiver<ReplicaStatus>, DbError> {
        self.replicas
            .read()
            .await
            .get(&shard_id)
            .map(|h| h.status.clone())
            .ok_or(DbError::ShardNotFound { shard_id })
    }

    async fn replica(&self, shard_id: ShardId) -> Result<Arc<ShardReplica>, DbError> {
        self.replicas
            .read()
            .await
            .get(&shard_id)
            .filter(|h| h.running())
            .map(|h| h.replica.clone())
            .ok_or(DbError::ShardNotFound { shard_id })
    }

    async fn status(&self, shard_id: ShardId) -> Result<ReplicaStatus, DbError> {
        let replicas = self.replicas.read().await;
        let handle = replicas
            .get(&shard_id)
            .filter(|h| h.running())
            .ok_or(DbError::ShardNotFound { shard_id })?;
        let status = handle.status.borrow().clone();
        Ok(status)
    }

    /// Current leader as known locally, and whether one is known at all.
    pub async fn leader_id(
        &self,
        shard_id: ShardId,
    ) -> Result<(Option<ReplicaId>, bool), DbError> {
        let status = self.status(shard_id).await?;
        Ok((status.leader_id, status.leader_id.is_some()))
    }

    /// Term of the local replica if it currently leads the shard.
    pub async fn leader_term(&self, shard_id: ShardId) -> Option<u64> {
        match self.status(shard_id).await {
            Ok(s) if s.is_leader() => Some(s.term),
            _ => None,
        }
    }

    /// Membership as applied by the local replica.
    pub async fn shard_members(&self, shard_id: ShardId) -> Result<Membership, DbError> {
        Ok(self.replica(shard_id).await?.membership().await)
    }

    pub async fn host_info(&self) -> Vec<ShardInfo> {
        let replicas = self.replicas.read().await;
        let mut shards: Vec<ShardInfo> = replicas
            .values()
            .filter(|h| h.running())
            .map(|h| {
                let s = h.status.borrow();
                ShardInfo {
                    shard_id: s.shard_id,
                    replica_id: h.replica_id,
                    state_machine: h.kind,
                    leader_id: s.leader_id,
                    is_leader: s.is_leader(),
                    is_observer: s.is_observer(),
                    is_witness: s.is_witness(),
                    term: s.term,
                    commit: s.commit,
                    applied: s.applied,
                    config_change_id: s.membership.config_change_id,
                    pending_config_change: s.pending_config_change,
                }
            })
            .collect();
        shards.sort_by_key(|s| s.shard_id);
        shards
    }

    // -----------------------------------------------------------------------
    // Replica requests
    // -----------------------------------------------------------------------

    async fn propose_command(
        &self,
        shard_id: ShardId,
        command: Command,
        timeout: Duration,
    ) -> Result<ApplyResult, DbError> {
        let replica = self.replica(shard_id).await?;
        within(timeout, replica.propose(command)).await
    }

    /// Replicate a KV command (or batch) under `tag` and wait for its outcome.
    pub async fn propose(
        &self,
        shard_id: ShardId,
        tag: SessionTag,
        body: ProposalBody,
        timeout: Duration,
    ) -> Result<Vec<KvResponse>, DbError> {
        match &body {
            ProposalBody::Kv(cmd) => cmd.validate()?,
            ProposalBody::Batch(cmds) => cmds.iter().try_for_each(KvCommand::validate)?,
        }
        let command = Command::Proposal(Proposal {
            session: tag,
            timestamp_ns: crate::now_ns(),
            body,
        });
        match self.propose_command(shard_id, command, timeout).await? {
            ApplyResult::Kv(responses) => Ok(responses),
            other => Err(DbError::Consensus(format!("unexpected apply result {other:?}"))),
        }
    }

    /// Confirm leadership with a quorum and wait until the local state has
    /// caught up with the returned index.
    pub async fn read_index(&self, shard_id: ShardId, timeout: Duration) -> Result<u64, DbError> {
        let replica = self.replica(shard_id).await?;
        within(timeout, replica.read_index()).await
    }

    async fn readable(
        &self,
        shard_id: ShardId,
        mode: ReadMode,
        timeout: Duration,
    ) -> Result<ShardStateMachine, DbError> {
        let replica = self.replica(shard_id).await?;
        if replica.subscribe().borrow().is_witness() {
            return Err(DbError::Rejected(format!(
                "the replica of shard {shard_id} on this host is a witness and holds no data"
            )));
        }
        if mode == ReadMode::Linearizable {
            within(timeout, replica.read_index()).await?;
        }
        Ok(replica.state_machine().clone())
    }

    pub async fn get_key(
        &self,
        shard_id: ShardId,
        account_id: u64,
        bucket: &str,
        key: &[u8],
        mode: ReadMode,
        timeout: Duration,
    ) -> Result<Option<KeyValue>, DbError> {
        let sm = self.readable(shard_id, mode, timeout).await?;
        sm.get_key(shard_id, account_id, bucket, key).await
    }

    pub async fn get_account(
        &self,
        shard_id: ShardId,
        account_id: u64,
        mode: ReadMode,
        timeout: Duration,
    ) -> Result<Option<AccountDescriptor>, DbError> {
        let sm = self.readable(shard_id, mode, timeout).await?;
        sm.get_account(shard_id, account_id).await
    }

    pub async fn get_bucket(
        &self,
        shard_id: ShardId,
        account_id: u64,
        name: &str,
        mode: ReadMode,
        timeout: Duration,
    ) -> Result<Option<BucketDescriptor>, DbError> {
        let sm = self.readable(shard_id, mode, timeout).await?;
        sm.get_bucket(shard_id, account_id, name).await
    }

    /// Register a client session on the shard. Client id 0 asks the host to
    /// pick a random id.
    pub async fn new_session(
        &self,
        shard_id: ShardId,
        client_id: ClientId,
        timeout: Duration,
    ) -> Result<Session, DbError> {
        let client_id = if client_id == NOOP_CLIENT_ID { random_client_id() } else { client_id };
        let command = Command::Session(SessionOp::Register { client_id });
        match self.propose_command(shard_id, command, timeout).await? {
            ApplyResult::Session(id) => Ok(Session::new(shard_id, id)),
            other => Err(DbError::Consensus(format!("unexpected apply result {other:?}"))),
        }
    }

    pub async fn close_session(
        &self,
        shard_id: ShardId,
        client_id: ClientId,
        timeout: Duration,
    ) -> Result<(), DbError> {
        if client_id == NOOP_CLIENT_ID {
            return Ok(());
        }
        let command = Command::Session(SessionOp::Unregister { client_id });
        self.propose_command(shard_id, command, timeout).await?;
        Ok(())
    }

    /// Change the shard's membership and return the new config change id.
    ///
    /// Without an explicit fencing token the locally applied epoch is used.
    pub async fn request_membership_change(
        &self,
        shard_id: ShardId,
        kind: ConfigChangeKind,
        replica_id: ReplicaId,
        address: &str,
        config_change_id: Option<u64>,
        timeout: Duration,
    ) -> Result<u64, DbError> {
        if replica_id == 0 {
            return Err(DbError::InvalidArgument("replica id must not be zero".into()));
        }
        let replica = self.replica(shard_id).await?;
        let expected = match config_change_id {
            Some(id) => id,
            None => replica.membership().await.config_change_id,
        };
        let change = ConfigChange {
            kind,
            replica_id,
            address: address.to_owned(),
            expected_config_change_id: Some(expected),
        };
        within(timeout, replica.change_membership(change)).await
    }

    pub async fn snapshot(
        &self,
        shard_id: ShardId,
        options: SnapshotOptions,
        timeout: Duration,
    ) -> Result<u64, DbError> {
        let replica = self.replica(shard_id).await?;
        within(timeout, replica.snapshot(options)).await
    }

    pub async fn compact(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        timeout: Duration,
    ) -> Result<(), DbError> {
        let local = self.status(shard_id).await?.replica_id;
        if local != replica_id {
            return Err(DbError::InvalidArgument(format!(
                "shard {shard_id} on this host is replica {local}, not {replica_id}"
            )));
        }
        let replica = self.replica(shard_id).await?;
        within(timeout, replica.compact()).await
    }
}

async fn within<R>(
    timeout: Duration,
    request: impl Future<Output = Result<R, DbError>>,
) -> Result<R, DbError> {
    tokio::time::timeout(timeout, request).await.unwrap_or(Err(DbError::Timeout))
}

async fn stop_handle(handle: ReplicaHandle) {
    let _ = handle.stop.send(());
    if let Err(e) = handle.task.await {
        tracing::warn!(replica = handle.replica_id, error = %e, "replica task ended abnormally");
    }
}

fn random_client_id() -> ClientId {
    loop {
        let id = rand::random::<u64>();
        if id != NOOP_CLIENT_ID {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use merope_types::DbError;

    use super::*;
    use crate::test_support::*;

    #[tokio::test]
    async fn new_shard_elects_and_refuses_duplicates() {
        let cluster = Cluster::new(1).await;
        let host = &cluster.hosts[0];
        host.new_shard(1, 1, StateMachineKind::Kv, None, WAIT).await.unwrap();

        assert_eq!(host.leader_id(1).await.unwrap(), (Some(1), true));
        assert!(matches!(
            host.new_shard(1, 1, StateMachineKind::Kv, None, WAIT).await,
            Err(DbError::AlreadyExists(_))
        ));
        assert!(matches!(
            host.start_replica(2, 1, StateMachineKind::Kv, true, false).await,
            Err(DbError::NotFound(_))
        ));
        let info = host.host_info().await;
        assert_eq!(info.len(), 1);
        assert!(info[0].is_leader);
        assert_eq!(info[0].config_change_id, 1);
    }

    #[tokio::test]
    async fn session_commands_apply_exactly_once() {
        let cluster = Cluster::new(1).await;
        let host = &cluster.hosts[0];
        host.new_shard(1, 1, StateMachineKind::Kv, None, WAIT).await.unwrap();
        setup_bucket(host, 1).await;

        let mut session = host.new_session(1, 42, WAIT).await.unwrap();
        assert_eq!(session.session_id, 1);
        let first = host.propose(1, session.tag(), put("k", "v"), WAIT).await.unwrap();
        let replay = host.propose(1, session.tag(), put("k", "v"), WAIT).await.unwrap();
        assert_eq!(first, replay);
        session.proposal_completed();

        let kv =
            host.get_key(1, 1, "b", b"k", ReadMode::Linearizable, WAIT).await.unwrap().unwrap();
        assert_eq!(kv.version, 1);

        // an acknowledged command can no longer be replayed
        let mut stale = session;
        stale.session_id = 1;
        stale.responded_to = 0;
        host.propose(1, session.tag(), put("k", "v2"), WAIT).await.unwrap();
        session.proposal_completed();
        host.propose(1, session.tag(), put("k", "v3"), WAIT).await.unwrap();
        assert!(matches!(
            host.propose(1, stale.tag(), put("k", "v"), WAIT).await,
            Err(DbError::DuplicateCommand { client_id: 42, series_id: 1 })
        ));

        host.close_session(1, 42, WAIT).await.unwrap();
        assert!(matches!(
            host.propose(1, session.tag(), put("k", "v4"), WAIT).await,
            Err(DbError::UnknownSession { client_id: 42 })
        ));
    }

    #[tokio::test]
    async fn replicas_join_and_follow() {
        let cluster = Cluster::new(3).await;
        cluster.form_shard(1, StateMachineKind::Kv).await;
        let leader = cluster.leader(1).await;
        setup_bucket(leader, 1).await;
        leader.propose(1, SessionTag::default(), put("k", "v"), WAIT).await.unwrap();

        let applied = leader.watch_status(1).await.unwrap().borrow().applied;
        for host in &cluster.hosts {
            wait_status(host, 1, |s| s.applied >= applied).await;
            let kv = host.get_key(1, 1, "b", b"k", ReadMode::Sequential, WAIT).await.unwrap();
            assert_eq!(kv.unwrap().value, b"v");
        }
        let members = leader.shard_members(1).await.unwrap();
        assert_eq!(members.replicas.len(), 3);
    }

    #[tokio::test]
    async fn stale_fencing_token_is_refused() {
        let cluster = Cluster::new(2).await;
        let host = &cluster.hosts[0];
        host.new_shard(1, 1, StateMachineKind::Test, None, WAIT).await.unwrap();
        let epoch = host.shard_members(1).await.unwrap().config_change_id;

        let stale = host
            .request_membership_change(
                1,
                ConfigChangeKind::AddObserver,
                2,
                &cluster.addr(1),
                Some(epoch + 5),
                WAIT,
            )
            .await;
        assert_eq!(stale, Err(DbError::StaleConfig { expected: epoch + 5, current: epoch }));

        cluster.hosts[1].start_replica(1, 2, StateMachineKind::Test, false, true).await.unwrap();
        let next = host
            .request_membership_change(
                1,
                ConfigChangeKind::AddObserver,
                2,
                &cluster.addr(1),
                Some(epoch),
                WAIT,
            )
            .await
            .unwrap();
        assert!(next > epoch);
        let again = host
            .request_membership_change(1, ConfigChangeKind::AddReplica, 2, "", Some(epoch), WAIT)
            .await;
        assert!(matches!(again, Err(DbError::StaleConfig { .. })));

        let promoted = host
            .request_membership_change(1, ConfigChangeKind::AddReplica, 2, "", Some(next), WAIT)
            .await
            .unwrap();
        assert!(promoted > next);
        let members = host.shard_members(1).await.unwrap();
        assert!(members.observers.is_empty());
        assert_eq!(members.replicas.len(), 2);
    }

    #[tokio::test]
    async fn leader_failover_keeps_committed_data() {
        let cluster = Cluster::new(3).await;
        cluster.form_shard(1, StateMachineKind::Kv).await;
        let leader = cluster.leader(1).await;
        setup_bucket(leader, 1).await;
        leader.propose(1, SessionTag::default(), put("k", "v"), WAIT).await.unwrap();
        let old = leader.watch_status(1).await.unwrap().borrow().replica_id;
        let applied = leader.watch_status(1).await.unwrap().borrow().applied;
        for host in &cluster.hosts {
            wait_status(host, 1, |s| s.applied >= applied).await;
        }

        leader.stop_replica(1).await.unwrap();
        let next = cluster.leader(1).await;
        assert_ne!(next.watch_status(1).await.unwrap().borrow().replica_id, old);
        next.propose(1, SessionTag::default(), put("k2", "v2"), WAIT).await.unwrap();
        let kv = next.get_key(1, 1, "b", b"k", ReadMode::Linearizable, WAIT).await.unwrap();
        assert_eq!(kv.unwrap().value, b"v");
    }

    #[tokio::test]
    async fn isolated_leader_reports_no_leader() {
        let cluster = Cluster::new(3).await;
        cluster.form_shard(1, StateMachineKind::Kv).await;
        let leader = cluster.leader(1).await;
        let old = leader.watch_status(1).await.unwrap().borrow().replica_id;
        assert_eq!(leader.leader_id(1).await.unwrap(), (Some(old), true));

        let old_addr = cluster.addr(old as usize - 1);
        cluster.transport.isolate(&old_addr);
        wait_status(leader, 1, |s| !s.is_leader()).await;
        assert_eq!(leader.leader_id(1).await.unwrap(), (None, false));
        assert!(matches!(
            leader.propose(1, SessionTag::default(), put("k", "v"), WAIT).await,
            Err(DbError::NotLeader { leader_id: None })
        ));

        for host in cluster.hosts.iter().filter(|h| h.raft_address() != old_addr) {
            wait_status(host, 1, |s| s.leader_id.is_some_and(|id| id != old)).await;
            let (leader_id, available) = host.leader_id(1).await.unwrap();
            assert!(available);
            assert_ne!(leader_id, Some(old));
        }
        cluster.transport.heal(&old_addr);
    }

    #[tokio::test]
    async fn witness_votes_but_serves_no_reads() {
        let cluster = Cluster::new(3).await;
        let host = &cluster.hosts[0];
        host.new_shard(1, 1, StateMachineKind::Kv, None, WAIT).await.unwrap();
        cluster.hosts[1].start_replica(1, 2, StateMachineKind::Kv, false, false).await.unwrap();
        host
            .request_membership_change(
                1,
                ConfigChangeKind::AddReplica,
                2,
                &cluster.addr(1),
                None,
                WAIT,
            )
            .await
            .unwrap();
        cluster.hosts[2].start_replica(1, 3, StateMachineKind::Kv, false, false).await.unwrap();
        host
            .request_membership_change(
                1,
                ConfigChangeKind::AddWitness,
                3,
                &cluster.addr(2),
                None,
                WAIT,
            )
            .await
            .unwrap();
        setup_bucket(host, 1).await;

        let witness = &cluster.hosts[2];
        wait_status(witness, 1, |s| s.is_witness()).await;
        assert!(matches!(
            witness.get_key(1, 1, "b", b"k", ReadMode::Sequential, WAIT).await,
            Err(DbError::Rejected(_))
        ));
        let promote = host
            .request_membership_change(
                1,
                ConfigChangeKind::AddReplica,
                3,
                &cluster.addr(2),
                None,
                WAIT,
            )
            .await;
        assert!(matches!(promote, Err(DbError::FailedPrecondition(_))));
    }

    #[tokio::test]
    async fn removed_replica_stops_and_data_can_be_purged() {
        let cluster = Cluster::new(2).await;
        cluster.form_shard(1, StateMachineKind::Kv).await;
        let removed = &cluster.hosts[1];
        assert!(matches!(removed.remove_data(1, 2).await, Err(DbError::FailedPrecondition(_))));

        let leader = &cluster.hosts[0];
        leader
            .request_membership_change(1, ConfigChangeKind::Remove, 2, "", None, WAIT)
            .await
            .unwrap();
        wait_status(removed, 1, |s| !s.running).await;
        removed.remove_data(1, 2).await.unwrap();
        assert!(matches!(
            removed.start_replica(1, 2, StateMachineKind::Kv, true, false).await,
            Err(DbError::NotFound(_))
        ));

        let rejoin = leader
            .request_membership_change(
                1,
                ConfigChangeKind::AddReplica,
                2,
                &cluster.addr(1),
                None,
                WAIT,
            )
            .await;
        assert!(matches!(rejoin, Err(DbError::FailedPrecondition(_))));
    }

    #[tokio::test]
    async fn lagging_replica_catches_up_from_snapshot() {
        let cluster = Cluster::new(2).await;
        let host = &cluster.hosts[0];
        host.new_shard(1, 1, StateMachineKind::Kv, None, WAIT).await.unwrap();
        setup_bucket(host, 1).await;
        for i in 0..10 {
            host.propose(1, SessionTag::default(), put(&format!("k{i}"), "v"), WAIT).await.unwrap();
        }
        let options = SnapshotOptions { compaction_overhead: Some(0), export_path: None };
        let index = host.snapshot(1, options, WAIT).await.unwrap();
        assert!(index >= 12);

        cluster.hosts[1].start_replica(1, 2, StateMachineKind::Kv, false, false).await.unwrap();
        host
            .request_membership_change(
                1,
                ConfigChangeKind::AddObserver,
                2,
                &cluster.addr(1),
                None,
                WAIT,
            )
            .await
            .unwrap();
        let follower = &cluster.hosts[1];
        wait_status(follower, 1, |s| s.applied >= index).await;
        let kv = follower.get_key(1, 1, "b", b"k9", ReadMode::Sequential, WAIT).await.unwrap();
        assert_eq!(kv.unwrap().value, b"v");
    }

    #[tokio::test]
    async fn durable_replica_restarts_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(crate::LocalTransport::new());
        let config =
            HostConfig { rtt_ms: 5, raft_address: "10.0.0.1:7000".into(), ..Default::default() };
        let storage = StorageConfig { data_dir: dir.path().to_path_buf(), in_memory: false };
        let host = NodeHost::open(config, fast_raft(), storage, transport).await.unwrap();

        host.new_shard(1, 1, StateMachineKind::Kv, None, WAIT).await.unwrap();
        setup_bucket(&host, 1).await;
        host.propose(1, SessionTag::default(), put("k", "v"), WAIT).await.unwrap();
        host.stop_replica(1).await.unwrap();
        assert!(matches!(host.leader_id(1).await, Err(DbError::ShardNotFound { shard_id: 1 })));

        host.start_replica(1, 1, StateMachineKind::Kv, true, false).await.unwrap();
        wait_status(&host, 1, |s| s.is_leader()).await;
        let kv = host.get_key(1, 1, "b", b"k", ReadMode::Linearizable, WAIT).await.unwrap();
        assert_eq!(kv.unwrap().version, 1);
        host.stop().await;
    }
}
