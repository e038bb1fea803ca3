//! One raft replica of one shard.
//!
//! Consensus itself is openraft's. The replica owns the `Raft` handle and a
//! monitor task that turns openraft metrics into the [`ReplicaStatus`] the
//! host publishes. Leader lease checks and removal shutdown live there as
//! well.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{CheckIsLeaderError, ClientWriteError, Fatal, RaftError};
use openraft::storage::Adaptor;
use openraft::{ChangeMembers, Raft, RaftMetrics, ServerState};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::{Instant, MissedTickBehavior};

use merope_storage::{LogStorage, StateMachineStore};
use merope_types::{ConfigChange, ConfigChangeKind, DbError, Membership, ReplicaId, ShardId};

use crate::config::RaftConfig;
use crate::message::{RaftReply, RaftRequest, RaftRpc};
use crate::network::{PeerContact, ShardNetworkFactory};
use crate::store::ShardStore;
use crate::transport::Transport;
use crate::types::{ApplyResult, Command, MeropeRaft, ReplicaNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

/// Snapshot of a replica's externally visible state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub shard_id: ShardId,
    pub replica_id: ReplicaId,
    pub role: Role,
    pub leader_id: Option<ReplicaId>,
    pub term: u64,
    pub commit: u64,
    pub applied: u64,
    pub membership: Membership,
    pub pending_config_change: bool,
    pub running: bool,
}

impl ReplicaStatus {
    pub(crate) fn starting(shard_id: ShardId, replica_id: ReplicaId) -> Self {
        ReplicaStatus {
            shard_id,
            replica_id,
            role: Role::Follower,
            leader_id: None,
            term: 0,
            commit: 0,
            applied: 0,
            membership: Membership::default(),
            pending_config_change: false,
            running: true,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn is_observer(&self) -> bool {
        self.membership.observers.contains_key(&self.replica_id)
    }

    pub fn is_witness(&self) -> bool {
        self.membership.witnesses.contains_key(&self.replica_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotOptions {
    /// Overrides `raft.compaction_overhead` for this request.
    pub compaction_overhead: Option<u64>,
    /// Write the snapshot to this directory instead of the log store; the
    /// log is not compacted.
    pub export_path: Option<PathBuf>,
}

pub(crate) struct Replica<L, S> {
    shard_id: ShardId,
    replica_id: ReplicaId,
    raft: Raft<MeropeRaft>,
    store: Arc<ShardStore<L, S>>,
    contact: Arc<PeerContact>,
    check_quorum: bool,
    compaction_overhead: u64,
    heartbeat: Duration,
    /// A leader that has not heard from a quorum for this long stops
    /// serving.
    lease: Duration,
    /// Held for the whole of a membership change.
    config_lock: Mutex<()>,
    status: watch::Sender<ReplicaStatus>,
}

impl<L, S> Replica<L, S>
where
    L: LogStorage,
    S: StateMachineStore,
{
    /// Restore local state and start the openraft core. The replica takes
    /// no part in elections until it is a voter of some membership.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn open<T: Transport>(
        shard_id: ShardId,
        replica_id: ReplicaId,
        addr: String,
        cfg: &RaftConfig,
        tick: Duration,
        log: L,
        sm: S,
        transport: Arc<T>,
    ) -> Result<Arc<Self>, DbError> {
        let store = ShardStore::open(shard_id, replica_id, log, sm, cfg.max_sessions).await?;
        let config = cfg.openraft(shard_id, tick)?;
        let heartbeat = Duration::from_millis(config.heartbeat_interval);
        let lease = Duration::from_millis(config.election_timeout_max);
        let contact = Arc::new(PeerContact::default());
        let network = ShardNetworkFactory::new(shard_id, addr, transport, contact.clone());
        let (log_store, state_machine) = Adaptor::<MeropeRaft, _>::new(store.clone());
        let raft = Raft::new(replica_id, Arc::new(config), network, log_store, state_machine)
            .await
            .map_err(fatal)?;
        if store.is_witness() {
            raft.runtime_config().elect(false);
        }
        let (status, _) = watch::channel(ReplicaStatus::starting(shard_id, replica_id));
        Ok(Arc::new(Replica {
            shard_id,
            replica_id,
            raft,
            store,
            contact,
            check_quorum: cfg.check_quorum,
            compaction_overhead: cfg.compaction_overhead,
            heartbeat,
            lease,
            config_lock: Mutex::new(()),
            status,
        }))
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ReplicaStatus> {
        self.status.subscribe()
    }

    pub(crate) fn state_machine(&self) -> &S {
        self.store.state_machine()
    }

    pub(crate) async fn membership(&self) -> Membership {
        self.store.membership().await
    }

    /// Make this replica the only voter of a brand new shard.
    pub(crate) async fn bootstrap(&self, addr: String) -> Result<(), DbError> {
        let members = BTreeMap::from([(self.replica_id, ReplicaNode::new(addr))]);
        self.raft.initialize(members).await.map_err(|e| match e {
            RaftError::Fatal(f) => fatal(f),
            RaftError::APIError(e) => DbError::AlreadyExists(e.to_string()),
        })
    }

    /// Publish status until stopped, removed from the shard, or the raft
    /// core exits; then shut the core down.
    ///
    /// Removal is noticed either from a membership entry without this
    /// replica or from a peer refusing our vote request as removed.
    pub(crate) async fn run(self: Arc<Self>, mut stop: oneshot::Receiver<()>) {
        let mut metrics = self.raft.metrics();
        let mut ticker = tokio::time::interval(self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut leading_since = None;
        let mut was_member = false;
        loop {
            tokio::select! {
                _ = &mut stop => break,
                changed = metrics.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {}
            }
            let current = metrics.borrow_and_update().clone();
            let member =
                current.membership_config.membership().get_node(&self.replica_id).is_some();
            was_member |= member;
            if self.contact.is_removed() || (was_member && !member) {
                tracing::warn!(
                    shard = self.shard_id,
                    replica = self.replica_id,
                    "replica was removed from the shard, stopping"
                );
                break;
            }
            self.publish(&current, &mut leading_since).await;
        }
        if let Err(e) = self.raft.shutdown().await {
            tracing::warn!(shard = self.shard_id, error = ?e, "raft core ended abnormally");
        }
        self.status.send_modify(|status| {
            status.role = Role::Follower;
            status.leader_id = None;
            status.running = false;
        });
        tracing::info!(shard = self.shard_id, replica = self.replica_id, "replica stopped");
    }

    async fn publish(
        &self,
        metrics: &RaftMetrics<ReplicaId, ReplicaNode>,
        leading_since: &mut Option<Instant>,
    ) {
        let membership = self.store.membership().await;
        if self.store.is_witness() {
            self.raft.runtime_config().elect(false);
        }
        let role = match metrics.state {
            ServerState::Leader => {
                let since = *leading_since.get_or_insert_with(Instant::now);
                if self.lost_quorum(since, &membership) {
                    Role::Follower
                } else {
                    Role::Leader
                }
            }
            ServerState::Candidate => {
                *leading_since = None;
                Role::Candidate
            }
            _ => {
                *leading_since = None;
                Role::Follower
            }
        };
        let leader_id = match (role, metrics.state) {
            (Role::Leader, _) => Some(self.replica_id),
            (_, ServerState::Leader) => None,
            _ => metrics.current_leader,
        };
        let effective = metrics.membership_config.log_id().map_or(0, |id| id.index + 1);
        let pending_config_change =
            self.config_lock.try_lock().is_err() || effective != membership.config_change_id;
        let applied = metrics.last_applied.map_or(0, |id| id.index);
        let next = ReplicaStatus {
            shard_id: self.shard_id,
            replica_id: self.replica_id,
            role,
            leader_id,
            term: metrics.current_term,
            // openraft applies an entry as soon as it is known committed
            commit: applied,
            applied,
            membership,
            pending_config_change,
            running: true,
        };
        self.status.send_if_modified(|status| {
            if *status == next {
                return false;
            }
            if status.role != next.role || status.leader_id != next.leader_id {
                tracing::info!(
                    shard = self.shard_id,
                    replica = self.replica_id,
                    role = ?next.role,
                    leader = ?next.leader_id,
                    term = next.term,
                    "replica role changed"
                );
            }
            *status = next;
            true
        });
    }

    /// True when this leader has gone a full lease without acks from a
    /// quorum of voters. A new leader gets one lease of grace.
    fn lost_quorum(&self, leading_since: Instant, membership: &Membership) -> bool {
        if !self.check_quorum {
            return false;
        }
        let Some(since) = Instant::now().checked_sub(self.lease) else {
            return false;
        };
        if leading_since > since {
            return false;
        }
        let heard = self.contact.heard_since(since);
        let active = membership
            .voters()
            .filter(|id| *id == self.replica_id || heard.contains(id))
            .count();
        active < membership.quorum()
    }

    fn ensure_leader(&self) -> Result<(), DbError> {
        let status = self.status.borrow();
        if !status.running {
            return Err(DbError::Terminated);
        }
        if status.is_leader() {
            Ok(())
        } else {
            Err(DbError::NotLeader { leader_id: status.leader_id })
        }
    }

    /// Answer a raft RPC from a peer.
    pub(crate) async fn handle(&self, request: RaftRequest) -> RaftReply {
        match request.rpc {
            RaftRpc::Vote(rpc) => {
                if let Some(candidate) = rpc.vote.leader_id().voted_for() {
                    if self.store.is_removed(candidate).await {
                        tracing::debug!(
                            shard = self.shard_id,
                            candidate,
                            "vote request from a removed replica"
                        );
                        return RaftReply::Removed;
                    }
                }
                RaftReply::Vote(self.raft.vote(rpc).await)
            }
            RaftRpc::AppendEntries(rpc) => {
                RaftReply::AppendEntries(self.raft.append_entries(rpc).await)
            }
            RaftRpc::InstallSnapshot(rpc) => {
                RaftReply::InstallSnapshot(self.raft.install_snapshot(rpc).await)
            }
        }
    }

    /// Replicate `command` and return what applying it produced.
    pub(crate) async fn propose(&self, command: Command) -> Result<ApplyResult, DbError> {
        self.ensure_leader()?;
        let response = self.raft.client_write(command).await.map_err(write_error)?;
        match response.data {
            ApplyResult::Failed(e) => Err(e),
            result => Ok(result),
        }
    }

    /// Confirm leadership with a quorum and wait until the read index has
    /// been applied locally.
    pub(crate) async fn read_index(&self) -> Result<u64, DbError> {
        self.ensure_leader()?;
        let read_log_id = self.raft.ensure_linearizable().await.map_err(check_error)?;
        Ok(read_log_id.map_or(0, |id| id.index))
    }

    /// Apply `change` and return the resulting config change id.
    pub(crate) async fn change_membership(&self, change: ConfigChange) -> Result<u64, DbError> {
        let _guard = self.config_lock.try_lock().map_err(|_| {
            DbError::Rejected(format!(
                "a membership change of shard {} is still in progress",
                self.shard_id
            ))
        })?;
        self.ensure_leader()?;
        let current = self.store.membership().await;
        let next = next_membership(&current, &change)?;

        let id = change.replica_id;
        let ids = BTreeSet::from([id]);
        let addr = next.address_of(id).unwrap_or_default().to_owned();
        let response = match change.kind {
            ConfigChangeKind::AddReplica if current.observers.contains_key(&id) => {
                self.raft.change_membership(ChangeMembers::AddVoterIds(ids), false).await
            }
            ConfigChangeKind::AddReplica | ConfigChangeKind::AddWitness => {
                let node = if change.kind == ConfigChangeKind::AddWitness {
                    ReplicaNode::witness(addr)
                } else {
                    ReplicaNode::new(addr)
                };
                self.raft.add_learner(id, node, true).await.map_err(write_error)?;
                self.raft.change_membership(ChangeMembers::AddVoterIds(ids), false).await
            }
            ConfigChangeKind::AddObserver => {
                self.raft.add_learner(id, ReplicaNode::new(addr), false).await
            }
            ConfigChangeKind::Remove if current.observers.contains_key(&id) => {
                self.raft.change_membership(ChangeMembers::RemoveNodes(ids), false).await
            }
            ConfigChangeKind::Remove => {
                self.raft.change_membership(ChangeMembers::RemoveVoters(ids), false).await
            }
        }
        .map_err(write_error)?;

        let config_change_id = response.log_id.index + 1;
        tracing::info!(
            shard = self.shard_id,
            kind = ?change.kind,
            target = id,
            config_change_id,
            "membership changed"
        );
        Ok(config_change_id)
    }

    /// Snapshot the applied state and compact the log behind it, or export
    /// it to a file when `export_path` is set.
    pub(crate) async fn snapshot(&self, options: SnapshotOptions) -> Result<u64, DbError> {
        if let Some(dir) = options.export_path {
            return self.store.export(&dir).await;
        }
        let mut metrics = self.raft.metrics();
        let applied = metrics.borrow().last_applied;
        let Some(applied) = applied else {
            return Err(DbError::Rejected("nothing has been applied yet".into()));
        };
        self.raft.trigger().snapshot().await.map_err(fatal)?;
        let index = {
            let built = metrics
                .wait_for(|m| m.snapshot.is_some_and(|s| s.index >= applied.index))
                .await
                .map_err(|_| DbError::Terminated)?;
            built.snapshot.map_or(applied.index, |s| s.index)
        };
        let overhead = options.compaction_overhead.unwrap_or(self.compaction_overhead);
        if index > overhead {
            self.raft.trigger().purge_log(index - overhead).await.map_err(fatal)?;
        }
        Ok(index)
    }

    /// Drop every log entry covered by the latest snapshot.
    pub(crate) async fn compact(&self) -> Result<(), DbError> {
        let snapshot = self.raft.metrics().borrow().snapshot;
        let Some(snapshot) = snapshot else {
            return Err(DbError::Rejected(format!(
                "shard {} has no snapshot to compact against",
                self.shard_id
            )));
        };
        self.raft.trigger().purge_log(snapshot.index).await.map_err(fatal)
    }
}

fn fatal(e: Fatal<ReplicaId>) -> DbError {
    match e {
        Fatal::Stopped => DbError::Terminated,
        other => DbError::Consensus(other.to_string()),
    }
}

fn write_error(e: RaftError<ReplicaId, ClientWriteError<ReplicaId, ReplicaNode>>) -> DbError {
    match e {
        RaftError::APIError(ClientWriteError::ForwardToLeader(f)) => {
            DbError::NotLeader { leader_id: f.leader_id }
        }
        RaftError::APIError(ClientWriteError::ChangeMembershipError(e)) => {
            DbError::FailedPrecondition(e.to_string())
        }
        RaftError::Fatal(f) => fatal(f),
    }
}

fn check_error(e: RaftError<ReplicaId, CheckIsLeaderError<ReplicaId, ReplicaNode>>) -> DbError {
    match e {
        RaftError::APIError(CheckIsLeaderError::ForwardToLeader(f)) => {
            DbError::NotLeader { leader_id: f.leader_id }
        }
        RaftError::APIError(CheckIsLeaderError::QuorumNotEnough(_)) => DbError::NoQuorum,
        RaftError::Fatal(f) => fatal(f),
    }
}

/// Membership produced by `change`, or why it cannot be applied.
pub(crate) fn next_membership(
    current: &Membership,
    change: &ConfigChange,
) -> Result<Membership, DbError> {
    if let Some(expected) = change.expected_config_change_id {
        if expected != current.config_change_id {
            return Err(DbError::StaleConfig { expected, current: current.config_change_id });
        }
    }
    let id = change.replica_id;
    if current.removed.contains(&id) {
        return Err(DbError::FailedPrecondition(format!(
            "replica {id} was removed and cannot rejoin"
        )));
    }
    let mut next = current.clone();
    match change.kind {
        ConfigChangeKind::AddReplica => {
            if next.replicas.contains_key(&id) {
                return Err(DbError::AlreadyExists(format!("replica {id}")));
            }
            if next.witnesses.contains_key(&id) {
                return Err(DbError::FailedPrecondition(format!(
                    "witness {id} cannot be promoted"
                )));
            }
            let observer_addr = next.observers.remove(&id);
            let address = match (change.address.is_empty(), observer_addr) {
                (false, _) => change.address.clone(),
                (true, Some(addr)) => addr,
                (true, None) => {
                    return Err(DbError::InvalidArgument(format!("replica {id} needs an address")))
                }
            };
            next.replicas.insert(id, address);
        }
        ConfigChangeKind::AddObserver | ConfigChangeKind::AddWitness => {
            if next.is_member(id) {
                return Err(DbError::AlreadyExists(format!("replica {id}")));
            }
            if change.address.is_empty() {
                return Err(DbError::InvalidArgument(format!("replica {id} needs an address")));
            }
            let target = if change.kind == ConfigChangeKind::AddObserver {
                &mut next.observers
            } else {
                &mut next.witnesses
            };
            target.insert(id, change.address.clone());
        }
        ConfigChangeKind::Remove => {
            if !next.is_member(id) {
                return Err(DbError::NotFound(format!("replica {id}")));
            }
            if next.is_voter(id) && next.voters().count() == 1 {
                return Err(DbError::FailedPrecondition(format!(
                    "replica {id} is the last voter"
                )));
            }
            next.replicas.remove(&id);
            next.observers.remove(&id);
            next.witnesses.remove(&id);
            next.removed.insert(id);
        }
    }
    Ok(next)
}

#[cfg(test)]
mod tests {
    use merope_storage::mem::{MemLogStorage, MemStateMachine};
    use merope_types::{KvCommand, KvResponse, Proposal, ProposalBody, SessionOp, SessionTag};

    use super::*;
    use crate::transport::LocalTransport;

    fn change(kind: ConfigChangeKind, id: u64, expected: Option<u64>) -> ConfigChange {
        ConfigChange {
            kind,
            replica_id: id,
            address: format!("host-{id}"),
            expected_config_change_id: expected,
        }
    }

    #[test]
    fn fencing_rejects_stale_token() {
        let m = Membership::bootstrap(1, "host-1");
        let err =
            next_membership(&m, &change(ConfigChangeKind::AddReplica, 2, Some(7))).unwrap_err();
        assert_eq!(err, DbError::StaleConfig { expected: 7, current: 1 });
        assert!(next_membership(&m, &change(ConfigChangeKind::AddReplica, 2, Some(1))).is_ok());
        assert!(next_membership(&m, &change(ConfigChangeKind::AddReplica, 2, None)).is_ok());
    }

    #[test]
    fn observer_is_promoted_in_place() {
        let m = Membership::bootstrap(1, "host-1");
        let m = next_membership(&m, &change(ConfigChangeKind::AddObserver, 2, None)).unwrap();
        let promote = ConfigChange {
            kind: ConfigChangeKind::AddReplica,
            replica_id: 2,
            address: String::new(),
            expected_config_change_id: None,
        };
        let m = next_membership(&m, &promote).unwrap();
        assert!(m.observers.is_empty());
        assert_eq!(m.replicas.get(&2).map(String::as_str), Some("host-2"));
        assert_eq!(m.quorum(), 2);
    }

    #[test]
    fn removed_replicas_cannot_return() {
        let m = Membership::bootstrap(1, "host-1");
        let m = next_membership(&m, &change(ConfigChangeKind::AddWitness, 3, None)).unwrap();
        let m = next_membership(&m, &change(ConfigChangeKind::Remove, 3, None)).unwrap();
        assert!(m.removed.contains(&3));
        assert!(matches!(
            next_membership(&m, &change(ConfigChangeKind::AddObserver, 3, None)),
            Err(DbError::FailedPrecondition(_))
        ));
        assert!(matches!(
            next_membership(&m, &change(ConfigChangeKind::Remove, 1, None)),
            Err(DbError::FailedPrecondition(_))
        ));
    }


    type TestReplica = Arc<Replica<MemLogStorage, MemStateMachine>>;

    fn fast_raft() -> RaftConfig {
        RaftConfig { election_rtt: 10, heartbeat_rtt: 2, ..Default::default() }
    }

    async fn single_replica(
        log: MemLogStorage,
        sm: MemStateMachine,
    ) -> (TestReplica, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
        let replica = Replica::open(
            1,
            1,
            "host-1".into(),
            &fast_raft(),
            Duration::from_millis(5),
            log,
            sm,
            Arc::new(LocalTransport::new()),
        )
        .await
        .unwrap();
        let (stop, rx) = oneshot::channel();
        let task = tokio::spawn(replica.clone().run(rx));
        (replica, stop, task)
    }

    async fn wait_leader(replica: &TestReplica) {
        let mut status = replica.subscribe();
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.is_leader()))
            .await
            .unwrap()
            .unwrap();
    }

    async fn stop(stop: oneshot::Sender<()>, task: tokio::task::JoinHandle<()>) {
        let _ = stop.send(());
        task.await.unwrap();
    }

    fn put(series_id: u64, value: &str) -> Command {
        Command::Proposal(Proposal {
            session: SessionTag { client_id: 42, series_id, responded_to: series_id - 1 },
            timestamp_ns: 1,
            body: ProposalBody::Kv(KvCommand::PutKey {
                account_id: 1,
                bucket: "b".into(),
                key: b"k".to_vec(),
                value: value.as_bytes().to_vec(),
                lease: 0,
            }),
        })
    }

    fn setup_cmds() -> Command {
        Command::Proposal(Proposal {
            session: SessionTag::default(),
            timestamp_ns: 1,
            body: ProposalBody::Batch(vec![
                KvCommand::CreateAccount { account_id: 1, owner: "o".into() },
                KvCommand::CreateBucket { account_id: 1, name: "b".into(), owner: "o".into() },
            ]),
        })
    }

    fn register() -> Command {
        Command::Session(SessionOp::Register { client_id: 42 })
    }

    #[tokio::test]
    async fn sole_voter_elects_itself_and_applies() {
        let (replica, stop_tx, task) =
            single_replica(MemLogStorage::new(), MemStateMachine::new()).await;
        replica.bootstrap("host-1".into()).await.unwrap();
        wait_leader(&replica).await;

        replica.propose(setup_cmds()).await.unwrap();
        assert_eq!(replica.propose(register()).await.unwrap(), ApplyResult::Session(42));
        let first = replica.propose(put(1, "v1")).await.unwrap();
        let retry = replica.propose(put(1, "v1")).await.unwrap();
        assert_eq!(first, retry);
        match first {
            ApplyResult::Kv(resps) => {
                assert!(matches!(&resps[0], KvResponse::Put(kv) if kv.version == 1))
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert!(replica.read_index().await.unwrap() >= 4);
        assert!(matches!(
            replica.bootstrap("host-1".into()).await,
            Err(DbError::AlreadyExists(_))
        ));

        stop(stop_tx, task).await;
        assert!(!replica.subscribe().borrow().running);
        assert_eq!(replica.propose(put(2, "v2")).await, Err(DbError::Terminated));
    }

    #[tokio::test]
    async fn restart_replays_log_and_sessions() {
        let log = MemLogStorage::new();
        {
            let (replica, stop_tx, task) =
                single_replica(log.clone(), MemStateMachine::new()).await;
            replica.bootstrap("host-1".into()).await.unwrap();
            wait_leader(&replica).await;
            replica.propose(setup_cmds()).await.unwrap();
            replica.propose(register()).await.unwrap();
            replica.propose(put(1, "v1")).await.unwrap();
            stop(stop_tx, task).await;
        }

        let sm = MemStateMachine::new();
        let (replica, _stop, _task) = single_replica(log, sm.clone()).await;
        wait_leader(&replica).await;
        // the retried command is answered from the rebuilt session table
        match replica.propose(put(1, "other")).await.unwrap() {
            ApplyResult::Kv(resps) => {
                assert!(matches!(&resps[0], KvResponse::Put(kv) if kv.value == b"v1"))
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(sm.get_key(1, 1, "b", b"k").await.unwrap().unwrap().value, b"v1");
    }

    #[tokio::test]
    async fn snapshot_compacts_and_survives_restart() {
        let log = MemLogStorage::new();
        let (replica, stop_tx, task) = single_replica(log.clone(), MemStateMachine::new()).await;
        replica.bootstrap("host-1".into()).await.unwrap();
        wait_leader(&replica).await;
        assert!(matches!(replica.compact().await, Err(DbError::Rejected(_))));

        replica.propose(setup_cmds()).await.unwrap();
        let options = SnapshotOptions { compaction_overhead: Some(0), export_path: None };
        let index = replica.snapshot(options).await.unwrap();
        let stored = log.read_snapshot(1).await.unwrap().unwrap();
        assert_eq!(stored.meta.last_log.map(|id| id.index), Some(index));
        tokio::time::timeout(Duration::from_secs(5), async {
            while log.log_state(1).await.unwrap().last_purged.map(|id| id.index) != Some(index) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        replica.compact().await.unwrap();
        stop(stop_tx, task).await;

        let sm = MemStateMachine::new();
        let (replica, _stop, _task) = single_replica(log, sm.clone()).await;
        assert!(sm.get_bucket(1, 1, "b").await.unwrap().is_some());
        assert_eq!(replica.membership().await.replicas.len(), 1);
        wait_leader(&replica).await;
    }

    #[tokio::test]
    async fn export_writes_file_without_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let log = MemLogStorage::new();
        let (replica, _stop, _task) = single_replica(log.clone(), MemStateMachine::new()).await;
        replica.bootstrap("host-1".into()).await.unwrap();
        wait_leader(&replica).await;
        replica.propose(setup_cmds()).await.unwrap();

        let options =
            SnapshotOptions { compaction_overhead: None, export_path: Some(dir.path().into()) };
        let index = replica.snapshot(options).await.unwrap();

        let bytes = std::fs::read(dir.path().join(format!("snapshot-1-{index}.bin"))).unwrap();
        let snapshot: merope_storage::Snapshot = merope_storage::decode(&bytes).unwrap();
        assert_eq!(snapshot.meta.last_log.map(|id| id.index), Some(index));
        assert!(log.read_snapshot(1).await.unwrap().is_none());
        assert_eq!(log.log_state(1).await.unwrap().first_index, Some(0));
    }
}
