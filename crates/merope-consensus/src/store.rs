//! openraft storage for one replica, layered on the host's [`LogStorage`]
//! and [`StateMachineStore`].
//!
//! Log entries are stored as encoded openraft entries. The session table,
//! the set of removed replicas and the membership ride along with the
//! replicated state in every snapshot, so a restored replica answers
//! retried commands the same way the others do.

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::io::Cursor;
use std::ops::{Bound, RangeBounds};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use openraft::storage::{LogState, RaftLogReader, RaftSnapshotBuilder, RaftStorage, Snapshot};
use openraft::{
    CommittedLeaderId, Entry, EntryPayload, LogId, OptionalSend, SnapshotMeta, StorageError,
    StorageIOError, StoredMembership, Vote,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use merope_storage::{EntryId, LogEntry, LogStorage, StateMachineStore, VoteRecord};
use merope_types::{
    DbError, Membership, Proposal, ReplicaId, SessionOp, ShardId, NOOP_CLIENT_ID,
};

use crate::session::{SessionCheck, SessionTable};
use crate::types::{ApplyResult, Command, MeropeRaft, ReplicaNode};

pub(crate) type ShardMembership = StoredMembership<ReplicaId, ReplicaNode>;

/// Entries decoded per batch when scanning the log on open.
const SCAN_BATCH: u64 = 256;

/// Everything a snapshot carries besides its metadata.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotBody {
    state: Vec<u8>,
    sessions: Vec<u8>,
    removed: BTreeSet<ReplicaId>,
}

#[derive(Debug)]
struct Applied {
    last_applied: Option<LogId<ReplicaId>>,
    membership: ShardMembership,
    sessions: SessionTable,
    removed: BTreeSet<ReplicaId>,
}

pub(crate) struct ShardStore<L, S> {
    shard_id: ShardId,
    replica_id: ReplicaId,
    log: L,
    sm: S,
    max_sessions: usize,
    witness: AtomicBool,
    applied: Mutex<Applied>,
}

impl<L, S> Debug for ShardStore<L, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardStore")
            .field("shard_id", &self.shard_id)
            .field("replica_id", &self.replica_id)
            .finish_non_exhaustive()
    }
}

fn entry_id(log_id: &LogId<ReplicaId>) -> EntryId {
    EntryId { term: log_id.leader_id.term, node_id: log_id.leader_id.node_id, index: log_id.index }
}

fn log_id(id: EntryId) -> LogId<ReplicaId> {
    LogId::new(CommittedLeaderId::new(id.term, id.node_id), id.index)
}

fn vote_record(vote: &Vote<ReplicaId>) -> VoteRecord {
    VoteRecord {
        term: vote.leader_id.term,
        node_id: vote.leader_id.node_id,
        committed: vote.committed,
    }
}

fn vote(record: VoteRecord) -> Vote<ReplicaId> {
    if record.committed {
        Vote::new_committed(record.term, record.node_id)
    } else {
        Vote::new(record.term, record.node_id)
    }
}

/// Translate an openraft membership into the shard's public view.
///
/// Voters flagged as witnesses are witnesses, other voters are full
/// replicas and non-voting nodes are observers. The config change id is one
/// past the log index of the membership entry, so the bootstrap membership
/// at index 0 has id 1.
pub(crate) fn membership_view(
    stored: &ShardMembership,
    removed: &BTreeSet<ReplicaId>,
) -> Membership {
    let config = stored.membership();
    let voters: BTreeSet<ReplicaId> = config.voter_ids().collect();
    let mut view = Membership {
        config_change_id: stored.log_id().map_or(0, |id| id.index + 1),
        removed: removed.clone(),
        ..Default::default()
    };
    for (id, node) in config.nodes() {
        let group = match (voters.contains(id), node.witness) {
            (true, true) => &mut view.witnesses,
            (true, false) => &mut view.replicas,
            (false, _) => &mut view.observers,
        };
        group.insert(*id, node.addr.clone());
    }
    view
}

impl<L, S> ShardStore<L, S>
where
    L: LogStorage,
    S: StateMachineStore,
{
    /// Restore the applied state from the latest snapshot. Entries after it
    /// are re-applied by openraft up to the saved commit index.
    pub(crate) async fn open(
        shard_id: ShardId,
        replica_id: ReplicaId,
        log: L,
        sm: S,
        max_sessions: usize,
    ) -> Result<Arc<Self>, DbError> {
        let store = ShardStore {
            shard_id,
            replica_id,
            log,
            sm,
            max_sessions,
            witness: AtomicBool::new(false),
            applied: Mutex::new(Applied {
                last_applied: None,
                membership: ShardMembership::default(),
                sessions: SessionTable::new(max_sessions),
                removed: BTreeSet::new(),
            }),
        };
        match store.log.read_snapshot(shard_id).await? {
            Some(snapshot) => {
                let meta = snapshot_meta(&snapshot.meta)?;
                store.restore(&meta, &snapshot.data).await?;
            }
            None => store.sm.remove_shard(shard_id).await?,
        }
        store.scan_for_witness().await?;
        Ok(Arc::new(store))
    }

    pub(crate) fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub(crate) fn state_machine(&self) -> &S {
        &self.sm
    }

    pub(crate) fn is_witness(&self) -> bool {
        self.witness.load(Ordering::Acquire)
    }

    /// Applied membership, including replicas removed over time.
    pub(crate) async fn membership(&self) -> Membership {
        let applied = self.applied.lock().await;
        membership_view(&applied.membership, &applied.removed)
    }

    pub(crate) async fn is_removed(&self, replica_id: ReplicaId) -> bool {
        self.applied.lock().await.removed.contains(&replica_id)
    }

    fn note_membership(&self, membership: &openraft::Membership<ReplicaId, ReplicaNode>) {
        let witness = membership.get_node(&self.replica_id).is_some_and(|n| n.witness);
        self.witness.store(witness, Ordering::Release);
    }

    /// Witness status follows the newest membership in the log, which may
    /// not be applied yet.
    async fn scan_for_witness(&self) -> Result<(), DbError> {
        let state = self.log.log_state(self.shard_id).await?;
        let (Some(first), Some(last)) = (state.first_index, state.last_index) else {
            return Ok(());
        };
        let mut to = last;
        loop {
            let from = to.saturating_sub(SCAN_BATCH - 1).max(first);
            let entries = self.log.get_entries(self.shard_id, from, to).await?;
            for stored in entries.iter().rev() {
                let entry: Entry<MeropeRaft> = merope_storage::decode(&stored.data)?;
                if let EntryPayload::Membership(membership) = &entry.payload {
                    self.note_membership(membership);
                    return Ok(());
                }
            }
            if from == first {
                return Ok(());
            }
            to = from - 1;
        }
    }

    async fn restore(
        &self,
        meta: &SnapshotMeta<ReplicaId, ReplicaNode>,
        data: &[u8],
    ) -> Result<(), DbError> {
        let body: SnapshotBody = merope_storage::decode(data)?;
        self.note_membership(meta.last_membership.membership());
        if self.is_witness() || body.state.is_empty() {
            self.sm.remove_shard(self.shard_id).await?;
        } else {
            self.sm.install_snapshot(self.shard_id, body.state).await?;
        }
        let mut applied = self.applied.lock().await;
        applied.sessions = SessionTable::restore(&body.sessions, self.max_sessions)?;
        applied.removed = body.removed;
        applied.membership = meta.last_membership.clone();
        applied.last_applied = meta.last_log_id;
        Ok(())
    }

    /// Serialize the applied state without storing it anywhere.
    pub(crate) async fn capture(
        &self,
    ) -> Result<(SnapshotMeta<ReplicaId, ReplicaNode>, Vec<u8>), DbError> {
        let applied = self.applied.lock().await;
        let state = if self.is_witness() {
            Vec::new()
        } else {
            self.sm.build_snapshot(self.shard_id).await?
        };
        let body = SnapshotBody {
            state,
            sessions: applied.sessions.encode()?,
            removed: applied.removed.clone(),
        };
        let meta = SnapshotMeta {
            last_log_id: applied.last_applied,
            last_membership: applied.membership.clone(),
            snapshot_id: uuid::Uuid::new_v4().to_string(),
        };
        Ok((meta, merope_storage::encode(&body)?))
    }

    async fn save_snapshot(
        &self,
        meta: &SnapshotMeta<ReplicaId, ReplicaNode>,
        data: Vec<u8>,
    ) -> Result<(), DbError> {
        self.log.save_snapshot(self.shard_id, stored_snapshot(meta, data)?).await
    }

    /// Write the applied state to `snapshot-<shard>-<index>.bin` under
    /// `dir`. The log store is left alone.
    pub(crate) async fn export(&self, dir: &Path) -> Result<u64, DbError> {
        let (meta, data) = self.capture().await?;
        let Some(last) = meta.last_log_id else {
            return Err(DbError::Rejected("nothing has been applied yet".into()));
        };
        let io_err = |e: std::io::Error| DbError::Storage(e.to_string());
        tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
        let path = dir.join(format!("snapshot-{}-{}.bin", self.shard_id, last.index));
        let bytes = merope_storage::encode(&stored_snapshot(&meta, data)?)?;
        tokio::fs::write(&path, bytes).await.map_err(io_err)?;
        tracing::info!(
            shard = self.shard_id,
            index = last.index,
            path = %path.display(),
            "snapshot exported"
        );
        Ok(last.index)
    }

    async fn read_entries(&self, from: u64, to: u64) -> Result<Vec<Entry<MeropeRaft>>, DbError> {
        self.log
            .get_entries(self.shard_id, from, to)
            .await?
            .iter()
            .map(|stored| merope_storage::decode(&stored.data))
            .collect()
    }

    async fn entries_in<RB: RangeBounds<u64>>(
        &self,
        range: RB,
    ) -> Result<Vec<Entry<MeropeRaft>>, StorageError<ReplicaId>> {
        let from = match range.start_bound() {
            Bound::Included(&from) => from,
            Bound::Excluded(&from) => from + 1,
            Bound::Unbounded => 0,
        };
        let to = match range.end_bound() {
            Bound::Included(&to) => to,
            Bound::Excluded(&0) => return Ok(Vec::new()),
            Bound::Excluded(&to) => to - 1,
            Bound::Unbounded => u64::MAX,
        };
        self.read_entries(from, to).await.map_err(|e| StorageIOError::read_logs(&e).into())
    }

    async fn apply_entry(
        &self,
        applied: &mut Applied,
        entry: &Entry<MeropeRaft>,
    ) -> Result<ApplyResult, DbError> {
        let index = entry.log_id.index;
        let result = match &entry.payload {
            EntryPayload::Blank => ApplyResult::Empty,
            EntryPayload::Normal(Command::Proposal(proposal)) => {
                self.apply_proposal(applied, index, proposal.clone()).await?
            }
            EntryPayload::Normal(Command::Session(op)) => apply_session(applied, index, *op),
            EntryPayload::Membership(membership) => {
                let next: BTreeSet<ReplicaId> = membership.nodes().map(|(id, _)| *id).collect();
                let gone: Vec<ReplicaId> = applied
                    .membership
                    .membership()
                    .nodes()
                    .map(|(id, _)| *id)
                    .filter(|id| !next.contains(id))
                    .collect();
                if !gone.is_empty() {
                    tracing::info!(shard = self.shard_id, index, ?gone, "replicas removed");
                }
                applied.removed.extend(gone);
                applied.membership = StoredMembership::new(Some(entry.log_id), membership.clone());
                ApplyResult::Empty
            }
        };
        applied.last_applied = Some(entry.log_id);
        Ok(result)
    }

    async fn apply_proposal(
        &self,
        applied: &mut Applied,
        index: u64,
        proposal: Proposal,
    ) -> Result<ApplyResult, DbError> {
        if self.is_witness() {
            return Ok(ApplyResult::Empty);
        }
        let tag = proposal.session;
        let cmds = proposal.body.into_commands();
        let outcome = if tag.client_id == NOOP_CLIENT_ID {
            self.sm.apply(self.shard_id, proposal.timestamp_ns, cmds).await?
        } else {
            match applied.sessions.check(&tag, index) {
                SessionCheck::Reject(e) => Err(e),
                SessionCheck::Cached(outcome) => outcome,
                SessionCheck::Apply => {
                    let outcome = self.sm.apply(self.shard_id, proposal.timestamp_ns, cmds).await?;
                    applied.sessions.record(&tag, outcome.clone());
                    outcome
                }
            }
        };
        Ok(outcome.map_or_else(ApplyResult::Failed, ApplyResult::Kv))
    }
}

fn apply_session(applied: &mut Applied, index: u64, op: SessionOp) -> ApplyResult {
    let result = match op {
        SessionOp::Register { client_id } => {
            applied.sessions.register(client_id, index).map(|_| client_id)
        }
        SessionOp::Unregister { client_id } => {
            applied.sessions.unregister(client_id).map(|_| client_id)
        }
    };
    result.map_or_else(ApplyResult::Failed, ApplyResult::Session)
}

fn stored_snapshot(
    meta: &SnapshotMeta<ReplicaId, ReplicaNode>,
    data: Vec<u8>,
) -> Result<merope_storage::Snapshot, DbError> {
    Ok(merope_storage::Snapshot {
        meta: merope_storage::SnapshotMeta {
            last_log: meta.last_log_id.as_ref().map(entry_id),
            snapshot_id: meta.snapshot_id.clone(),
            membership: merope_storage::encode(&meta.last_membership)?,
        },
        data,
    })
}

fn snapshot_meta(
    meta: &merope_storage::SnapshotMeta,
) -> Result<SnapshotMeta<ReplicaId, ReplicaNode>, DbError> {
    Ok(SnapshotMeta {
        last_log_id: meta.last_log.map(log_id),
        last_membership: merope_storage::decode(&meta.membership)?,
        snapshot_id: meta.snapshot_id.clone(),
    })
}

impl<L, S> RaftLogReader<MeropeRaft> for Arc<ShardStore<L, S>>
where
    L: LogStorage,
    S: StateMachineStore,
{
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<MeropeRaft>>, StorageError<ReplicaId>> {
        self.entries_in(range).await
    }
}

/// Builds snapshots from the shared store.
pub(crate) struct SnapshotBuilder<L, S>(Arc<ShardStore<L, S>>);

impl<L, S> RaftSnapshotBuilder<MeropeRaft> for SnapshotBuilder<L, S>
where
    L: LogStorage,
    S: StateMachineStore,
{
    async fn build_snapshot(&mut self) -> Result<Snapshot<MeropeRaft>, StorageError<ReplicaId>> {
        let store = &self.0;
        let (meta, data) =
            store.capture().await.map_err(|e| StorageIOError::read_state_machine(&e))?;
        store
            .save_snapshot(&meta, data.clone())
            .await
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;
        tracing::info!(
            shard = store.shard_id,
            replica = store.replica_id,
            index = meta.last_log_id.map_or(0, |id| id.index),
            "snapshot taken"
        );
        Ok(Snapshot { meta, snapshot: Box::new(Cursor::new(data)) })
    }
}

#[allow(deprecated)]
impl<L, S> RaftStorage<MeropeRaft> for Arc<ShardStore<L, S>>
where
    L: LogStorage,
    S: StateMachineStore,
{
    type LogReader = Self;
    type SnapshotBuilder = SnapshotBuilder<L, S>;

    async fn save_vote(&mut self, vote: &Vote<ReplicaId>) -> Result<(), StorageError<ReplicaId>> {
        let result = async {
            let mut hard = self.log.read_hard_state(self.shard_id).await?.unwrap_or_default();
            hard.vote = Some(vote_record(vote));
            self.log.save_hard_state(self.shard_id, hard).await
        };
        result.await.map_err(|e| StorageIOError::write_vote(&e).into())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<ReplicaId>>, StorageError<ReplicaId>> {
        let hard = self
            .log
            .read_hard_state(self.shard_id)
            .await
            .map_err(|e| StorageIOError::read_vote(&e))?;
        Ok(hard.and_then(|h| h.vote).map(vote))
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<ReplicaId>>,
    ) -> Result<(), StorageError<ReplicaId>> {
        let result = async {
            let mut hard = self.log.read_hard_state(self.shard_id).await?.unwrap_or_default();
            hard.committed = committed.as_ref().map(entry_id);
            self.log.save_hard_state(self.shard_id, hard).await
        };
        result.await.map_err(|e| StorageIOError::write(&e).into())
    }

    async fn read_committed(
        &mut self,
    ) -> Result<Option<LogId<ReplicaId>>, StorageError<ReplicaId>> {
        let hard = self
            .log
            .read_hard_state(self.shard_id)
            .await
            .map_err(|e| StorageIOError::read(&e))?;
        Ok(hard.and_then(|h| h.committed).map(log_id))
    }

    async fn get_log_state(&mut self) -> Result<LogState<MeropeRaft>, StorageError<ReplicaId>> {
        let result = async {
            let state = self.log.log_state(self.shard_id).await?;
            let last_purged_log_id = state.last_purged.map(log_id);
            let last_log_id = match state.last_index {
                Some(last) => {
                    let stored = self.log.get_entry(self.shard_id, last).await?;
                    match stored {
                        Some(stored) => {
                            let entry: Entry<MeropeRaft> = merope_storage::decode(&stored.data)?;
                            Some(entry.log_id)
                        }
                        None => last_purged_log_id,
                    }
                }
                None => last_purged_log_id,
            };
            Ok::<_, DbError>(LogState { last_purged_log_id, last_log_id })
        };
        result.await.map_err(|e| StorageIOError::read_logs(&e).into())
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<ReplicaId>>
    where
        I: IntoIterator<Item = Entry<MeropeRaft>> + OptionalSend,
    {
        let entries: Vec<Entry<MeropeRaft>> = entries.into_iter().collect();
        for entry in &entries {
            if let EntryPayload::Membership(membership) = &entry.payload {
                self.note_membership(membership);
            }
        }
        let witness = self.is_witness();
        let mut stored = Vec::with_capacity(entries.len());
        for mut entry in entries {
            // witnesses keep entry ids for voting but none of the data
            if witness && matches!(entry.payload, EntryPayload::Normal(_)) {
                entry.payload = EntryPayload::Blank;
            }
            let data = merope_storage::encode(&entry).map_err(|e| StorageIOError::write_logs(&e))?;
            let (index, term) = (entry.log_id.index, entry.log_id.leader_id.term);
            stored.push(LogEntry { index, term, data });
        }
        self.log
            .append(self.shard_id, stored)
            .await
            .map_err(|e| StorageIOError::write_logs(&e).into())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<ReplicaId>,
    ) -> Result<(), StorageError<ReplicaId>> {
        self.log
            .truncate(self.shard_id, log_id.index)
            .await
            .map_err(|e| StorageIOError::write_logs(&e).into())
    }

    async fn purge_logs_upto(
        &mut self,
        log_id: LogId<ReplicaId>,
    ) -> Result<(), StorageError<ReplicaId>> {
        tracing::debug!(shard = self.shard_id, up_to = log_id.index, "log compacted");
        self.log
            .purge(self.shard_id, entry_id(&log_id))
            .await
            .map_err(|e| StorageIOError::write_logs(&e).into())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<ReplicaId>>, ShardMembership), StorageError<ReplicaId>> {
        let applied = self.applied.lock().await;
        Ok((applied.last_applied, applied.membership.clone()))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<MeropeRaft>],
    ) -> Result<Vec<ApplyResult>, StorageError<ReplicaId>> {
        let mut applied = self.applied.lock().await;
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let result = self
                .apply_entry(&mut applied, entry)
                .await
                .map_err(|e| StorageIOError::write_state_machine(&e))?;
            results.push(result);
        }
        Ok(results)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        SnapshotBuilder(self.clone())
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<ReplicaId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<ReplicaId, ReplicaNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<ReplicaId>> {
        let data = snapshot.into_inner();
        self.restore(meta, &data)
            .await
            .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;
        self.save_snapshot(meta, data)
            .await
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;
        tracing::info!(
            shard = self.shard_id,
            replica = self.replica_id,
            index = meta.last_log_id.map_or(0, |id| id.index),
            "snapshot installed"
        );
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<MeropeRaft>>, StorageError<ReplicaId>> {
        let result = async {
            let Some(snapshot) = self.log.read_snapshot(self.shard_id).await? else {
                return Ok(None);
            };
            let meta = snapshot_meta(&snapshot.meta)?;
            let data = Box::new(Cursor::new(snapshot.data));
            Ok::<_, DbError>(Some(Snapshot { meta, snapshot: data }))
        };
        result.await.map_err(|e| StorageIOError::read_snapshot(None, &e).into())
    }
}
