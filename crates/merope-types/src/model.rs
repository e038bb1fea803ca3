use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{ClientId, ReplicaId, SessionTag, ShardId, NOOP_CLIENT_ID};

/// A client's exactly-once command stream on one shard.
///
/// `session_id` is the series id of the next command; `responded_to` is the
/// highest series id whose reply the client has received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Session {
    pub cluster_id: ShardId,
    pub client_id: ClientId,
    pub session_id: u64,
    pub responded_to: u64,
}

impl Session {
    /// A freshly registered session: the first command uses series id 1.
    pub fn new(cluster_id: ShardId, client_id: ClientId) -> Self {
        Session { cluster_id, client_id, session_id: 1, responded_to: 0 }
    }

    /// Session whose commands are applied without deduplication.
    pub fn noop(cluster_id: ShardId) -> Self {
        Session { cluster_id, client_id: NOOP_CLIENT_ID, session_id: 0, responded_to: 0 }
    }

    pub fn is_noop(&self) -> bool {
        self.client_id == NOOP_CLIENT_ID
    }

    pub fn tag(&self) -> SessionTag {
        SessionTag {
            client_id: self.client_id,
            series_id: self.session_id,
            responded_to: self.responded_to,
        }
    }

    /// Mark the current command as answered and move to the next series id.
    pub fn proposal_completed(&mut self) {
        if self.is_noop() {
            return;
        }
        self.responded_to = self.session_id;
        self.session_id += 1;
    }
}

/// A session bound to one shard whose staged commands commit as one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Transaction {
    pub shard_id: ShardId,
    pub client_id: ClientId,
    pub transaction_id: u64,
    pub responded_to: u64,
}

impl Transaction {
    pub fn new(shard_id: ShardId, client_id: ClientId) -> Self {
        Transaction { shard_id, client_id, transaction_id: 1, responded_to: 0 }
    }

    pub fn tag(&self) -> SessionTag {
        SessionTag {
            client_id: self.client_id,
            series_id: self.transaction_id,
            responded_to: self.responded_to,
        }
    }

    pub fn commit_completed(&mut self) {
        self.responded_to = self.transaction_id;
        self.transaction_id += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub create_revision: i64,
    pub mod_revision: i64,
    pub version: i64,
    pub lease: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccountDescriptor {
    pub account_id: u64,
    pub owner: String,
    pub created_ns: i64,
    pub last_updated_ns: i64,
    pub bucket_count: u64,
    pub buckets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BucketDescriptor {
    pub owner: String,
    /// Total value bytes stored in the bucket.
    pub size: u64,
    pub key_count: u64,
    pub created_ns: i64,
    pub last_updated_ns: i64,
}

/// Replicated shard membership.
///
/// `config_change_id` is the fencing token: it is the log index of the entry
/// that produced this membership, so it strictly increases with every change.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Membership {
    pub config_change_id: u64,
    pub replicas: BTreeMap<ReplicaId, String>,
    pub observers: BTreeMap<ReplicaId, String>,
    pub witnesses: BTreeMap<ReplicaId, String>,
    pub removed: BTreeSet<ReplicaId>,
}

impl Membership {
    /// Membership of a freshly bootstrapped single-replica shard.
    pub fn bootstrap(replica_id: ReplicaId, address: impl Into<String>) -> Self {
        let mut replicas = BTreeMap::new();
        replicas.insert(replica_id, address.into());
        Membership { config_change_id: 1, replicas, ..Default::default() }
    }

    /// Members that vote and count towards quorum.
    pub fn voters(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.replicas.keys().chain(self.witnesses.keys()).copied()
    }

    pub fn quorum(&self) -> usize {
        (self.replicas.len() + self.witnesses.len()) / 2 + 1
    }

    pub fn is_voter(&self, id: ReplicaId) -> bool {
        self.replicas.contains_key(&id) || self.witnesses.contains_key(&id)
    }

    pub fn is_member(&self, id: ReplicaId) -> bool {
        self.address_of(id).is_some()
    }

    pub fn address_of(&self, id: ReplicaId) -> Option<&str> {
        self.replicas
            .get(&id)
            .or_else(|| self.observers.get(&id))
            .or_else(|| self.witnesses.get(&id))
            .map(String::as_str)
    }

    /// Every member other than `self_id`, with its raft address.
    pub fn peers(&self, self_id: ReplicaId) -> Vec<(ReplicaId, String)> {
        self.replicas
            .iter()
            .chain(self.observers.iter())
            .chain(self.witnesses.iter())
            .filter(|(id, _)| **id != self_id)
            .map(|(id, addr)| (*id, addr.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadMode {
    /// Confirm leadership with a quorum before reading local state.
    Linearizable,
    /// Read the local replica's applied state.
    Sequential,
    Eventual,
}

/// State machine backing a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateMachineKind {
    /// Volatile in-memory state machine, rebuilt from the log on restart.
    Test,
    /// Durable state machine in the host's storage engine.
    Kv,
}
