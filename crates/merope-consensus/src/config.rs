use std::path::PathBuf;
use std::time::Duration;

use openraft::SnapshotPolicy;
use serde::{Deserialize, Serialize};

use merope_types::{DbError, ShardId};

/// `[host]` section: identity and networking of the local node host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub deployment_id: u64,
    /// Length of one raft tick in milliseconds.
    pub rtt_ms: u64,
    /// Directory (under `storage.data_dir`) holding the fjall database.
    pub wal_dir: String,
    /// Directory (under `storage.data_dir`) for host-local files.
    pub host_dir: String,
    /// Address peers use to reach this host's raft transport.
    pub raft_address: String,
    pub listen_address: String,
    pub address_by_host_id: bool,
    pub mutual_tls: bool,
    pub ca_file: String,
    pub cert_file: String,
    pub key_file: String,
    pub enable_metrics: bool,
    pub notify_commit: bool,
    /// In-flight raft RPCs allowed per peer connection.
    pub mailbox_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            deployment_id: 1,
            rtt_ms: 10,
            wal_dir: "wal".into(),
            host_dir: "host".into(),
            raft_address: "127.0.0.1:17001".into(),
            listen_address: "0.0.0.0:17001".into(),
            address_by_host_id: false,
            mutual_tls: false,
            ca_file: String::new(),
            cert_file: String::new(),
            key_file: String::new(),
            enable_metrics: false,
            notify_commit: false,
            mailbox_capacity: 1024,
        }
    }
}

impl HostConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.rtt_ms.max(1))
    }

    /// Rejects settings the host cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.rtt_ms == 0 {
            return Err("host.rtt_ms must be > 0".into());
        }
        if self.raft_address.is_empty() || !self.raft_address.contains(':') {
            return Err(format!(
                "host.raft_address must be host:port, got '{}'",
                self.raft_address
            ));
        }
        if self.mailbox_capacity == 0 {
            return Err("host.mailbox_capacity must be > 0".into());
        }
        if self.mutual_tls {
            return Err("host.mutual_tls is not supported; peers and clients use plaintext".into());
        }
        if self.enable_metrics {
            return Err("host.enable_metrics is not supported".into());
        }
        if self.notify_commit {
            return Err("host.notify_commit is not supported; proposals return once applied".into());
        }
        Ok(())
    }
}

/// `[raft]` section. Intervals are counted in ticks of `host.rtt_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftConfig {
    pub election_rtt: u64,
    pub heartbeat_rtt: u64,
    pub check_quorum: bool,
    /// Take a snapshot every this many applied entries; 0 disables.
    pub snapshot_entries: u64,
    /// Entries kept in the log behind a snapshot.
    pub compaction_overhead: u64,
    pub max_entries_per_message: usize,
    pub max_sessions: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            election_rtt: 50,
            heartbeat_rtt: 5,
            check_quorum: true,
            snapshot_entries: 1000,
            compaction_overhead: 500,
            max_entries_per_message: 64,
            max_sessions: 4096,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_rtt == 0 {
            return Err("raft.heartbeat_rtt must be > 0".into());
        }
        if self.election_rtt <= 2 * self.heartbeat_rtt {
            return Err(format!(
                "raft.election_rtt ({}) must be greater than 2 * heartbeat_rtt ({})",
                self.election_rtt, self.heartbeat_rtt
            ));
        }
        if self.max_entries_per_message == 0 {
            return Err("raft.max_entries_per_message must be > 0".into());
        }
        if self.max_sessions == 0 {
            return Err("raft.max_sessions must be > 0".into());
        }
        Ok(())
    }

    /// openraft settings for one replica of `shard_id`, with ticks of `tick`.
    pub(crate) fn openraft(
        &self,
        shard_id: ShardId,
        tick: Duration,
    ) -> Result<openraft::Config, DbError> {
        let tick_ms = tick.as_millis().max(1) as u64;
        let election = self.election_rtt * tick_ms;
        let snapshot_policy = match self.snapshot_entries {
            0 => SnapshotPolicy::LogsSinceLast(u64::MAX),
            n => SnapshotPolicy::LogsSinceLast(n),
        };
        openraft::Config {
            cluster_name: format!("merope-shard-{shard_id}"),
            election_timeout_min: election,
            election_timeout_max: 2 * election,
            heartbeat_interval: self.heartbeat_rtt * tick_ms,
            install_snapshot_timeout: election.max(200),
            max_payload_entries: self.max_entries_per_message as u64,
            snapshot_policy,
            max_in_snapshot_log_to_keep: self.compaction_overhead,
            ..Default::default()
        }
        .validate()
        .map_err(|e| DbError::InvalidArgument(e.to_string()))
    }
}

/// `[storage]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Keep logs and state in memory only; nothing survives a restart.
    pub in_memory: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig { data_dir: PathBuf::from("/var/lib/merope"), in_memory: false }
    }
}
