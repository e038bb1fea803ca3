use std::fmt::Debug;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use prost::Message;
use tonic::transport::Channel;
use tonic::Status;

use merope_proto::server::{
    self as pb, kv_store_service_client::KvStoreServiceClient,
    raft_host_client::RaftHostClient, session_manager_client::SessionManagerClient,
    shard_manager_client::ShardManagerClient,
};

#[derive(Parser, Debug)]
#[command(name = "merope", about = "Merope command-line client")]
struct Cli {
    /// Client address of a merope node.
    #[arg(long, default_value = "http://127.0.0.1:17000", global = true)]
    addr: String,
    /// Request timeout in milliseconds; 0 uses the server default.
    #[arg(long, default_value_t = 0, global = true)]
    timeout_ms: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(subcommand)]
    Shard(ShardCmd),
    #[command(subcommand)]
    Host(HostCmd),
    #[command(subcommand)]
    Session(SessionCmd),
    #[command(subcommand)]
    Account(AccountCmd),
    #[command(subcommand)]
    Bucket(BucketCmd),
    #[command(subcommand)]
    Kv(KvCmd),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SmType {
    Test,
    Kv,
}

impl From<SmType> for pb::StateMachineType {
    fn from(t: SmType) -> Self {
        match t {
            SmType::Test => pb::StateMachineType::Test,
            SmType::Kv => pb::StateMachineType::Kv,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Consistency {
    Linearizable,
    Sequential,
    Eventual,
}

impl From<Consistency> for pb::ReadConsistency {
    fn from(c: Consistency) -> Self {
        match c {
            Consistency::Linearizable => pb::ReadConsistency::Linearizable,
            Consistency::Sequential => pb::ReadConsistency::Sequential,
            Consistency::Eventual => pb::ReadConsistency::Eventual,
        }
    }
}

#[derive(clap::Args, Debug)]
struct MemberArgs {
    #[arg(long)]
    shard: u64,
    #[arg(long)]
    replica: u64,
    /// Raft address of the host running the replica.
    #[arg(long)]
    hostname: String,
    /// Fencing token; omitted means the current epoch.
    #[arg(long)]
    config_change_id: Option<u64>,
}

#[derive(Subcommand, Debug)]
enum ShardCmd {
    New {
        #[arg(long)]
        shard: u64,
        #[arg(long)]
        replica: u64,
        #[arg(long = "type", value_enum, default_value = "kv")]
        sm_type: SmType,
        #[arg(long, default_value = "")]
        hostname: String,
    },
    Start {
        #[arg(long)]
        shard: u64,
        #[arg(long)]
        replica: u64,
        #[arg(long = "type", value_enum, default_value = "kv")]
        sm_type: SmType,
        #[arg(long)]
        restart: bool,
        #[arg(long)]
        observer: bool,
    },
    Stop {
        #[arg(long)]
        shard: u64,
    },
    AddReplica(MemberArgs),
    AddObserver(MemberArgs),
    AddWitness(MemberArgs),
    RemoveReplica {
        #[arg(long)]
        shard: u64,
        #[arg(long)]
        replica: u64,
        #[arg(long)]
        config_change_id: Option<u64>,
    },
    RemoveData {
        #[arg(long)]
        shard: u64,
        #[arg(long)]
        replica: u64,
    },
    Leader {
        #[arg(long)]
        shard: u64,
    },
    Members {
        #[arg(long)]
        shard: u64,
    },
}

#[derive(Subcommand, Debug)]
enum HostCmd {
    Snapshot {
        #[arg(long)]
        shard: u64,
        /// Write the snapshot into this directory instead of compacting.
        #[arg(long)]
        export_path: Option<String>,
        #[arg(long)]
        compaction_overhead: Option<u64>,
    },
    Compact {
        #[arg(long)]
        shard: u64,
        #[arg(long)]
        replica: u64,
    },
    ReadIndex {
        #[arg(long)]
        shard: u64,
    },
    /// Print leader and membership changes of a shard until its replica stops.
    Watch {
        #[arg(long)]
        shard: u64,
    },
    Config,
    Info,
    Stop,
}

#[derive(Subcommand, Debug)]
enum SessionCmd {
    New {
        #[arg(long)]
        shard: u64,
        /// 0 lets the server pick a client id.
        #[arg(long, default_value_t = 0)]
        client: u64,
    },
    Close {
        #[arg(long)]
        shard: u64,
        #[arg(long)]
        client: u64,
    },
}

#[derive(Subcommand, Debug)]
enum AccountCmd {
    Create {
        #[arg(long)]
        account: u64,
        #[arg(long)]
        owner: String,
    },
    Delete {
        #[arg(long)]
        account: u64,
        #[arg(long)]
        owner: String,
    },
    Get {
        #[arg(long)]
        account: u64,
        #[arg(long, value_enum, default_value = "linearizable")]
        consistency: Consistency,
    },
}

#[derive(Subcommand, Debug)]
enum BucketCmd {
    Create {
        #[arg(long)]
        account: u64,
        #[arg(long)]
        name: String,
        #[arg(long)]
        owner: String,
    },
    Delete {
        #[arg(long)]
        account: u64,
        #[arg(long)]
        name: String,
    },
    Get {
        #[arg(long)]
        account: u64,
        #[arg(long)]
        name: String,
        #[arg(long, value_enum, default_value = "linearizable")]
        consistency: Consistency,
    },
}

#[derive(Subcommand, Debug)]
enum KvCmd {
    Get {
        #[arg(long)]
        account: u64,
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        key: String,
        #[arg(long, value_enum, default_value = "linearizable")]
        consistency: Consistency,
    },
    Put {
        #[arg(long)]
        account: u64,
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        key: String,
        #[arg(long)]
        value: String,
        #[arg(long, default_value_t = 0)]
        lease: i64,
    },
    Delete {
        #[arg(long)]
        account: u64,
        #[arg(long)]
        bucket: String,
        #[arg(long)]
        key: String,
    },
}

/// Render a failed call, including the server's `DBError` when present.
fn rpc_error(status: Status) -> anyhow::Error {
    if !status.details().is_empty() {
        if let Ok(err) = pb::DbError::decode(status.details()) {
            return anyhow::anyhow!("{:?} [{}]: {}", status.code(), err.kind, err.message);
        }
    }
    anyhow::anyhow!("{:?}: {}", status.code(), status.message())
}

fn print<T: Debug>(result: Result<tonic::Response<T>, Status>) -> anyhow::Result<()> {
    let response = result.map_err(rpc_error)?;
    println!("{:#?}", response.into_inner());
    Ok(())
}

async fn run_shard(channel: Channel, cmd: ShardCmd, timeout_ms: u64) -> anyhow::Result<()> {
    let mut client = ShardManagerClient::new(channel);
    let add = |m: MemberArgs| pb::AddReplicaRequest {
        shard_id: m.shard,
        replica_id: m.replica,
        hostname: m.hostname,
        config_change_id: m.config_change_id,
        timeout_ms,
    };
    match cmd {
        ShardCmd::New { shard, replica, sm_type, hostname } => print(
            client
                .new_shard(pb::NewShardRequest {
                    shard_id: shard,
                    replica_id: replica,
                    r#type: pb::StateMachineType::from(sm_type) as i32,
                    hostname,
                    timeout_ms,
                })
                .await,
        ),
        ShardCmd::Start { shard, replica, sm_type, restart, observer } => {
            let req = pb::StartReplicaRequest {
                shard_id: shard,
                replica_id: replica,
                r#type: pb::StateMachineType::from(sm_type) as i32,
                restart,
            };
            if observer {
                print(client.start_replica_observer(req).await)
            } else {
                print(client.start_replica(req).await)
            }
        }
        ShardCmd::Stop { shard } => {
            print(client.stop_replica(pb::StopReplicaRequest { shard_id: shard }).await)
        }
        ShardCmd::AddReplica(m) => print(client.add_replica(add(m)).await),
        ShardCmd::AddObserver(m) => print(client.add_replica_observer(add(m)).await),
        ShardCmd::AddWitness(m) => print(client.add_replica_witness(add(m)).await),
        ShardCmd::RemoveReplica { shard, replica, config_change_id } => print(
            client
                .remove_replica(pb::RemoveReplicaRequest {
                    shard_id: shard,
                    replica_id: replica,
                    config_change_id,
                    timeout_ms,
                })
                .await,
        ),
        ShardCmd::RemoveData { shard, replica } => print(
            client
                .remove_data(pb::RemoveDataRequest { shard_id: shard, replica_id: replica })
                .await,
        ),
        ShardCmd::Leader { shard } => {
            print(client.get_leader_id(pb::GetLeaderIdRequest { shard_id: shard }).await)
        }
        ShardCmd::Members { shard } => {
            print(client.get_shard_members(pb::GetShardMembersRequest { shard_id: shard }).await)
        }
    }
}

async fn run_host(channel: Channel, cmd: HostCmd, timeout_ms: u64) -> anyhow::Result<()> {
    let mut client = RaftHostClient::new(channel);
    match cmd {
        HostCmd::Snapshot { shard, export_path, compaction_overhead } => {
            let options = pb::SnapshotOption {
                compaction_overhead: compaction_overhead.unwrap_or(0),
                override_compaction_overhead: compaction_overhead.is_some(),
                exported: export_path.is_some(),
                export_path: export_path.unwrap_or_default(),
            };
            let request =
                pb::SnapshotRequest { shard_id: shard, options: Some(options), timeout_ms };
            print(client.snapshot(request).await)
        }
        HostCmd::Compact { shard, replica } => {
            print(client.compact(pb::CompactRequest { shard_id: shard, replica_id: replica }).await)
        }
        HostCmd::ReadIndex { shard } => {
            print(client.read_index(pb::ReadIndexRequest { shard_id: shard, timeout_ms }).await)
        }
        HostCmd::Watch { shard } => {
            let mut events = client
                .watch_events(pb::WatchEventsRequest { shard_id: shard })
                .await
                .map_err(rpc_error)?
                .into_inner();
            while let Some(event) = events.message().await.map_err(rpc_error)? {
                println!("{event:?}");
            }
            Ok(())
        }
        HostCmd::Config => print(client.get_host_config(pb::GetHostConfigRequest {}).await),
        HostCmd::Info => print(client.get_host_info(pb::GetHostInfoRequest {}).await),
        HostCmd::Stop => print(client.stop(pb::StopRequest {}).await),
    }
}

async fn run_session(channel: Channel, cmd: SessionCmd, timeout_ms: u64) -> anyhow::Result<()> {
    let mut client = SessionManagerClient::new(channel);
    match cmd {
        SessionCmd::New { shard, client: client_id } => print(
            client
                .new_session(pb::NewSessionRequest { cluster_id: shard, client_id, timeout_ms })
                .await,
        ),
        SessionCmd::Close { shard, client: client_id } => {
            let session = pb::Session { cluster_id: shard, client_id, ..Default::default() };
            print(
                client
                    .close_session(pb::CloseSessionRequest { session: Some(session), timeout_ms })
                    .await,
            )
        }
    }
}

async fn run_kv(channel: Channel, command: Command, timeout_ms: u64) -> anyhow::Result<()> {
    let mut client = KvStoreServiceClient::new(channel);
    match command {
        Command::Account(AccountCmd::Create { account, owner }) => print(
            client
                .create_account(pb::CreateAccountRequest {
                    account_id: account,
                    owner,
                    session: None,
                    timeout_ms,
                })
                .await,
        ),
        Command::Account(AccountCmd::Delete { account, owner }) => print(
            client
                .delete_account(pb::DeleteAccountRequest {
                    account_id: account,
                    owner,
                    session: None,
                    timeout_ms,
                })
                .await,
        ),
        Command::Account(AccountCmd::Get { account, consistency }) => print(
            client
                .get_account_descriptor(pb::GetAccountDescriptorRequest {
                    account_id: account,
                    consistency: pb::ReadConsistency::from(consistency) as i32,
                    timeout_ms,
                })
                .await,
        ),
        Command::Bucket(BucketCmd::Create { account, name, owner }) => print(
            client
                .create_bucket(pb::CreateBucketRequest {
                    account_id: account,
                    name,
                    owner,
                    session: None,
                    timeout_ms,
                })
                .await,
        ),
        Command::Bucket(BucketCmd::Delete { account, name }) => print(
            client
                .delete_bucket(pb::DeleteBucketRequest {
                    account_id: account,
                    name,
                    session: None,
                    timeout_ms,
                })
                .await,
        ),
        Command::Bucket(BucketCmd::Get { account, name, consistency }) => print(
            client
                .get_bucket_descriptor(pb::GetBucketDescriptorRequest {
                    account_id: account,
                    name,
                    consistency: pb::ReadConsistency::from(consistency) as i32,
                    timeout_ms,
                })
                .await,
        ),
        Command::Kv(KvCmd::Get { account, bucket, key, consistency }) => {
            let response = client
                .get_key(pb::GetKeyRequest {
                    account_id: account,
                    bucket_name: bucket,
                    key: key.into_bytes(),
                    consistency: pb::ReadConsistency::from(consistency) as i32,
                    timeout_ms,
                })
                .await
                .map_err(rpc_error)?
                .into_inner();
            if let Some(kv) = response.key_value {
                println!("{}", String::from_utf8_lossy(&kv.value));
                println!(
                    "version={} create_revision={} mod_revision={} lease={}",
                    kv.version, kv.create_revision, kv.mod_revision, kv.lease
                );
            }
            Ok(())
        }
        Command::Kv(KvCmd::Put { account, bucket, key, value, lease }) => print(
            client
                .put_key(pb::PutKeyRequest {
                    account_id: account,
                    bucket_name: bucket,
                    key_value: Some(pb::KeyValue {
                        key: key.into_bytes(),
                        value: value.into_bytes(),
                        lease,
                        ..Default::default()
                    }),
                    handle: None,
                    timeout_ms,
                })
                .await,
        ),
        Command::Kv(KvCmd::Delete { account, bucket, key }) => print(
            client
                .delete_key(pb::DeleteKeyRequest {
                    account_id: account,
                    bucket_name: bucket,
                    key: key.into_bytes(),
                    handle: None,
                    timeout_ms,
                })
                .await,
        ),
        other => anyhow::bail!("not a key-value command: {other:?}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let channel = Channel::from_shared(cli.addr.clone())
        .with_context(|| format!("invalid address: {}", cli.addr))?
        .connect()
        .await
        .with_context(|| format!("failed to connect to {}", cli.addr))?;

    match cli.command {
        Command::Shard(cmd) => run_shard(channel, cmd, cli.timeout_ms).await,
        Command::Host(cmd) => run_host(channel, cmd, cli.timeout_ms).await,
        Command::Session(cmd) => run_session(channel, cmd, cli.timeout_ms).await,
        command => run_kv(channel, command, cli.timeout_ms).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_membership_commands() {
        let cli = Cli::try_parse_from([
            "merope",
            "shard",
            "add-observer",
            "--shard",
            "1",
            "--replica",
            "4",
            "--hostname",
            "10.0.0.4:17001",
            "--config-change-id",
            "9",
        ])
        .unwrap();
        let Command::Shard(ShardCmd::AddObserver(m)) = cli.command else {
            panic!("expected shard add-observer");
        };
        assert_eq!((m.shard, m.replica, m.config_change_id), (1, 4, Some(9)));
        assert_eq!(cli.addr, "http://127.0.0.1:17000");
    }

    #[test]
    fn rpc_error_shows_db_error_kind() {
        let detail = pb::DbError {
            r#type: pb::ErrorType::KeyValue as i32,
            message: "not empty: bucket b".into(),
            kind: "not_empty".into(),
        };
        let status = Status::with_details(
            tonic::Code::FailedPrecondition,
            "not empty: bucket b",
            detail.encode_to_vec().into(),
        );
        let rendered = rpc_error(status).to_string();
        assert!(rendered.contains("not_empty"), "{rendered}");
        assert!(rpc_error(Status::unavailable("down")).to_string().contains("down"));
    }
}
