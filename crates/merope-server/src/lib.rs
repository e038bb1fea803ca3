mod config;
mod convert;
mod host_service;
mod kv_service;
mod router;
mod session_service;
mod shard_service;
mod transaction_service;
mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use merope_consensus::{NodeHost, TransactionManager, Transport};
use merope_proto::server::{
    kv_store_service_server::KvStoreServiceServer, raft_host_server::RaftHostServer,
    raft_transport_server::RaftTransportServer, session_manager_server::SessionManagerServer,
    shard_manager_server::ShardManagerServer, transactions_server::TransactionsServer,
};
use tokio::sync::watch;
use tonic_reflection::server::Builder as ReflectionBuilder;

pub use config::ServerConfig;
pub use convert::{db_to_status, status_db_error, LEADER_METADATA_KEY};
pub use router::{RoutingConfig, ShardRouter};
pub use transport::{GrpcTransport, RaftTransportService};

use host_service::RaftHostImpl;
use kv_service::KvStoreServiceImpl;
use session_service::SessionManagerImpl;
use shard_service::ShardManagerImpl;
use transaction_service::TransactionsImpl;

/// Process-wide stop signal shared by the servers and `RaftHost.Stop`.
#[derive(Clone)]
pub struct Shutdown(Arc<watch::Sender<bool>>);

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Shutdown(Arc::new(tx))
    }

    pub fn trigger(&self) {
        self.0.send_replace(true);
    }

    pub async fn wait(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Serve the client-facing services until `shutdown` fires.
pub async fn serve_client<T: Transport>(
    addr: SocketAddr,
    host: Arc<NodeHost<T>>,
    router: Arc<ShardRouter>,
    config: ServerConfig,
    shutdown: Shutdown,
) -> anyhow::Result<()> {
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(merope_proto::FILE_DESCRIPTOR_SET)
        .build_v1()?;
    let txns = Arc::new(TransactionManager::new(host.clone()));
    let kv = KvStoreServiceImpl::new(host.clone(), txns.clone(), router, config.clone());
    let sessions = SessionManagerImpl::new(host.clone(), config.clone());
    let transactions = TransactionsImpl::new(txns, config.clone());
    let shards = ShardManagerImpl::new(host.clone(), config.clone());
    let raft_host = RaftHostImpl::new(host, config, shutdown.clone());

    tracing::info!(%addr, "client gRPC server starting");
    tonic::transport::Server::builder()
        .add_service(KvStoreServiceServer::new(kv))
        .add_service(SessionManagerServer::new(sessions))
        .add_service(TransactionsServer::new(transactions))
        .add_service(ShardManagerServer::new(shards))
        .add_service(RaftHostServer::new(raft_host))
        .add_service(reflection)
        .serve_with_shutdown(addr, async move { shutdown.wait().await })
        .await
        .map_err(Into::into)
}

/// Serve the raft peer transport until `shutdown` fires.
pub async fn serve_cluster<T: Transport>(
    addr: SocketAddr,
    host: Arc<NodeHost<T>>,
    shutdown: Shutdown,
) -> anyhow::Result<()> {
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(merope_proto::FILE_DESCRIPTOR_SET)
        .build_v1()?;
    tracing::info!(%addr, "cluster gRPC server starting");
    tonic::transport::Server::builder()
        .add_service(RaftTransportServer::new(RaftTransportService::new(host)))
        .add_service(reflection)
        .serve_with_shutdown(addr, async move { shutdown.wait().await })
        .await
        .map_err(Into::into)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;
    use std::time::Duration;

    use merope_consensus::{
        HostConfig, LocalTransport, NodeHost, RaftConfig, StorageConfig, TransactionManager,
    };
    use merope_proto::server::Session as ProtoSession;
    use merope_types::{KvCommand, ProposalBody, ReadMode, SessionTag, ShardId, StateMachineKind};

    use super::*;
    use crate::convert::session_to_proto;

    pub const WAIT: Duration = Duration::from_secs(5);
    pub const TEST_ADDRESS: &str = "10.0.0.1:7000";

    /// One in-memory host leading every KV shard, with every service wired to it.
    pub struct TestNode {
        pub host: Arc<NodeHost<LocalTransport>>,
        pub txns: Arc<TransactionManager<LocalTransport>>,
        pub router: Arc<ShardRouter>,
        pub config: ServerConfig,
        pub shutdown: Shutdown,
        _transport: Arc<LocalTransport>,
    }

    impl TestNode {
        pub async fn start() -> Self {
            Self::start_sharded(&[1]).await
        }

        pub async fn start_sharded(kv_shards: &[ShardId]) -> Self {
            let transport = Arc::new(LocalTransport::new());
            let host_config =
                HostConfig { rtt_ms: 5, raft_address: TEST_ADDRESS.into(), ..Default::default() };
            let raft = RaftConfig { election_rtt: 10, heartbeat_rtt: 2, ..Default::default() };
            let storage = StorageConfig { in_memory: true, ..Default::default() };
            let host =
                NodeHost::open(host_config, raft, storage, transport.clone()).await.unwrap();
            host.spawn_inbound(transport.register(TEST_ADDRESS));
            for shard_id in kv_shards {
                host.new_shard(*shard_id, 1, StateMachineKind::Kv, None, WAIT).await.unwrap();
            }

            let routing = RoutingConfig { kv_shards: kv_shards.to_vec() };
            let router = Arc::new(ShardRouter::new(&routing).unwrap());
            TestNode {
                txns: Arc::new(TransactionManager::new(host.clone())),
                host,
                router,
                config: ServerConfig::default(),
                shutdown: Shutdown::new(),
                _transport: transport,
            }
        }

        pub fn kv_service(&self) -> KvStoreServiceImpl<LocalTransport> {
            KvStoreServiceImpl::new(
                self.host.clone(),
                self.txns.clone(),
                self.router.clone(),
                self.config.clone(),
            )
        }

        pub fn session_service(&self) -> SessionManagerImpl<LocalTransport> {
            SessionManagerImpl::new(self.host.clone(), self.config.clone())
        }

        pub fn transaction_service(&self) -> TransactionsImpl<LocalTransport> {
            TransactionsImpl::new(self.txns.clone(), self.config.clone())
        }

        pub fn shard_service(&self) -> ShardManagerImpl<LocalTransport> {
            ShardManagerImpl::new(self.host.clone(), self.config.clone())
        }

        pub fn host_service(&self) -> RaftHostImpl<LocalTransport> {
            RaftHostImpl::new(self.host.clone(), self.config.clone(), self.shutdown.clone())
        }

        /// Account 1 owned by "o" with bucket "b".
        pub async fn bucket(&self) {
            let body = ProposalBody::Batch(vec![
                KvCommand::CreateAccount { account_id: 1, owner: "o".into() },
                KvCommand::CreateBucket { account_id: 1, name: "b".into(), owner: "o".into() },
            ]);
            self.host.propose(1, SessionTag::default(), body, WAIT).await.unwrap();
        }

        pub async fn put(&self, key: &str) {
            let body = ProposalBody::Kv(KvCommand::PutKey {
                account_id: 1,
                bucket: "b".into(),
                key: key.as_bytes().to_vec(),
                value: b"v".to_vec(),
                lease: 0,
            });
            self.host.propose(1, SessionTag::default(), body, WAIT).await.unwrap();
        }

        pub async fn has_key(&self, key: &str) -> bool {
            self.host
                .get_key(1, 1, "b", key.as_bytes(), ReadMode::Sequential, WAIT)
                .await
                .unwrap()
                .is_some()
        }

        pub async fn session(&self, client_id: u64) -> ProtoSession {
            session_to_proto(self.host.new_session(1, client_id, WAIT).await.unwrap())
        }
    }
}
