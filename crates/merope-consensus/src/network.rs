//! openraft networking for one replica, carried over the host [`Transport`].

use std::collections::HashMap;
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use openraft::error::{
    InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use tokio::time::Instant;

use merope_types::{DbError, ReplicaId, ShardId};

use crate::message::{RaftReply, RaftRequest, RaftRpc};
use crate::transport::Transport;
use crate::types::{MeropeRaft, ReplicaNode};

type RpcResult<T, E = RaftError<ReplicaId>> = Result<T, RPCError<ReplicaId, ReplicaNode, E>>;

/// What the replica learned from talking to its peers.
#[derive(Debug, Default)]
pub(crate) struct PeerContact {
    /// Last time each peer answered a replication request.
    heard: Mutex<HashMap<ReplicaId, Instant>>,
    /// A peer told us we were removed from the shard.
    removed: AtomicBool,
}

impl PeerContact {
    fn heard_from(&self, peer: ReplicaId) {
        if let Ok(mut heard) = self.heard.lock() {
            heard.insert(peer, Instant::now());
        }
    }

    /// Peers heard from at or after `since`.
    pub(crate) fn heard_since(&self, since: Instant) -> Vec<ReplicaId> {
        self.heard
            .lock()
            .map(|heard| heard.iter().filter(|(_, at)| **at >= since).map(|(id, _)| *id).collect())
            .unwrap_or_default()
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}

pub(crate) struct ShardNetworkFactory<T> {
    shard_id: ShardId,
    local_addr: String,
    transport: Arc<T>,
    contact: Arc<PeerContact>,
}

impl<T> ShardNetworkFactory<T> {
    pub(crate) fn new(
        shard_id: ShardId,
        local_addr: String,
        transport: Arc<T>,
        contact: Arc<PeerContact>,
    ) -> Self {
        ShardNetworkFactory { shard_id, local_addr, transport, contact }
    }
}

impl<T: Transport> RaftNetworkFactory<MeropeRaft> for ShardNetworkFactory<T> {
    type Network = ShardNetwork<T>;

    async fn new_client(&mut self, target: ReplicaId, node: &ReplicaNode) -> Self::Network {
        ShardNetwork {
            shard_id: self.shard_id,
            local_addr: self.local_addr.clone(),
            target,
            target_addr: node.addr.clone(),
            transport: self.transport.clone(),
            contact: self.contact.clone(),
        }
    }
}

pub(crate) struct ShardNetwork<T> {
    shard_id: ShardId,
    local_addr: String,
    target: ReplicaId,
    target_addr: String,
    transport: Arc<T>,
    contact: Arc<PeerContact>,
}

impl<T: Transport> ShardNetwork<T> {
    async fn send<E: Error>(&self, rpc: RaftRpc) -> RpcResult<RaftReply, E> {
        let request = RaftRequest {
            shard_id: self.shard_id,
            from_addr: self.local_addr.clone(),
            to: self.target,
            rpc,
        };
        let reply = self
            .transport
            .call(&self.target_addr, request)
            .await
            .map_err(|e| RPCError::Unreachable(Unreachable::new(&e)))?;
        match reply {
            RaftReply::NoReplica => Err(RPCError::Unreachable(Unreachable::new(
                &DbError::ShardNotFound { shard_id: self.shard_id },
            ))),
            RaftReply::Removed => {
                if !self.contact.removed.swap(true, Ordering::AcqRel) {
                    tracing::warn!(
                        shard = self.shard_id,
                        peer = self.target,
                        "peer reports this replica was removed from the shard"
                    );
                }
                Err(RPCError::Unreachable(Unreachable::new(&DbError::FailedPrecondition(
                    "replica was removed from the shard".into(),
                ))))
            }
            reply => Ok(reply),
        }
    }

    fn unexpected<E: Error>(&self, reply: RaftReply) -> RPCError<ReplicaId, ReplicaNode, E> {
        let e = DbError::Consensus(format!("unexpected reply from {}: {reply:?}", self.target));
        RPCError::Network(NetworkError::new(&e))
    }
}

impl<T: Transport> RaftNetwork<MeropeRaft> for ShardNetwork<T> {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<MeropeRaft>,
        _option: RPCOption,
    ) -> RpcResult<AppendEntriesResponse<ReplicaId>> {
        match self.send(RaftRpc::AppendEntries(rpc)).await? {
            RaftReply::AppendEntries(Ok(resp)) => {
                self.contact.heard_from(self.target);
                Ok(resp)
            }
            RaftReply::AppendEntries(Err(e)) => {
                Err(RPCError::RemoteError(RemoteError::new(self.target, e)))
            }
            other => Err(self.unexpected(other)),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<MeropeRaft>,
        _option: RPCOption,
    ) -> RpcResult<InstallSnapshotResponse<ReplicaId>, RaftError<ReplicaId, InstallSnapshotError>>
    {
        match self.send(RaftRpc::InstallSnapshot(rpc)).await? {
            RaftReply::InstallSnapshot(Ok(resp)) => {
                self.contact.heard_from(self.target);
                Ok(resp)
            }
            RaftReply::InstallSnapshot(Err(e)) => {
                Err(RPCError::RemoteError(RemoteError::new(self.target, e)))
            }
            other => Err(self.unexpected(other)),
        }
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<ReplicaId>,
        _option: RPCOption,
    ) -> RpcResult<VoteResponse<ReplicaId>> {
        match self.send(RaftRpc::Vote(rpc)).await? {
            RaftReply::Vote(Ok(resp)) => Ok(resp),
            RaftReply::Vote(Err(e)) => Err(RPCError::RemoteError(RemoteError::new(self.target, e))),
            other => Err(self.unexpected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use openraft::Vote;

    use super::*;
    use crate::transport::{InboundCall, LocalTransport};

    fn factory(
        transport: Arc<LocalTransport>,
    ) -> (ShardNetworkFactory<LocalTransport>, Arc<PeerContact>) {
        let contact = Arc::new(PeerContact::default());
        (ShardNetworkFactory::new(1, "a".into(), transport, contact.clone()), contact)
    }

    fn reply_with(
        mut rx: tokio::sync::mpsc::UnboundedReceiver<InboundCall>,
        reply: fn() -> RaftReply,
    ) {
        tokio::spawn(async move {
            while let Some(call) = rx.recv().await {
                let _ = call.reply.send(reply());
            }
        });
    }

    #[tokio::test]
    async fn removal_notice_marks_the_replica() {
        let transport = Arc::new(LocalTransport::new());
        reply_with(transport.register("b"), || RaftReply::Removed);
        let (mut factory, contact) = factory(transport);
        let mut client = factory.new_client(2, &ReplicaNode::new("b")).await;

        let option = RPCOption::new(Duration::from_millis(100));
        let result = client.vote(VoteRequest::new(Vote::new(2, 1), None), option).await;
        assert!(matches!(result, Err(RPCError::Unreachable(_))));
        assert!(contact.is_removed());
    }

    #[tokio::test]
    async fn missing_replica_is_unreachable_and_not_heard() {
        let transport = Arc::new(LocalTransport::new());
        reply_with(transport.register("b"), || RaftReply::NoReplica);
        let (mut factory, contact) = factory(transport);
        let mut client = factory.new_client(2, &ReplicaNode::new("b")).await;

        let before = Instant::now();
        let option = RPCOption::new(Duration::from_millis(100));
        let result = client.vote(VoteRequest::new(Vote::new(2, 1), None), option).await;
        assert!(matches!(result, Err(RPCError::Unreachable(_))));
        assert!(contact.heard_since(before).is_empty());
        assert!(!contact.is_removed());
    }
}
