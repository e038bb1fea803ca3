use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::RwLock;

use tokio::sync::{mpsc, oneshot};

use merope_types::DbError;

use crate::message::{RaftReply, RaftRequest};

/// Request/response delivery of raft RPCs to the host at `addr`.
///
/// An `Err` means the peer could not be reached; openraft retries on its
/// own schedule.
pub trait Transport: Send + Sync + 'static {
    fn call(
        &self,
        addr: &str,
        request: RaftRequest,
    ) -> impl Future<Output = Result<RaftReply, DbError>> + Send;
}

/// A raft RPC handed to a host by [`LocalTransport`].
pub struct InboundCall {
    pub request: RaftRequest,
    pub reply: oneshot::Sender<RaftReply>,
}

/// In-process transport connecting hosts of one test cluster.
#[derive(Default)]
pub struct LocalTransport {
    routes: RwLock<HashMap<String, mpsc::UnboundedSender<InboundCall>>>,
    isolated: RwLock<HashSet<String>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a host listening on `addr`; calls for it arrive on the
    /// returned receiver.
    pub fn register(&self, addr: &str) -> mpsc::UnboundedReceiver<InboundCall> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut routes) = self.routes.write() {
            routes.insert(addr.to_owned(), tx);
        }
        rx
    }

    /// Fail all calls to and from `addr` until [`heal`](Self::heal).
    pub fn isolate(&self, addr: &str) {
        if let Ok(mut isolated) = self.isolated.write() {
            isolated.insert(addr.to_owned());
        }
    }

    pub fn heal(&self, addr: &str) {
        if let Ok(mut isolated) = self.isolated.write() {
            isolated.remove(addr);
        }
    }

    fn is_isolated(&self, addr: &str) -> bool {
        self.isolated.read().map(|isolated| isolated.contains(addr)).unwrap_or(false)
    }

    fn route(&self, addr: &str) -> Option<mpsc::UnboundedSender<InboundCall>> {
        self.routes.read().ok().and_then(|routes| routes.get(addr).cloned())
    }
}

impl Transport for LocalTransport {
    async fn call(&self, addr: &str, request: RaftRequest) -> Result<RaftReply, DbError> {
        let unreachable = || DbError::Consensus(format!("host {addr} is unreachable"));
        if self.is_isolated(addr) || self.is_isolated(&request.from_addr) {
            return Err(unreachable());
        }
        let route = self.route(addr).ok_or_else(unreachable)?;
        let (reply, rx) = oneshot::channel();
        route.send(InboundCall { request, reply }).map_err(|_| unreachable())?;
        rx.await.map_err(|_| unreachable())
    }
}

#[cfg(test)]
mod tests {
    use openraft::raft::VoteRequest;
    use openraft::Vote;

    use super::*;
    use crate::message::RaftRpc;

    fn request(from_addr: &str) -> RaftRequest {
        RaftRequest {
            shard_id: 1,
            from_addr: from_addr.into(),
            to: 2,
            rpc: RaftRpc::Vote(VoteRequest::new(Vote::new(1, 1), None)),
        }
    }

    /// Answer every call on `rx` with `NoReplica`.
    fn answer_all(mut rx: mpsc::UnboundedReceiver<InboundCall>) {
        tokio::spawn(async move {
            while let Some(call) = rx.recv().await {
                let _ = call.reply.send(RaftReply::NoReplica);
            }
        });
    }

    #[tokio::test]
    async fn isolated_hosts_lose_traffic() {
        let transport = LocalTransport::new();
        answer_all(transport.register("b"));

        assert!(matches!(transport.call("b", request("a")).await, Ok(RaftReply::NoReplica)));

        transport.isolate("a");
        assert!(transport.call("b", request("a")).await.is_err());

        transport.heal("a");
        assert!(transport.call("b", request("a")).await.is_ok());
        assert!(transport.call("c", request("a")).await.is_err());
    }
}
