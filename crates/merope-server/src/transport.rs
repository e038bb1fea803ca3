//! Raft traffic between hosts.
//!
//! Each raft RPC is one unary `RaftTransport.Call` carrying the encoded
//! request. Channels are opened lazily, one per peer address, and cap the
//! number of calls in flight to that peer at `host.mailbox_capacity`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use merope_consensus::{NodeHost, RaftReply, RaftRequest, Transport};
use merope_proto::server::{
    raft_transport_client::RaftTransportClient, raft_transport_server::RaftTransport, RaftCall,
    RaftCallReply,
};
use merope_types::DbError;
use tonic::transport::{Channel, Endpoint};
use tonic::{Request, Response, Status};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

pub struct GrpcTransport {
    peers: Mutex<HashMap<String, RaftTransportClient<Channel>>>,
    in_flight: usize,
}

impl GrpcTransport {
    pub fn new(in_flight: usize) -> Self {
        GrpcTransport { peers: Mutex::new(HashMap::new()), in_flight: in_flight.max(1) }
    }

    fn client(&self, addr: &str) -> Result<RaftTransportClient<Channel>, DbError> {
        let mut peers = self
            .peers
            .lock()
            .map_err(|_| DbError::Consensus("raft peer table poisoned".into()))?;
        if let Some(client) = peers.get(addr) {
            return Ok(client.clone());
        }
        let channel = Endpoint::from_shared(format!("http://{addr}"))
            .map_err(|e| DbError::InvalidArgument(format!("bad peer address {addr}: {e}")))?
            .connect_timeout(CONNECT_TIMEOUT)
            .concurrency_limit(self.in_flight)
            .connect_lazy();
        let client = RaftTransportClient::new(channel);
        peers.insert(addr.to_owned(), client.clone());
        tracing::debug!(peer = %addr, "raft channel opened");
        Ok(client)
    }
}

impl Transport for GrpcTransport {
    async fn call(&self, addr: &str, request: RaftRequest) -> Result<RaftReply, DbError> {
        let mut client = self.client(addr)?;
        let payload = request.encode()?;
        let reply = client.call(RaftCall { payload }).await.map_err(|status| {
            tracing::trace!(peer = %addr, %status, "raft call failed");
            DbError::Consensus(format!("raft call to {addr} failed: {}", status.message()))
        })?;
        RaftReply::decode(&reply.into_inner().payload)
    }
}

/// Inbound side: decodes the request and lets the local host answer it.
pub struct RaftTransportService<T> {
    host: Arc<NodeHost<T>>,
}

impl<T: Transport> RaftTransportService<T> {
    pub fn new(host: Arc<NodeHost<T>>) -> Self {
        RaftTransportService { host }
    }
}

#[tonic::async_trait]
impl<T: Transport> RaftTransport for RaftTransportService<T> {
    async fn call(&self, request: Request<RaftCall>) -> Result<Response<RaftCallReply>, Status> {
        let request = RaftRequest::decode(&request.into_inner().payload).map_err(|e| {
            tracing::warn!(error = %e, "undecodable raft request");
            Status::invalid_argument(e.to_string())
        })?;
        let reply = self.host.handle_raft(request).await;
        let payload = reply.encode().map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(RaftCallReply { payload }))
    }
}
