use std::sync::Arc;

use merope_consensus::{NodeHost, Transport};
use merope_proto::server::{
    session_manager_server::SessionManager, CloseSessionRequest, CloseSessionResponse,
    NewSessionRequest, NewSessionResponse,
};
use tonic::{Request, Response, Status};

use crate::config::ServerConfig;
use crate::convert::{db_to_status, request_timeout, session_from_proto, session_to_proto};

pub struct SessionManagerImpl<T> {
    host: Arc<NodeHost<T>>,
    config: ServerConfig,
}

impl<T: Transport> SessionManagerImpl<T> {
    pub fn new(host: Arc<NodeHost<T>>, config: ServerConfig) -> Self {
        SessionManagerImpl { host, config }
    }
}

#[tonic::async_trait]
impl<T: Transport> SessionManager for SessionManagerImpl<T> {
    async fn new_session(
        &self,
        request: Request<NewSessionRequest>,
    ) -> Result<Response<NewSessionResponse>, Status> {
        let req = request.into_inner();
        let timeout = request_timeout(req.timeout_ms, self.config.default_timeout());
        let session = self
            .host
            .new_session(req.cluster_id, req.client_id, timeout)
            .await
            .map_err(db_to_status)?;
        tracing::debug!(shard = session.cluster_id, client = session.client_id, "session opened");
        Ok(Response::new(NewSessionResponse {
            session_id: session.session_id,
            session: Some(session_to_proto(session)),
        }))
    }

    async fn close_session(
        &self,
        request: Request<CloseSessionRequest>,
    ) -> Result<Response<CloseSessionResponse>, Status> {
        let req = request.into_inner();
        let session = req
            .session
            .map(session_from_proto)
            .ok_or_else(|| Status::invalid_argument("session is required"))?;
        let timeout = request_timeout(req.timeout_ms, self.config.default_timeout());
        self.host
            .close_session(session.cluster_id, session.client_id, timeout)
            .await
            .map_err(db_to_status)?;
        tracing::debug!(shard = session.cluster_id, client = session.client_id, "session closed");
        Ok(Response::new(CloseSessionResponse {}))
    }
}
