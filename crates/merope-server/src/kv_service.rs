use std::sync::Arc;

use merope_consensus::{NodeHost, TransactionManager, Transport};
use merope_proto::server::{
    delete_key_request, delete_key_response, kv_store_service_server::KvStoreService,
    put_key_request, put_key_response, CreateAccountRequest, CreateAccountResponse,
    CreateBucketRequest, CreateBucketResponse, DeleteAccountRequest, DeleteAccountResponse,
    DeleteBucketRequest, DeleteBucketResponse, DeleteKeyRequest, DeleteKeyResponse,
    GetAccountDescriptorRequest, GetAccountDescriptorResponse, GetBucketDescriptorRequest,
    GetBucketDescriptorResponse, GetKeyRequest, GetKeyResponse, PutKeyRequest, PutKeyResponse,
    Session as ProtoSession,
};
use merope_types::{KeyValue, KvCommand, KvResponse, ProposalBody, ShardId};
use tonic::{Request, Response, Status};

use crate::config::ServerConfig;
use crate::convert::{
    account_to_proto, bucket_to_proto, db_to_status, header, kv_to_proto, proto_read_consistency,
    request_timeout, session_from_proto, session_to_proto, txn_from_proto, txn_to_proto,
};
use crate::router::ShardRouter;

pub struct KvStoreServiceImpl<T> {
    host: Arc<NodeHost<T>>,
    txns: Arc<TransactionManager<T>>,
    router: Arc<ShardRouter>,
    config: ServerConfig,
}

impl<T: Transport> KvStoreServiceImpl<T> {
    pub fn new(
        host: Arc<NodeHost<T>>,
        txns: Arc<TransactionManager<T>>,
        router: Arc<ShardRouter>,
        config: ServerConfig,
    ) -> Self {
        KvStoreServiceImpl { host, txns, router, config }
    }

    /// Replicate `cmd` on its shard, under the client's session when one
    /// is given, and return the advanced session.
    async fn propose(
        &self,
        session: Option<ProtoSession>,
        cmd: KvCommand,
        timeout_ms: u64,
    ) -> Result<(ShardId, KvResponse, Option<ProtoSession>), Status> {
        let mut session = session.map(session_from_proto);
        let shard_id = self.route(cmd.account_id(), session.map(|s| s.cluster_id))?;
        let tag = session.map(|s| s.tag()).unwrap_or_default();
        let timeout = request_timeout(timeout_ms, self.config.default_timeout());
        let mut responses = self
            .host
            .propose(shard_id, tag, ProposalBody::Kv(cmd), timeout)
            .await
            .map_err(db_to_status)?;
        let response = responses
            .pop()
            .ok_or_else(|| Status::internal("command produced no response"))?;
        if let Some(s) = session.as_mut() {
            s.proposal_completed();
        }
        Ok((shard_id, response, session.map(session_to_proto)))
    }

    fn route(&self, account_id: u64, pinned: Option<ShardId>) -> Result<ShardId, Status> {
        self.router.route(account_id, pinned).map_err(Status::invalid_argument)
    }

    fn check_key(&self, key: &[u8]) -> Result<(), Status> {
        if key.is_empty() {
            return Err(Status::invalid_argument("key must not be empty"));
        }
        if key.len() > self.config.max_key_bytes {
            return Err(Status::invalid_argument(format!(
                "key is {} bytes, limit is {}",
                key.len(),
                self.config.max_key_bytes
            )));
        }
        Ok(())
    }

    fn check_value(&self, value: &[u8]) -> Result<(), Status> {
        if value.len() > self.config.max_value_bytes {
            return Err(Status::invalid_argument(format!(
                "value is {} bytes, limit is {}",
                value.len(),
                self.config.max_value_bytes
            )));
        }
        Ok(())
    }
}

fn unexpected(resp: KvResponse) -> Status {
    Status::internal(format!("unexpected command response {resp:?}"))
}

#[tonic::async_trait]
impl<T: Transport> KvStoreService for KvStoreServiceImpl<T> {
    async fn create_account(
        &self,
        request: Request<CreateAccountRequest>,
    ) -> Result<Response<CreateAccountResponse>, Status> {
        let req = request.into_inner();
        let cmd = KvCommand::CreateAccount { account_id: req.account_id, owner: req.owner };
        let (shard_id, resp, session) = self.propose(req.session, cmd, req.timeout_ms).await?;
        let KvResponse::Account(account) = resp else { return Err(unexpected(resp)) };
        tracing::info!(account_id = req.account_id, shard = shard_id, "account created");
        Ok(Response::new(CreateAccountResponse {
            header: header(&self.host, shard_id).await,
            account: Some(account_to_proto(account)),
            session,
        }))
    }

    async fn delete_account(
        &self,
        request: Request<DeleteAccountRequest>,
    ) -> Result<Response<DeleteAccountResponse>, Status> {
        let req = request.into_inner();
        let cmd = KvCommand::DeleteAccount { account_id: req.account_id, owner: req.owner };
        let (shard_id, resp, session) = self.propose(req.session, cmd, req.timeout_ms).await?;
        let KvResponse::AccountDeleted = resp else { return Err(unexpected(resp)) };
        tracing::info!(account_id = req.account_id, shard = shard_id, "account deleted");
        Ok(Response::new(DeleteAccountResponse {
            header: header(&self.host, shard_id).await,
            session,
        }))
    }

    async fn get_account_descriptor(
        &self,
        request: Request<GetAccountDescriptorRequest>,
    ) -> Result<Response<GetAccountDescriptorResponse>, Status> {
        let req = request.into_inner();
        let shard_id = self.route(req.account_id, None)?;
        let mode = proto_read_consistency(req.consistency);
        let timeout = request_timeout(req.timeout_ms, self.config.default_timeout());
        let account = self
            .host
            .get_account(shard_id, req.account_id, mode, timeout)
            .await
            .map_err(db_to_status)?
            .ok_or_else(|| Status::not_found(format!("account {} not found", req.account_id)))?;
        Ok(Response::new(GetAccountDescriptorResponse {
            header: header(&self.host, shard_id).await,
            account: Some(account_to_proto(account)),
        }))
    }

    async fn create_bucket(
        &self,
        request: Request<CreateBucketRequest>,
    ) -> Result<Response<CreateBucketResponse>, Status> {
        let req = request.into_inner();
        let cmd = KvCommand::CreateBucket {
            account_id: req.account_id,
            name: req.name.clone(),
            owner: req.owner,
        };
        let (shard_id, resp, session) = self.propose(req.session, cmd, req.timeout_ms).await?;
        let KvResponse::Bucket(bucket) = resp else { return Err(unexpected(resp)) };
        tracing::info!(account_id = req.account_id, bucket = %req.name, "bucket created");
        Ok(Response::new(CreateBucketResponse {
            header: header(&self.host, shard_id).await,
            bucket: Some(bucket_to_proto(bucket)),
            session,
        }))
    }

    async fn delete_bucket(
        &self,
        request: Request<DeleteBucketRequest>,
    ) -> Result<Response<DeleteBucketResponse>, Status> {
        let req = request.into_inner();
        let cmd = KvCommand::DeleteBucket { account_id: req.account_id, name: req.name.clone() };
        let (shard_id, resp, session) = self.propose(req.session, cmd, req.timeout_ms).await?;
        let KvResponse::BucketDeleted = resp else { return Err(unexpected(resp)) };
        tracing::info!(account_id = req.account_id, bucket = %req.name, "bucket deleted");
        Ok(Response::new(DeleteBucketResponse {
            header: header(&self.host, shard_id).await,
            session,
        }))
    }

    async fn get_bucket_descriptor(
        &self,
        request: Request<GetBucketDescriptorRequest>,
    ) -> Result<Response<GetBucketDescriptorResponse>, Status> {
        let req = request.into_inner();
        let shard_id = self.route(req.account_id, None)?;
        let mode = proto_read_consistency(req.consistency);
        let timeout = request_timeout(req.timeout_ms, self.config.default_timeout());
        let bucket = self
            .host
            .get_bucket(shard_id, req.account_id, &req.name, mode, timeout)
            .await
            .map_err(db_to_status)?
            .ok_or_else(|| Status::not_found(format!("bucket '{}' not found", req.name)))?;
        Ok(Response::new(GetBucketDescriptorResponse {
            header: header(&self.host, shard_id).await,
            bucket: Some(bucket_to_proto(bucket)),
        }))
    }

    async fn get_key(
        &self,
        request: Request<GetKeyRequest>,
    ) -> Result<Response<GetKeyResponse>, Status> {
        let req = request.into_inner();
        self.check_key(&req.key)?;
        let shard_id = self.route(req.account_id, None)?;
        let mode = proto_read_consistency(req.consistency);
        let timeout = request_timeout(req.timeout_ms, self.config.default_timeout());
        let kv = self
            .host
            .get_key(shard_id, req.account_id, &req.bucket_name, &req.key, mode, timeout)
            .await
            .map_err(db_to_status)?
            .ok_or_else(|| Status::not_found("key not found"))?;
        Ok(Response::new(GetKeyResponse {
            header: header(&self.host, shard_id).await,
            key_value: Some(kv_to_proto(kv)),
        }))
    }

    async fn put_key(
        &self,
        request: Request<PutKeyRequest>,
    ) -> Result<Response<PutKeyResponse>, Status> {
        let req = request.into_inner();
        let kv = req
            .key_value
            .ok_or_else(|| Status::invalid_argument("key_value is required"))?;
        self.check_key(&kv.key)?;
        self.check_value(&kv.value)?;
        let cmd = KvCommand::PutKey {
            account_id: req.account_id,
            bucket: req.bucket_name,
            key: kv.key.clone(),
            value: kv.value.clone(),
            lease: kv.lease,
        };

        match req.handle {
            Some(put_key_request::Handle::Transaction(txn)) => {
                let txn = txn_from_proto(txn);
                self.route(req.account_id, Some(txn.shard_id))?;
                self.txns.stage(&txn, cmd).await.map_err(db_to_status)?;
                // revisions are assigned when the transaction commits
                let staged = KeyValue {
                    key: kv.key,
                    value: kv.value,
                    lease: kv.lease,
                    ..Default::default()
                };
                Ok(Response::new(PutKeyResponse {
                    header: header(&self.host, txn.shard_id).await,
                    key_value: Some(kv_to_proto(staged)),
                    handle: Some(put_key_response::Handle::Transaction(txn_to_proto(txn))),
                }))
            }
            handle => {
                let session = match handle {
                    Some(put_key_request::Handle::Session(s)) => Some(s),
                    _ => None,
                };
                let (shard_id, resp, session) = self.propose(session, cmd, req.timeout_ms).await?;
                let KvResponse::Put(stored) = resp else { return Err(unexpected(resp)) };
                Ok(Response::new(PutKeyResponse {
                    header: header(&self.host, shard_id).await,
                    key_value: Some(kv_to_proto(stored)),
                    handle: session.map(put_key_response::Handle::Session),
                }))
            }
        }
    }

    async fn delete_key(
        &self,
        request: Request<DeleteKeyRequest>,
    ) -> Result<Response<DeleteKeyResponse>, Status> {
        let req = request.into_inner();
        self.check_key(&req.key)?;
        let cmd = KvCommand::DeleteKey {
            account_id: req.account_id,
            bucket: req.bucket_name,
            key: req.key,
        };

        match req.handle {
            Some(delete_key_request::Handle::Transaction(txn)) => {
                let txn = txn_from_proto(txn);
                self.route(cmd.account_id(), Some(txn.shard_id))?;
                self.txns.stage(&txn, cmd).await.map_err(db_to_status)?;
                Ok(Response::new(DeleteKeyResponse {
                    header: header(&self.host, txn.shard_id).await,
                    found: false,
                    handle: Some(delete_key_response::Handle::Transaction(txn_to_proto(txn))),
                }))
            }
            handle => {
                let session = match handle {
                    Some(delete_key_request::Handle::Session(s)) => Some(s),
                    _ => None,
                };
                let (shard_id, resp, session) = self.propose(session, cmd, req.timeout_ms).await?;
                let KvResponse::KeyDeleted { found } = resp else { return Err(unexpected(resp)) };
                Ok(Response::new(DeleteKeyResponse {
                    header: header(&self.host, shard_id).await,
                    found,
                    handle: session.map(delete_key_response::Handle::Session),
                }))
            }
        }
    }
}
