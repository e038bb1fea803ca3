use std::sync::Arc;

use merope_consensus::{TransactionManager, Transport};
use merope_proto::server::{
    transactions_server::Transactions, CloseTransactionRequest, CloseTransactionResponse,
    CommitRequest, CommitResponse, NewTransactionRequest, NewTransactionResponse,
    Transaction as ProtoTransaction,
};
use merope_types::Transaction;
use tonic::{Request, Response, Status};

use crate::config::ServerConfig;
use crate::convert::{db_to_status, operation_result, request_timeout, txn_from_proto, txn_to_proto};

pub struct TransactionsImpl<T> {
    txns: Arc<TransactionManager<T>>,
    config: ServerConfig,
}

impl<T: Transport> TransactionsImpl<T> {
    pub fn new(txns: Arc<TransactionManager<T>>, config: ServerConfig) -> Self {
        TransactionsImpl { txns, config }
    }
}

fn required(txn: Option<ProtoTransaction>) -> Result<Transaction, Status> {
    txn.map(txn_from_proto)
        .ok_or_else(|| Status::invalid_argument("transaction is required"))
}

#[tonic::async_trait]
impl<T: Transport> Transactions for TransactionsImpl<T> {
    async fn new_transaction(
        &self,
        request: Request<NewTransactionRequest>,
    ) -> Result<Response<NewTransactionResponse>, Status> {
        let req = request.into_inner();
        if req.shard_id == 0 {
            return Err(Status::invalid_argument("shard_id must not be zero"));
        }
        let timeout = request_timeout(req.timeout_ms, self.config.default_timeout());
        let txn = self
            .txns
            .begin(req.shard_id, req.client_id, timeout)
            .await
            .map_err(db_to_status)?;
        Ok(Response::new(NewTransactionResponse { transaction: Some(txn_to_proto(txn)) }))
    }

    async fn commit(
        &self,
        request: Request<CommitRequest>,
    ) -> Result<Response<CommitResponse>, Status> {
        let req = request.into_inner();
        let txn = required(req.transaction)?;
        let timeout = request_timeout(req.timeout_ms, self.config.default_timeout());
        let (next, results) = self.txns.commit(&txn, timeout).await.map_err(db_to_status)?;
        tracing::debug!(
            shard = txn.shard_id,
            client = txn.client_id,
            ops = results.len(),
            "transaction committed"
        );
        Ok(Response::new(CommitResponse {
            transaction: Some(txn_to_proto(next)),
            results: results.into_iter().map(operation_result).collect(),
        }))
    }

    async fn close_transaction(
        &self,
        request: Request<CloseTransactionRequest>,
    ) -> Result<Response<CloseTransactionResponse>, Status> {
        let req = request.into_inner();
        let txn = required(req.transaction)?;
        let timeout = request_timeout(req.timeout_ms, self.config.default_timeout());
        let closed = self.txns.close(&txn, timeout).await.map_err(db_to_status)?;
        Ok(Response::new(CloseTransactionResponse { transaction: Some(txn_to_proto(closed)) }))
    }
}

#[cfg(test)]
mod tests {
    use merope_proto::server::{
        delete_key_request, operation_result, put_key_request, DeleteKeyRequest,
        KeyValue as ProtoKeyValue, PutKeyRequest,
    };
    use merope_proto::server::kv_store_service_server::KvStoreService;
    use tonic::Code;

    use super::*;
    use crate::test_support::*;

    fn staged_put(txn: &ProtoTransaction, key: &str) -> PutKeyRequest {
        PutKeyRequest {
            account_id: 1,
            bucket_name: "b".into(),
            key_value: Some(ProtoKeyValue {
                key: key.as_bytes().to_vec(),
                value: b"v".to_vec(),
                ..Default::default()
            }),
            handle: Some(put_key_request::Handle::Transaction(txn.clone())),
            timeout_ms: 0,
        }
    }

    #[tokio::test]
    async fn staged_writes_apply_on_commit() {
        let node = TestNode::start().await;
        node.bucket().await;
        node.put("gone").await;
        let kv = node.kv_service();
        let txns = node.transaction_service();

        let txn = txns
            .new_transaction(Request::new(NewTransactionRequest {
                shard_id: 1,
                client_id: 11,
                timeout_ms: 0,
            }))
            .await
            .unwrap()
            .into_inner()
            .transaction
            .unwrap();

        let staged = kv.put_key(Request::new(staged_put(&txn, "a"))).await.unwrap().into_inner();
        assert_eq!(staged.key_value.unwrap().version, 0);
        kv.delete_key(Request::new(DeleteKeyRequest {
            account_id: 1,
            bucket_name: "b".into(),
            key: b"gone".to_vec(),
            handle: Some(delete_key_request::Handle::Transaction(txn.clone())),
            timeout_ms: 0,
        }))
        .await
        .unwrap();
        assert!(!node.has_key("a").await, "nothing applies before commit");

        let committed = txns
            .commit(Request::new(CommitRequest { transaction: Some(txn.clone()), timeout_ms: 0 }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(committed.transaction.unwrap().transaction_id, txn.transaction_id + 1);
        assert_eq!(committed.results.len(), 2);
        assert!(matches!(committed.results[0].result, Some(operation_result::Result::Put(_))));
        assert_eq!(committed.results[1].result, Some(operation_result::Result::DeleteFound(true)));
        assert!(node.has_key("a").await);
        assert!(!node.has_key("gone").await);
    }

    #[tokio::test]
    async fn stale_handle_is_rejected_after_close() {
        let node = TestNode::start().await;
        node.bucket().await;
        let txns = node.transaction_service();
        let txn = txns
            .new_transaction(Request::new(NewTransactionRequest {
                shard_id: 1,
                client_id: 12,
                timeout_ms: 0,
            }))
            .await
            .unwrap()
            .into_inner()
            .transaction
            .unwrap();

        txns.close_transaction(Request::new(CloseTransactionRequest {
            transaction: Some(txn.clone()),
            timeout_ms: 0,
        }))
        .await
        .unwrap();
        let err = node.kv_service().put_key(Request::new(staged_put(&txn, "a"))).await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);

        let err = txns
            .commit(Request::new(CommitRequest { transaction: None, timeout_ms: 0 }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }
}
