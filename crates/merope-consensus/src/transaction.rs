//! Single-shard transactions.
//!
//! A transaction is a session whose commands are staged on the host and
//! committed as one `Batch` entry. The leader term seen at `begin` is the
//! transaction's epoch: a commit under a different leader term is aborted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use merope_types::{
    ClientId, DbError, KvCommand, KvResponse, ProposalBody, ShardId, Transaction,
};

use crate::host::NodeHost;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Open,
    Committing,
    Committed,
    /// Stays until the client closes it.
    Aborted,
}

struct TxnEntry {
    txn: Transaction,
    epoch: u64,
    state: TxnState,
    staged: Vec<KvCommand>,
}

pub struct TransactionManager<T> {
    host: Arc<NodeHost<T>>,
    txns: Mutex<HashMap<(ShardId, ClientId), TxnEntry>>,
}

impl<T: Transport> TransactionManager<T> {
    pub fn new(host: Arc<NodeHost<T>>) -> Self {
        TransactionManager { host, txns: Mutex::new(HashMap::new()) }
    }

    /// Open a transaction on a shard led by this host.
    pub async fn begin(
        &self,
        shard_id: ShardId,
        client_id: ClientId,
        timeout: Duration,
    ) -> Result<Transaction, DbError> {
        let Some(epoch) = self.host.leader_term(shard_id).await else {
            let leader_id = self.host.leader_id(shard_id).await?.0;
            return Err(DbError::NotLeader { leader_id });
        };
        let session = self.host.new_session(shard_id, client_id, timeout).await?;
        let txn = Transaction::new(shard_id, session.client_id);
        self.txns.lock().await.insert(
            (shard_id, txn.client_id),
            TxnEntry { txn, epoch, state: TxnState::Open, staged: Vec::new() },
        );
        tracing::debug!(shard = shard_id, client = txn.client_id, epoch, "transaction opened");
        Ok(txn)
    }

    pub async fn state(&self, txn: &Transaction) -> Option<TxnState> {
        self.txns.lock().await.get(&(txn.shard_id, txn.client_id)).map(|e| e.state)
    }

    /// Stage a command for the next commit. Only shape is checked here;
    /// state checks happen when the batch applies.
    pub async fn stage(&self, txn: &Transaction, cmd: KvCommand) -> Result<(), DbError> {
        cmd.validate()?;
        let mut txns = self.txns.lock().await;
        let entry = lookup(&mut txns, txn)?;
        match entry.state {
            TxnState::Open => {}
            TxnState::Committed => entry.state = TxnState::Open,
            other => {
                return Err(DbError::FailedPrecondition(format!(
                    "transaction of client {} is {other:?}",
                    txn.client_id
                )))
            }
        }
        entry.staged.push(cmd);
        Ok(())
    }

    /// Commit the staged commands as one replicated entry and return the
    /// advanced transaction with one response per command.
    pub async fn commit(
        &self,
        txn: &Transaction,
        timeout: Duration,
    ) -> Result<(Transaction, Vec<KvResponse>), DbError> {
        let (current, staged) = {
            let mut txns = self.txns.lock().await;
            let entry = lookup(&mut txns, txn)?;
            if !matches!(entry.state, TxnState::Open | TxnState::Committed) {
                return Err(DbError::FailedPrecondition(format!(
                    "transaction of client {} is {:?}",
                    txn.client_id, entry.state
                )));
            }
            if entry.staged.is_empty() {
                return Ok((entry.txn, Vec::new()));
            }
            if self.host.leader_term(txn.shard_id).await != Some(entry.epoch) {
                entry.state = TxnState::Aborted;
                entry.staged.clear();
                tracing::info!(
                    shard = txn.shard_id,
                    client = txn.client_id,
                    "transaction aborted, leader changed"
                );
                return Err(DbError::Aborted(format!(
                    "leader of shard {} changed since the transaction began",
                    txn.shard_id
                )));
            }
            entry.state = TxnState::Committing;
            (entry.txn, entry.staged.clone())
        };

        let result = self
            .host
            .propose(txn.shard_id, current.tag(), ProposalBody::Batch(staged), timeout)
            .await;

        let mut txns = self.txns.lock().await;
        let entry = lookup(&mut txns, txn)?;
        match result {
            Ok(responses) => {
                entry.txn.commit_completed();
                entry.staged.clear();
                entry.state = TxnState::Committed;
                Ok((entry.txn, responses))
            }
            Err(DbError::Timeout) => {
                // retried commits reuse the same id, so the batch applies once
                entry.state = TxnState::Open;
                Err(DbError::Timeout)
            }
            Err(e @ (DbError::NotLeader { .. } | DbError::Terminated | DbError::Aborted(_))) => {
                entry.state = TxnState::Aborted;
                entry.staged.clear();
                Err(DbError::Aborted(format!("commit failed: {e}")))
            }
            Err(e) => {
                // the failure is the replicated outcome of this id
                entry.txn.commit_completed();
                entry.staged.clear();
                entry.state = TxnState::Open;
                Err(e)
            }
        }
    }

    /// Forget the transaction, dropping anything staged, and release its
    /// session.
    pub async fn close(
        &self,
        txn: &Transaction,
        timeout: Duration,
    ) -> Result<Transaction, DbError> {
        let closed = {
            let mut txns = self.txns.lock().await;
            let closed = lookup(&mut txns, txn)?.txn;
            txns.remove(&(txn.shard_id, txn.client_id));
            closed
        };
        tracing::debug!(shard = txn.shard_id, client = txn.client_id, "transaction closed");
        match self.host.close_session(txn.shard_id, txn.client_id, timeout).await {
            Ok(()) | Err(DbError::NotFound(_)) => Ok(closed),
            Err(e) => Err(e),
        }
    }
}

fn lookup<'a>(
    txns: &'a mut HashMap<(ShardId, ClientId), TxnEntry>,
    txn: &Transaction,
) -> Result<&'a mut TxnEntry, DbError> {
    let entry = txns.get_mut(&(txn.shard_id, txn.client_id)).ok_or_else(|| {
        DbError::NotFound(format!(
            "transaction of client {} on shard {}",
            txn.client_id, txn.shard_id
        ))
    })?;
    if entry.txn.transaction_id != txn.transaction_id {
        return Err(DbError::FailedPrecondition(format!(
            "transaction id {} is stale, current is {}",
            txn.transaction_id, entry.txn.transaction_id
        )));
    }
    Ok(entry)
}
