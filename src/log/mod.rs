//! Append-only record of committed transactions.
//!
//! A transaction is considered committed only once `append` has returned.
//! Entries are never updated or removed.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use thiserror::Error;

use crate::model::{AccountId, NewTransaction, RequestId, Transaction, TxId};

mod file;
mod memory;
pub use file::FileTransactionLog;
pub use memory::InMemoryTransactionLog;

/// Errors returned by a [`TransactionLog`].
#[derive(Debug, Error)]
pub enum LogError {
    #[error("request {request} already logged as transaction {existing}")]
    Duplicate { request: RequestId, existing: TxId },

    #[error("transaction {0} not found")]
    NotFound(TxId),

    #[error("log i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("log line {line} is corrupt: {source}")]
    Corrupt {
        line: usize,
        source: serde_json::Error,
    },

    #[error("log line {line} holds transaction {found}, expected {expected}")]
    OutOfSequence {
        line: usize,
        expected: TxId,
        found: TxId,
    },

    #[error("failed to encode transaction: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("log unavailable: {0}")]
    Unavailable(String),
}

/// Storage contract for the transaction log.
pub trait TransactionLog: Send + Sync + 'static {
    /// Durably append a transaction, assigning it the next id.
    ///
    /// Fails with [`LogError::Duplicate`] if the request was already logged.
    fn append(
        &self,
        transaction: NewTransaction,
    ) -> impl Future<Output = Result<Transaction, LogError>> + Send;

    fn get_by_id(&self, id: TxId) -> impl Future<Output = Result<Transaction, LogError>> + Send;

    /// The transaction a request produced, if it was committed.
    fn get_by_request(
        &self,
        request: RequestId,
    ) -> impl Future<Output = Result<Option<Transaction>, LogError>> + Send;

    /// Every transaction sent by `account`, newest first.
    fn list_by_sender(
        &self,
        account: AccountId,
    ) -> impl Future<Output = Result<Vec<Transaction>, LogError>> + Send;

    /// One page of `account`'s history, newest first, strictly older than
    /// `before` when given. Pass the last id of a page to fetch the next one.
    fn list_by_sender_before(
        &self,
        account: AccountId,
        before: Option<TxId>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Transaction>, LogError>> + Send;
}

/// In-memory indexes shared by the log implementations.
#[derive(Debug, Default)]
struct LogIndex {
    /// Entry `n` holds transaction id `n + 1`.
    entries: Vec<Transaction>,
    by_request: HashMap<RequestId, TxId>,
    by_sender: HashMap<AccountId, Vec<TxId>>,
}

impl LogIndex {
    fn next_id(&self) -> TxId {
        self.entries.len() as TxId + 1
    }

    fn check_unique(&self, request: RequestId) -> Result<(), LogError> {
        match self.by_request.get(&request) {
            Some(&existing) => Err(LogError::Duplicate { request, existing }),
            None => Ok(()),
        }
    }

    fn assign(&self, body: NewTransaction) -> Result<Transaction, LogError> {
        self.check_unique(body.request_id)?;
        Ok(Transaction {
            id: self.next_id(),
            body,
        })
    }

    /// Insert an entry whose id was produced by `assign`.
    fn insert(&mut self, transaction: Transaction) {
        self.by_request
            .insert(transaction.request_id(), transaction.id);
        self.by_sender
            .entry(transaction.sender())
            .or_default()
            .push(transaction.id);
        self.entries.push(transaction);
    }

    fn get(&self, id: TxId) -> Result<Transaction, LogError> {
        id.checked_sub(1)
            .and_then(|idx| self.entries.get(idx as usize))
            .cloned()
            .ok_or(LogError::NotFound(id))
    }

    fn get_by_request(&self, request: RequestId) -> Option<Transaction> {
        self.by_request
            .get(&request)
            .and_then(|&id| self.get(id).ok())
    }

    fn list_by_sender(
        &self,
        account: AccountId,
        before: Option<TxId>,
        limit: usize,
    ) -> Vec<Transaction> {
        let Some(ids) = self.by_sender.get(&account) else {
            return Vec::new();
        };
        ids.iter()
            .rev()
            .filter(|&&id| before.is_none_or(|b| id < b))
            .take(limit)
            .filter_map(|&id| self.get(id).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TransactionKind;

    fn body(sender: AccountId, amount: u64) -> NewTransaction {
        NewTransaction::new(RequestId::new(), TransactionKind::DepositBank, sender, amount)
    }

    fn index_with(bodies: Vec<NewTransaction>) -> LogIndex {
        let mut index = LogIndex::default();
        for b in bodies {
            let tx = index.assign(b).unwrap();
            index.insert(tx);
        }
        index
    }

    #[test]
    fn ids_are_sequential_from_one() {
        let index = index_with(vec![body(1, 10), body(2, 20)]);
        assert_eq!(index.get(1).unwrap().body.amount, 10);
        assert_eq!(index.get(2).unwrap().body.amount, 20);
        assert_eq!(index.next_id(), 3);
    }

    #[test]
    fn get_out_of_range_is_not_found() {
        let index = index_with(vec![body(1, 10)]);
        assert!(matches!(index.get(0), Err(LogError::NotFound(0))));
        assert!(matches!(index.get(2), Err(LogError::NotFound(2))));
    }

    #[test]
    fn duplicate_request_is_rejected() {
        let first = body(1, 10);
        let mut again = first.clone();
        again.amount = 99;
        let index = index_with(vec![first]);

        assert!(matches!(
            index.assign(again),
            Err(LogError::Duplicate { existing: 1, .. })
        ));
    }

    #[test]
    fn list_by_sender_pages_newest_first() {
        let index = index_with(vec![body(1, 1), body(2, 2), body(1, 3), body(1, 4)]);

        let all: Vec<_> = index
            .list_by_sender(1, None, usize::MAX)
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(all, vec![4, 3, 1]);

        let page: Vec<_> = index
            .list_by_sender(1, Some(4), 1)
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(page, vec![3]);

        assert!(index.list_by_sender(9, None, 10).is_empty());
    }
}
