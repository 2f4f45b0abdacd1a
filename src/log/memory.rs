use parking_lot::RwLock;

use super::{LogError, LogIndex, TransactionLog};
use crate::model::{AccountId, NewTransaction, RequestId, Transaction, TxId};

/// Transaction log kept in process memory. Useful for tests and the batch driver.
#[derive(Debug, Default)]
pub struct InMemoryTransactionLog {
    index: RwLock<LogIndex>,
}

impl InMemoryTransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TransactionLog for InMemoryTransactionLog {
    async fn append(&self, transaction: NewTransaction) -> Result<Transaction, LogError> {
        let mut index = self.index.write();
        let transaction = index.assign(transaction)?;
        index.insert(transaction.clone());
        Ok(transaction)
    }

    async fn get_by_id(&self, id: TxId) -> Result<Transaction, LogError> {
        self.index.read().get(id)
    }

    async fn get_by_request(&self, request: RequestId) -> Result<Option<Transaction>, LogError> {
        Ok(self.index.read().get_by_request(request))
    }

    async fn list_by_sender(&self, account: AccountId) -> Result<Vec<Transaction>, LogError> {
        Ok(self.index.read().list_by_sender(account, None, usize::MAX))
    }

    async fn list_by_sender_before(
        &self,
        account: AccountId,
        before: Option<TxId>,
        limit: usize,
    ) -> Result<Vec<Transaction>, LogError> {
        Ok(self.index.read().list_by_sender(account, before, limit))
    }
}
