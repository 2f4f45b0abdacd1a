use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{LogError, LogIndex, TransactionLog};
use crate::jsonl::JsonLines;
use crate::model::{AccountId, NewTransaction, RequestId, Transaction, TxId};

/// Transaction log persisted as JSON lines.
///
/// `append` returns only after the line has been written and synced to disk.
/// Opening an existing file replays it to rebuild the indexes; ids must run
/// 1, 2, 3.. in file order.
#[derive(Debug)]
pub struct FileTransactionLog {
    path: PathBuf,
    /// Serializes appends so ids are assigned in file order.
    file: Mutex<JsonLines>,
    index: RwLock<LogIndex>,
}

impl FileTransactionLog {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        let (file, lines) = JsonLines::open(&path).await?;

        let mut index = LogIndex::default();
        for line in lines {
            let transaction: Transaction =
                serde_json::from_slice(&line.bytes).map_err(|source| LogError::Corrupt {
                    line: line.number,
                    source,
                })?;

            let expected = index.next_id();
            if transaction.id < expected && index.get(transaction.id).is_ok_and(|t| t == transaction)
            {
                warn!(line = line.number, tx = transaction.id, "skipping repeated log line");
                continue;
            }
            if transaction.id != expected {
                return Err(LogError::OutOfSequence {
                    line: line.number,
                    expected,
                    found: transaction.id,
                });
            }
            index.check_unique(transaction.request_id())?;
            index.insert(transaction);
        }

        info!(path = %path.display(), entries = index.entries.len(), "transaction log opened");

        Ok(Self {
            path,
            file: Mutex::new(file),
            index: RwLock::new(index),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TransactionLog for FileTransactionLog {
    async fn append(&self, transaction: NewTransaction) -> Result<Transaction, LogError> {
        let mut file = self.file.lock().await;

        let transaction = self.index.read().assign(transaction)?;
        let line = serde_json::to_vec(&transaction)?;
        file.append(&line).await?;

        self.index.write().insert(transaction.clone());
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
