use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::info;

use super::journal::PendingSet;
use super::{
    AccountStore, AccountWrite, JournalChange, PendingEntry, StoreError, check_distinct,
    next_records,
};
use crate::jsonl::JsonLines;
use crate::model::{Account, AccountId, RequestId};

/// One synced line of the store file: the new state of every account a
/// mutation touched, plus its journal change.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreRecord {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    accounts: Vec<Account>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    recorded: Option<PendingEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    settled: Option<RequestId>,
}

impl StoreRecord {
    fn new(accounts: Vec<Account>, journal: JournalChange<'_>) -> Self {
        let mut record = StoreRecord {
            accounts,
            ..StoreRecord::default()
        };
        match journal {
            JournalChange::None => {}
            JournalChange::Record(entry) => record.recorded = Some(entry.clone()),
            JournalChange::Settle(request) => record.settled = Some(request),
        }
        record
    }
}

#[derive(Debug, Default)]
struct State {
    accounts: HashMap<AccountId, Account>,
    pending: PendingSet,
}

impl State {
    fn apply(&mut self, record: StoreRecord) {
        for account in record.accounts {
            self.accounts.insert(account.id, account);
        }
        if let Some(entry) = &record.recorded {
            self.pending.apply(JournalChange::Record(entry));
        }
        if let Some(request) = record.settled {
            self.pending.apply(JournalChange::Settle(request));
        }
    }
}

fn unavailable(e: impl Display) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Account store persisted as JSON lines.
///
/// Every mutation appends one synced line holding the touched records and
/// the journal change, so a commit and its journal entry land together or
/// not at all. Opening the file replays it, last line wins.
#[derive(Debug)]
pub struct FileAccountStore {
    path: PathBuf,
    /// Serializes mutations from the version check until the new state is applied
    file: Mutex<JsonLines>,
    state: RwLock<State>,
}

impl FileAccountStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let (file, lines) = JsonLines::open(&path).await.map_err(unavailable)?;

        let mut state = State::default();
        for line in lines {
            let record: StoreRecord =
                serde_json::from_slice(&line.bytes).map_err(|e| StoreError::Corrupt {
                    line: line.number,
                    reason: e.to_string(),
                })?;
            state.apply(record);
        }

        info!(
            path = %path.display(),
            accounts = state.accounts.len(),
            pending = state.pending.entries().len(),
            "account store opened"
        );

        Ok(Self {
            path,
            file: Mutex::new(file),
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `build` against the current state, persist the record it returns,
    /// then apply it.
    async fn mutate<T>(
        &self,
        build: impl FnOnce(&State) -> Result<(StoreRecord, T), StoreError>,
    ) -> Result<T, StoreError> {
        let mut file = self.file.lock().await;

        let (record, out) = build(&self.state.read())?;
        let line = serde_json::to_vec(&record).map_err(unavailable)?;
        file.append(&line).await.map_err(unavailable)?;

        self.state.write().apply(record);
        Ok(out)
    }
}

impl AccountStore for FileAccountStore {
    async fn get(&self, id: AccountId) -> Result<Account, StoreError> {
        self.state
            .read()
            .accounts
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn create(&self, account: Account) -> Result<Account, StoreError> {
        self.mutate(|state| {
            if state.accounts.contains_key(&account.id) {
                return Err(StoreError::AlreadyExists(account.id));
            }
            let record = StoreRecord::new(vec![account.clone()], JournalChange::None);
            Ok((record, account))
        })
        .await
    }

    async fn commit(
        &self,
        writes: &[AccountWrite],
        journal: JournalChange<'_>,
    ) -> Result<Vec<Account>, StoreError> {
        check_distinct(writes)?;
        self.mutate(|state| {
            let updated = next_records(writes, |id| state.accounts.get(&id).cloned())?;
            Ok((StoreRecord::new(updated.clone(), journal), updated))
        })
        .await
    }

    async fn deactivate(&self, id: AccountId) -> Result<Account, StoreError> {
        self.mutate(|state| {
            let mut account = state
                .accounts
                .get(&id)
                .cloned()
                .ok_or(StoreError::NotFound(id))?;
            account.active = false;
            account.version += 1;
            Ok((
                StoreRecord::new(vec![account.clone()], JournalChange::None),
                account,
            ))
        })
        .await
    }

    async fn accounts(&self) -> Result<Vec<Account>, StoreError> {
        let mut accounts: Vec<Account> = self.state.read().accounts.values().cloned().collect();
        accounts.sort_by_key(|a| a.id);
        Ok(accounts)
    }

    async fn pending(&self) -> Result<Vec<PendingEntry>, StoreError> {
        Ok(self.state.read().pending.entries())
    }

    async fn is_pending(&self, request: RequestId) -> Result<bool, StoreError> {
        Ok(self.state.read().pending.contains(request))
    }

    async fn settle(&self, request: RequestId) -> Result<(), StoreError> {
        if !self.state.read().pending.contains(request) {
            return Ok(());
        }
        let record = StoreRecord::new(Vec::new(), JournalChange::Settle(request));
        self.mutate(|_| Ok((record, ()))).await
    }
}
