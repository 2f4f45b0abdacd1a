use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

use super::journal::PendingSet;
use super::{
    AccountStore, AccountWrite, JournalChange, PendingEntry, StoreError, check_distinct,
    next_records,
};
use crate::model::{Account, AccountId, RequestId};

/// Account store kept in process memory.
///
/// Each record sits behind its own mutex. A commit locks the records it
/// touches in ascending account id order, so two commits over the same pair
/// of accounts can never wait on each other in a cycle.
#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    accounts: RwLock<HashMap<AccountId, Arc<Mutex<Account>>>>,
    /// Locked after any record mutexes, never before
    pending: Mutex<PendingSet>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of every account, sorted by id.
    pub fn snapshot(&self) -> Vec<Account> {
        let records: Vec<_> = self.accounts.read().values().cloned().collect();
        let mut accounts: Vec<Account> = records.iter().map(|r| r.lock().clone()).collect();
        accounts.sort_by_key(|a| a.id);
        accounts
    }

    fn record(&self, id: AccountId) -> Result<Arc<Mutex<Account>>, StoreError> {
        self.accounts
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    fn commit_locked(
        &self,
        writes: &[AccountWrite],
        journal: JournalChange<'_>,
    ) -> Result<Vec<Account>, StoreError> {
        check_distinct(writes)?;

        let mut ids: Vec<AccountId> = writes.iter().map(|w| w.account).collect();
        ids.sort_unstable();
        let records = ids
            .iter()
            .map(|&id| self.record(id))
            .collect::<Result<Vec<_>, _>>()?;
        let mut guards: Vec<_> = records.iter().map(|r| r.lock()).collect();

        let updated = next_records(writes, |id| {
            guards.iter().find(|g| g.id == id).map(|g| (**g).clone())
        })?;

        for guard in guards.iter_mut() {
            if let Some(account) = updated.iter().find(|a| a.id == guard.id) {
                **guard = account.clone();
            }
        }
        self.pending.lock().apply(journal);

        Ok(updated)
    }
}

impl AccountStore for InMemoryAccountStore {
    async fn get(&self, id: AccountId) -> Result<Account, StoreError> {
        let record = self.record(id)?;
        let account = record.lock().clone();
        Ok(account)
    }

    async fn create(&self, account: Account) -> Result<Account, StoreError> {
        let mut accounts = self.accounts.write();
        if accounts.contains_key(&account.id) {
            return Err(StoreError::AlreadyExists(account.id));
        }
        accounts.insert(account.id, Arc::new(Mutex::new(account.clone())));
        Ok(account)
    }

    async fn commit(
        &self,
        writes: &[AccountWrite],
        journal: JournalChange<'_>,
    ) -> Result<Vec<Account>, StoreError> {
        self.commit_locked(writes, journal)
    }

    async fn deactivate(&self, id: AccountId) -> Result<Account, StoreError> {
        let record = self.record(id)?;
        let mut account = record.lock();
        account.active = false;
        account.version += 1;
        Ok(account.clone())
    }

    async fn accounts(&self) -> Result<Vec<Account>, StoreError> {
        Ok(self.snapshot())
    }

    async fn pending(&self) -> Result<Vec<PendingEntry>, StoreError> {
        Ok(self.pending.lock().entries())
    }

    async fn is_pending(&self, request: RequestId) -> Result<bool, StoreError> {
        Ok(self.pending.lock().contains(request))
    }

    async fn settle(&self, request: RequestId) -> Result<(), StoreError> {
        self.pending.lock().apply(JournalChange::Settle(request));
        Ok(())
    }
}
