//! Durable keyed storage for account records.
//!
//! The store holds no business rules. Every mutation is a compare-and-update
//! against the record's version token, and a multi-account [`commit`] applies
//! all of its writes or none of them, together with any change to the
//! reconciliation journal.
//!
//! [`commit`]: AccountStore::commit

use std::future::Future;
use thiserror::Error;

use crate::model::{Account, AccountId, RequestId};
use crate::{Amount, Points};

mod file;
mod journal;
mod memory;
pub use file::FileAccountStore;
pub use journal::{BalanceEffect, JournalChange, PendingEntry};
pub use memory::InMemoryAccountStore;

/// Errors returned by an [`AccountStore`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("account {0} not found")]
    NotFound(AccountId),

    #[error("account {0} already exists")]
    AlreadyExists(AccountId),

    #[error("account {account} changed concurrently: expected version {expected}, found {actual}")]
    VersionConflict {
        account: AccountId,
        expected: u64,
        actual: u64,
    },

    #[error("account {0} appears more than once in a single commit")]
    DuplicateWrite(AccountId),

    #[error("commit result is missing account {0}")]
    MissingFromCommit(AccountId),

    #[error("store line {line} is corrupt: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// New state for one account, valid only if the stored version still matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountWrite {
    pub account: AccountId,
    pub expected_version: u64,
    pub balance: Amount,
    pub points: Points,
}

impl AccountWrite {
    /// Write derived from a previously read record.
    pub fn from_read(read: &Account, balance: Amount, points: Points) -> Self {
        Self {
            account: read.id,
            expected_version: read.version,
            balance,
            points,
        }
    }
}

/// Storage contract the ledger engine requires.
pub trait AccountStore: Send + Sync + 'static {
    /// Load the current record, including its version token.
    fn get(&self, id: AccountId) -> impl Future<Output = Result<Account, StoreError>> + Send;

    /// Register a new account.
    fn create(&self, account: Account) -> impl Future<Output = Result<Account, StoreError>> + Send;

    /// Apply every write and the journal change atomically, or none of them.
    ///
    /// Returns the updated records in the same order as `writes`.
    fn commit(
        &self,
        writes: &[AccountWrite],
        journal: JournalChange<'_>,
    ) -> impl Future<Output = Result<Vec<Account>, StoreError>> + Send;

    /// Mark an account inactive. Bumps the version so in-flight writes conflict.
    fn deactivate(&self, id: AccountId)
    -> impl Future<Output = Result<Account, StoreError>> + Send;

    /// Every account, sorted by id.
    fn accounts(&self) -> impl Future<Output = Result<Vec<Account>, StoreError>> + Send;

    /// Journaled transactions not yet settled, oldest first.
    fn pending(&self) -> impl Future<Output = Result<Vec<PendingEntry>, StoreError>> + Send;

    fn is_pending(
        &self,
        request: RequestId,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Drop a journal entry whose transaction reached the log. Settling an
    /// unknown request is a no-op.
    fn settle(&self, request: RequestId) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Single-account form of [`commit`](AccountStore::commit).
    fn compare_and_update(
        &self,
        id: AccountId,
        expected_version: u64,
        balance: Amount,
        points: Points,
    ) -> impl Future<Output = Result<Account, StoreError>> + Send {
        async move {
            let writes = [AccountWrite {
                account: id,
                expected_version,
                balance,
                points,
            }];
            let mut updated = self.commit(&writes, JournalChange::None).await?;
            updated.pop().ok_or(StoreError::MissingFromCommit(id))
        }
    }
}

/// Fail if an account is written twice in one commit.
fn check_distinct(writes: &[AccountWrite]) -> Result<(), StoreError> {
    let mut ids: Vec<AccountId> = writes.iter().map(|w| w.account).collect();
    ids.sort_unstable();
    match ids.windows(2).find(|pair| pair[0] == pair[1]) {
        Some(pair) => Err(StoreError::DuplicateWrite(pair[0])),
        None => Ok(()),
    }
}

/// Records after applying `writes`, in the order of `writes`.
///
/// `current` looks up the record as it is now; every write must match its
/// version.
fn next_records(
    writes: &[AccountWrite],
    current: impl Fn(AccountId) -> Option<Account>,
) -> Result<Vec<Account>, StoreError> {
    writes
        .iter()
        .map(|write| {
            let mut account = current(write.account).ok_or(StoreError::NotFound(write.account))?;
            if account.version != write.expected_version {
                return Err(StoreError::VersionConflict {
                    account: write.account,
                    expected: write.expected_version,
                    actual: account.version,
                });
            }
            account.balance = write.balance;
            account.points = write.points;
            account.version += 1;
            Ok(account)
        })
        .collect()
}
