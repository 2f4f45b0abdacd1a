//! Transactions whose balance effects committed but which are not yet in the
//! transaction log.
//!
//! The store keeps these alongside the accounts and changes them in the same
//! atomic step as the account writes, so a durable store never holds a
//! committed balance that nothing points back to.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::AccountWrite;
use crate::model::{Account, AccountId, NewTransaction, RequestId};
use crate::{Amount, Points};

/// What one committed operation did to one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceEffect {
    pub account: AccountId,
    pub balance_credit: Amount,
    pub balance_debit: Amount,
    pub points_credit: Points,
    pub points_debit: Points,
}

impl BalanceEffect {
    /// Effect of applying `write` to the `before` record.
    pub fn between(before: &Account, write: &AccountWrite) -> Self {
        Self {
            account: before.id,
            balance_credit: write.balance.checked_sub(before.balance).unwrap_or_default(),
            balance_debit: before.balance.checked_sub(write.balance).unwrap_or_default(),
            points_credit: write.points.checked_sub(before.points).unwrap_or_default(),
            points_debit: before.points.checked_sub(write.points).unwrap_or_default(),
        }
    }
}

/// A committed operation waiting for its transaction to be logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingEntry {
    pub transaction: NewTransaction,
    pub effects: Vec<BalanceEffect>,
}

impl PendingEntry {
    pub fn request_id(&self) -> RequestId {
        self.transaction.request_id
    }
}

/// Journal update committed together with a set of account writes.
#[derive(Debug, Clone, Copy, Default)]
pub enum JournalChange<'a> {
    #[default]
    None,
    /// The writes belong to this not-yet-logged transaction.
    Record(&'a PendingEntry),
    /// The transaction is resolved; drop its entry.
    Settle(RequestId),
}

#[derive(Debug, Default)]
pub(crate) struct PendingSet {
    entries: HashMap<RequestId, PendingEntry>,
}

impl PendingSet {
    pub(crate) fn apply(&mut self, change: JournalChange<'_>) {
        match change {
            JournalChange::None => {}
            JournalChange::Record(entry) => {
                self.entries.insert(entry.request_id(), entry.clone());
            }
            JournalChange::Settle(request) => {
                self.entries.remove(&request);
            }
        }
    }

    pub(crate) fn contains(&self, request: RequestId) -> bool {
        self.entries.contains_key(&request)
    }

    /// Oldest first.
    pub(crate) fn entries(&self) -> Vec<PendingEntry> {
        let mut entries: Vec<_> = self.entries.values().cloned().collect();
        entries.sort_by_key(|e| e.transaction.timestamp);
        entries
    }
}
