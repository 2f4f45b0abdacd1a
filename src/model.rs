//! Core domain types for the ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{Amount, Points};

/// Account identifier.
pub type AccountId = u64;

/// Transaction identifier, assigned by the transaction log in append order.
pub type TxId = u64;

/// Point exchange (catalog reward) identifier.
pub type ExchangeId = u32;

/// Caller-supplied identity of one logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        RequestId(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        RequestId(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An account record as stored by the account store.
///
/// `version` is bumped by the store on every successful write and is the
/// optimistic-concurrency token for `compare_and_update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub balance: Amount,
    pub points: Points,
    pub version: u64,
    pub active: bool,
}

impl Account {
    /// A freshly registered account with nothing on it.
    pub fn new(id: AccountId) -> Self {
        Self {
            id,
            balance: Amount::ZERO,
            points: Points::ZERO,
            version: 0,
            active: true,
        }
    }

    pub fn with_balance(mut self, balance: Amount) -> Self {
        self.balance = balance;
        self
    }

    pub fn with_points(mut self, points: Points) -> Self {
        self.points = points;
        self
    }
}

/// Kind of a committed monetary movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    DepositBank,
    DepositCard,
    Withdraw,
    Transfer,
    Redeem,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionKind::DepositBank => "deposit_bank",
            TransactionKind::DepositCard => "deposit_card",
            TransactionKind::Withdraw => "withdraw",
            TransactionKind::Transfer => "transfer",
            TransactionKind::Redeem => "redeem",
        };
        f.write_str(name)
    }
}

/// A transaction the engine wants appended. The log assigns the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransaction {
    pub request_id: RequestId,
    pub kind: TransactionKind,
    pub sender: AccountId,
    /// Transfer only.
    pub recipient: Option<AccountId>,
    /// DepositBank / Withdraw only.
    pub bank_ref: Option<String>,
    /// DepositCard only.
    pub card_ref: Option<String>,
    /// Redeem only.
    pub exchange: Option<ExchangeId>,
    /// Currency units, except for `Redeem` where it is points.
    pub amount: u64,
    pub timestamp: DateTime<Utc>,
}

impl NewTransaction {
    pub fn new(
        request_id: RequestId,
        kind: TransactionKind,
        sender: AccountId,
        amount: u64,
    ) -> Self {
        Self {
            request_id,
            kind,
            sender,
            recipient: None,
            bank_ref: None,
            card_ref: None,
            exchange: None,
            amount,
            timestamp: Utc::now(),
        }
    }
}

/// An immutable, committed transaction record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxId,
    #[serde(flatten)]
    pub body: NewTransaction,
}

impl Transaction {
    pub fn kind(&self) -> TransactionKind {
        self.body.kind
    }

    pub fn sender(&self) -> AccountId {
        self.body.sender
    }

    pub fn request_id(&self) -> RequestId {
        self.body.request_id
    }
}

/// A redeemable reward in the point catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointExchangeEntry {
    pub id: ExchangeId,
    pub reward_description: String,
    pub cost_in_points: Points,
}
