//! Error types for ledger operations.

use thiserror::Error;

use crate::log::LogError;
use crate::model::{AccountId, ExchangeId, RequestId};
use crate::store::StoreError;
use crate::{Amount, Points};

/// Broad class of a [`LedgerError`], which tells the caller what to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request. Never retried.
    Validation,
    /// Request is well formed but the ledger state refuses it.
    BusinessRule,
    /// Too many concurrent writers; safe to retry from scratch.
    Contention,
    /// Deadline passed before anything committed; safe to retry.
    Timeout,
    /// Balances committed but the log entry is not confirmed.
    /// Must not be retried as a new request.
    Durability,
    /// Storage failed before anything committed.
    Storage,
}

/// Error returned by every [`LedgerEngine`](super::LedgerEngine) operation.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("amount must be greater than zero")]
    InvalidAmount,

    #[error("account {0} not found")]
    AccountNotFound(AccountId),

    #[error("account {0} already exists")]
    AccountExists(AccountId),

    #[error("account {0} is inactive")]
    AccountInactive(AccountId),

    #[error("account {0} cannot transfer to itself")]
    SelfTransfer(AccountId),

    #[error("reward {0} is not in the catalog")]
    UnknownReward(ExchangeId),

    #[error("operation would overflow account {0}")]
    Overflow(AccountId),

    #[error("request {0} was already submitted")]
    DuplicateRequest(RequestId),

    #[error("insufficient balance on account {account}: available {available}, requested {requested}")]
    InsufficientBalance {
        account: AccountId,
        available: Amount,
        requested: Amount,
    },

    #[error("insufficient points on account {account}: available {available}, required {required}")]
    InsufficientPoints {
        account: AccountId,
        available: Points,
        required: Points,
    },

    #[error("reward {exchange} costs {actual} points, request claimed {claimed}")]
    CatalogMismatch {
        exchange: ExchangeId,
        claimed: Points,
        actual: Points,
    },

    #[error("gave up after {attempts} attempts on concurrently modified accounts")]
    Contention { attempts: u32 },

    #[error("request {0} timed out before committing")]
    Timeout(RequestId),

    #[error("request {0} committed; its log entry is still being written")]
    CommitPending(RequestId),

    #[error("request {request} committed but could not be logged: {source}")]
    ReconciliationRequired {
        request: RequestId,
        #[source]
        source: LogError,
    },

    #[error("account store failed: {0}")]
    Store(StoreError),

    #[error("transaction log failed: {0}")]
    Log(#[from] LogError),
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => LedgerError::AccountNotFound(id),
            StoreError::AlreadyExists(id) => LedgerError::AccountExists(id),
            other => LedgerError::Store(other),
        }
    }
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidAmount
            | LedgerError::AccountNotFound(_)
            | LedgerError::AccountExists(_)
            | LedgerError::AccountInactive(_)
            | LedgerError::SelfTransfer(_)
            | LedgerError::UnknownReward(_)
            | LedgerError::Overflow(_)
            | LedgerError::DuplicateRequest(_) => ErrorKind::Validation,

            LedgerError::InsufficientBalance { .. }
            | LedgerError::InsufficientPoints { .. }
            | LedgerError::CatalogMismatch { .. } => ErrorKind::BusinessRule,

            LedgerError::Contention { .. } => ErrorKind::Contention,
            LedgerError::Timeout(_) => ErrorKind::Timeout,

            LedgerError::CommitPending(_) | LedgerError::ReconciliationRequired { .. } => {
                ErrorKind::Durability
            }

            LedgerError::Store(_) | LedgerError::Log(_) => ErrorKind::Storage,
        }
    }

    /// Whether the caller may resubmit the whole operation as a fresh request.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Contention | ErrorKind::Timeout)
    }
}
