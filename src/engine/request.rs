use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use super::LedgerError;
use crate::model::{Account, AccountId, ExchangeId, RequestId, Transaction, TransactionKind};
use crate::{Amount, Points};

/// Identity and deadline of one caller request.
///
/// Resubmitting with the same `request_id` is how a caller retries safely:
/// the engine applies a request id at most once.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub deadline: Instant,
}

impl RequestContext {
    /// Fresh request id, due `timeout` from now.
    pub fn new(timeout: Duration) -> Self {
        Self {
            request_id: RequestId::new(),
            deadline: Instant::now() + timeout,
        }
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub(crate) fn check_deadline(&self) -> Result<(), LedgerError> {
        if Instant::now() >= self.deadline {
            return Err(LedgerError::Timeout(self.request_id));
        }
        Ok(())
    }

    /// Await `fut`, or fail with `Timeout` once the deadline passes.
    pub(crate) async fn run<T>(&self, fut: impl Future<Output = T>) -> Result<T, LedgerError> {
        tokio::time::timeout_at(self.deadline, fut)
            .await
            .map_err(|_| LedgerError::Timeout(self.request_id))
    }
}

/// A monetary operation the engine can apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Credit funds arriving from a bank account.
    DepositBank {
        account: AccountId,
        amount: Amount,
        bank_ref: Option<String>,
    },
    /// Credit funds arriving from a card.
    DepositCard {
        account: AccountId,
        amount: Amount,
        card_ref: Option<String>,
    },
    /// Debit funds leaving to a bank account.
    Withdraw {
        account: AccountId,
        amount: Amount,
        bank_ref: Option<String>,
    },
    /// Move funds between two accounts.
    Transfer {
        sender: AccountId,
        recipient: AccountId,
        amount: Amount,
    },
    /// Spend points on a catalog reward.
    Redeem {
        account: AccountId,
        exchange: ExchangeId,
        claimed_cost: Points,
    },
}

impl Operation {
    pub fn kind(&self) -> TransactionKind {
        match self {
            Operation::DepositBank { .. } => TransactionKind::DepositBank,
            Operation::DepositCard { .. } => TransactionKind::DepositCard,
            Operation::Withdraw { .. } => TransactionKind::Withdraw,
            Operation::Transfer { .. } => TransactionKind::Transfer,
            Operation::Redeem { .. } => TransactionKind::Redeem,
        }
    }

    /// The account that initiates the operation.
    pub fn account(&self) -> AccountId {
        match self {
            Operation::DepositBank { account, .. }
            | Operation::DepositCard { account, .. }
            | Operation::Withdraw { account, .. }
            | Operation::Redeem { account, .. } => *account,
            Operation::Transfer { sender, .. } => *sender,
        }
    }

    /// Currency amount, or points for a redemption.
    pub fn quantity(&self) -> u64 {
        match self {
            Operation::DepositBank { amount, .. }
            | Operation::DepositCard { amount, .. }
            | Operation::Withdraw { amount, .. }
            | Operation::Transfer { amount, .. } => amount.value(),
            Operation::Redeem { claimed_cost, .. } => claimed_cost.value(),
        }
    }

    /// Checks that need no ledger state.
    pub(crate) fn validate(&self) -> Result<(), LedgerError> {
        if self.quantity() == 0 {
            return Err(LedgerError::InvalidAmount);
        }
        match self {
            Operation::Transfer {
                sender, recipient, ..
            } if sender == recipient => Err(LedgerError::SelfTransfer(*sender)),
            _ => Ok(()),
        }
    }
}

/// Input accepted by [`LedgerEngine::run`](super::LedgerEngine::run).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Open(AccountId),
    Deactivate(AccountId),
    Execute(Operation),
}

/// Result of a completed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub transaction: Transaction,
    /// Initiating account after the operation.
    pub account: Account,
    /// Recipient after a transfer.
    pub counterparty: Option<Account>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_amount_is_invalid() {
        let op = Operation::Withdraw {
            account: 1,
            amount: Amount::ZERO,
            bank_ref: None,
        };
        assert!(matches!(op.validate(), Err(LedgerError::InvalidAmount)));
    }

    #[test]
    fn zero_claimed_cost_is_invalid() {
        let op = Operation::Redeem {
            account: 1,
            exchange: 1,
            claimed_cost: Points::ZERO,
        };
        assert!(matches!(op.validate(), Err(LedgerError::InvalidAmount)));
    }

    #[test]
    fn self_transfer_is_invalid() {
        let op = Operation::Transfer {
            sender: 4,
            recipient: 4,
            amount: Amount::new(10),
        };
        assert!(matches!(op.validate(), Err(LedgerError::SelfTransfer(4))));
    }

    #[test]
    fn kind_and_account() {
        let op = Operation::Transfer {
            sender: 1,
            recipient: 2,
            amount: Amount::new(10),
        };
        assert_eq!(op.kind(), TransactionKind::Transfer);
        assert_eq!(op.account(), 1);
        assert!(op.validate().is_ok());
    }

    #[tokio::test]
    async fn expired_context_times_out() {
        let ctx = RequestContext::new(Duration::ZERO);
        assert!(matches!(ctx.check_deadline(), Err(LedgerError::Timeout(_))));
        assert!(ctx.remaining().is_zero());
    }
}
