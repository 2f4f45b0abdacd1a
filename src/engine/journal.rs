//! Undoing committed operations whose log entry could not be written.
//!
//! The pending entries themselves live in the account store, committed in
//! the same step as the balances they describe.

use super::LedgerError;
use crate::model::{Account, RequestId};
use crate::store::BalanceEffect;
use crate::{Amount, Points};

impl BalanceEffect {
    /// Balance and points of `account` with this effect undone.
    pub(crate) fn revert(&self, account: &Account) -> Result<(Amount, Points), LedgerError> {
        let balance = account
            .balance
            .checked_sub(self.balance_credit)
            .ok_or(LedgerError::InsufficientBalance {
                account: account.id,
                available: account.balance,
                requested: self.balance_credit,
            })?
            .checked_add(self.balance_debit)
            .ok_or(LedgerError::Overflow(account.id))?;
        let points = account
            .points
            .checked_sub(self.points_credit)
            .ok_or(LedgerError::InsufficientPoints {
                account: account.id,
                available: account.points,
                required: self.points_credit,
            })?
            .checked_add(self.points_debit)
            .ok_or(LedgerError::Overflow(account.id))?;
        Ok((balance, points))
    }
}

/// Outcome of one [`LedgerEngine::reconcile`](super::LedgerEngine::reconcile) pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Log entry written (or found already written).
    pub completed: Vec<RequestId>,
    /// Request id taken by a different transaction; balances reverted instead.
    pub compensated: Vec<RequestId>,
    /// Still unresolved.
    pub pending: Vec<RequestId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AccountWrite;

    fn account(balance: u64, points: u64) -> Account {
        Account::new(1)
            .with_balance(Amount::new(balance))
            .with_points(Points::new(points))
    }

    fn effect(before: &Account, balance: u64, points: u64) -> BalanceEffect {
        let write = AccountWrite::from_read(before, Amount::new(balance), Points::new(points));
        BalanceEffect::between(before, &write)
    }

    #[test]
    fn revert_undoes_the_effect() {
        let effect = effect(&account(1000, 50), 400, 10);
        let (balance, points) = effect.revert(&account(400, 10)).unwrap();
        assert_eq!(balance, Amount::new(1000));
        assert_eq!(points, Points::new(50));
    }

    #[test]
    fn revert_refuses_to_go_negative() {
        let effect = effect(&account(0, 0), 500, 20);
        // The credited funds were spent in the meantime
        assert!(matches!(
            effect.revert(&account(100, 20)),
            Err(LedgerError::InsufficientBalance { .. })
        ));
    }

    #[test]
    fn revert_refuses_spent_points() {
        let effect = effect(&account(0, 0), 0, 20);
        assert!(matches!(
            effect.revert(&account(0, 5)),
            Err(LedgerError::InsufficientPoints { .. })
        ));
    }
}
