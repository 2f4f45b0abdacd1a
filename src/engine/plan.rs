//! New account state for each operation, computed from freshly read records.
//!
//! Plans are pure. The engine re-runs them on every retry, so a plan always
//! sees the latest committed state and its checks hold at commit time.

use super::LedgerError;
use crate::model::Account;
use crate::store::AccountWrite;
use crate::{Amount, Points};

fn ensure_active(account: &Account) -> Result<(), LedgerError> {
    if !account.active {
        return Err(LedgerError::AccountInactive(account.id));
    }
    Ok(())
}

fn add_points(account: &Account, points: Points, bonus: Points) -> Result<Points, LedgerError> {
    points
        .checked_add(bonus)
        .ok_or(LedgerError::Overflow(account.id))
}

/// Deposit: `balance += amount`, `points += bonus`.
pub(crate) fn credit(
    amount: Amount,
    bonus: Points,
) -> impl Fn(&[Account]) -> Result<Vec<AccountWrite>, LedgerError> {
    move |accounts| {
        let account = &accounts[0];
        ensure_active(account)?;
        let balance = account
            .balance
            .checked_add(amount)
            .ok_or(LedgerError::Overflow(account.id))?;
        let points = add_points(account, account.points, bonus)?;
        Ok(vec![AccountWrite::from_read(account, balance, points)])
    }
}

/// Withdrawal: `balance -= amount`, refused if it would go negative.
pub(crate) fn debit(
    amount: Amount,
    bonus: Points,
) -> impl Fn(&[Account]) -> Result<Vec<AccountWrite>, LedgerError> {
    move |accounts| {
        let account = &accounts[0];
        ensure_active(account)?;
        let balance =
            account
                .balance
                .checked_sub(amount)
                .ok_or(LedgerError::InsufficientBalance {
                    account: account.id,
                    available: account.balance,
                    requested: amount,
                })?;
        let points = add_points(account, account.points, bonus)?;
        Ok(vec![AccountWrite::from_read(account, balance, points)])
    }
}

/// Transfer from `accounts[0]` to `accounts[1]`. The sum of both balances is
/// unchanged; only the sender earns the bonus.
pub(crate) fn transfer(
    amount: Amount,
    bonus: Points,
) -> impl Fn(&[Account]) -> Result<Vec<AccountWrite>, LedgerError> {
    move |accounts| {
        let (sender, recipient) = (&accounts[0], &accounts[1]);
        ensure_active(sender)?;
        ensure_active(recipient)?;

        let sender_balance =
            sender
                .balance
                .checked_sub(amount)
                .ok_or(LedgerError::InsufficientBalance {
                    account: sender.id,
                    available: sender.balance,
                    requested: amount,
                })?;
        let recipient_balance = recipient
            .balance
            .checked_add(amount)
            .ok_or(LedgerError::Overflow(recipient.id))?;
        let sender_points = add_points(sender, sender.points, bonus)?;

        Ok(vec![
            AccountWrite::from_read(sender, sender_balance, sender_points),
            AccountWrite::from_read(recipient, recipient_balance, recipient.points),
        ])
    }
}

/// Redemption: `points -= cost`, refused if it would go negative.
pub(crate) fn spend_points(
    cost: Points,
    bonus: Points,
) -> impl Fn(&[Account]) -> Result<Vec<AccountWrite>, LedgerError> {
    move |accounts| {
        let account = &accounts[0];
        ensure_active(account)?;
        let remaining = account
            .points
            .checked_sub(cost)
            .ok_or(LedgerError::InsufficientPoints {
                account: account.id,
                available: account.points,
                required: cost,
            })?;
        let points = add_points(account, remaining, bonus)?;
        Ok(vec![AccountWrite::from_read(account, account.balance, points)])
    }
}
