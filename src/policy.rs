//! Reward points granted per operation.

use serde::{Deserialize, Serialize};

use crate::Points;
use crate::model::TransactionKind;

/// Points credited to the sending account for each kind of operation.
///
/// Every kind has its own hook so deposits by bank and by card can be tuned
/// independently even when they currently pay the same.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardPolicy {
    pub deposit_bank_bonus: Points,
    pub deposit_card_bonus: Points,
    pub withdraw_bonus: Points,
    pub transfer_bonus: Points,
    pub redeem_bonus: Points,
}

impl Default for RewardPolicy {
    fn default() -> Self {
        Self {
            deposit_bank_bonus: Points::new(20),
            deposit_card_bonus: Points::new(20),
            withdraw_bonus: Points::ZERO,
            transfer_bonus: Points::new(20),
            redeem_bonus: Points::ZERO,
        }
    }
}

impl RewardPolicy {
    /// A policy that never grants points.
    pub fn none() -> Self {
        Self {
            deposit_bank_bonus: Points::ZERO,
            deposit_card_bonus: Points::ZERO,
            withdraw_bonus: Points::ZERO,
            transfer_bonus: Points::ZERO,
            redeem_bonus: Points::ZERO,
        }
    }

    pub fn deposit_bank_bonus(&self) -> Points {
        self.deposit_bank_bonus
    }

    pub fn deposit_card_bonus(&self) -> Points {
        self.deposit_card_bonus
    }

    pub fn transfer_bonus(&self) -> Points {
        self.transfer_bonus
    }

    pub fn bonus_for(&self, kind: TransactionKind) -> Points {
        match kind {
            TransactionKind::DepositBank => self.deposit_bank_bonus,
            TransactionKind::DepositCard => self.deposit_card_bonus,
            TransactionKind::Withdraw => self.withdraw_bonus,
            TransactionKind::Transfer => self.transfer_bonus,
            TransactionKind::Redeem => self.redeem_bonus,
        }
    }
}
