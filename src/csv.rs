use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::engine::{Command, Operation};
use crate::model::{Account, AccountId, ExchangeId};
use crate::{Amount, Points};

/// Errors that can occur when parsing csv rows
#[derive(Debug, Error)]
pub enum CsvError {
    #[error("failed to open csv file: {0}")]
    Open(csv::Error),

    #[error("line {line}: failed to parse row: {source}")]
    Parse { line: usize, source: csv::Error },

    #[error("line {line}: unrecognized transaction type '{tx_type}'")]
    UnrecognizedType { line: usize, tx_type: String },

    #[error("line {line}: {tx_type} missing {field}")]
    MissingField {
        line: usize,
        tx_type: String,
        field: &'static str,
    },
}

#[derive(Debug, Deserialize)]
struct InputRow {
    r#type: String,
    account: AccountId,
    counterparty: Option<AccountId>,
    amount: Option<u64>,
    reference: Option<String>,
    reward: Option<ExchangeId>,
}

#[derive(Debug, Serialize)]
struct OutputRow {
    account: AccountId,
    balance: u64,
    points: u64,
    active: bool,
}

impl InputRow {
    fn require<T>(&self, line: usize, field: &'static str, value: Option<T>) -> Result<T, CsvError> {
        value.ok_or_else(|| CsvError::MissingField {
            line,
            tx_type: self.r#type.clone(),
            field,
        })
    }

    fn into_command(self, line: usize) -> Result<Command, CsvError> {
        let command = match self.r#type.as_str() {
            "open" => Command::Open(self.account),
            "deactivate" => Command::Deactivate(self.account),
            "deposit_bank" => Command::Execute(Operation::DepositBank {
                account: self.account,
                amount: Amount::new(self.require(line, "amount", self.amount)?),
                bank_ref: self.reference,
            }),
            "deposit_card" => Command::Execute(Operation::DepositCard {
                account: self.account,
                amount: Amount::new(self.require(line, "amount", self.amount)?),
                card_ref: self.reference,
            }),
            "withdraw" => Command::Execute(Operation::Withdraw {
                account: self.account,
                amount: Amount::new(self.require(line, "amount", self.amount)?),
                bank_ref: self.reference,
            }),
            "transfer" => Command::Execute(Operation::Transfer {
                sender: self.account,
                recipient: self.require(line, "counterparty", self.counterparty)?,
                amount: Amount::new(self.require(line, "amount", self.amount)?),
            }),
            "redeem" => Command::Execute(Operation::Redeem {
                account: self.account,
                exchange: self.require(line, "reward", self.reward)?,
                claimed_cost: Points::new(self.require(line, "amount", self.amount)?),
            }),
            other => {
                return Err(CsvError::UnrecognizedType {
                    line,
                    tx_type: other.to_string(),
                });
            }
        };
        Ok(command)
    }
}

/// Read ledger commands from a csv file
///
/// Columns: `type,account,counterparty,amount,reference,reward`.
///
/// The returned iterator owns the open file, so it can be moved to another task.
pub fn read_commands(
    path: &Path,
) -> Result<impl Iterator<Item = Result<Command, CsvError>> + use<>, CsvError> {
    let reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(CsvError::Open)?;

    Ok(reader
        .into_deserialize::<InputRow>()
        .enumerate()
        .map(|(idx, result)| {
            let line = idx + 2; // 1-indexed, skip header
            let row = result.map_err(|source| CsvError::Parse { line, source })?;
            row.into_command(line)
        }))
}

/// Write account snapshots in csv format
pub fn write_accounts<'a>(
    accounts: impl IntoIterator<Item = &'a Account>,
    writer: impl io::Write,
) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_writer(writer);

    for account in accounts {
        writer.serialize(OutputRow {
            account: account.id,
            balance: account.balance.value(),
            points: account.points.value(),
            active: account.active,
        })?;
    }

    writer.flush()?;
    Ok(())
}
