//! Ledger engine.
//!
//! The engine applies deposits, withdrawals, transfers and point redemptions
//! against an [`AccountStore`] and records every committed one in a
//! [`TransactionLog`]. All operations follow the same steps:
//!
//! 1. validate the request and claim its request id
//! 2. read the account(s) with their version tokens
//! 3. compute the new state (see [`plan`])
//! 4. compare-and-update, re-reading and retrying on version conflicts
//! 5. append the transaction
//!
//! Anything failing before step 4 commits leaves no trace. Once step 4 has
//! committed, the append is carried to completion on a background task even
//! if the caller's deadline passes. The commit in step 4 also records the
//! transaction in the store's reconciliation journal, and the entry is
//! settled once the append lands, so an operation whose append keeps failing
//! (or whose process dies) is picked up by [`LedgerEngine::reconcile`].

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use crate::catalog::PointCatalog;
use crate::config::{LedgerConfig, RetryConfig};
use crate::log::{LogError, TransactionLog};
use crate::model::{
    Account, AccountId, ExchangeId, NewTransaction, RequestId, Transaction, TransactionKind,
    TxId,
};
use crate::policy::RewardPolicy;
use crate::store::{AccountStore, AccountWrite, JournalChange, StoreError};
use crate::{Amount, Points};

mod error;
pub use error::{ErrorKind, LedgerError};

mod journal;
pub use crate::store::{BalanceEffect, PendingEntry};
pub use journal::ReconcileReport;

mod plan;

mod request;
pub use request::{Command, Operation, Receipt, RequestContext};

/// Counts from [`LedgerEngine::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub applied: usize,
    pub rejected: usize,
}

/// The ledger engine.
///
/// Holds no account state of its own; it is cheap to clone and safe to call
/// from any number of tasks at once.
pub struct LedgerEngine<S, L> {
    store: Arc<S>,
    log: Arc<L>,
    catalog: Arc<dyn PointCatalog>,
    policy: Arc<RewardPolicy>,
    retry: RetryConfig,
    log_append_attempts: u32,
    default_timeout: Duration,
    /// Request ids currently being executed
    in_flight: Arc<Mutex<HashSet<RequestId>>>,
    /// Serializes reconciliation passes
    reconciling: Arc<tokio::sync::Mutex<()>>,
}

impl<S, L> Clone for LedgerEngine<S, L> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            log: Arc::clone(&self.log),
            catalog: Arc::clone(&self.catalog),
            policy: Arc::clone(&self.policy),
            retry: self.retry.clone(),
            log_append_attempts: self.log_append_attempts,
            default_timeout: self.default_timeout,
            in_flight: Arc::clone(&self.in_flight),
            reconciling: Arc::clone(&self.reconciling),
        }
    }
}

/// Journal change committed by [`LedgerEngine::mutate`].
#[derive(Debug, Clone, Copy)]
enum Journaling<'a> {
    /// The writes belong to this transaction, which is not logged yet
    Record(&'a NewTransaction),
    /// The writes resolve this journaled request
    Settle(RequestId),
}

/// Removes a request id from the in-flight set when dropped.
struct RequestClaim {
    in_flight: Arc<Mutex<HashSet<RequestId>>>,
    request: RequestId,
}

impl Drop for RequestClaim {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.request);
    }
}

/// Public API
impl<S: AccountStore, L: TransactionLog> LedgerEngine<S, L> {
    pub fn new(
        store: Arc<S>,
        log: Arc<L>,
        catalog: Arc<dyn PointCatalog>,
        config: &LedgerConfig,
    ) -> Self {
        Self {
            store,
            log,
            catalog,
            policy: Arc::new(config.rewards.clone()),
            retry: config.retry.clone(),
            log_append_attempts: config.log_append_attempts.max(1),
            default_timeout: config.operation_timeout(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            reconciling: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// A request context with a fresh id and the configured timeout.
    pub fn context(&self) -> RequestContext {
        RequestContext::new(self.default_timeout)
    }

    pub fn policy(&self) -> &RewardPolicy {
        &self.policy
    }

    /// Register a new, empty account.
    pub async fn open_account(&self, id: AccountId) -> Result<Account, LedgerError> {
        let result = self.store.create(Account::new(id)).await;
        match &result {
            Ok(_) => info!(account = id, "account opened"),
            Err(e) => info!(account = id, reason = %e, "account open skipped"),
        }
        Ok(result?)
    }

    /// Soft-delete an account. Its record and history are kept.
    pub async fn deactivate_account(&self, id: AccountId) -> Result<Account, LedgerError> {
        let result = self.store.deactivate(id).await;
        match &result {
            Ok(_) => info!(account = id, "account deactivated"),
            Err(e) => info!(account = id, reason = %e, "account deactivation skipped"),
        }
        Ok(result?)
    }

    pub async fn account(&self, id: AccountId) -> Result<Account, LedgerError> {
        Ok(self.store.get(id).await?)
    }

    /// Transactions sent by `id`, newest first.
    pub async fn history(&self, id: AccountId) -> Result<Vec<Transaction>, LedgerError> {
        Ok(self.log.list_by_sender(id).await?)
    }

    pub async fn transaction(&self, id: TxId) -> Result<Transaction, LedgerError> {
        Ok(self.log.get_by_id(id).await?)
    }

    pub async fn deposit_bank(
        &self,
        ctx: &RequestContext,
        account: AccountId,
        amount: Amount,
        bank_ref: Option<String>,
    ) -> Result<Receipt, LedgerError> {
        let op = Operation::DepositBank {
            account,
            amount,
            bank_ref,
        };
        self.execute(ctx, op).await
    }

    pub async fn deposit_card(
        &self,
        ctx: &RequestContext,
        account: AccountId,
        amount: Amount,
        card_ref: Option<String>,
    ) -> Result<Receipt, LedgerError> {
        let op = Operation::DepositCard {
            account,
            amount,
            card_ref,
        };
        self.execute(ctx, op).await
    }

    pub async fn withdraw(
        &self,
        ctx: &RequestContext,
        account: AccountId,
        amount: Amount,
    ) -> Result<Receipt, LedgerError> {
        let op = Operation::Withdraw {
            account,
            amount,
            bank_ref: None,
        };
        self.execute(ctx, op).await
    }

    pub async fn transfer(
        &self,
        ctx: &RequestContext,
        sender: AccountId,
        recipient: AccountId,
        amount: Amount,
    ) -> Result<Receipt, LedgerError> {
        let op = Operation::Transfer {
            sender,
            recipient,
            amount,
        };
        self.execute(ctx, op).await
    }

    pub async fn redeem(
        &self,
        ctx: &RequestContext,
        account: AccountId,
        exchange: ExchangeId,
        claimed_cost: Points,
    ) -> Result<Receipt, LedgerError> {
        let op = Operation::Redeem {
            account,
            exchange,
            claimed_cost,
        };
        self.execute(ctx, op).await
    }

    /// Apply a single operation.
    pub async fn execute(
        &self,
        ctx: &RequestContext,
        op: Operation,
    ) -> Result<Receipt, LedgerError> {
        let result = self.execute_claimed(ctx, &op).await;
        Self::log_result(ctx, &op, &result);
        result
    }

    /// Apply one command from a batch.
    pub async fn apply(&self, command: Command) -> Result<(), LedgerError> {
        match command {
            Command::Open(id) => self.open_account(id).await.map(drop),
            Command::Deactivate(id) => self.deactivate_account(id).await.map(drop),
            Command::Execute(op) => self.execute(&self.context(), op).await.map(drop),
        }
    }

    /// Run the engine over a stream of commands, in order.
    pub async fn run(&self, mut stream: impl Stream<Item = Command> + Unpin) -> RunStats {
        let mut stats = RunStats::default();
        while let Some(command) = stream.next().await {
            // failures are already logged and must not stop the run
            match self.apply(command).await {
                Ok(()) => stats.applied += 1,
                Err(_) => stats.rejected += 1,
            }
        }
        stats
    }

    /// Operations that committed but are not yet in the log, oldest first.
    pub async fn pending_reconciliation(&self) -> Result<Vec<PendingEntry>, LedgerError> {
        Ok(self.store.pending().await?)
    }

    /// Try to resolve every journaled operation.
    ///
    /// The log append is retried; if the request id turns out to be logged
    /// for a different transaction, the balance effects are reverted instead.
    pub async fn reconcile(&self) -> Result<ReconcileReport, LedgerError> {
        let _pass = self.reconciling.lock().await;
        let mut report = ReconcileReport::default();

        for entry in self.store.pending().await? {
            let request = entry.request_id();
            let outcome = match self.log.append(entry.transaction.clone()).await {
                Ok(tx) => Ok(Some(tx)),
                Err(LogError::Duplicate { existing, .. }) => {
                    self.resolve_duplicate(existing, &entry.transaction).await
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(Some(tx)) => match self.store.settle(request).await {
                    Ok(()) => {
                        info!(request = %request, tx = tx.id, "reconciled: transaction logged");
                        report.completed.push(request);
                    }
                    Err(e) => {
                        warn!(request = %request, reason = %e, "logged but journal entry not settled");
                        report.pending.push(request);
                    }
                },
                Ok(None) => match self.compensate(&entry).await {
                    Ok(()) => {
                        warn!(request = %request, "reconciled: balance effects reverted");
                        report.compensated.push(request);
                    }
                    Err(e) => {
                        error!(request = %request, reason = %e, "failed to revert balance effects");
                        report.pending.push(request);
                    }
                },
                Err(e) => {
                    warn!(request = %request, reason = %e, "reconciliation append failed");
                    report.pending.push(request);
                }
            }
        }

        Ok(report)
    }
}

/// Private API
impl<S: AccountStore, L: TransactionLog> LedgerEngine<S, L> {
    /// Small helper to log `execute` results
    fn log_result(ctx: &RequestContext, op: &Operation, result: &Result<Receipt, LedgerError>) {
        let kind = op.kind();
        match result {
            Ok(receipt) => {
                info!(
                    request = %ctx.request_id,
                    account = op.account(),
                    tx = receipt.transaction.id,
                    amount = op.quantity(),
                    balance = %receipt.account.balance,
                    points = %receipt.account.points,
                    "{kind} applied"
                );
            }
            Err(e) => {
                info!(
                    request = %ctx.request_id,
                    account = op.account(),
                    amount = op.quantity(),
                    reason = %e,
                    "{kind} skipped"
                );
            }
        }
    }

    fn claim(&self, request: RequestId) -> Result<RequestClaim, LedgerError> {
        if !self.in_flight.lock().insert(request) {
            return Err(LedgerError::DuplicateRequest(request));
        }
        Ok(RequestClaim {
            in_flight: Arc::clone(&self.in_flight),
            request,
        })
    }

    async fn execute_claimed(
        &self,
        ctx: &RequestContext,
        op: &Operation,
    ) -> Result<Receipt, LedgerError> {
        op.validate()?;
        let _claim = self.claim(ctx.request_id)?;

        if ctx.run(self.store.is_pending(ctx.request_id)).await??
            || ctx
                .run(self.log.get_by_request(ctx.request_id))
                .await??
                .is_some()
        {
            return Err(LedgerError::DuplicateRequest(ctx.request_id));
        }

        let (body, mut accounts) = match op {
            Operation::DepositBank {
                account,
                amount,
                bank_ref,
            } => {
                let mut body = self.transaction_body(ctx, op, amount.value());
                body.bank_ref = bank_ref.clone();
                let bonus = self.policy.deposit_bank_bonus();
                let accounts = self
                    .mutate(
                        ctx,
                        &[*account],
                        plan::credit(*amount, bonus),
                        Journaling::Record(&body),
                    )
                    .await?;
                (body, accounts)
            }
            Operation::DepositCard {
                account,
                amount,
                card_ref,
            } => {
                let mut body = self.transaction_body(ctx, op, amount.value());
                body.card_ref = card_ref.clone();
                let bonus = self.policy.deposit_card_bonus();
                let accounts = self
                    .mutate(
                        ctx,
                        &[*account],
                        plan::credit(*amount, bonus),
                        Journaling::Record(&body),
                    )
                    .await?;
                (body, accounts)
            }
            Operation::Withdraw {
                account,
                amount,
                bank_ref,
            } => {
                let mut body = self.transaction_body(ctx, op, amount.value());
                body.bank_ref = bank_ref.clone();
                let bonus = self.policy.bonus_for(TransactionKind::Withdraw);
                let accounts = self
                    .mutate(
                        ctx,
                        &[*account],
                        plan::debit(*amount, bonus),
                        Journaling::Record(&body),
                    )
                    .await?;
                (body, accounts)
            }
            Operation::Transfer {
                sender,
                recipient,
                amount,
            } => {
                let mut body = self.transaction_body(ctx, op, amount.value());
                body.recipient = Some(*recipient);
                let bonus = self.policy.transfer_bonus();
                let accounts = self
                    .mutate(
                        ctx,
                        &[*sender, *recipient],
                        plan::transfer(*amount, bonus),
                        Journaling::Record(&body),
                    )
                    .await?;
                (body, accounts)
            }
            Operation::Redeem {
                account,
                exchange,
                claimed_cost,
            } => {
                let entry = self
                    .catalog
                    .get(*exchange)
                    .ok_or(LedgerError::UnknownReward(*exchange))?;
                if *claimed_cost != entry.cost_in_points {
                    return Err(LedgerError::CatalogMismatch {
                        exchange: *exchange,
                        claimed: *claimed_cost,
                        actual: entry.cost_in_points,
                    });
                }
                let mut body = self.transaction_body(ctx, op, entry.cost_in_points.value());
                body.exchange = Some(*exchange);
                let bonus = self.policy.bonus_for(TransactionKind::Redeem);
                let accounts = self
                    .mutate(
                        ctx,
                        &[*account],
                        plan::spend_points(entry.cost_in_points, bonus),
                        Journaling::Record(&body),
                    )
                    .await?;
                (body, accounts)
            }
        };

        let transaction = self.record(ctx, body).await?;

        let counterparty = if accounts.len() > 1 {
            accounts.pop()
        } else {
            None
        };
        let account = accounts
            .pop()
            .ok_or(LedgerError::AccountNotFound(op.account()))?;

        Ok(Receipt {
            transaction,
            account,
            counterparty,
        })
    }

    fn transaction_body(&self, ctx: &RequestContext, op: &Operation, amount: u64) -> NewTransaction {
        NewTransaction::new(ctx.request_id, op.kind(), op.account(), amount)
    }

    /// Read `ids`, apply `plan`, and commit together with `journaling`,
    /// retrying on version conflicts.
    ///
    /// Returns the committed records in the order of `ids`.
    async fn mutate<F>(
        &self,
        ctx: &RequestContext,
        ids: &[AccountId],
        plan: F,
        journaling: Journaling<'_>,
    ) -> Result<Vec<Account>, LedgerError>
    where
        F: Fn(&[Account]) -> Result<Vec<AccountWrite>, LedgerError>,
    {
        let max_attempts = self.retry.max_attempts.max(1);

        // Accounts are read and written in ascending id order
        let mut lock_order = ids.to_vec();
        lock_order.sort_unstable();

        for attempt in 1..=max_attempts {
            ctx.check_deadline()?;

            let mut reads = Vec::with_capacity(lock_order.len());
            for &id in &lock_order {
                reads.push(ctx.run(self.store.get(id)).await??);
            }
            let accounts: Vec<Account> = ids
                .iter()
                .filter_map(|id| reads.iter().find(|a| a.id == *id).cloned())
                .collect();

            let mut writes = plan(&accounts)?;
            writes.sort_by_key(|w| w.account);

            let entry;
            let journal = match journaling {
                Journaling::Record(body) => {
                    entry = PendingEntry {
                        transaction: body.clone(),
                        effects: Self::effects(&reads, &writes)?,
                    };
                    JournalChange::Record(&entry)
                }
                Journaling::Settle(request) => JournalChange::Settle(request),
            };

            ctx.check_deadline()?;
            match self.store.commit(&writes, journal).await {
                Ok(updated) => {
                    return ids
                        .iter()
                        .map(|&id| {
                            updated
                                .iter()
                                .find(|a| a.id == id)
                                .cloned()
                                .ok_or(LedgerError::Store(StoreError::MissingFromCommit(id)))
                        })
                        .collect();
                }
                Err(StoreError::VersionConflict {
                    account,
                    expected,
                    actual,
                }) => {
                    debug!(
                        request = %ctx.request_id,
                        account,
                        expected,
                        actual,
                        attempt,
                        "version conflict, retrying"
                    );
                    if attempt < max_attempts {
                        let delay = self.retry.backoff(attempt).min(ctx.remaining());
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(LedgerError::Contention {
            attempts: max_attempts,
        })
    }

    /// What `writes` do to the records in `reads`.
    fn effects(reads: &[Account], writes: &[AccountWrite]) -> Result<Vec<BalanceEffect>, LedgerError> {
        writes
            .iter()
            .map(|write| {
                let before = reads
                    .iter()
                    .find(|a| a.id == write.account)
                    .ok_or(LedgerError::AccountNotFound(write.account))?;
                Ok(BalanceEffect::between(before, write))
            })
            .collect()
    }

    /// Log a transaction whose balance effects have committed.
    ///
    /// The append runs on its own task so it finishes even if the caller
    /// stops waiting at the deadline.
    async fn record(
        &self,
        ctx: &RequestContext,
        body: NewTransaction,
    ) -> Result<Transaction, LedgerError> {
        let request = body.request_id;
        let engine = self.clone();
        let append = tokio::spawn(async move { engine.append_committed(body).await });

        match tokio::time::timeout_at(ctx.deadline, append).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                error!(request = %request, reason = %join_error, "log append task failed");
                Err(LedgerError::ReconciliationRequired {
                    request,
                    source: LogError::Unavailable(join_error.to_string()),
                })
            }
            Err(_) => {
                warn!(request = %request, "deadline passed while logging a committed operation");
                Err(LedgerError::CommitPending(request))
            }
        }
    }

    async fn append_committed(&self, body: NewTransaction) -> Result<Transaction, LedgerError> {
        let request = body.request_id;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match self.log.append(body.clone()).await {
                Ok(tx) => Ok(Some(tx)),
                Err(LogError::Duplicate { existing, .. }) => {
                    self.resolve_duplicate(existing, &body).await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(Some(tx)) => {
                    // an unsettled entry is completed by the next reconcile
                    if let Err(e) = self.store.settle(request).await {
                        warn!(request = %request, reason = %e, "logged but journal entry not settled");
                    }
                    return Ok(tx);
                }
                Ok(None) => {
                    warn!(request = %request, "request id already logged for another transaction");
                    return Err(LedgerError::ReconciliationRequired {
                        request,
                        source: LogError::Unavailable(format!(
                            "request {request} already logged for another transaction"
                        )),
                    });
                }
                Err(source) if attempt >= self.log_append_attempts => {
                    warn!(
                        request = %request,
                        reason = %source,
                        "committed operation left for reconciliation"
                    );
                    return Err(LedgerError::ReconciliationRequired { request, source });
                }
                Err(e) => {
                    debug!(request = %request, reason = %e, attempt, "log append failed, retrying");
                    tokio::time::sleep(self.retry.backoff(attempt)).await;
                }
            }
        }
    }

    /// The log already holds `existing` under our request id. It is ours if
    /// the bodies match (an earlier append landed without us hearing back).
    async fn resolve_duplicate(
        &self,
        existing: TxId,
        body: &NewTransaction,
    ) -> Result<Option<Transaction>, LogError> {
        let logged = self.log.get_by_id(existing).await?;
        Ok((logged.body == *body).then_some(logged))
    }

    /// Undo the balance effects of a journaled operation and settle its entry
    /// in the same commit.
    async fn compensate(&self, entry: &PendingEntry) -> Result<(), LedgerError> {
        let ctx = self.context();
        let ids: Vec<AccountId> = entry.effects.iter().map(|e| e.account).collect();
        let effects = &entry.effects;

        self.mutate(
            &ctx,
            &ids,
            |accounts| {
                accounts
                    .iter()
                    .zip(effects)
                    .map(|(account, effect)| {
                        let (balance, points) = effect.revert(account)?;
                        Ok(AccountWrite::from_read(account, balance, points))
                    })
                    .collect()
            },
            Journaling::Settle(entry.request_id()),
        )
        .await?;
        Ok(())
    }
}
