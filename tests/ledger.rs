use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rewards_ledger::engine::ErrorKind;
use rewards_ledger::log::LogError;
use rewards_ledger::model::{NewTransaction, PointExchangeEntry};
use rewards_ledger::store::{AccountWrite, BalanceEffect, JournalChange, PendingEntry, StoreError};
use rewards_ledger::{
    Account, AccountId, AccountStore, Amount, FileAccountStore, InMemoryAccountStore,
    InMemoryTransactionLog, LedgerConfig, LedgerEngine, LedgerError, Points, RequestContext,
    RequestId, StaticPointCatalog, Transaction, TransactionKind, TransactionLog, TxId,
};
use tempfile::tempdir;

// test utils

fn catalog() -> Arc<StaticPointCatalog> {
    Arc::new(StaticPointCatalog::new([PointExchangeEntry {
        id: 7,
        reward_description: "gift card".to_string(),
        cost_in_points: Points::new(100),
    }]))
}

async fn seeded<S: AccountStore>(store: S, accounts: &[Account]) -> Arc<S> {
    for account in accounts {
        store.create(account.clone()).await.unwrap();
    }
    Arc::new(store)
}

fn patient_config() -> LedgerConfig {
    let mut config = LedgerConfig::default();
    config.retry.max_attempts = 1_000;
    config.retry.base_backoff_ms = 1;
    config.retry.max_backoff_ms = 5;
    config.operation_timeout_ms = 30_000;
    config
}

/// Log that can be taken offline, slowed down, or made blind to lookups.
#[derive(Default)]
struct FaultyLog {
    inner: InMemoryTransactionLog,
    offline: AtomicBool,
    append_delay: Duration,
    /// Pretend no request has been logged, as if another writer raced us.
    hide_requests: bool,
}

impl TransactionLog for FaultyLog {
    async fn append(&self, transaction: NewTransaction) -> Result<Transaction, LogError> {
        if !self.append_delay.is_zero() {
            tokio::time::sleep(self.append_delay).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(LogError::Unavailable("log offline".to_string()));
        }
        self.inner.append(transaction).await
    }

    async fn get_by_id(&self, id: TxId) -> Result<Transaction, LogError> {
        self.inner.get_by_id(id).await
    }

    async fn get_by_request(&self, request: RequestId) -> Result<Option<Transaction>, LogError> {
        if self.hide_requests {
            return Ok(None);
        }
        self.inner.get_by_request(request).await
    }

    async fn list_by_sender(&self, account: AccountId) -> Result<Vec<Transaction>, LogError> {
        self.inner.list_by_sender(account).await
    }

    async fn list_by_sender_before(
        &self,
        account: AccountId,
        before: Option<TxId>,
        limit: usize,
    ) -> Result<Vec<Transaction>, LogError> {
        self.inner.list_by_sender_before(account, before, limit).await
    }
}

#[derive(Debug, Clone, Copy)]
enum Misbehavior {
    /// Every commit loses the version race
    AlwaysConflict,
    /// Commits apply but return no records
    DropResults,
}

/// In-memory store with a broken `commit`.
struct MisbehavingStore {
    inner: InMemoryAccountStore,
    misbehavior: Misbehavior,
}

impl MisbehavingStore {
    fn new(misbehavior: Misbehavior) -> Self {
        Self {
            inner: InMemoryAccountStore::new(),
            misbehavior,
        }
    }
}

impl AccountStore for MisbehavingStore {
    async fn get(&self, id: AccountId) -> Result<Account, StoreError> {
        self.inner.get(id).await
    }

    async fn create(&self, account: Account) -> Result<Account, StoreError> {
        self.inner.create(account).await
    }

    async fn commit(
        &self,
        writes: &[AccountWrite],
        journal: JournalChange<'_>,
    ) -> Result<Vec<Account>, StoreError> {
        match self.misbehavior {
            Misbehavior::AlwaysConflict => Err(StoreError::VersionConflict {
                account: writes[0].account,
                expected: writes[0].expected_version,
                actual: writes[0].expected_version + 1,
            }),
            Misbehavior::DropResults => {
                self.inner.commit(writes, journal).await?;
                Ok(Vec::new())
            }
        }
    }

    async fn deactivate(&self, id: AccountId) -> Result<Account, StoreError> {
        self.inner.deactivate(id).await
    }

    async fn accounts(&self) -> Result<Vec<Account>, StoreError> {
        self.inner.accounts().await
    }

    async fn pending(&self) -> Result<Vec<PendingEntry>, StoreError> {
        self.inner.pending().await
    }

    async fn is_pending(&self, request: RequestId) -> Result<bool, StoreError> {
        self.inner.is_pending(request).await
    }

    async fn settle(&self, request: RequestId) -> Result<(), StoreError> {
        self.inner.settle(request).await
    }
}

// Scenario

#[tokio::test]
async fn deposit_withdraw_transfer_scenario() {
    let store = seeded(
        InMemoryAccountStore::new(),
        &[Account::new(1).with_balance(Amount::new(1000)), Account::new(2)],
    )
    .await;
    let log = Arc::new(InMemoryTransactionLog::new());
    let engine = LedgerEngine::new(
        Arc::clone(&store),
        Arc::clone(&log),
        catalog(),
        &LedgerConfig::default(),
    );

    let receipt = engine
        .deposit_bank(&engine.context(), 1, Amount::new(500), None)
        .await
        .unwrap();
    assert_eq!(receipt.account.balance, Amount::new(1500));
    assert_eq!(receipt.account.points, Points::new(20));
    let history = engine.history(1).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].kind(), TransactionKind::DepositBank);
    assert_eq!(history[0].sender(), 1);
    assert_eq!(history[0].body.amount, 500);

    let result = engine.withdraw(&engine.context(), 1, Amount::new(2000)).await;
    assert!(matches!(
        result,
        Err(LedgerError::InsufficientBalance { .. })
    ));
    assert_eq!(engine.account(1).await.unwrap().balance, Amount::new(1500));
    assert_eq!(log.len(), 1);

    let receipt = engine
        .transfer(&engine.context(), 1, 2, Amount::new(1000))
        .await
        .unwrap();
    assert_eq!(receipt.account.balance, Amount::new(500));
    assert_eq!(receipt.account.points, Points::new(40));
    assert_eq!(receipt.counterparty.unwrap().balance, Amount::new(1000));
    assert_eq!(receipt.transaction.kind(), TransactionKind::Transfer);
    assert_eq!(log.len(), 2);
}

// Redemption boundary

#[tokio::test]
async fn redeem_exact_points_leaves_zero() {
    let store = seeded(
        InMemoryAccountStore::new(),
        &[Account::new(1).with_points(Points::new(100))],
    )
    .await;
    let engine = LedgerEngine::new(
        store,
        Arc::new(InMemoryTransactionLog::new()),
        catalog(),
        &LedgerConfig::default(),
    );

    let receipt = engine
        .redeem(&engine.context(), 1, 7, Points::new(100))
        .await
        .unwrap();
    assert_eq!(receipt.account.points, Points::ZERO);
    assert_eq!(receipt.transaction.kind(), TransactionKind::Redeem);
}

#[tokio::test]
async fn redeem_one_point_short_fails_and_keeps_points() {
    let store = seeded(
        InMemoryAccountStore::new(),
        &[Account::new(1).with_points(Points::new(99))],
    )
    .await;
    let log = Arc::new(InMemoryTransactionLog::new());
    let engine = LedgerEngine::new(store, Arc::clone(&log), catalog(), &LedgerConfig::default());

    let result = engine.redeem(&engine.context(), 1, 7, Points::new(100)).await;
    assert!(matches!(
        result,
        Err(LedgerError::InsufficientPoints { account: 1, .. })
    ));
    assert_eq!(engine.account(1).await.unwrap().points, Points::new(99));
    assert!(log.is_empty());
}

// Concurrency

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_concurrent_deposits_are_both_applied() {
    let store = seeded(
        InMemoryAccountStore::new(),
        &[Account::new(1).with_balance(Amount::new(100))],
    )
    .await;
    let engine = LedgerEngine::new(
        store,
        Arc::new(InMemoryTransactionLog::new()),
        catalog(),
        &LedgerConfig::default(),
    );

    let a = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .deposit_bank(&engine.context(), 1, Amount::new(30), None)
                .await
        })
    };
    let b = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .deposit_bank(&engine.context(), 1, Amount::new(12), None)
                .await
        })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let account = engine.account(1).await.unwrap();
    assert_eq!(account.balance, Amount::new(142));
    assert_eq!(account.points, Points::new(40));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_concurrent_deposits_lose_no_update() {
    let store = seeded(InMemoryAccountStore::new(), &[Account::new(1)]).await;
    let log = Arc::new(InMemoryTransactionLog::new());
    let engine = LedgerEngine::new(store, Arc::clone(&log), catalog(), &patient_config());

    let tasks: Vec<_> = (0..32)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .deposit_card(&engine.context(), 1, Amount::new(10), None)
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let account = engine.account(1).await.unwrap();
    assert_eq!(account.balance, Amount::new(320));
    assert_eq!(account.points, Points::new(32 * 20));
    assert_eq!(log.len(), 32);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn opposite_transfers_neither_deadlock_nor_leak_funds() {
    let store = seeded(
        InMemoryAccountStore::new(),
        &[
            Account::new(1).with_balance(Amount::new(1000)),
            Account::new(2).with_balance(Amount::new(1000)),
        ],
    )
    .await;
    let log = Arc::new(InMemoryTransactionLog::new());
    let engine = LedgerEngine::new(store, Arc::clone(&log), catalog(), &patient_config());

    let tasks: Vec<_> = (0..40)
        .map(|i| {
            let engine = engine.clone();
            let (from, to) = if i % 2 == 0 { (1, 2) } else { (2, 1) };
            tokio::spawn(async move {
                engine
                    .transfer(&engine.context(), from, to, Amount::new(10))
                    .await
            })
        })
        .collect();

    tokio::time::timeout(Duration::from_secs(20), async {
        for task in tasks {
            task.await.unwrap().unwrap();
        }
    })
    .await
    .expect("transfers did not finish");

    let one = engine.account(1).await.unwrap();
    let two = engine.account(2).await.unwrap();
    assert_eq!(one.balance.value() + two.balance.value(), 2000);
    assert_eq!(one.balance, Amount::new(1000));
    assert_eq!(one.points, Points::new(20 * 20));
    assert_eq!(log.len(), 40);
}

#[tokio::test]
async fn exhausted_retries_surface_as_contention() {
    let store = seeded(
        MisbehavingStore::new(Misbehavior::AlwaysConflict),
        &[Account::new(1)],
    )
    .await;
    let log = Arc::new(InMemoryTransactionLog::new());
    let engine = LedgerEngine::new(store, Arc::clone(&log), catalog(), &LedgerConfig::default());

    let result = engine
        .deposit_bank(&engine.context(), 1, Amount::new(10), None)
        .await;
    let err = result.unwrap_err();
    assert!(matches!(err, LedgerError::Contention { attempts: 5 }));
    assert_eq!(err.kind(), ErrorKind::Contention);
    assert!(err.is_retryable());
    assert!(log.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_withdrawals_never_overdraw() {
    let store = seeded(
        InMemoryAccountStore::new(),
        &[Account::new(1).with_balance(Amount::new(100))],
    )
    .await;
    let log = Arc::new(InMemoryTransactionLog::new());
    let engine = LedgerEngine::new(store, Arc::clone(&log), catalog(), &patient_config());

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .withdraw(&engine.context(), 1, Amount::new(10))
                    .await
            })
        })
        .collect();

    let mut succeeded = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(LedgerError::InsufficientBalance { account: 1, .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(succeeded, 10);
    assert_eq!(engine.account(1).await.unwrap().balance, Amount::ZERO);
    assert_eq!(log.len(), 10);
}

#[tokio::test]
async fn commit_result_missing_an_account_is_a_store_error() {
    let store = seeded(
        MisbehavingStore::new(Misbehavior::DropResults),
        &[Account::new(1)],
    )
    .await;
    let log = Arc::new(InMemoryTransactionLog::new());
    let engine = LedgerEngine::new(store, Arc::clone(&log), catalog(), &LedgerConfig::default());

    let result = engine
        .deposit_bank(&engine.context(), 1, Amount::new(10), None)
        .await;
    let err = result.unwrap_err();
    assert!(matches!(
        err,
        LedgerError::Store(StoreError::MissingFromCommit(1))
    ));
    assert_eq!(err.kind(), ErrorKind::Storage);
}

// Durability

#[tokio::test]
async fn failed_log_append_is_journaled_then_reconciled() {
    let store = seeded(InMemoryAccountStore::new(), &[Account::new(1)]).await;
    let log = Arc::new(FaultyLog::default());
    log.offline.store(true, Ordering::SeqCst);
    let engine = LedgerEngine::new(
        Arc::clone(&store),
        Arc::clone(&log),
        catalog(),
        &LedgerConfig::default(),
    );

    let ctx = engine.context();
    let result = engine.deposit_bank(&ctx, 1, Amount::new(250), None).await;
    let err = result.unwrap_err();
    assert!(matches!(err, LedgerError::ReconciliationRequired { request, .. } if request == ctx.request_id));
    assert_eq!(err.kind(), ErrorKind::Durability);
    assert!(!err.is_retryable());

    // the balance moved, the log did not
    assert_eq!(engine.account(1).await.unwrap().balance, Amount::new(250));
    assert!(log.inner.is_empty());
    let pending = engine.pending_reconciliation().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].effects[0].balance_credit, Amount::new(250));

    // replaying the request must not apply it twice
    let replay = engine.deposit_bank(&ctx, 1, Amount::new(250), None).await;
    assert!(matches!(replay, Err(LedgerError::DuplicateRequest(_))));

    let report = engine.reconcile().await.unwrap();
    assert_eq!(report.pending, vec![ctx.request_id]);

    log.offline.store(false, Ordering::SeqCst);
    let report = engine.reconcile().await.unwrap();
    assert_eq!(report.completed, vec![ctx.request_id]);
    assert!(engine.pending_reconciliation().await.unwrap().is_empty());

    let logged = log.inner.get_by_request(ctx.request_id).await.unwrap().unwrap();
    assert_eq!(logged.body.amount, 250);
    assert_eq!(engine.account(1).await.unwrap().balance, Amount::new(250));
}

#[tokio::test]
async fn slow_log_append_finishes_after_deadline() {
    let store = seeded(InMemoryAccountStore::new(), &[Account::new(1)]).await;
    let log = Arc::new(FaultyLog {
        append_delay: Duration::from_millis(200),
        ..FaultyLog::default()
    });
    let engine = LedgerEngine::new(
        Arc::clone(&store),
        Arc::clone(&log),
        catalog(),
        &LedgerConfig::default(),
    );

    let ctx = RequestContext::new(Duration::from_millis(50));
    let result = engine.deposit_bank(&ctx, 1, Amount::new(70), None).await;
    assert!(matches!(result, Err(LedgerError::CommitPending(r)) if r == ctx.request_id));

    // a retry while the append is in flight is refused
    let retry = RequestContext::new(Duration::from_secs(5)).with_request_id(ctx.request_id);
    assert!(matches!(
        engine.deposit_bank(&retry, 1, Amount::new(70), None).await,
        Err(LedgerError::DuplicateRequest(_))
    ));

    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(engine.pending_reconciliation().await.unwrap().is_empty());
    assert_eq!(log.inner.len(), 1);
    assert_eq!(engine.account(1).await.unwrap().balance, Amount::new(70));
}

#[tokio::test]
async fn request_id_taken_by_another_writer_is_compensated() {
    let store = seeded(
        InMemoryAccountStore::new(),
        &[Account::new(1).with_balance(Amount::new(40))],
    )
    .await;
    let log = Arc::new(FaultyLog {
        hide_requests: true,
        ..FaultyLog::default()
    });
    let engine = LedgerEngine::new(
        Arc::clone(&store),
        Arc::clone(&log),
        catalog(),
        &LedgerConfig::default(),
    );

    // some other writer already logged this request id for a different account
    let ctx = engine.context();
    log.inner
        .append(NewTransaction::new(
            ctx.request_id,
            TransactionKind::Withdraw,
            9,
            1,
        ))
        .await
        .unwrap();

    let result = engine.deposit_bank(&ctx, 1, Amount::new(500), None).await;
    assert!(matches!(
        result,
        Err(LedgerError::ReconciliationRequired { .. })
    ));
    let account = engine.account(1).await.unwrap();
    assert_eq!(account.balance, Amount::new(540));
    assert_eq!(account.points, Points::new(20));

    let report = engine.reconcile().await.unwrap();
    assert_eq!(report.compensated, vec![ctx.request_id]);
    assert!(engine.pending_reconciliation().await.unwrap().is_empty());

    let account = engine.account(1).await.unwrap();
    assert_eq!(account.balance, Amount::new(40));
    assert_eq!(account.points, Points::ZERO);
    assert_eq!(log.inner.len(), 1);
}

#[tokio::test]
async fn logged_but_unsettled_entry_completes_on_reconcile() {
    let store = seeded(InMemoryAccountStore::new(), &[Account::new(1)]).await;
    let log = Arc::new(InMemoryTransactionLog::new());

    // balances and log entry both landed; the process died before settling
    let body = NewTransaction::new(RequestId::new(), TransactionKind::DepositBank, 1, 100);
    let write = AccountWrite::from_read(&Account::new(1), Amount::new(100), Points::new(20));
    let entry = PendingEntry {
        transaction: body.clone(),
        effects: vec![BalanceEffect::between(&Account::new(1), &write)],
    };
    store
        .commit(&[write], JournalChange::Record(&entry))
        .await
        .unwrap();
    log.append(body.clone()).await.unwrap();

    let engine = LedgerEngine::new(
        Arc::clone(&store),
        Arc::clone(&log),
        catalog(),
        &LedgerConfig::default(),
    );
    let report = engine.reconcile().await.unwrap();
    assert_eq!(report.completed, vec![body.request_id]);
    assert!(engine.pending_reconciliation().await.unwrap().is_empty());
    assert_eq!(log.len(), 1);
    assert_eq!(engine.account(1).await.unwrap().balance, Amount::new(100));
}

#[tokio::test]
async fn journaled_operation_survives_a_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("accounts.jsonl");
    let log = Arc::new(FaultyLog::default());
    log.offline.store(true, Ordering::SeqCst);

    let ctx = {
        let store = seeded(FileAccountStore::open(&path).await.unwrap(), &[Account::new(1)]).await;
        let engine = LedgerEngine::new(store, Arc::clone(&log), catalog(), &LedgerConfig::default());
        let ctx = engine.context();
        let result = engine.deposit_bank(&ctx, 1, Amount::new(250), None).await;
        assert!(matches!(
            result,
            Err(LedgerError::ReconciliationRequired { .. })
        ));
        ctx
    };

    // a fresh process sees the committed balance and the unlogged operation
    log.offline.store(false, Ordering::SeqCst);
    let store = Arc::new(FileAccountStore::open(&path).await.unwrap());
    let engine = LedgerEngine::new(
        Arc::clone(&store),
        Arc::clone(&log),
        catalog(),
        &LedgerConfig::default(),
    );
    assert_eq!(engine.account(1).await.unwrap().balance, Amount::new(250));
    let pending = engine.pending_reconciliation().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].request_id(), ctx.request_id);

    let report = engine.reconcile().await.unwrap();
    assert_eq!(report.completed, vec![ctx.request_id]);
    assert_eq!(log.inner.len(), 1);

    // settling is durable too
    let reopened = FileAccountStore::open(&path).await.unwrap();
    assert!(reopened.pending().await.unwrap().is_empty());
    assert_eq!(reopened.get(1).await.unwrap().balance, Amount::new(250));
}
