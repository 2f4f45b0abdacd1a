pub mod amount;
pub mod catalog;
pub mod config;
pub mod csv;
pub mod engine;
mod jsonl;
pub mod log;
pub mod model;
pub mod policy;
pub mod store;

pub use amount::{Amount, Points};
pub use catalog::{PointCatalog, StaticPointCatalog};
pub use config::LedgerConfig;
pub use engine::{LedgerEngine, LedgerError, Operation, Receipt, ReconcileReport, RequestContext};
pub use log::{FileTransactionLog, InMemoryTransactionLog, TransactionLog};
pub use model::{Account, AccountId, RequestId, Transaction, TransactionKind, TxId};
pub use policy::RewardPolicy;
pub use store::{AccountStore, FileAccountStore, InMemoryAccountStore};
