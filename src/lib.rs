//! Two-pass transaction coordination for a table-oriented document store.
//!
//! Transaction closures are run twice by the [`Coordinator`]: a planning pass
//! discovers which tables they touch, then an executing pass runs them for
//! real inside one native transaction scoped to exactly those tables.

mod core;
mod engine;
mod live;
mod storage;
mod txn;

pub use crate::core::document::{normalize_document, validate_key, ID_FIELD};
pub use crate::core::errors::{BranchFailure, DocumentValidationError, StorageError, TxnError};
pub use crate::core::txn_stats::{TxnStatKind, TxnStats, TxnStatsSnapshot, WaitCounterSnapshot};
pub use crate::engine::{Database, DatabaseConfig, Table};
pub use crate::live::{LiveQuery, LiveQueryInvalidator, LiveResult, SubscriptionId};
pub use crate::storage::{
    ChangeCallback, ChangeToken, EngineEvent, MemoryEngine, NativeHandle, StorageEngine,
};
pub use crate::txn::upgrade::run_version_upgrade;
pub use crate::txn::{
    Coordinator, LedgerSnapshot, LockMode, Phase, Schema, SchemaDiff, TableUsageLedger,
    Transaction, TransactionKind, TxnId, WaitForBroker, TXN_NONE,
};

pub type Document = serde_json::Map<String, serde_json::Value>;
