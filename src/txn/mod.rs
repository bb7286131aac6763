pub mod context;
pub mod coordinator;
pub mod ledger;
pub mod upgrade;
pub mod wait_for;

use std::fmt;

pub use context::Transaction;
pub use coordinator::Coordinator;
pub use ledger::{LedgerSnapshot, TableUsageLedger};
pub use upgrade::{Schema, SchemaDiff};
pub use wait_for::WaitForBroker;

pub type TxnId = u64;
pub const TXN_NONE: TxnId = 0;

/// Lock mode of a table usage or of a whole native transaction.
///
/// Ordered so that `Read < ReadWrite`; `max` yields the dominant mode.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockMode {
    Read,
    ReadWrite,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransactionKind {
    TopLevel,
    Nested,
    Parallel,
    /// Single-shot schema migration opened by the engine's version change.
    Upgrade,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    Planning,
    Executing,
    Completed,
    Aborted,
}

impl Phase {
    pub fn is_finished(self) -> bool {
        matches!(self, Phase::Completed | Phase::Aborted)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Planning => "planning",
            Phase::Executing => "executing",
            Phase::Completed => "completed",
            Phase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}
