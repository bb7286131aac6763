use std::collections::{BTreeMap, BTreeSet};

use super::LockMode;

/// The tables a transaction touches and the mode it needs for each.
#[derive(Debug, Default, Clone)]
pub struct TableUsageLedger {
    entries: BTreeMap<String, LockMode>,
    frozen: bool,
}

/// What the native transaction gets opened with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub tables: BTreeSet<String>,
    pub mode: LockMode,
}

impl TableUsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `table` in `mode`. Re-registering upgrades Read to ReadWrite
    /// and never downgrades. Returns whether the ledger changed.
    pub fn register(&mut self, table: &str, mode: LockMode) -> bool {
        debug_assert!(!self.frozen, "register on a frozen ledger");
        match self.entries.get_mut(table) {
            Some(existing) => {
                let upgraded = (*existing).max(mode);
                let changed = upgraded != *existing;
                *existing = upgraded;
                changed
            }
            None => {
                self.entries.insert(table.to_string(), mode);
                true
            }
        }
    }

    /// Whether a frozen ledger already covers `table` in `mode`.
    pub fn permits(&self, table: &str, mode: LockMode) -> bool {
        match self.entries.get(table) {
            Some(planned) => *planned >= mode,
            None => false,
        }
    }

    pub fn mode_of(&self, table: &str) -> Option<LockMode> {
        self.entries.get(table).copied()
    }

    pub fn aggregate_mode(&self) -> LockMode {
        self.entries
            .values()
            .fold(LockMode::Read, |acc, mode| acc.max(*mode))
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, LockMode)> {
        self.entries.iter().map(|(table, mode)| (table.as_str(), *mode))
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            tables: self.entries.keys().cloned().collect(),
            mode: self.aggregate_mode(),
        }
    }
}
