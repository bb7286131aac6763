//! Schema version upgrades.
//!
//! A version bump runs the upgrade callback exactly once inside the native
//! transaction the engine opens for the version change. There is no planning
//! pass: the table set comes from the declared schema.

use std::collections::BTreeSet;
use std::future::Future;

use tracing::{debug, info};

use super::context::Transaction;
use super::coordinator::Coordinator;
use crate::core::txn_stats::TxnStatKind;
use crate::TxnError;

/// Tables to create and drop when moving the store to a new schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDiff {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl SchemaDiff {
    pub fn between(existing: &BTreeSet<String>, declared: &BTreeSet<String>) -> Self {
        Self {
            added: declared.difference(existing).cloned().collect(),
            removed: existing.difference(declared).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    version: u32,
    tables: BTreeSet<String>,
}

impl Schema {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            tables: BTreeSet::new(),
        }
    }

    pub fn table(mut self, name: impl Into<String>) -> Self {
        self.tables.insert(name.into());
        self
    }

    pub fn tables<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn table_names(&self) -> impl Iterator<Item = &String> {
        self.tables.iter()
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains(table)
    }
}

/// Brings the engine up to `schema`, running `upgrade(txn, from, to)` in the
/// version-change transaction. Returns whether an upgrade happened.
///
/// A failing callback rolls the version change back; the stored version stays
/// where it was.
pub async fn run_version_upgrade<F, Fut>(
    coordinator: &Coordinator,
    schema: &Schema,
    upgrade: F,
) -> Result<bool, TxnError>
where
    F: FnOnce(Transaction, u32, u32) -> Fut,
    Fut: Future<Output = Result<(), TxnError>>,
{
    if schema.version == 0 {
        return Err(TxnError::usage("schema version must be at least 1"));
    }
    if schema.tables.iter().any(|t| t.is_empty()) {
        return Err(TxnError::usage("table name must not be empty"));
    }

    let engine = coordinator.engine();
    let current = engine
        .version()
        .await
        .map_err(|e| TxnError::Storage(e).into_boundary())?;
    if current > schema.version {
        return Err(TxnError::VersionMismatch {
            current,
            requested: schema.version,
        });
    }
    if current == schema.version {
        debug!(version = current, "schema is current");
        return Ok(false);
    }

    let existing = engine
        .table_names()
        .await
        .map_err(|e| TxnError::Storage(e).into_boundary())?;
    let diff = SchemaDiff::between(&existing, &schema.tables);
    let handle = engine
        .open_version_upgrade(current, schema.version, &diff)
        .await
        .map_err(|e| TxnError::Storage(e).into_boundary())?;
    coordinator.stats().record(TxnStatKind::NativeOpen);

    info!(from = current, to = schema.version, ?diff, "upgrading schema");
    let txn = coordinator.upgrade_context(handle, schema);
    let outcome = upgrade(txn.clone(), current, schema.version).await;
    txn.finish(outcome).await?;
    Ok(true)
}
