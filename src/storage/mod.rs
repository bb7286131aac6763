//! Boundary to the storage engine that owns the native transactions.
//!
//! The coordinator never reads or writes data itself. Everything that touches
//! the store goes through [`StorageEngine`], scoped by a [`NativeHandle`] the
//! engine handed out for a fixed table set and lock mode.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::errors::StorageError;
use crate::txn::upgrade::SchemaDiff;
use crate::txn::LockMode;
use crate::Document;

pub mod memory;

pub use memory::{EngineEvent, MemoryEngine};

/// Identifies a native transaction inside the engine that opened it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeHandle(pub u64);

impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "native#{}", self.0)
    }
}

/// Token returned by [`StorageEngine::subscribe_changes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChangeToken(pub u64);

/// Called with the set of tables a committed native transaction wrote.
pub type ChangeCallback = Arc<dyn Fn(&BTreeSet<String>) + Send + Sync>;

#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Opens a native transaction over exactly `tables` in `mode`.
    ///
    /// Fails when the engine is closed or when the request conflicts with
    /// another exclusive transaction.
    async fn open_transaction(
        &self,
        tables: &BTreeSet<String>,
        mode: LockMode,
    ) -> Result<NativeHandle, StorageError>;

    /// Makes the effects of `handle` durable. Callable once per handle.
    async fn commit(&self, handle: NativeHandle) -> Result<(), StorageError>;

    /// Discards the effects of `handle`. Callable once per handle.
    async fn rollback(&self, handle: NativeHandle) -> Result<(), StorageError>;

    /// Keeps `handle` from being finalized while it has no operation in flight.
    fn acquire_lease(&self, handle: NativeHandle) -> Result<(), StorageError>;

    fn heartbeat(&self, handle: NativeHandle);

    fn release_lease(&self, handle: NativeHandle);

    async fn get(
        &self,
        handle: NativeHandle,
        table: &str,
        key: &Value,
    ) -> Result<Option<Document>, StorageError>;

    async fn put(
        &self,
        handle: NativeHandle,
        table: &str,
        key: Value,
        doc: Document,
    ) -> Result<(), StorageError>;

    /// Returns whether a document was removed.
    async fn delete(
        &self,
        handle: NativeHandle,
        table: &str,
        key: &Value,
    ) -> Result<bool, StorageError>;

    /// All documents of `table` in key order.
    async fn scan(&self, handle: NativeHandle, table: &str)
        -> Result<Vec<Document>, StorageError>;

    fn subscribe_changes(&self, callback: ChangeCallback) -> ChangeToken;

    fn unsubscribe_changes(&self, token: ChangeToken);

    /// The schema version currently marked as current.
    async fn version(&self) -> Result<u32, StorageError>;

    async fn table_names(&self) -> Result<BTreeSet<String>, StorageError>;

    /// Opens the version-change transaction for a schema bump. Committing the
    /// returned handle applies `diff` and marks `to` as current.
    async fn open_version_upgrade(
        &self,
        from: u32,
        to: u32,
        diff: &SchemaDiff,
    ) -> Result<NativeHandle, StorageError>;
}
