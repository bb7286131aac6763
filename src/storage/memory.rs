//! In-memory storage engine.
//!
//! Writes are staged per native transaction and only applied on commit, so a
//! rolled back transaction leaves no trace. Every call is appended to an event
//! log that callers can inspect.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace};

use super::{ChangeCallback, ChangeToken, NativeHandle, StorageEngine};
use crate::core::errors::StorageError;
use crate::txn::upgrade::SchemaDiff;
use crate::txn::LockMode;
use crate::Document;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Open {
        handle: NativeHandle,
        tables: BTreeSet<String>,
        mode: LockMode,
    },
    OpenUpgrade {
        handle: NativeHandle,
        from: u32,
        to: u32,
    },
    Get {
        handle: NativeHandle,
        table: String,
    },
    Put {
        handle: NativeHandle,
        table: String,
        key: Value,
    },
    Delete {
        handle: NativeHandle,
        table: String,
        key: Value,
    },
    Scan {
        handle: NativeHandle,
        table: String,
    },
    Commit(NativeHandle),
    Rollback(NativeHandle),
    LeaseAcquired(NativeHandle),
    Heartbeat(NativeHandle),
    LeaseReleased(NativeHandle),
}

#[derive(Debug)]
struct NativeTxn {
    tables: BTreeSet<String>,
    mode: LockMode,
    // (table, encoded key) -> Some(doc) for puts, None for deletes
    staged: BTreeMap<(String, String), Option<Document>>,
    leases: u32,
    upgrade: Option<(u32, SchemaDiff)>,
}

#[derive(Debug, Default)]
struct EngineState {
    closed: bool,
    version: u32,
    tables: BTreeMap<String, BTreeMap<String, Document>>,
    open: HashMap<NativeHandle, NativeTxn>,
    next_handle: u64,
    events: Vec<EngineEvent>,
    fail_next_commit: Option<String>,
}

impl EngineState {
    fn txn(&self, handle: NativeHandle, table: &str) -> Result<&NativeTxn, StorageError> {
        let txn = self
            .open
            .get(&handle)
            .ok_or_else(|| StorageError(format!("{handle} is not open")))?;
        if !txn.tables.contains(table) {
            return Err(StorageError(format!(
                "table '{table}' is not in the scope of {handle}"
            )));
        }
        Ok(txn)
    }

    fn writable_txn(
        &mut self,
        handle: NativeHandle,
        table: &str,
    ) -> Result<&mut NativeTxn, StorageError> {
        if self.txn(handle, table)?.mode != LockMode::ReadWrite {
            return Err(StorageError(format!("{handle} is read-only")));
        }
        self.open
            .get_mut(&handle)
            .ok_or_else(|| StorageError(format!("{handle} is not open")))
    }

    fn visible(&self, handle: NativeHandle, table: &str) -> Result<BTreeMap<String, Document>, StorageError> {
        let txn = self.txn(handle, table)?;
        let mut rows = self.tables.get(table).cloned().unwrap_or_default();
        for ((staged_table, key), doc) in &txn.staged {
            if staged_table != table {
                continue;
            }
            match doc {
                Some(doc) => {
                    rows.insert(key.clone(), doc.clone());
                }
                None => {
                    rows.remove(key);
                }
            }
        }
        Ok(rows)
    }

    fn conflicts(&self, tables: &BTreeSet<String>, mode: LockMode) -> Option<String> {
        if mode != LockMode::ReadWrite {
            return None;
        }
        self.open
            .values()
            .filter(|txn| txn.mode == LockMode::ReadWrite)
            .flat_map(|txn| txn.tables.intersection(tables))
            .next()
            .cloned()
    }

    fn allocate(&mut self, txn: NativeTxn) -> NativeHandle {
        self.next_handle += 1;
        let handle = NativeHandle(self.next_handle);
        self.open.insert(handle, txn);
        handle
    }
}

pub struct MemoryEngine {
    state: Mutex<EngineState>,
    subscribers: Mutex<Vec<(ChangeToken, ChangeCallback)>>,
    next_token: AtomicU64,
    latency: Duration,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            subscribers: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(0),
            latency: Duration::ZERO,
        }
    }

    /// An engine at version 1 that already holds the given (empty) tables.
    pub fn with_tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let engine = Self::new();
        {
            let mut state = engine.state.lock();
            state.version = 1;
            for table in tables {
                state.tables.insert(table.into(), BTreeMap::new());
            }
        }
        engine
    }

    /// Delays every data operation, giving concurrent transactions a chance
    /// to interleave.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    pub fn fail_next_commit(&self, message: impl Into<String>) {
        self.state.lock().fail_next_commit = Some(message.into());
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.state.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.state.lock().events.clear();
    }

    /// Committed documents of `table` in key order.
    pub fn committed(&self, table: &str) -> Vec<Document> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn open_transactions(&self) -> usize {
        self.state.lock().open.len()
    }

    pub fn active_leases(&self, handle: NativeHandle) -> u32 {
        self.state
            .lock()
            .open
            .get(&handle)
            .map(|txn| txn.leases)
            .unwrap_or(0)
    }

    /// Number of registered change-feed callbacks.
    pub fn change_subscribers(&self) -> usize {
        self.subscribers.lock().len()
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn notify(&self, changed: &BTreeSet<String>) {
        if changed.is_empty() {
            return;
        }
        let callbacks: Vec<ChangeCallback> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(changed);
        }
    }
}

fn encode_key(key: &Value) -> Result<String, StorageError> {
    serde_json::to_string(key).map_err(|e| StorageError(format!("invalid key: {e}")))
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    async fn open_transaction(
        &self,
        tables: &BTreeSet<String>,
        mode: LockMode,
    ) -> Result<NativeHandle, StorageError> {
        self.pause().await;
        let mut state = self.state.lock();
        if state.closed {
            return Err(StorageError("engine is closed".into()));
        }
        if let Some(missing) = tables.iter().find(|t| !state.tables.contains_key(*t)) {
            return Err(StorageError(format!("unknown table '{missing}'")));
        }
        if let Some(table) = state.conflicts(tables, mode) {
            return Err(StorageError(format!(
                "table '{table}' is locked by another read-write transaction"
            )));
        }
        let handle = state.allocate(NativeTxn {
            tables: tables.clone(),
            mode,
            staged: BTreeMap::new(),
            leases: 0,
            upgrade: None,
        });
        state.events.push(EngineEvent::Open {
            handle,
            tables: tables.clone(),
            mode,
        });
        debug!(%handle, ?tables, ?mode, "opened native transaction");
        Ok(handle)
    }

    async fn commit(&self, handle: NativeHandle) -> Result<(), StorageError> {
        self.pause().await;
        let changed = {
            let mut state = self.state.lock();
            let leases = state
                .open
                .get(&handle)
                .ok_or_else(|| StorageError(format!("{handle} is not open")))?
                .leases;
            if leases > 0 {
                return Err(StorageError(format!(
                    "{handle} still has {leases} outstanding lease(s)"
                )));
            }
            if let Some(message) = state.fail_next_commit.take() {
                state.open.remove(&handle);
                return Err(StorageError(message));
            }
            let Some(txn) = state.open.remove(&handle) else {
                return Err(StorageError(format!("{handle} is not open")));
            };

            let mut changed = BTreeSet::new();
            if let Some((to, diff)) = txn.upgrade {
                for table in &diff.removed {
                    state.tables.remove(table);
                    changed.insert(table.clone());
                }
                for table in &diff.added {
                    state.tables.entry(table.clone()).or_default();
                }
                state.version = to;
            }
            for ((table, key), doc) in txn.staged {
                let rows = state.tables.entry(table.clone()).or_default();
                match doc {
                    Some(doc) => {
                        rows.insert(key, doc);
                    }
                    None => {
                        rows.remove(&key);
                    }
                }
                changed.insert(table);
            }
            state.events.push(EngineEvent::Commit(handle));
            changed
        };
        debug!(%handle, ?changed, "committed native transaction");
        self.notify(&changed);
        Ok(())
    }

    async fn rollback(&self, handle: NativeHandle) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if state.open.remove(&handle).is_none() {
            return Err(StorageError(format!("{handle} is not open")));
        }
        state.events.push(EngineEvent::Rollback(handle));
        debug!(%handle, "rolled back native transaction");
        Ok(())
    }

    fn acquire_lease(&self, handle: NativeHandle) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        let txn = state
            .open
            .get_mut(&handle)
            .ok_or_else(|| StorageError(format!("{handle} is not open")))?;
        txn.leases += 1;
        state.events.push(EngineEvent::LeaseAcquired(handle));
        Ok(())
    }

    fn heartbeat(&self, handle: NativeHandle) {
        trace!(%handle, "heartbeat");
        self.state.lock().events.push(EngineEvent::Heartbeat(handle));
    }

    fn release_lease(&self, handle: NativeHandle) {
        let mut state = self.state.lock();
        if let Some(txn) = state.open.get_mut(&handle) {
            txn.leases = txn.leases.saturating_sub(1);
        }
        state.events.push(EngineEvent::LeaseReleased(handle));
    }

    async fn get(
        &self,
        handle: NativeHandle,
        table: &str,
        key: &Value,
    ) -> Result<Option<Document>, StorageError> {
        self.pause().await;
        let encoded = encode_key(key)?;
        let mut state = self.state.lock();
        let mut rows = state.visible(handle, table)?;
        state.events.push(EngineEvent::Get {
            handle,
            table: table.to_string(),
        });
        Ok(rows.remove(&encoded))
    }

    async fn put(
        &self,
        handle: NativeHandle,
        table: &str,
        key: Value,
        doc: Document,
    ) -> Result<(), StorageError> {
        self.pause().await;
        let encoded = encode_key(&key)?;
        let mut state = self.state.lock();
        let txn = state.writable_txn(handle, table)?;
        txn.staged.insert((table.to_string(), encoded), Some(doc));
        state.events.push(EngineEvent::Put {
            handle,
            table: table.to_string(),
            key,
        });
        Ok(())
    }

    async fn delete(
        &self,
        handle: NativeHandle,
        table: &str,
        key: &Value,
    ) -> Result<bool, StorageError> {
        self.pause().await;
        let encoded = encode_key(key)?;
        let mut state = self.state.lock();
        let existed = state.visible(handle, table)?.contains_key(&encoded);
        let txn = state.writable_txn(handle, table)?;
        txn.staged.insert((table.to_string(), encoded), None);
        state.events.push(EngineEvent::Delete {
            handle,
            table: table.to_string(),
            key: key.clone(),
        });
        Ok(existed)
    }

    async fn scan(
        &self,
        handle: NativeHandle,
        table: &str,
    ) -> Result<Vec<Document>, StorageError> {
        self.pause().await;
        let mut state = self.state.lock();
        let rows = state.visible(handle, table)?;
        state.events.push(EngineEvent::Scan {
            handle,
            table: table.to_string(),
        });
        Ok(rows.into_values().collect())
    }

    fn subscribe_changes(&self, callback: ChangeCallback) -> ChangeToken {
        let token = ChangeToken(self.next_token.fetch_add(1, Ordering::Relaxed) + 1);
        self.subscribers.lock().push((token, callback));
        token
    }

    fn unsubscribe_changes(&self, token: ChangeToken) {
        self.subscribers.lock().retain(|(t, _)| *t != token);
    }

    async fn version(&self) -> Result<u32, StorageError> {
        let state = self.state.lock();
        if state.closed {
            return Err(StorageError("engine is closed".into()));
        }
        Ok(state.version)
    }

    async fn table_names(&self) -> Result<BTreeSet<String>, StorageError> {
        Ok(self.state.lock().tables.keys().cloned().collect())
    }

    async fn open_version_upgrade(
        &self,
        from: u32,
        to: u32,
        diff: &SchemaDiff,
    ) -> Result<NativeHandle, StorageError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StorageError("engine is closed".into()));
        }
        if state.version != from || to <= from {
            return Err(StorageError(format!(
                "cannot upgrade from {from} to {to} (stored version {})",
                state.version
            )));
        }
        if !state.open.is_empty() {
            return Err(StorageError(
                "version change blocked by open transactions".into(),
            ));
        }
        let mut tables: BTreeSet<String> = state
            .tables
            .keys()
            .filter(|t| !diff.removed.contains(*t))
            .cloned()
            .collect();
        tables.extend(diff.added.iter().cloned());
        let handle = state.allocate(NativeTxn {
            tables,
            mode: LockMode::ReadWrite,
            staged: BTreeMap::new(),
            leases: 0,
            upgrade: Some((to, diff.clone())),
        });
        state.events.push(EngineEvent::OpenUpgrade { handle, from, to });
        debug!(%handle, from, to, "opened version upgrade");
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().unwrap().clone()
    }

    fn set(tables: &[&str]) -> BTreeSet<String> {
        tables.iter().map(|t| t.to_string()).collect()
    }

    #[tokio::test]
    async fn staged_writes_apply_only_on_commit() {
        let engine = MemoryEngine::with_tables(["users"]);
        let h = engine
            .open_transaction(&set(&["users"]), LockMode::ReadWrite)
            .await
            .unwrap();
        engine
            .put(h, "users", json!(1), doc(json!({"_id": 1, "name": "alice"})))
            .await
            .unwrap();

        // read-your-writes inside the native transaction
        assert!(engine.get(h, "users", &json!(1)).await.unwrap().is_some());
        assert!(engine.committed("users").is_empty());

        engine.commit(h).await.unwrap();
        assert_eq!(engine.committed("users").len(), 1);
    }

    #[tokio::test]
    async fn rollback_discards_staged_writes() {
        let engine = MemoryEngine::with_tables(["users"]);
        let h = engine
            .open_transaction(&set(&["users"]), LockMode::ReadWrite)
            .await
            .unwrap();
        engine
            .put(h, "users", json!(1), doc(json!({"_id": 1})))
            .await
            .unwrap();
        engine.rollback(h).await.unwrap();
        assert!(engine.committed("users").is_empty());
        assert!(engine.rollback(h).await.is_err());
    }

    #[tokio::test]
    async fn rejects_out_of_scope_and_read_only_writes() {
        let engine = MemoryEngine::with_tables(["a", "b"]);
        let h = engine
            .open_transaction(&set(&["a"]), LockMode::Read)
            .await
            .unwrap();
        assert!(engine.scan(h, "b").await.is_err());
        assert!(engine
            .put(h, "a", json!(1), doc(json!({"_id": 1})))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn overlapping_writers_conflict() {
        let engine = MemoryEngine::with_tables(["a", "b"]);
        let _h1 = engine
            .open_transaction(&set(&["a", "b"]), LockMode::ReadWrite)
            .await
            .unwrap();
        let err = engine
            .open_transaction(&set(&["b"]), LockMode::ReadWrite)
            .await
            .unwrap_err();
        assert!(err.0.contains("locked"));
        // readers are not blocked
        engine
            .open_transaction(&set(&["b"]), LockMode::Read)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn commit_with_outstanding_lease_fails() {
        let engine = MemoryEngine::with_tables(["a"]);
        let h = engine
            .open_transaction(&set(&["a"]), LockMode::Read)
            .await
            .unwrap();
        engine.acquire_lease(h).unwrap();
        assert_eq!(engine.active_leases(h), 1);
        assert!(engine.commit(h).await.is_err());
        engine.release_lease(h);
        engine.commit(h).await.unwrap();
    }

    #[tokio::test]
    async fn closed_engine_refuses_to_open() {
        let engine = MemoryEngine::with_tables(["a"]);
        engine.close();
        assert!(engine
            .open_transaction(&set(&["a"]), LockMode::Read)
            .await
            .is_err());
    }
}
