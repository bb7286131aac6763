use std::future::Future;
use std::sync::Arc;

use crate::core::txn_stats::TxnStatsSnapshot;
use crate::live::{LiveQuery, LiveQueryInvalidator};
use crate::storage::StorageEngine;
use crate::txn::upgrade::run_version_upgrade;
use crate::txn::{Coordinator, Schema, Transaction};
use crate::TxnError;

use super::table::Table;

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Drop errors raised during the planning pass instead of failing the
    /// transaction (default: true). Usage and validation errors always fail.
    pub discard_planning_errors: bool,
    /// Heartbeat interval while a `wait_for` holds its lease.
    /// - 0 = lease only, no heartbeats
    /// - N > 0 = one heartbeat every N ms
    pub wait_for_heartbeat_ms: u64,
    /// Collect transaction counters.
    pub stats_enabled: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            discard_planning_errors: true,
            wait_for_heartbeat_ms: 25,
            stats_enabled: true,
        }
    }
}

impl DatabaseConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn discard_planning_errors(mut self, discard: bool) -> Self {
        self.discard_planning_errors = discard;
        self
    }

    pub fn wait_for_heartbeat_ms(mut self, interval_ms: u64) -> Self {
        self.wait_for_heartbeat_ms = interval_ms;
        self
    }

    pub fn stats_enabled(mut self, enabled: bool) -> Self {
        self.stats_enabled = enabled;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Database {
    schema: Schema,
    coordinator: Coordinator,
    invalidator: LiveQueryInvalidator,
}

impl Database {
    /// Open a database with default settings and no upgrade callback.
    pub async fn open(engine: Arc<dyn StorageEngine>, schema: Schema) -> Result<Self, TxnError> {
        Self::open_with_upgrade(engine, schema, DatabaseConfig::default(), |_, _, _| async {
            Ok::<(), TxnError>(())
        })
        .await
    }

    pub async fn open_with_config(
        engine: Arc<dyn StorageEngine>,
        schema: Schema,
        config: DatabaseConfig,
    ) -> Result<Self, TxnError> {
        Self::open_with_upgrade(engine, schema, config, |_, _, _| async { Ok::<(), TxnError>(()) }).await
    }

    /// Opens the database, running `upgrade(txn, from, to)` first when the
    /// stored schema version is older than `schema`.
    pub async fn open_with_upgrade<F, Fut>(
        engine: Arc<dyn StorageEngine>,
        schema: Schema,
        config: DatabaseConfig,
        upgrade: F,
    ) -> Result<Self, TxnError>
    where
        F: FnOnce(Transaction, u32, u32) -> Fut,
        Fut: Future<Output = Result<(), TxnError>>,
    {
        let coordinator = Coordinator::with_config(engine, &config);
        run_version_upgrade(&coordinator, &schema, upgrade).await?;
        let invalidator = LiveQueryInvalidator::new(coordinator.clone());
        Ok(Self {
            schema,
            coordinator,
            invalidator,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn live_queries(&self) -> &LiveQueryInvalidator {
        &self.invalidator
    }

    /// A handle on `name`. Tables outside the schema are rejected by the
    /// engine when the transaction opens.
    pub fn table(&self, name: &str) -> Table {
        Table::new(name)
    }

    pub async fn transaction<T, F, Fut>(&self, f: F) -> Result<T, TxnError>
    where
        F: Fn(Transaction) -> Fut,
        Fut: Future<Output = Result<T, TxnError>>,
    {
        self.coordinator.run(f).await
    }

    pub async fn parallel<T, F, Fut>(&self, branches: Vec<F>) -> Result<Vec<T>, TxnError>
    where
        F: Fn(Transaction) -> Fut,
        Fut: Future<Output = Result<T, TxnError>>,
    {
        self.coordinator.run_parallel(None, branches).await
    }

    /// Subscribes to the results of `query`, re-run after every commit.
    /// Must be called from within a tokio runtime.
    pub fn live_query<T, F, Fut>(&self, query: F) -> Result<LiveQuery<T>, TxnError>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(Coordinator) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TxnError>> + Send + 'static,
    {
        let coordinator = self.coordinator.clone();
        self.invalidator
            .subscribe(move || query(coordinator.clone()))
    }

    pub fn stats(&self) -> TxnStatsSnapshot {
        self.coordinator.stats().snapshot()
    }
}
