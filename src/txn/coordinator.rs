//! Two-pass transaction coordination.
//!
//! The engine wants the table set and lock mode of a native transaction up
//! front, while transaction closures discover their tables as they go. The
//! coordinator therefore runs every closure twice: a planning pass where
//! table operations only register their table and return stand-in values,
//! then an executing pass inside a native transaction opened for exactly the
//! planned tables.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, trace, warn};

use super::context::Transaction;
use super::upgrade::Schema;
use super::wait_for::WaitForBroker;
use super::{TransactionKind, TxnId};
use crate::core::errors::BranchFailure;
use crate::core::txn_stats::{TxnStatKind, TxnStats};
use crate::engine::DatabaseConfig;
use crate::storage::{NativeHandle, StorageEngine};
use crate::TxnError;

struct CoordinatorInner {
    engine: Arc<dyn StorageEngine>,
    stats: Arc<TxnStats>,
    broker: WaitForBroker,
    next_txn_id: AtomicU64,
    discard_planning_errors: bool,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<CoordinatorInner>,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field("discard_planning_errors", &self.inner.discard_planning_errors)
            .field("broker", &self.inner.broker)
            .finish()
    }
}

impl Coordinator {
    pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
        Self::with_config(engine, &DatabaseConfig::default())
    }

    pub fn with_config(engine: Arc<dyn StorageEngine>, config: &DatabaseConfig) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                engine,
                stats: Arc::new(TxnStats::new(config.stats_enabled)),
                broker: WaitForBroker::new(config.wait_for_heartbeat_ms),
                next_txn_id: AtomicU64::new(0),
                discard_planning_errors: config.discard_planning_errors,
            }),
        }
    }

    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.inner.engine
    }

    pub fn stats(&self) -> &Arc<TxnStats> {
        &self.inner.stats
    }

    pub fn broker(&self) -> &WaitForBroker {
        &self.inner.broker
    }

    fn allocate_txn_id(&self) -> TxnId {
        self.inner.next_txn_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn new_context(&self, kind: TransactionKind) -> Transaction {
        Transaction::new_root(self.allocate_txn_id(), kind, self.clone())
    }

    pub(crate) fn upgrade_context(&self, native: NativeHandle, schema: &Schema) -> Transaction {
        Transaction::new_upgrade(
            self.allocate_txn_id(),
            self.clone(),
            native,
            schema.table_names(),
        )
    }

    /// Runs `f` as a top-level transaction.
    ///
    /// `f` is invoked twice: once to plan which tables it touches and once
    /// for real inside the native transaction. Side effects outside table
    /// operations belong in [`Transaction::wait_for`].
    pub async fn run<T, F, Fut>(&self, f: F) -> Result<T, TxnError>
    where
        F: Fn(Transaction) -> Fut,
        Fut: Future<Output = Result<T, TxnError>>,
    {
        let txn = self.new_context(TransactionKind::TopLevel);
        self.drive(txn, &f).await
    }

    /// Runs `f` inside `parent`, sharing its ledger, phase and native
    /// transaction. A failure while executing aborts the whole parent.
    pub async fn run_nested<T, F, Fut>(
        &self,
        parent: Option<&Transaction>,
        f: F,
    ) -> Result<T, TxnError>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T, TxnError>>,
    {
        let parent = parent.ok_or_else(|| {
            TxnError::usage("a nested transaction needs an enclosing transaction")
        })?;
        parent.ensure_open()?;

        match f(parent.nested_handle()).await {
            Ok(value) => Ok(value),
            Err(err) if parent.is_planning_phase() => Err(err),
            Err(err) => Err(parent.abort_with(err)),
        }
    }

    /// Runs each branch as an independent transaction with its own two-pass
    /// cycle. The branches are driven concurrently and all of them run to
    /// completion even when one fails. Branches commit only if every branch
    /// succeeded; otherwise every opened native transaction is rolled back.
    ///
    /// With a `parent`, the parallel composition has to be the only content
    /// of that parent. While the parent is planning nothing runs and an empty
    /// `Vec` is returned.
    pub async fn run_parallel<T, F, Fut>(
        &self,
        parent: Option<&Transaction>,
        branches: Vec<F>,
    ) -> Result<Vec<T>, TxnError>
    where
        F: Fn(Transaction) -> Fut,
        Fut: Future<Output = Result<T, TxnError>>,
    {
        if let Some(parent) = parent {
            if parent.claim_for_parallel()? {
                trace!(txn = parent.id(), branches = branches.len(), "parallel deferred until executing");
                return Ok(Vec::new());
            }
        }

        let total = branches.len();
        let executed = join_all(branches.iter().map(|f| self.execute_branch(f))).await;
        let all_succeeded = executed.iter().all(BranchOutcome::succeeded);
        if !all_succeeded {
            debug!(total, "parallel branch failed, rolling back every branch");
        }

        let mut values = Vec::with_capacity(total);
        let mut failures = Vec::new();
        for (index, outcome) in executed.into_iter().enumerate() {
            let settled = match outcome {
                BranchOutcome::NotStarted(err) => Err(err),
                BranchOutcome::Executed(txn, outcome) => {
                    let failed = outcome.is_err() || txn.is_aborted();
                    if all_succeeded || failed {
                        txn.finish(outcome).await
                    } else {
                        let sibling = TxnError::aborted("a sibling parallel transaction failed");
                        let _ = txn.finish::<T>(Err(sibling)).await;
                        continue;
                    }
                }
            };
            match settled {
                Ok(value) => values.push(value),
                Err(error) => failures.push(BranchFailure { index, error }),
            }
        }
        if failures.is_empty() {
            Ok(values)
        } else {
            warn!(total, failed = failures.len(), "parallel transaction failed");
            Err(TxnError::ParallelFailed { total, failures })
        }
    }

    /// Runs `f` as a transaction of `kind`.
    ///
    /// `Parallel` is a parallel composition of the single branch `f`; while
    /// its parent is still planning it yields `T::default()`. `Upgrade`
    /// contexts are only created by the version upgrade and are rejected here.
    pub async fn run_as<T, F, Fut>(
        &self,
        kind: TransactionKind,
        parent: Option<&Transaction>,
        f: F,
    ) -> Result<T, TxnError>
    where
        T: Default,
        F: Fn(Transaction) -> Fut,
        Fut: Future<Output = Result<T, TxnError>>,
    {
        match kind {
            TransactionKind::TopLevel => self.run(f).await,
            TransactionKind::Nested => self.run_nested(parent, f).await,
            TransactionKind::Parallel => Ok(self
                .run_parallel(parent, vec![f])
                .await?
                .pop()
                .unwrap_or_default()),
            TransactionKind::Upgrade => Err(TxnError::usage(
                "upgrade transactions are started by the schema upgrade only",
            )),
        }
    }

    async fn drive<T, F, Fut>(&self, txn: Transaction, f: &F) -> Result<T, TxnError>
    where
        F: Fn(Transaction) -> Fut,
        Fut: Future<Output = Result<T, TxnError>>,
    {
        self.plan_and_open(&txn, f).await?;
        self.stats().record(TxnStatKind::ExecutingPass);
        let outcome = f(txn.clone()).await;
        txn.finish(outcome).await
    }

    /// Runs the executing pass of one parallel branch but leaves its native
    /// transaction open, so the composition can decide how it ends.
    async fn execute_branch<T, F, Fut>(&self, f: &F) -> BranchOutcome<T>
    where
        F: Fn(Transaction) -> Fut,
        Fut: Future<Output = Result<T, TxnError>>,
    {
        let txn = self.new_context(TransactionKind::Parallel);
        if let Err(err) = self.plan_and_open(&txn, f).await {
            return BranchOutcome::NotStarted(err);
        }
        self.stats().record(TxnStatKind::ExecutingPass);
        let outcome = f(txn.clone()).await;
        BranchOutcome::Executed(txn, outcome)
    }

    /// Planning pass, then opens the native transaction for the frozen plan
    /// and moves `txn` to Executing.
    async fn plan_and_open<T, F, Fut>(&self, txn: &Transaction, f: &F) -> Result<(), TxnError>
    where
        F: Fn(Transaction) -> Fut,
        Fut: Future<Output = Result<T, TxnError>>,
    {
        let stats = self.stats();

        stats.record(TxnStatKind::PlanningPass);
        if let Err(err) = f(txn.clone()).await {
            if err.is_phase_independent() || !self.inner.discard_planning_errors {
                txn.fail_before_executing();
                return Err(err.into_boundary());
            }
            stats.record(TxnStatKind::PlanningErrorDiscarded);
            debug!(txn = txn.id(), error = %err, "discarding planning-pass error");
        }

        let native = match txn.freeze_plan()? {
            Some(plan) => {
                match self.engine().open_transaction(&plan.tables, plan.mode).await {
                    Ok(handle) => {
                        stats.record(TxnStatKind::NativeOpen);
                        debug!(txn = txn.id(), %handle, tables = ?plan.tables, mode = ?plan.mode, "executing");
                        Some(handle)
                    }
                    Err(err) => {
                        warn!(txn = txn.id(), error = %err, "engine refused to open native transaction");
                        txn.fail_before_executing();
                        return Err(TxnError::Storage(err).into_boundary());
                    }
                }
            }
            None => None,
        };

        txn.enter_executing(native);
        Ok(())
    }
}

enum BranchOutcome<T> {
    /// Failed before a native transaction was opened.
    NotStarted(TxnError),
    /// Executing pass done; the native transaction is still open.
    Executed(Transaction, Result<T, TxnError>),
}

impl<T> BranchOutcome<T> {
    fn succeeded(&self) -> bool {
        matches!(self, BranchOutcome::Executed(txn, Ok(_)) if !txn.is_aborted())
    }
}
