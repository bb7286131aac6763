//! Per-transaction state: phase, table ledger, native handle and abort state.
//!
//! A [`Transaction`] is a cheap handle. Nested handles point at the state of
//! the root transaction that created them, so they share its ledger, phase and
//! native handle and never own any of them.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use super::coordinator::Coordinator;
use super::ledger::{LedgerSnapshot, TableUsageLedger};
use super::{LockMode, Phase, TransactionKind, TxnId};
use crate::core::errors::StorageError;
use crate::core::txn_stats::{TxnStatKind, TxnStats};
use crate::storage::{NativeHandle, StorageEngine};
use crate::TxnError;

struct TxnState {
    phase: Phase,
    ledger: TableUsageLedger,
    native: Option<NativeHandle>,
    abort_reason: Option<TxnError>,
    abort_message: Option<String>,
    pending_wait: bool,
    // The root's only content is a parallel composition.
    delegated: bool,
}

struct TxnShared {
    id: TxnId,
    root_kind: TransactionKind,
    coordinator: Coordinator,
    state: Mutex<TxnState>,
    aborted: Notify,
}

#[derive(Clone)]
pub struct Transaction {
    shared: Arc<TxnShared>,
    kind: TransactionKind,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.shared.id)
            .field("kind", &self.kind)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new_root(id: TxnId, kind: TransactionKind, coordinator: Coordinator) -> Self {
        Self::with_state(
            id,
            kind,
            coordinator,
            TxnState {
                phase: Phase::Planning,
                ledger: TableUsageLedger::new(),
                native: None,
                abort_reason: None,
                abort_message: None,
                pending_wait: false,
                delegated: false,
            },
        )
    }

    /// A context that starts out executing inside a native transaction the
    /// engine opened for a version change. Every declared table is usable in
    /// ReadWrite mode.
    pub(crate) fn new_upgrade<'a, I>(
        id: TxnId,
        coordinator: Coordinator,
        native: NativeHandle,
        tables: I,
    ) -> Self
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut ledger = TableUsageLedger::new();
        for table in tables {
            ledger.register(table, LockMode::ReadWrite);
        }
        ledger.freeze();
        Self::with_state(
            id,
            TransactionKind::Upgrade,
            coordinator,
            TxnState {
                phase: Phase::Executing,
                ledger,
                native: Some(native),
                abort_reason: None,
                abort_message: None,
                pending_wait: false,
                delegated: false,
            },
        )
    }

    fn with_state(
        id: TxnId,
        kind: TransactionKind,
        coordinator: Coordinator,
        state: TxnState,
    ) -> Self {
        Self {
            shared: Arc::new(TxnShared {
                id,
                root_kind: kind,
                coordinator,
                state: Mutex::new(state),
                aborted: Notify::new(),
            }),
            kind,
        }
    }

    /// A handle for a nested run. It shares this transaction's root state.
    pub(crate) fn nested_handle(&self) -> Transaction {
        Transaction {
            shared: Arc::clone(&self.shared),
            kind: TransactionKind::Nested,
        }
    }

    pub fn id(&self) -> TxnId {
        self.shared.id
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    /// Kind of the root this handle belongs to.
    pub fn root_kind(&self) -> TransactionKind {
        self.shared.root_kind
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.lock().phase
    }

    pub fn is_planning_phase(&self) -> bool {
        self.phase() == Phase::Planning
    }

    pub fn is_aborted(&self) -> bool {
        self.phase() == Phase::Aborted
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.shared.coordinator
    }

    pub(crate) fn engine(&self) -> &Arc<dyn StorageEngine> {
        self.shared.coordinator.engine()
    }

    pub(crate) fn stats(&self) -> &Arc<TxnStats> {
        self.shared.coordinator.stats()
    }

    pub fn ledger_snapshot(&self) -> LedgerSnapshot {
        self.shared.state.lock().ledger.snapshot()
    }

    /// Records that the caller is about to use `table` in `mode`.
    ///
    /// While planning this grows the ledger. Once executing, the table must
    /// already be covered by the plan; anything else aborts the transaction.
    pub fn register_table_usage(&self, table: &str, mode: LockMode) -> Result<(), TxnError> {
        if table.is_empty() {
            return Err(TxnError::usage("table name must not be empty"));
        }
        let mut state = self.shared.state.lock();
        let phase = state.phase;
        match phase {
            Phase::Planning => {
                if state.delegated {
                    return Err(TxnError::usage(format!(
                        "table '{table}' used next to a parallel composition; \
                         parallel transactions must be the sole content of their enclosing transaction"
                    )));
                }
                if state.ledger.register(table, mode) {
                    trace!(txn = self.shared.id, table, ?mode, "registered table usage");
                }
                Ok(())
            }
            Phase::Executing => {
                if state.ledger.permits(table, mode) {
                    return Ok(());
                }
                let message = match state.ledger.mode_of(table) {
                    Some(planned) => format!(
                        "table '{table}' was planned as {planned:?} but used as {mode:?}"
                    ),
                    None => format!("table '{table}' was not used during the planning pass"),
                };
                drop(state);
                Err(self.abort_with(TxnError::Usage(message)))
            }
            Phase::Aborted => Err(TxnError::Aborted(abort_message(&state))),
            Phase::Completed => Err(TxnError::usage("transaction has already completed")),
        }
    }

    /// The native transaction this context executes in.
    pub fn current_native_handle(&self) -> Result<NativeHandle, TxnError> {
        let state = self.shared.state.lock();
        let phase = state.phase;
        match phase {
            Phase::Executing => state.native.ok_or_else(|| {
                TxnError::usage("transaction delegates to parallel branches and has no native transaction")
            }),
            Phase::Planning => Err(TxnError::usage(
                "no native transaction is open during the planning pass",
            )),
            Phase::Aborted => Err(TxnError::Aborted(abort_message(&state))),
            Phase::Completed => Err(TxnError::usage("transaction has already completed")),
        }
    }

    /// Aborts the transaction. The first reason wins; later calls are no-ops.
    ///
    /// During the planning pass this does nothing: the values planning code
    /// sees are stand-ins, so the executing pass decides for real. An abort
    /// requested while planning has to be issued again in the executing pass.
    pub fn abort(&self, reason: TxnError) {
        let mut state = self.shared.state.lock();
        let phase = state.phase;
        match phase {
            Phase::Executing => self.record_abort(&mut state, reason),
            Phase::Planning => {
                trace!(txn = self.shared.id, %reason, "abort ignored during planning")
            }
            Phase::Aborted | Phase::Completed => {
                trace!(txn = self.shared.id, %reason, "abort after finish ignored")
            }
        }
    }

    /// Records `err` as the abort reason and returns the error the failing
    /// operation should hand back to its caller.
    pub(crate) fn abort_with(&self, err: TxnError) -> TxnError {
        let mut state = self.shared.state.lock();
        let phase = state.phase;
        match phase {
            Phase::Executing => {
                let propagated = match &err {
                    TxnError::Usage(message) => TxnError::Usage(message.clone()),
                    other => TxnError::Aborted(other.to_string()),
                };
                self.record_abort(&mut state, err);
                propagated
            }
            Phase::Aborted => TxnError::Aborted(abort_message(&state)),
            Phase::Planning | Phase::Completed => err,
        }
    }

    fn record_abort(&self, state: &mut TxnState, reason: TxnError) {
        if state.abort_reason.is_some() {
            return;
        }
        debug!(txn = self.shared.id, %reason, "transaction aborted");
        state.abort_message = Some(reason.to_string());
        state.abort_reason = Some(reason);
        state.phase = Phase::Aborted;
        self.shared.aborted.notify_waiters();
    }

    /// Resolves once the transaction has been aborted.
    pub(crate) async fn aborted(&self) {
        loop {
            let notified = self.shared.aborted.notified();
            if self.is_aborted() {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn abort_message(&self) -> String {
        abort_message(&self.shared.state.lock())
    }

    /// Fails fast if the root can no longer run operations.
    pub(crate) fn ensure_open(&self) -> Result<(), TxnError> {
        let state = self.shared.state.lock();
        let phase = state.phase;
        match phase {
            Phase::Planning | Phase::Executing => Ok(()),
            Phase::Aborted => Err(TxnError::Aborted(abort_message(&state))),
            Phase::Completed => Err(TxnError::usage("transaction has already completed")),
        }
    }

    /// Runs one table operation. The planning short-circuit lives here so
    /// that table operations never repeat it: while planning, `planned` is
    /// returned without touching the engine.
    pub(crate) async fn perform<T, F, Fut>(
        &self,
        table: &str,
        mode: LockMode,
        planned: T,
        op: F,
    ) -> Result<T, TxnError>
    where
        F: FnOnce(Arc<dyn StorageEngine>, NativeHandle) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        self.register_table_usage(table, mode)?;
        if self.is_planning_phase() {
            return Ok(planned);
        }
        let handle = self.current_native_handle()?;
        op(Arc::clone(self.engine()), handle)
            .await
            .map_err(|e| self.abort_with(TxnError::Storage(e)))
    }

    /// Awaits `op` while keeping the native transaction alive.
    ///
    /// During planning `op` is not invoked and `T::default()` is returned.
    pub async fn wait_for<T, F, Fut>(&self, op: F) -> Result<T, TxnError>
    where
        T: Default,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TxnError>>,
    {
        let broker = self.coordinator().broker().clone();
        broker.wait_for(self, op).await
    }

    /// Runs `f` as a nested transaction of this one.
    pub async fn nested<T, F, Fut>(&self, f: F) -> Result<T, TxnError>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T, TxnError>>,
    {
        self.coordinator().run_nested(Some(self), f).await
    }

    /// Runs `branches` as parallel transactions; must be the only thing this
    /// transaction does.
    pub async fn parallel<T, F, Fut>(&self, branches: Vec<F>) -> Result<Vec<T>, TxnError>
    where
        F: Fn(Transaction) -> Fut,
        Fut: Future<Output = Result<T, TxnError>>,
    {
        self.coordinator().run_parallel(Some(self), branches).await
    }

    pub(crate) fn begin_wait(&self) -> Result<PendingWait, TxnError> {
        let mut state = self.shared.state.lock();
        if state.pending_wait {
            return Err(TxnError::usage(
                "only one wait_for may be outstanding per transaction",
            ));
        }
        state.pending_wait = true;
        Ok(PendingWait { txn: self.clone() })
    }

    /// Marks the root as delegating to a parallel composition. Returns true
    /// while planning, when the branches must not run yet.
    pub(crate) fn claim_for_parallel(&self) -> Result<bool, TxnError> {
        let mut state = self.shared.state.lock();
        let phase = state.phase;
        match phase {
            Phase::Planning if state.ledger.is_empty() => {
                state.delegated = true;
                Ok(true)
            }
            Phase::Executing if state.delegated && state.ledger.is_empty() => Ok(false),
            Phase::Planning | Phase::Executing => Err(TxnError::usage(
                "parallel transactions must be the sole content of their enclosing transaction",
            )),
            Phase::Aborted => Err(TxnError::Aborted(abort_message(&state))),
            Phase::Completed => Err(TxnError::usage("transaction has already completed")),
        }
    }

    /// Freezes the ledger after the planning pass. `None` means the root only
    /// delegates to parallel branches and needs no native transaction.
    pub(crate) fn freeze_plan(&self) -> Result<Option<LedgerSnapshot>, TxnError> {
        let mut state = self.shared.state.lock();
        if state.phase != Phase::Planning {
            return Err(TxnError::usage(format!(
                "cannot plan a transaction that is {}",
                state.phase
            )));
        }
        state.ledger.freeze();
        if !state.ledger.is_empty() {
            return Ok(Some(state.ledger.snapshot()));
        }
        if state.delegated {
            return Ok(None);
        }
        state.phase = Phase::Aborted;
        Err(TxnError::usage("transaction did not use any table"))
    }

    pub(crate) fn enter_executing(&self, native: Option<NativeHandle>) {
        let mut state = self.shared.state.lock();
        debug_assert_eq!(state.phase, Phase::Planning);
        state.native = native;
        state.phase = Phase::Executing;
    }

    pub(crate) fn fail_before_executing(&self) {
        let mut state = self.shared.state.lock();
        state.phase = Phase::Aborted;
        state.ledger.clear();
    }

    /// Commits or rolls back depending on `outcome` and any recorded abort,
    /// and releases the native handle.
    pub(crate) async fn finish<T>(&self, outcome: Result<T, TxnError>) -> Result<T, TxnError> {
        let (native, reason) = {
            let mut state = self.shared.state.lock();
            (state.native.take(), state.abort_reason.take())
        };
        let stats = self.stats();
        let engine = self.engine();

        let cause = match (reason, outcome) {
            (Some(reason), _) => reason,
            (None, Err(err)) => err,
            (None, Ok(value)) => {
                if let Some(handle) = native {
                    if let Err(err) = engine.commit(handle).await {
                        warn!(txn = self.shared.id, %handle, error = %err, "commit failed");
                        self.settle(Phase::Aborted);
                        return Err(TxnError::Storage(err).into_boundary());
                    }
                    stats.record(TxnStatKind::Commit);
                }
                self.settle(Phase::Completed);
                debug!(txn = self.shared.id, "transaction committed");
                return Ok(value);
            }
        };

        self.settle(Phase::Aborted);
        if let Some(handle) = native {
            stats.record(TxnStatKind::Rollback);
            if let Err(err) = engine.rollback(handle).await {
                warn!(txn = self.shared.id, %handle, error = %err, "rollback failed");
            }
        }
        debug!(txn = self.shared.id, error = %cause, "transaction rolled back");
        Err(cause.into_boundary())
    }

    fn settle(&self, phase: Phase) {
        let mut state = self.shared.state.lock();
        if phase == Phase::Aborted && state.abort_message.is_none() {
            state.abort_message = Some("transaction failed".into());
        }
        state.phase = phase;
        state.ledger.clear();
        drop(state);
        if phase == Phase::Aborted {
            self.shared.aborted.notify_waiters();
        }
    }
}

fn abort_message(state: &TxnState) -> String {
    state
        .abort_message
        .clone()
        .unwrap_or_else(|| "transaction aborted".to_string())
}

/// At most one wait-for per transaction; cleared on drop.
pub(crate) struct PendingWait {
    txn: Transaction,
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        self.txn.shared.state.lock().pending_wait = false;
    }
}
