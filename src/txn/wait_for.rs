//! Awaiting external work from inside an open native transaction.
//!
//! Some engines finalize a native transaction as soon as it has no request in
//! flight. While a closure awaits something that is not an engine call, the
//! broker holds a lease on the native handle (and optionally heartbeats it) so
//! the transaction stays open until the closure resumes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::trace;

use super::context::Transaction;
use crate::core::txn_stats::TxnStatKind;
use crate::storage::{NativeHandle, StorageEngine};
use crate::TxnError;

#[derive(Debug, Clone)]
pub struct WaitForBroker {
    heartbeat: Option<Duration>,
}

impl WaitForBroker {
    /// `heartbeat_ms == 0` disables heartbeats; the lease is still held.
    pub fn new(heartbeat_ms: u64) -> Self {
        Self {
            heartbeat: (heartbeat_ms > 0).then(|| Duration::from_millis(heartbeat_ms)),
        }
    }

    pub fn heartbeat(&self) -> Option<Duration> {
        self.heartbeat
    }

    pub async fn wait_for<T, F, Fut>(&self, txn: &Transaction, op: F) -> Result<T, TxnError>
    where
        T: Default,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TxnError>>,
    {
        if txn.is_planning_phase() {
            trace!(txn = txn.id(), "wait_for resolved without running during planning");
            return Ok(T::default());
        }

        let handle = txn.current_native_handle()?;
        let _pending = txn.begin_wait()?;
        let engine = Arc::clone(txn.engine());
        let lease = Lease::acquire(engine.clone(), handle)
            .map_err(|e| txn.abort_with(TxnError::Storage(e)))?;
        let _timer = txn.stats().begin_wait();

        let operation = op();
        tokio::pin!(operation);

        let outcome = match self.heartbeat {
            Some(period) => {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        out = &mut operation => break Some(out),
                        _ = txn.aborted() => break None,
                        _ = ticker.tick() => {
                            engine.heartbeat(handle);
                            txn.stats().record(TxnStatKind::Heartbeat);
                        }
                    }
                }
            }
            None => {
                tokio::select! {
                    out = &mut operation => Some(out),
                    _ = txn.aborted() => None,
                }
            }
        };
        drop(lease);

        match outcome {
            Some(Ok(value)) => Ok(value),
            Some(Err(err)) => Err(txn.abort_with(err)),
            None => Err(TxnError::Aborted(txn.abort_message())),
        }
    }
}

struct Lease {
    engine: Arc<dyn StorageEngine>,
    handle: NativeHandle,
}

impl Lease {
    fn acquire(
        engine: Arc<dyn StorageEngine>,
        handle: NativeHandle,
    ) -> Result<Self, crate::core::errors::StorageError> {
        engine.acquire_lease(handle)?;
        Ok(Self { engine, handle })
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.engine.release_lease(self.handle);
    }
}
