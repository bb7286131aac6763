//! Live queries: subscriptions whose results are recomputed after commits.
//!
//! The invalidator listens to the engine's change feed while at least one
//! subscription is alive. Every committed change wakes all subscriptions.
//! Wake-ups arriving while a query is still running collapse into a single
//! follow-up run, and a result equal to the last delivered one is not
//! delivered again.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::core::txn_stats::{TxnStatKind, TxnStats};
use crate::storage::{ChangeCallback, ChangeToken};
use crate::txn::Coordinator;
use crate::TxnError;

pub type SubscriptionId = u64;

/// What a subscriber sees: the latest result, or the error the latest run
/// failed with.
pub type LiveResult<T> = Result<T, Arc<TxnError>>;

#[derive(Default)]
struct InvalidatorState {
    feed: Option<ChangeToken>,
    subscriptions: HashMap<SubscriptionId, Arc<Notify>>,
    next_id: SubscriptionId,
}

struct InvalidatorInner {
    coordinator: Coordinator,
    state: Mutex<InvalidatorState>,
}

impl InvalidatorInner {
    fn invalidate(&self, changed: &BTreeSet<String>) {
        let wakes: Vec<Arc<Notify>> = self.state.lock().subscriptions.values().cloned().collect();
        trace!(?changed, subscriptions = wakes.len(), "invalidating live queries");
        for wake in wakes {
            wake.notify_one();
        }
    }
}

#[derive(Clone)]
pub struct LiveQueryInvalidator {
    inner: Arc<InvalidatorInner>,
}

impl fmt::Debug for LiveQueryInvalidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("LiveQueryInvalidator")
            .field("subscriptions", &state.subscriptions.len())
            .field("listening", &state.feed.is_some())
            .finish()
    }
}

impl LiveQueryInvalidator {
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            inner: Arc::new(InvalidatorInner {
                coordinator,
                state: Mutex::new(InvalidatorState::default()),
            }),
        }
    }

    /// Starts a subscription. `query` runs once right away and again after
    /// every commit. Fails outside a tokio runtime.
    pub fn subscribe<T, F, Fut>(&self, query: F) -> Result<LiveQuery<T>, TxnError>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, TxnError>> + Send + 'static,
    {
        let runtime = Handle::try_current()
            .map_err(|_| TxnError::usage("live queries need a running tokio runtime"))?;

        let wake = Arc::new(Notify::new());
        // stored permit: the first run happens without waiting for a commit
        wake.notify_one();

        let id = {
            let mut state = self.inner.state.lock();
            state.next_id += 1;
            let id = state.next_id;
            state.subscriptions.insert(id, Arc::clone(&wake));
            if state.feed.is_none() {
                let token = self
                    .inner
                    .coordinator
                    .engine()
                    .subscribe_changes(self.change_callback());
                debug!(?token, "listening to engine changes");
                state.feed = Some(token);
            }
            id
        };

        let (sender, receiver) = watch::channel(None);
        let stats = Arc::clone(self.inner.coordinator.stats());
        let runner = runtime.spawn(run_subscription(id, query, wake, sender, stats));
        debug!(subscription = id, "live query subscribed");

        Ok(LiveQuery {
            id,
            receiver,
            shared: Arc::new(SubscriptionShared {
                subscribers: AtomicUsize::new(1),
                runner: Mutex::new(Some(runner)),
                invalidator: self.clone(),
            }),
        })
    }

    pub fn active_subscriptions(&self) -> usize {
        self.inner.state.lock().subscriptions.len()
    }

    /// Whether the engine's change feed is currently subscribed.
    pub fn is_listening(&self) -> bool {
        self.inner.state.lock().feed.is_some()
    }

    /// Wakes every subscription as if `changed` had just been committed.
    pub fn invalidate(&self, changed: &BTreeSet<String>) {
        self.inner.invalidate(changed);
    }

    fn change_callback(&self) -> ChangeCallback {
        let inner: Weak<InvalidatorInner> = Arc::downgrade(&self.inner);
        Arc::new(move |changed: &BTreeSet<String>| {
            if let Some(inner) = inner.upgrade() {
                inner.invalidate(changed);
            }
        })
    }

    fn unregister(&self, id: SubscriptionId) {
        let feed = {
            let mut state = self.inner.state.lock();
            state.subscriptions.remove(&id);
            if state.subscriptions.is_empty() {
                state.feed.take()
            } else {
                None
            }
        };
        debug!(subscription = id, "live query torn down");
        if let Some(token) = feed {
            self.inner.coordinator.engine().unsubscribe_changes(token);
            debug!(?token, "stopped listening to engine changes");
        }
    }
}

async fn run_subscription<T, F, Fut>(
    id: SubscriptionId,
    query: F,
    wake: Arc<Notify>,
    sender: watch::Sender<Option<LiveResult<T>>>,
    stats: Arc<TxnStats>,
) where
    T: Clone + PartialEq,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, TxnError>>,
{
    let mut last: Option<T> = None;
    loop {
        wake.notified().await;
        stats.record(TxnStatKind::LiveQueryRun);
        match query().await {
            Ok(value) => {
                if last.as_ref() == Some(&value) {
                    stats.record(TxnStatKind::LiveQuerySuppressed);
                    trace!(subscription = id, "live query result unchanged");
                    continue;
                }
                last = Some(value.clone());
                sender.send_replace(Some(Ok(value)));
            }
            Err(err) => {
                warn!(subscription = id, error = %err, "live query failed");
                last = None;
                sender.send_replace(Some(Err(Arc::new(err))));
            }
        }
    }
}

struct SubscriptionShared {
    subscribers: AtomicUsize,
    runner: Mutex<Option<JoinHandle<()>>>,
    invalidator: LiveQueryInvalidator,
}

/// Handle on a live query subscription. Clones share the subscription; it is
/// torn down when the last handle is dropped.
pub struct LiveQuery<T> {
    id: SubscriptionId,
    receiver: watch::Receiver<Option<LiveResult<T>>>,
    shared: Arc<SubscriptionShared>,
}

impl<T> fmt::Debug for LiveQuery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQuery")
            .field("id", &self.id)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl<T: Clone> LiveQuery<T> {
    /// The most recently delivered result, if any run has finished.
    pub fn latest(&self) -> Option<LiveResult<T>> {
        (*self.receiver.borrow()).clone()
    }

    /// Waits for a result this handle has not seen yet. Returns `None` once
    /// the subscription is gone.
    pub async fn changed(&mut self) -> Option<LiveResult<T>> {
        self.receiver.changed().await.ok()?;
        (*self.receiver.borrow_and_update()).clone()
    }
}

impl<T> LiveQuery<T> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.load(Ordering::Acquire)
    }
}

impl<T> Clone for LiveQuery<T> {
    fn clone(&self) -> Self {
        self.shared.subscribers.fetch_add(1, Ordering::AcqRel);
        Self {
            id: self.id,
            receiver: self.receiver.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for LiveQuery<T> {
    fn drop(&mut self) {
        if self.shared.subscribers.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if let Some(runner) = self.shared.runner.lock().take() {
            runner.abort();
        }
        self.shared.invalidator.unregister(self.id);
    }
}
