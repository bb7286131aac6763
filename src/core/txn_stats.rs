use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatKind {
    PlanningPass,
    ExecutingPass,
    PlanningErrorDiscarded,
    NativeOpen,
    Commit,
    Rollback,
    Heartbeat,
    LiveQueryRun,
    LiveQuerySuppressed,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct WaitCounterSnapshot {
    pub waits: u64,
    pub wait_ns: u64,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct TxnStatsSnapshot {
    pub planning_passes: u64,
    pub executing_passes: u64,
    pub planning_errors_discarded: u64,
    pub native_opens: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub heartbeats: u64,
    pub live_query_runs: u64,
    pub live_query_suppressed: u64,
    pub wait_for: WaitCounterSnapshot,
}

#[derive(Debug, Default)]
struct WaitCounter {
    waits: AtomicU64,
    wait_ns: AtomicU64,
}

impl WaitCounter {
    fn record(&self, held: Duration) {
        self.waits.fetch_add(1, Ordering::Relaxed);
        self.wait_ns
            .fetch_add(duration_as_u64_ns(held), Ordering::Relaxed);
    }

    fn snapshot(&self) -> WaitCounterSnapshot {
        WaitCounterSnapshot {
            waits: self.waits.load(Ordering::Relaxed),
            wait_ns: self.wait_ns.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.waits.store(0, Ordering::Relaxed);
        self.wait_ns.store(0, Ordering::Relaxed);
    }
}

/// Counters shared by a coordinator, its transactions and its live queries.
#[derive(Debug)]
pub struct TxnStats {
    enabled: AtomicBool,
    counters: [AtomicU64; 9],
    wait_for: WaitCounter,
}

impl Default for TxnStats {
    fn default() -> Self {
        Self::new(true)
    }
}

impl TxnStats {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            counters: Default::default(),
            wait_for: WaitCounter::default(),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn record(&self, kind: TxnStatKind) {
        if !self.enabled() {
            return;
        }
        self.counters[slot(kind)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, kind: TxnStatKind) -> u64 {
        self.counters[slot(kind)].load(Ordering::Relaxed)
    }

    /// Starts timing a wait-for; the time is recorded when the guard drops.
    pub fn begin_wait(self: &Arc<Self>) -> WaitHoldGuard {
        WaitHoldGuard {
            stats: Arc::clone(self),
            start: Instant::now(),
            enabled: self.enabled(),
        }
    }

    pub fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
        self.wait_for.reset();
    }

    pub fn snapshot(&self) -> TxnStatsSnapshot {
        use TxnStatKind::*;
        TxnStatsSnapshot {
            planning_passes: self.get(PlanningPass),
            executing_passes: self.get(ExecutingPass),
            planning_errors_discarded: self.get(PlanningErrorDiscarded),
            native_opens: self.get(NativeOpen),
            commits: self.get(Commit),
            rollbacks: self.get(Rollback),
            heartbeats: self.get(Heartbeat),
            live_query_runs: self.get(LiveQueryRun),
            live_query_suppressed: self.get(LiveQuerySuppressed),
            wait_for: self.wait_for.snapshot(),
        }
    }
}

fn slot(kind: TxnStatKind) -> usize {
    match kind {
        TxnStatKind::PlanningPass => 0,
        TxnStatKind::ExecutingPass => 1,
        TxnStatKind::PlanningErrorDiscarded => 2,
        TxnStatKind::NativeOpen => 3,
        TxnStatKind::Commit => 4,
        TxnStatKind::Rollback => 5,
        TxnStatKind::Heartbeat => 6,
        TxnStatKind::LiveQueryRun => 7,
        TxnStatKind::LiveQuerySuppressed => 8,
    }
}

pub struct WaitHoldGuard {
    stats: Arc<TxnStats>,
    start: Instant,
    enabled: bool,
}

impl Drop for WaitHoldGuard {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }
        self.stats.wait_for.record(self.start.elapsed());
    }
}

fn duration_as_u64_ns(duration: Duration) -> u64 {
    duration.as_nanos().min(u64::MAX as u128) as u64
}
