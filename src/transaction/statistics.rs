// Transaction statistics and monitoring.
//
// A thread-safe counter set maintained by the coordinator and surfaced as a
// serializable snapshot through `TransactionCoordinator::stats`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::error::AbortCause;

#[derive(Debug, Default, Clone)]
struct Counters {
    active: u64,
    committed: u64,
    aborted: u64,
    restarts: u64,
    deadlocks: u64,
    timeouts: u64,
}

/// Point-in-time view of the coordinator's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Transactions currently live.
    pub active_count: u64,
    /// Transactions that reached COMMITTED.
    pub committed_count: u64,
    /// Transactions that reached ABORTED, restarted or not.
    pub aborted_count: u64,
    /// Body re-runs performed by the retry loop.
    pub restart_count: u64,
    /// Aborts caused by deadlock victimization.
    pub deadlocks_detected: u64,
    /// Aborts caused by wait timeouts.
    pub timeouts: u64,
}

impl StatsSnapshot {
    /// Aborts as a fraction of finished transactions.
    pub fn abort_rate(&self) -> f64 {
        let total = self.committed_count + self.aborted_count;
        if total == 0 {
            return 0.0;
        }
        self.aborted_count as f64 / total as f64
    }
}

/// Thread-safe collector for transaction metrics.
#[derive(Debug, Default)]
pub struct TransactionStatistics {
    inner: Mutex<Counters>,
}

impl TransactionStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_begin(&self) {
        self.inner.lock().active += 1;
    }

    pub fn record_commit(&self) {
        let mut inner = self.inner.lock();
        inner.committed += 1;
        inner.active = inner.active.saturating_sub(1);
    }

    pub fn record_abort(&self, cause: AbortCause) {
        let mut inner = self.inner.lock();
        inner.aborted += 1;
        inner.active = inner.active.saturating_sub(1);
        match cause {
            AbortCause::Deadlock => inner.deadlocks += 1,
            AbortCause::Timeout => inner.timeouts += 1,
            _ => {}
        }
    }

    pub fn record_restart(&self) {
        self.inner.lock().restarts += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock();
        StatsSnapshot {
            active_count: inner.active,
            committed_count: inner.committed,
            aborted_count: inner.aborted,
            restart_count: inner.restarts,
            deadlocks_detected: inner.deadlocks,
            timeouts: inner.timeouts,
        }
    }

    pub fn reset(&self) {
        *self.inner.lock() = Counters::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_counters() {
        let stats = TransactionStatistics::new();
        stats.record_begin();
        stats.record_begin();
        stats.record_commit();
        stats.record_abort(AbortCause::Deadlock);

        let snap = stats.snapshot();
        assert_eq!(snap.active_count, 0);
        assert_eq!(snap.committed_count, 1);
        assert_eq!(snap.aborted_count, 1);
        assert_eq!(snap.deadlocks_detected, 1);
        assert_eq!(snap.abort_rate(), 0.5);
    }

    #[test]
    fn test_restart_counter() {
        let stats = TransactionStatistics::new();
        stats.record_restart();
        stats.record_restart();
        assert_eq!(stats.snapshot().restart_count, 2);
    }

    #[test]
    fn test_reset() {
        let stats = TransactionStatistics::new();
        stats.record_begin();
        stats.record_commit();
        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = TransactionStatistics::new();
        stats.record_begin();
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"active_count\":1"));
    }
}
