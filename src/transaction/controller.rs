// Concurrency controller: timestamps, liveness, waiting, deadlock handling.
//
// One controller exists per coordinator. It hands out monotonic transaction
// timestamps from a single atomic counter, tracks every live transaction,
// and implements the wait protocol of the version manager: a blocked
// operation parks on its own transaction's condition and is woken when the
// awaited transaction terminates, when it is victimized by deadlock
// resolution, when it is cancelled, or when the wait times out.
//
// No chain lock is ever held across a park; the version manager resolves to
// a `Busy { holder }` outcome first and the caller waits here, then re-runs
// the operation.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::common::{Timestamp, TransactionId};

use super::deadlock::{DeadlockStats, WaitForGraph};
use super::error::{TransactionError, TransactionResult};
use super::types::{ChainKey, TransactionState};

/// Shared per-transaction state registered with the controller.
pub struct TxnHandle {
    pub id: TransactionId,
    pub ts: Timestamp,
    state: Mutex<TransactionState>,
    terminal: AtomicBool,
    cancelled: AtomicBool,
    /// Set when this transaction is selected as a deadlock victim; holds the
    /// cycle it participated in. Delivered at the next suspension point.
    doom: Mutex<Option<Vec<TransactionId>>>,
    wake: Condvar,
}

enum WakeOutcome {
    HolderDone,
    Doomed(Vec<TransactionId>),
    Cancelled,
    TimedOut,
}

impl TxnHandle {
    fn new(id: TransactionId, ts: Timestamp) -> Self {
        Self {
            id,
            ts,
            state: Mutex::new(TransactionState::Active),
            terminal: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            doom: Mutex::new(None),
            wake: Condvar::new(),
        }
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    /// Lock-free terminal check, safe to call while holding another
    /// transaction's mutexes.
    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Acquire)
    }

    /// Requests cancellation; honored at the next suspension point.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.wake.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn doom_with(&self, cycle: Vec<TransactionId>) {
        *self.doom.lock() = Some(cycle);
        self.wake.notify_all();
    }

    fn park(&self, holder: &TxnHandle, deadline: Instant) -> WakeOutcome {
        let mut doom = self.doom.lock();
        loop {
            if let Some(cycle) = doom.take() {
                return WakeOutcome::Doomed(cycle);
            }
            if self.is_cancelled() {
                return WakeOutcome::Cancelled;
            }
            if holder.is_terminal() {
                return WakeOutcome::HolderDone;
            }
            if Instant::now() >= deadline {
                return WakeOutcome::TimedOut;
            }
            let _ = self.wake.wait_until(&mut doom, deadline);
        }
    }
}

impl fmt::Debug for TxnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnHandle")
            .field("id", &self.id)
            .field("ts", &self.ts)
            .field("state", &self.state())
            .finish()
    }
}

/// Process-wide concurrency controller.
pub struct ConcurrencyController {
    clock: AtomicU64,
    next_id: AtomicU64,
    live: DashMap<TransactionId, Arc<TxnHandle>>,
    graph: Mutex<WaitForGraph>,
    wait_timeout: Duration,
}

impl ConcurrencyController {
    pub fn new(initial_timestamp: Timestamp, wait_timeout: Duration) -> Self {
        Self {
            clock: AtomicU64::new(initial_timestamp),
            next_id: AtomicU64::new(1),
            live: DashMap::new(),
            graph: Mutex::new(WaitForGraph::new()),
            wait_timeout,
        }
    }

    /// Registers a new transaction with a fresh id and timestamp.
    pub fn begin(&self) -> Arc<TxnHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ts = self.clock.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(TxnHandle::new(id, ts));
        self.live.insert(id, Arc::clone(&handle));
        self.graph.lock().note_transaction(id, ts);
        trace!(txn = id, ts, "transaction registered");
        handle
    }

    pub fn handle(&self, id: TransactionId) -> Option<Arc<TxnHandle>> {
        self.live.get(&id).map(|h| Arc::clone(h.value()))
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Smallest timestamp among live transactions; the GC horizon.
    pub fn min_live_ts(&self) -> Option<Timestamp> {
        self.live.iter().map(|entry| entry.value().ts).min()
    }

    /// Guarded lifecycle transition.
    pub fn transition(
        &self,
        handle: &TxnHandle,
        to: TransactionState,
    ) -> TransactionResult<()> {
        use TransactionState::*;
        let mut state = handle.state.lock();
        let valid = matches!(
            (*state, to),
            (Active, Preparing) | (Active, Aborted) | (Preparing, Committed) | (Preparing, Aborted)
        );
        if !valid {
            return Err(TransactionError::InvalidStateTransition {
                txn_id: handle.id,
                from: *state,
                to,
            });
        }
        *state = to;
        handle.terminal.store(to.is_terminal(), Ordering::Release);
        Ok(())
    }

    /// Marks a transaction terminal, clears its wait edges, and wakes every
    /// transaction that was waiting on it.
    pub fn finish(&self, handle: &TxnHandle, state: TransactionState) -> TransactionResult<()> {
        debug_assert!(state.is_terminal());
        self.transition(handle, state)?;
        self.retire(handle);
        Ok(())
    }

    /// Deregisters an already-terminal transaction: clears its wait edges
    /// and wakes every transaction that was waiting on it.
    ///
    /// Used directly by the commit path, where the transition to COMMITTED
    /// happens inside the two-phase-commit decide step, before the versions
    /// are applied.
    pub fn retire(&self, handle: &TxnHandle) {
        debug_assert!(handle.is_terminal());
        self.live.remove(&handle.id);

        let waiters = self.graph.lock().on_terminated(handle.id);
        for waiter in &waiters {
            if let Some(peer) = self.live.get(waiter) {
                peer.value().wake.notify_all();
            }
        }
        debug!(txn = handle.id, state = %handle.state(), woken = waiters.len(), "transaction finished");
    }

    /// Surfaces a pending deadlock victimization or cancellation.
    ///
    /// Called at operation entry and at commit start so a victim that is not
    /// currently parked still observes its abort promptly.
    pub fn poll_doom(&self, handle: &TxnHandle) -> TransactionResult<()> {
        if let Some(cycle) = handle.doom.lock().take() {
            return Err(TransactionError::deadlock(cycle, handle.id));
        }
        if handle.is_cancelled() {
            return Err(TransactionError::UserAbort(handle.id));
        }
        Ok(())
    }

    /// Blocks `waiter` until `holder_id` terminates, then returns so the
    /// caller can re-run the blocked operation.
    ///
    /// Inserts the wait edge, runs cycle detection through it, and parks.
    /// Returns an error when the waiter itself must abort: it was selected
    /// as the deadlock victim, the wait timed out, or it was cancelled.
    pub fn wait_for(
        &self,
        waiter: &Arc<TxnHandle>,
        holder_id: TransactionId,
        chain: &ChainKey,
    ) -> TransactionResult<()> {
        self.poll_doom(waiter)?;

        let holder = match self.handle(holder_id) {
            Some(h) => h,
            // Already gone: the edge counts as removed, re-run immediately.
            None => return Ok(()),
        };
        if holder.is_terminal() {
            return Ok(());
        }

        {
            let mut graph = self.graph.lock();
            if let Some(cycle) = graph.add_wait(waiter.id, holder_id, chain.clone()) {
                let victim = graph.select_victim(&cycle);
                graph.record_victim();
                warn!(victim, ?cycle, "deadlock cycle detected");
                if victim == waiter.id {
                    graph.remove_wait(waiter.id, holder_id);
                    return Err(TransactionError::deadlock(cycle, victim));
                }
                match self.live.get(&victim) {
                    Some(peer) => peer.value().doom_with(cycle),
                    // Victim vanished mid-detection: its edges count as
                    // removed and the next insertion re-runs detection.
                    None => {}
                }
            }
        }

        // The holder may have finished between the liveness check and the
        // edge publication; it sets its terminal flag before collecting
        // waiters, so one more check here closes the race.
        if holder.is_terminal() {
            self.graph.lock().remove_wait(waiter.id, holder_id);
            return Ok(());
        }

        trace!(waiter = waiter.id, holder = holder_id, %chain, "parked");
        let started = Instant::now();
        let outcome = waiter.park(&holder, started + self.wait_timeout);
        self.graph.lock().remove_wait(waiter.id, holder_id);

        match outcome {
            WakeOutcome::HolderDone => Ok(()),
            WakeOutcome::Doomed(cycle) => Err(TransactionError::deadlock(cycle, waiter.id)),
            WakeOutcome::Cancelled => Err(TransactionError::UserAbort(waiter.id)),
            WakeOutcome::TimedOut => {
                Err(TransactionError::wait_timeout(waiter.id, chain, started.elapsed()))
            }
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }

    pub fn deadlock_stats(&self) -> DeadlockStats {
        self.graph.lock().stats()
    }

    /// Number of wait edges currently in the graph. Diagnostic surface.
    pub fn wait_edge_count(&self) -> usize {
        self.graph.lock().edge_count()
    }
}

impl fmt::Debug for ConcurrencyController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyController")
            .field("live_count", &self.live_count())
            .field("wait_edges", &self.wait_edge_count())
            .field("wait_timeout", &self.wait_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Value;
    use std::thread;

    fn controller() -> ConcurrencyController {
        ConcurrencyController::new(1, Duration::from_millis(200))
    }

    fn chain(pk: i64) -> ChainKey {
        ChainKey::new("financial", "accounts", Value::Integer(pk))
    }

    #[test]
    fn test_timestamps_monotonic() {
        let cc = controller();
        let a = cc.begin();
        let b = cc.begin();
        assert!(b.ts > a.ts);
        assert_ne!(a.id, b.id);
        assert_eq!(cc.live_count(), 2);
        assert_eq!(cc.min_live_ts(), Some(a.ts));
    }

    #[test]
    fn test_transition_guards() {
        let cc = controller();
        let tx = cc.begin();
        cc.transition(&tx, TransactionState::Preparing).unwrap();
        assert!(matches!(
            cc.transition(&tx, TransactionState::Preparing),
            Err(TransactionError::InvalidStateTransition { .. })
        ));
        cc.transition(&tx, TransactionState::Committed).unwrap();
        assert!(tx.is_terminal());
    }

    #[test]
    fn test_wait_returns_when_holder_finishes() {
        let cc = Arc::new(controller());
        let holder = cc.begin();
        let waiter = cc.begin();

        let holder_id = holder.id;
        let cc2 = Arc::clone(&cc);
        let waiter2 = Arc::clone(&waiter);
        let join = thread::spawn(move || cc2.wait_for(&waiter2, holder_id, &chain(1)));

        thread::sleep(Duration::from_millis(20));
        cc.transition(&holder, TransactionState::Preparing).unwrap();
        cc.finish(&holder, TransactionState::Committed).unwrap();

        join.join().unwrap().unwrap();
        assert_eq!(cc.wait_edge_count(), 0);
    }

    #[test]
    fn test_wait_on_vanished_holder_is_noop() {
        let cc = controller();
        let waiter = cc.begin();
        cc.wait_for(&waiter, 9999, &chain(1)).unwrap();
    }

    #[test]
    fn test_wait_times_out() {
        let cc = controller();
        let holder = cc.begin();
        let waiter = cc.begin();

        let err = cc.wait_for(&waiter, holder.id, &chain(1)).unwrap_err();
        assert!(matches!(err, TransactionError::WaitTimeout { .. }));
        assert_eq!(cc.wait_edge_count(), 0);
    }

    #[test]
    fn test_two_party_deadlock_dooms_youngest() {
        let cc = Arc::new(controller());
        let older = cc.begin();
        let younger = cc.begin();

        // Younger parks on older first.
        let cc2 = Arc::clone(&cc);
        let younger2 = Arc::clone(&younger);
        let older_id = older.id;
        let join = thread::spawn(move || cc2.wait_for(&younger2, older_id, &chain(1)));

        thread::sleep(Duration::from_millis(20));

        // Older waiting on younger closes the cycle; the younger (largest
        // timestamp) must be the victim, so the older's wait continues until
        // the younger aborts.
        let err = {
            let cc3 = Arc::clone(&cc);
            let older2 = Arc::clone(&older);
            let younger_id = younger.id;
            let older_wait =
                thread::spawn(move || cc3.wait_for(&older2, younger_id, &chain(2)));

            let younger_err = join.join().unwrap().unwrap_err();
            assert!(younger_err.is_deadlock());

            // Victim aborts; the older waiter is woken.
            cc.finish(&younger, TransactionState::Aborted).unwrap();
            older_wait.join().unwrap().unwrap();
            younger_err
        };
        assert!(matches!(err, TransactionError::Deadlock { victim, .. } if victim == younger.id));
    }

    #[test]
    fn test_cancel_delivered_at_suspension_point() {
        let cc = Arc::new(controller());
        let holder = cc.begin();
        let waiter = cc.begin();

        let cc2 = Arc::clone(&cc);
        let waiter2 = Arc::clone(&waiter);
        let holder_id = holder.id;
        let join = thread::spawn(move || cc2.wait_for(&waiter2, holder_id, &chain(1)));

        thread::sleep(Duration::from_millis(20));
        waiter.cancel();

        let err = join.join().unwrap().unwrap_err();
        assert!(matches!(err, TransactionError::UserAbort(_)));
    }

    #[test]
    fn test_poll_doom_outside_wait() {
        let cc = controller();
        let tx = cc.begin();
        tx.doom_with(vec![tx.id, 7, tx.id]);

        let err = cc.poll_doom(&tx).unwrap_err();
        assert!(err.is_deadlock());
        // Doom is consumed.
        cc.poll_doom(&tx).unwrap();
    }
}
