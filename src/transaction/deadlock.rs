// Deadlock detection over the wait-for graph.
//
// The graph keys waits on the transaction being waited for, not on a
// resource: TO plus per-chain writer uniqueness means a waiter always knows
// exactly which peer it is blocked behind, which keeps the graph small.
//
// # Algorithm
//
// Cycle detection is a depth-first search run on every edge insertion,
// starting from the inserting waiter (any new cycle must pass through the
// new edge). The victim is the youngest member of the cycle: the one with
// the largest transaction timestamp.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::common::{Timestamp, TransactionId};

use super::types::ChainKey;

/// Deadlock detection statistics.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DeadlockStats {
    /// Number of detection passes (one per edge insertion).
    pub detection_runs: u64,
    /// Number of cycles found.
    pub deadlocks_found: u64,
    /// Number of victims selected for abort.
    pub victims_selected: u64,
    /// Longest cycle seen, in distinct transactions.
    pub max_cycle_length: usize,
}

/// Wait-for graph: waiter -> holder edges annotated with the blocked chain.
///
/// Not internally synchronized; the concurrency controller owns the single
/// mutex guarding it, and cycle detection runs under that mutex.
#[derive(Debug, Default)]
pub struct WaitForGraph {
    edges: HashMap<TransactionId, HashMap<TransactionId, ChainKey>>,
    timestamps: HashMap<TransactionId, Timestamp>,
    max_depth: usize,
    stats: DeadlockStats,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self {
            edges: HashMap::new(),
            timestamps: HashMap::new(),
            max_depth: 1000,
            stats: DeadlockStats::default(),
        }
    }

    /// Registers a live transaction's timestamp for victim selection.
    pub fn note_transaction(&mut self, id: TransactionId, ts: Timestamp) {
        self.timestamps.insert(id, ts);
    }

    /// Adds edge `waiter -> holder` and runs cycle detection through it.
    ///
    /// Returns the cycle as a path starting and ending at `waiter` when one
    /// exists. Self-edges are ignored.
    pub fn add_wait(
        &mut self,
        waiter: TransactionId,
        holder: TransactionId,
        chain: ChainKey,
    ) -> Option<Vec<TransactionId>> {
        if waiter == holder {
            return None;
        }
        self.edges.entry(waiter).or_default().insert(holder, chain);
        self.stats.detection_runs += 1;

        let mut visited = HashSet::new();
        let mut path = Vec::new();
        if self.walk(waiter, waiter, &mut visited, &mut path, 0) {
            self.stats.deadlocks_found += 1;
            let distinct = path.len().saturating_sub(1);
            self.stats.max_cycle_length = self.stats.max_cycle_length.max(distinct);
            return Some(path);
        }
        None
    }

    /// DFS helper: walks from `current` looking for a path back to `origin`.
    fn walk(
        &self,
        origin: TransactionId,
        current: TransactionId,
        visited: &mut HashSet<TransactionId>,
        path: &mut Vec<TransactionId>,
        depth: usize,
    ) -> bool {
        if depth > self.max_depth {
            return false;
        }
        if !visited.insert(current) {
            return false;
        }
        path.push(current);

        if let Some(next) = self.edges.get(&current) {
            for &holder in next.keys() {
                // An endpoint with no registered timestamp has terminated
                // under us; its edges count as removed.
                if !self.timestamps.contains_key(&holder) {
                    continue;
                }
                if holder == origin {
                    path.push(origin);
                    return true;
                }
                if self.walk(origin, holder, visited, path, depth + 1) {
                    return true;
                }
            }
        }

        path.pop();
        false
    }

    /// Removes a specific wait edge.
    pub fn remove_wait(&mut self, waiter: TransactionId, holder: TransactionId) {
        if let Some(holders) = self.edges.get_mut(&waiter) {
            holders.remove(&holder);
            if holders.is_empty() {
                self.edges.remove(&waiter);
            }
        }
    }

    /// Clears every edge touching `id` (it reached a terminal state) and
    /// forgets its timestamp.
    ///
    /// Returns the transactions that were waiting on `id` so the controller
    /// can wake them.
    pub fn on_terminated(&mut self, id: TransactionId) -> Vec<TransactionId> {
        self.edges.remove(&id);
        self.timestamps.remove(&id);

        let mut waiters = Vec::new();
        self.edges.retain(|&waiter, holders| {
            if holders.remove(&id).is_some() {
                waiters.push(waiter);
            }
            !holders.is_empty()
        });
        waiters
    }

    /// Selects the victim of a cycle: the member with the largest timestamp.
    pub fn select_victim(&self, cycle: &[TransactionId]) -> TransactionId {
        debug_assert!(!cycle.is_empty());
        let mut seen = HashSet::new();
        cycle
            .iter()
            .copied()
            .filter(|id| seen.insert(*id))
            .max_by_key(|&id| (self.timestamps.get(&id).copied().unwrap_or(0), id))
            .unwrap_or(cycle[0])
    }

    pub fn record_victim(&mut self) {
        self.stats.victims_selected += 1;
    }

    /// The chain a waiter is blocked on, if it is waiting at all.
    pub fn waiting_on(&self, waiter: TransactionId) -> Option<&ChainKey> {
        self.edges.get(&waiter).and_then(|h| h.values().next())
    }

    pub fn is_waiting(&self, waiter: TransactionId) -> bool {
        self.edges.contains_key(&waiter)
    }

    pub fn waiter_count(&self) -> usize {
        self.edges.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(|h| h.len()).sum()
    }

    pub fn stats(&self) -> DeadlockStats {
        self.stats.clone()
    }
}
