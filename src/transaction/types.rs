// Core transaction types.
//
// The transaction layer addresses data by chain coordinate, never by raw
// reference: a [`ChainKey`] names the version chain of one primary key in one
// table of one store, and the per-transaction bookkeeping (`TxnMeta`) is a
// plain value owned by the handle that created it.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::common::{Timestamp, TransactionId, Value};

/// Transaction lifecycle state.
///
/// ```text
///            begin              prepare             commit-step
///    [∅] ─────────▶ ACTIVE ───────────▶ PREPARING ─────────────▶ COMMITTED
///                    │  \                   │
///              abort │   \  abort           │ prepare-fail
///                    ▼    ▼                 ▼
///                  ABORTED ◀────────────── ABORTED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    /// Transaction is actively executing operations.
    Active,
    /// Two-phase commit: prepare in flight.
    Preparing,
    /// Transaction has successfully committed.
    Committed,
    /// Transaction has been aborted.
    Aborted,
}

impl TransactionState {
    /// Returns true if the transaction is in a terminal state.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted
        )
    }

    /// Returns true if the transaction can still accept operations.
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }
}

impl Default for TransactionState {
    fn default() -> Self {
        TransactionState::Active
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Preparing => write!(f, "PREPARING"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Coordinate of one version chain: (store, table, primary key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainKey {
    pub store: String,
    pub table: String,
    pub pk: Value,
}

impl ChainKey {
    pub fn new(store: impl Into<String>, table: impl Into<String>, pk: Value) -> Self {
        Self {
            store: store.into(),
            table: table.into(),
            pk,
        }
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}[{}]", self.store, self.table, self.pk)
    }
}

/// Per-transaction bookkeeping: read/write sets, touched stores, restarts.
///
/// Exclusive to the owning transaction (and thus to one thread at a time);
/// shared state lives in the concurrency controller instead.
#[derive(Debug, Clone)]
pub struct TxnMeta {
    pub id: TransactionId,
    pub ts: Timestamp,
    /// Chains this transaction has observed.
    pub read_set: HashSet<ChainKey>,
    /// Chains this transaction has staged writes on.
    pub write_set: HashSet<ChainKey>,
    /// Stores touched by any data call, in deterministic order.
    pub participants: BTreeSet<String>,
    /// How many times the body has been re-run by the coordinator.
    pub restart_count: u32,
}

impl TxnMeta {
    pub fn new(id: TransactionId, ts: Timestamp, restart_count: u32) -> Self {
        Self {
            id,
            ts,
            read_set: HashSet::new(),
            write_set: HashSet::new(),
            participants: BTreeSet::new(),
            restart_count,
        }
    }

    /// Write-set keys that live in `store`.
    pub fn writes_in(&self, store: &str) -> Vec<ChainKey> {
        self.write_set
            .iter()
            .filter(|k| k.store == store)
            .cloned()
            .collect()
    }

    pub fn operation_count(&self) -> usize {
        self.read_set.len() + self.write_set.len()
    }
}
