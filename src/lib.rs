// TandemDB - didactic distributed transactional storage engine.
//
// An in-process system that coordinates ACID transactions spanning two
// independent in-memory relational stores (`financial` and `inventory`).
// Isolation comes from timestamp ordering with multiversion reads; deadlocks
// are broken via a wait-for graph; commits run a two-phase protocol across
// the stores. Everything is process-local and volatile: no wire protocol,
// no on-disk layout, no CLI.

use std::time::Duration;

pub mod catalog;
pub mod common;
pub mod error;
pub mod storage;
pub mod transaction;
pub mod workload;

pub use common::{Row, Value, ValueKind};
pub use error::{DbError, Result};
pub use transaction::{
    AbortCause, StatsSnapshot, TransactionCoordinator, TransactionError, TransactionResult, Tx,
};

/// Process-wide engine configuration.
///
/// Plain values, never loaded from files; embedders construct one and hand
/// it to [`TransactionCoordinator::new`].
#[derive(Debug, Clone)]
pub struct Config {
    /// How many times the coordinator re-runs a body after a restartable
    /// abort.
    pub max_restarts: u32,
    /// Upper bound on any single wait for a peer transaction.
    pub wait_timeout: Duration,
    /// Minimum interval between garbage-collection sweeps.
    pub gc_interval: Duration,
    /// First timestamp handed out by the controller.
    pub initial_timestamp: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            wait_timeout: Duration::from_secs(2),
            gc_interval: Duration::from_secs(1),
            initial_timestamp: 1,
        }
    }
}

/// Installs a plain `tracing` subscriber for embedders and tests.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(tracing::Level::INFO)
        .try_init();
}
