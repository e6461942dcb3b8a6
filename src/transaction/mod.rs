// Transaction Management Module
//
// ACID transactions across the two in-memory stores:
//
// - **Timestamp ordering (TO)**: conflicting operations serialize in
//   transaction-timestamp order, enforced at the version chains.
// - **MVCC**: multiversion reads resolve each reader to the version matching
//   its timestamp; readers never block committed writers.
// - **Deadlock detection**: wait-for graph with cycle detection on every
//   edge insertion; the youngest cycle member is the victim.
// - **Undo logging**: per-transaction inverse operations replayed in reverse
//   on abort.
// - **Two-phase commit**: prepare may veto, commit may not fail; both stores
//   participate under per-store prepare latches.
// - **Abort-and-restart**: the coordinator owns the retry loop over
//   caller-supplied transaction bodies.
//
// # Module Organization
//
// | Module | Responsibility |
// |--------|----------------|
// | [`types`] | Core types: `TransactionState`, `ChainKey`, `TxnMeta` |
// | [`error`] | `AbortCause` taxonomy and `TransactionError` |
// | [`version`] | Version chains, MVCC reads, TO write checks, GC |
// | [`controller`] | Timestamps, liveness, waiting, victim delivery |
// | [`deadlock`] | Wait-for graph and cycle detection |
// | [`undo`] | Per-transaction undo log |
// | [`two_phase_commit`] | Commit protocol across the stores |
// | [`coordinator`] | `TransactionCoordinator`, the `Tx` handle, retry loop |
// | [`statistics`] | Counters and the `stats()` snapshot |

pub mod controller;
pub mod coordinator;
pub mod deadlock;
pub mod error;
pub mod statistics;
pub mod two_phase_commit;
pub mod types;
pub mod undo;
pub mod version;

pub use controller::{ConcurrencyController, TxnHandle};
pub use coordinator::{CancelToken, TransactionCoordinator, Tx};
pub use deadlock::{DeadlockStats, WaitForGraph};
pub use error::{AbortCause, TransactionError, TransactionResult};
pub use statistics::{StatsSnapshot, TransactionStatistics};
pub use two_phase_commit::{Participant, PrepareVote, TwoPhaseCommitCoordinator, TwoPhaseCommitStats};
pub use types::{ChainKey, TransactionState, TxnMeta};
pub use undo::{UndoEntry, UndoLog, UndoSummary};
pub use version::{ChainRead, ChainWrite, GcStats, Version, VersionManager, WriteIntent};
