// Two-phase commit across the participant stores.
//
// Both participants live in this process, so the prepare record is the
// coordinator's memory: this is 2PC semantically, not a durable 2PC. The
// prepare phase may veto; the commit phase may not fail. Each store has a
// prepare latch held from its prepare vote until the transaction's versions
// are applied or abandoned, which serializes prepare-time validation against
// concurrent committers on the same store.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::common::TransactionId;

use super::error::{TransactionError, TransactionResult};
use super::types::ChainKey;
use super::version::VersionManager;

/// A participant's answer to the prepare request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareVote {
    /// All staged state verified; the participant guarantees commit.
    Ready,
    /// The participant refuses; the transaction must abort.
    Veto(String),
}

/// One commit participant. Implemented by each store's version manager.
pub trait Participant: Send + Sync {
    /// Stable identifier, used for latch lookup and deterministic ordering.
    fn participant_id(&self) -> &str;

    /// Prepare phase: verify the transaction's staged versions.
    fn prepare(&self, txn: TransactionId, keys: &[ChainKey]) -> PrepareVote;

    /// Commit phase: flip the staged versions committed. Must not fail.
    fn commit(&self, txn: TransactionId, keys: &[ChainKey]);

    /// Abort phase: discard the staged versions.
    fn abort(&self, txn: TransactionId, keys: &[ChainKey]);
}

impl Participant for VersionManager {
    fn participant_id(&self) -> &str {
        self.store().name()
    }

    fn prepare(&self, txn: TransactionId, keys: &[ChainKey]) -> PrepareVote {
        match self.verify_prepared(txn, keys) {
            Ok(()) => PrepareVote::Ready,
            Err(reason) => PrepareVote::Veto(reason),
        }
    }

    fn commit(&self, txn: TransactionId, keys: &[ChainKey]) {
        self.commit_apply(txn, keys);
    }

    fn abort(&self, txn: TransactionId, keys: &[ChainKey]) {
        self.discard(txn, keys);
    }
}

/// Statistics for 2PC operations.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct TwoPhaseCommitStats {
    /// Commit protocol runs.
    pub total_transactions: u64,
    /// Successfully committed.
    pub committed: u64,
    /// Aborted by a prepare veto.
    pub prepare_failures: u64,
}

/// Coordinator for the commit protocol.
pub struct TwoPhaseCommitCoordinator {
    /// Per-store prepare latches, iterated in name order.
    latches: BTreeMap<String, Mutex<()>>,
    stats: Mutex<TwoPhaseCommitStats>,
}

impl TwoPhaseCommitCoordinator {
    pub fn new(stores: impl IntoIterator<Item = String>) -> Self {
        Self {
            latches: stores.into_iter().map(|s| (s, Mutex::new(()))).collect(),
            stats: Mutex::new(TwoPhaseCommitStats::default()),
        }
    }

    /// Runs the protocol for one transaction.
    ///
    /// `participants` must be ordered by participant id; the caller derives
    /// it from its ordered participant set. `decide` runs after every
    /// participant voted ready and must atomically mark the transaction
    /// committed; the commit phase follows and cannot fail.
    pub fn execute(
        &self,
        txn: TransactionId,
        participants: &[(&dyn Participant, Vec<ChainKey>)],
        decide: impl FnOnce() -> TransactionResult<()>,
    ) -> TransactionResult<()> {
        // Latch acquisition follows the BTreeMap's name order, so two
        // committers touching the same stores cannot latch-deadlock.
        let mut guards: Vec<MutexGuard<'_, ()>> = Vec::with_capacity(participants.len());
        for (participant, _) in participants {
            let latch = self
                .latches
                .get(participant.participant_id())
                .ok_or_else(|| {
                    TransactionError::prepare_fail(
                        txn,
                        participant.participant_id(),
                        "store is not registered with the commit coordinator",
                    )
                })?;
            guards.push(latch.lock());
        }

        self.stats.lock().total_transactions += 1;

        for (participant, keys) in participants {
            debug!(txn, store = participant.participant_id(), staged = keys.len(), "prepare");
            if let PrepareVote::Veto(reason) = participant.prepare(txn, keys) {
                warn!(txn, store = participant.participant_id(), %reason, "prepare vetoed");
                self.stats.lock().prepare_failures += 1;
                return Err(TransactionError::prepare_fail(
                    txn,
                    participant.participant_id(),
                    reason,
                ));
            }
        }

        decide()?;

        for (participant, keys) in participants {
            participant.commit(txn, keys);
        }
        self.stats.lock().committed += 1;
        debug!(txn, participants = participants.len(), "two-phase commit complete");
        Ok(())
    }

    pub fn stats(&self) -> TwoPhaseCommitStats {
        self.stats.lock().clone()
    }
}

impl fmt::Debug for TwoPhaseCommitCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwoPhaseCommitCoordinator")
            .field("stores", &self.latches.keys().collect::<Vec<_>>())
            .finish()
    }
}
