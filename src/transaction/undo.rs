// Per-transaction undo log.
//
// Entries are self-contained inverses appended in execution order and
// replayed in reverse on abort. Uncommitted versions only ever live in the
// version chains, so the physical pruning happens through the version
// manager's discard path; the replay here is the authoritative account of
// what was undone.

use tracing::debug;

use crate::common::{Row, TransactionId};

use super::types::ChainKey;

/// Inverse of one executed operation.
#[derive(Debug, Clone)]
pub enum UndoEntry {
    /// Inverse of INSERT: delete the inserted key.
    DeleteInserted { chain: ChainKey },
    /// Inverse of UPDATE: restore the pre-image.
    RestoreUpdated { chain: ChainKey, prior: Row },
    /// Inverse of DELETE: reinsert the pre-image.
    ReinsertDeleted { chain: ChainKey, prior: Row },
}

impl UndoEntry {
    pub fn chain(&self) -> &ChainKey {
        match self {
            UndoEntry::DeleteInserted { chain }
            | UndoEntry::RestoreUpdated { chain, .. }
            | UndoEntry::ReinsertDeleted { chain, .. } => chain,
        }
    }
}

/// Accounting produced by an undo replay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UndoSummary {
    pub inserts_undone: u64,
    pub updates_undone: u64,
    pub deletes_undone: u64,
}

impl UndoSummary {
    pub fn total(&self) -> u64 {
        self.inserts_undone + self.updates_undone + self.deletes_undone
    }
}

/// Ordered undo log of one transaction.
#[derive(Debug, Default)]
pub struct UndoLog {
    entries: Vec<UndoEntry>,
}

impl UndoLog {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Appends an entry in execution order.
    pub fn push(&mut self, entry: UndoEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Walks the log in reverse, producing the abort accounting.
    ///
    /// The caller follows up with the version manager's `discard`, which
    /// removes this transaction's uncommitted versions wholesale.
    pub fn replay(&self, txn_id: TransactionId) -> UndoSummary {
        let mut summary = UndoSummary::default();
        for entry in self.entries.iter().rev() {
            match entry {
                UndoEntry::DeleteInserted { chain } => {
                    debug!(txn = txn_id, %chain, "undo insert");
                    summary.inserts_undone += 1;
                }
                UndoEntry::RestoreUpdated { chain, .. } => {
                    debug!(txn = txn_id, %chain, "undo update");
                    summary.updates_undone += 1;
                }
                UndoEntry::ReinsertDeleted { chain, .. } => {
                    debug!(txn = txn_id, %chain, "undo delete");
                    summary.deletes_undone += 1;
                }
            }
        }
        summary
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Value;

    fn key(pk: i64) -> ChainKey {
        ChainKey::new("financial", "accounts", Value::Integer(pk))
    }

    #[test]
    fn test_append_order() {
        let mut log = UndoLog::new();
        log.push(UndoEntry::DeleteInserted { chain: key(1) });
        log.push(UndoEntry::RestoreUpdated {
            chain: key(2),
            prior: Row::new().with("id", 2i64),
        });

        assert_eq!(log.len(), 2);
        assert_eq!(log.entries[0].chain().pk, Value::Integer(1));
    }

    #[test]
    fn test_replay_accounting() {
        let mut log = UndoLog::new();
        log.push(UndoEntry::DeleteInserted { chain: key(1) });
        log.push(UndoEntry::RestoreUpdated {
            chain: key(2),
            prior: Row::new().with("id", 2i64),
        });
        log.push(UndoEntry::ReinsertDeleted {
            chain: key(3),
            prior: Row::new().with("id", 3i64),
        });

        let summary = log.replay(42);
        assert_eq!(summary.inserts_undone, 1);
        assert_eq!(summary.updates_undone, 1);
        assert_eq!(summary.deletes_undone, 1);
        assert_eq!(summary.total(), 3);
    }

    #[test]
    fn test_empty_replay() {
        let log = UndoLog::new();
        assert_eq!(log.replay(1).total(), 0);
        assert!(log.is_empty());
    }
}
