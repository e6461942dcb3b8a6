// Multiversion storage: one version chain per (table, primary key).
//
// The version manager of a store hosts the chains, resolves reads to the
// version matching the reader's timestamp, stages writes as uncommitted
// versions, and applies or discards them when the coordinator decides the
// transaction's fate. Timestamp-order enforcement for writes lives here,
// against the chain's read timestamp and its newest committed version.
//
// # Chain invariants
//
// - Versions are ordered newest-first with strictly decreasing writer
//   timestamps.
// - At most one uncommitted version exists per chain, and it is always the
//   head: a second writer must wait for the first to terminate.
// - `read_ts` is the largest timestamp any reader has observed the chain at.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use crate::common::{Row, Timestamp, TransactionId, Value};
use crate::error::DbError;
use crate::storage::RecordStore;

use super::error::{TransactionError, TransactionResult};
use super::types::ChainKey;

/// One version of a row. A `None` row is a deletion tombstone.
#[derive(Debug, Clone)]
pub struct Version {
    pub row: Option<Row>,
    /// Transaction that wrote this version.
    pub writer: TransactionId,
    /// Timestamp of the writing transaction.
    pub writer_ts: Timestamp,
    /// False while the writing transaction is live.
    pub committed: bool,
    /// Wall clock, for eviction hints only.
    pub created_at: DateTime<Utc>,
}

impl Version {
    fn uncommitted(row: Option<Row>, writer: TransactionId, writer_ts: Timestamp) -> Self {
        Self {
            row,
            writer,
            writer_ts,
            committed: false,
            created_at: Utc::now(),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.row.is_none()
    }
}

/// Newest-first version list plus the chain read timestamp.
#[derive(Debug, Default)]
struct VersionChain {
    versions: Vec<Version>,
    read_ts: Timestamp,
}

impl VersionChain {
    /// First version a reader at `ts` may see, committed or not.
    fn visible_at(&self, ts: Timestamp) -> Option<&Version> {
        self.versions.iter().find(|v| v.writer_ts <= ts)
    }

    fn newest_committed(&self) -> Option<&Version> {
        self.versions.iter().find(|v| v.committed)
    }

    fn uncommitted_head(&self) -> Option<&Version> {
        self.versions.first().filter(|v| !v.committed)
    }
}

/// Outcome of a versioned read.
#[derive(Debug)]
pub enum ChainRead {
    /// The read resolved; `None` means no visible row (absent or tombstone).
    Resolved(Option<Row>),
    /// The visible version is uncommitted and owned by a live peer; the
    /// caller must wait for `holder` and re-run the read.
    Busy { holder: TransactionId },
}

/// What a staged write claims about the row's existence.
///
/// Writes are blind with respect to timestamp ordering: they never lift the
/// chain's read timestamp. The pre-image for the undo log comes from the
/// chain itself at staging time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteIntent {
    /// The row must not exist yet.
    Insert,
    /// The row must exist; it is replaced.
    Update,
    /// The row must exist; it is tombstoned.
    Delete,
}

/// Outcome of staging a write.
#[derive(Debug)]
pub enum ChainWrite {
    /// The uncommitted version is in place (new or overwritten in place).
    /// `prior` is the row the write supersedes from this transaction's
    /// viewpoint: its own staged row, else the newest committed version.
    Staged { prior: Option<Row> },
    /// Another live transaction holds the chain's uncommitted version.
    Busy { holder: TransactionId },
}

/// Garbage collection statistics.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct GcStats {
    pub runs: u64,
    pub versions_removed: u64,
    pub chains_removed: u64,
}

struct GcState {
    last_run: Instant,
    interval: Duration,
    stats: GcStats,
}

/// Version manager for one store.
pub struct VersionManager {
    store: Arc<RecordStore>,
    chains: DashMap<(String, Value), Arc<Mutex<VersionChain>>>,
    gc: Mutex<GcState>,
}

impl VersionManager {
    pub fn new(store: Arc<RecordStore>, gc_interval: Duration) -> Self {
        Self {
            store,
            chains: DashMap::new(),
            gc: Mutex::new(GcState {
                last_run: Instant::now(),
                interval: gc_interval,
                stats: GcStats::default(),
            }),
        }
    }

    /// The record store this manager layers MVCC on top of.
    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    fn chain_entry(&self, table: &str, pk: &Value) -> Arc<Mutex<VersionChain>> {
        self.chains
            .entry((table.to_string(), pk.clone()))
            .or_insert_with(|| Arc::new(Mutex::new(VersionChain::default())))
            .clone()
    }

    /// Resolves a read at timestamp `ts`.
    ///
    /// On a resolved read the chain's `read_ts` is lifted to `ts`. A chain is
    /// materialized even for a miss so the observation is remembered: a later
    /// slow writer must fail its timestamp-order check against this read.
    pub fn read(
        &self,
        txn: TransactionId,
        ts: Timestamp,
        key: &ChainKey,
    ) -> TransactionResult<ChainRead> {
        self.store.schema(&key.table)?;

        let chain = self.chain_entry(&key.table, &key.pk);
        let mut guard = chain.lock();
        match guard.visible_at(ts) {
            Some(v) if !v.committed && v.writer != txn => {
                trace!(txn, ts, %key, holder = v.writer, "read blocked on uncommitted writer");
                Ok(ChainRead::Busy { holder: v.writer })
            }
            visible => {
                let row = visible.and_then(|v| v.row.clone());
                guard.read_ts = guard.read_ts.max(ts);
                Ok(ChainRead::Resolved(row))
            }
        }
    }

    /// Stages a write (a `None` row denotes delete) at timestamp `ts`.
    ///
    /// Enforces the timestamp-order write rule: writing behind the chain's
    /// read timestamp or behind its newest committed version aborts the
    /// writer. No silent late-write drop is applied; late writers restart.
    /// The `intent` is validated against the pre-image under the chain lock,
    /// so presence checks never race with a peer's commit.
    pub fn stage(
        &self,
        txn: TransactionId,
        ts: Timestamp,
        key: &ChainKey,
        intent: WriteIntent,
        row: Option<Row>,
    ) -> TransactionResult<ChainWrite> {
        self.store.schema(&key.table)?;

        let chain = self.chain_entry(&key.table, &key.pk);
        let mut guard = chain.lock();

        if guard.read_ts > ts {
            return Err(TransactionError::timestamp_order(
                txn,
                ts,
                guard.read_ts,
                key,
            ));
        }
        if let Some(committed) = guard.newest_committed() {
            if committed.writer_ts > ts {
                return Err(TransactionError::timestamp_order(
                    txn,
                    ts,
                    committed.writer_ts,
                    key,
                ));
            }
        }

        if let Some(head) = guard.versions.first() {
            if !head.committed && head.writer != txn {
                trace!(txn, ts, %key, holder = head.writer, "write blocked on uncommitted writer");
                return Ok(ChainWrite::Busy {
                    holder: head.writer,
                });
            }
        }

        let prior = match guard.uncommitted_head() {
            Some(own) => own.row.clone(),
            None => guard.newest_committed().and_then(|v| v.row.clone()),
        };
        match intent {
            WriteIntent::Insert if prior.is_some() => {
                return Err(DbError::duplicate_pk(key.table.as_str(), &key.pk).into());
            }
            WriteIntent::Update if prior.is_none() => {
                return Err(TransactionError::constraint(format!(
                    "update of missing row {}",
                    key
                )));
            }
            WriteIntent::Delete if prior.is_none() => {
                return Err(TransactionError::constraint(format!(
                    "delete of missing row {}",
                    key
                )));
            }
            _ => {}
        }

        match guard.versions.first_mut() {
            Some(head) if !head.committed => head.row = row,
            _ => guard.versions.insert(0, Version::uncommitted(row, txn, ts)),
        }
        Ok(ChainWrite::Staged { prior })
    }

    /// The row this transaction has staged on `key`, if any.
    ///
    /// `Some(None)` is a staged delete.
    pub fn staged_row(&self, txn: TransactionId, key: &ChainKey) -> Option<Option<Row>> {
        let chain = self.chains.get(&(key.table.clone(), key.pk.clone()))?;
        let guard = chain.lock();
        guard
            .uncommitted_head()
            .filter(|v| v.writer == txn)
            .map(|v| v.row.clone())
    }

    /// Prepare-phase verification for this store's slice of a transaction.
    ///
    /// Vetoes when a staged version went missing or was superseded, or when
    /// a unique secondary index would be violated by the staged rows against
    /// the committed rowset.
    pub(crate) fn verify_prepared(
        &self,
        txn: TransactionId,
        keys: &[ChainKey],
    ) -> std::result::Result<(), String> {
        for key in keys {
            let chain = self
                .chains
                .get(&(key.table.clone(), key.pk.clone()))
                .ok_or_else(|| format!("staged version missing on {}", key))?;
            let guard = chain.lock();
            let head = guard
                .uncommitted_head()
                .filter(|v| v.writer == txn)
                .ok_or_else(|| format!("staged version superseded on {}", key))?;

            let Some(row) = &head.row else {
                continue;
            };
            let schema = self
                .store
                .schema(&key.table)
                .map_err(|e| e.to_string())?;
            for index in schema.indexes.iter().filter(|i| i.unique) {
                let Some(value) = row.get(&index.column).filter(|v| !v.is_null()) else {
                    continue;
                };
                let owners = self
                    .store
                    .index_owners(&key.table, &index.column, value)
                    .map_err(|e| e.to_string())?;
                if owners.iter().any(|pk| *pk != key.pk) {
                    return Err(format!(
                        "unique index {}.{} would be violated by {}",
                        key.table, index.column, value
                    ));
                }
            }
        }
        Ok(())
    }

    /// Commit application: flips every staged version of `txn` to committed
    /// and installs it as the store's current row state. This is the commit
    /// step of two-phase commit and must not fail; it only mutates in-memory
    /// state already validated by prepare.
    pub(crate) fn commit_apply(&self, txn: TransactionId, keys: &[ChainKey]) {
        for key in keys {
            let Some(chain) = self.chains.get(&(key.table.clone(), key.pk.clone())) else {
                continue;
            };
            let chain = Arc::clone(chain.value());
            let mut guard = chain.lock();
            let Some(head) = guard.versions.first_mut() else {
                continue;
            };
            if head.committed || head.writer != txn {
                continue;
            }
            head.committed = true;
            let row = head.row.clone();
            drop(guard);

            let applied = match row {
                Some(row) => self.store.apply_put(&key.table, key.pk.clone(), row),
                None => self.store.apply_delete(&key.table, &key.pk),
            };
            if let Err(err) = applied {
                // Unreachable for prepared keys; surfaced for diagnosis.
                error!(txn, %key, %err, "commit apply failed");
            }
        }
        debug!(txn, writes = keys.len(), "versions committed");
    }

    /// Removes every uncommitted version written by `txn`.
    pub(crate) fn discard(&self, txn: TransactionId, keys: &[ChainKey]) {
        let mut removed = 0usize;
        for key in keys {
            let Some(chain) = self.chains.get(&(key.table.clone(), key.pk.clone())) else {
                continue;
            };
            let mut guard = chain.lock();
            let before = guard.versions.len();
            guard.versions.retain(|v| v.committed || v.writer != txn);
            removed += before - guard.versions.len();
        }
        if removed > 0 {
            debug!(txn, removed, "uncommitted versions discarded");
        }
    }

    /// Interval-gated garbage collection.
    ///
    /// `min_live_ts` is the smallest timestamp among live transactions, or
    /// `None` when none are live.
    pub fn collect(&self, min_live_ts: Option<Timestamp>) {
        {
            let gc = self.gc.lock();
            if gc.last_run.elapsed() < gc.interval {
                return;
            }
        }
        self.force_collect(min_live_ts);
    }

    /// Garbage collection, ignoring the interval gate.
    ///
    /// A version may go only when a newer committed version serves every
    /// live reader; a tombstone-only chain may go entirely once no live or
    /// future transaction can observe anything older.
    pub fn force_collect(&self, min_live_ts: Option<Timestamp>) {
        let horizon = min_live_ts.unwrap_or(Timestamp::MAX);
        let mut versions_removed = 0u64;
        let mut droppable: Vec<(String, Value)> = Vec::new();

        for entry in self.chains.iter() {
            let mut guard = entry.value().lock();
            let before = guard.versions.len();

            let mut shielded = false;
            guard.versions.retain(|v| {
                if !v.committed {
                    return true;
                }
                if shielded {
                    return false;
                }
                if v.writer_ts <= horizon {
                    shielded = true;
                }
                true
            });
            versions_removed += (before - guard.versions.len()) as u64;

            if chain_is_droppable(&guard, horizon) {
                droppable.push(entry.key().clone());
            }
        }

        let mut chains_removed = 0u64;
        for key in droppable {
            // Re-validate under the removal: a writer may have staged a new
            // version since the sweep.
            let removed = self
                .chains
                .remove_if(&key, |_, chain| chain_is_droppable(&chain.lock(), horizon));
            if let Some((_, chain)) = removed {
                versions_removed += chain.lock().versions.len() as u64;
                chains_removed += 1;
            }
        }

        let mut gc = self.gc.lock();
        gc.last_run = Instant::now();
        gc.stats.runs += 1;
        gc.stats.versions_removed += versions_removed;
        gc.stats.chains_removed += chains_removed;
        if versions_removed > 0 || chains_removed > 0 {
            debug!(
                store = self.store.name(),
                versions_removed, chains_removed, "garbage collected"
            );
        }
    }

    pub fn gc_stats(&self) -> GcStats {
        self.gc.lock().stats.clone()
    }

    pub fn chain_count(&self) -> usize {
        self.chains.len()
    }

    pub fn version_count(&self) -> usize {
        self.chains
            .iter()
            .map(|entry| entry.value().lock().versions.len())
            .sum()
    }

    /// Number of uncommitted versions across all chains. The system invariant
    /// keeps this at most one per chain.
    pub fn uncommitted_count(&self) -> usize {
        self.chains
            .iter()
            .filter(|entry| entry.value().lock().uncommitted_head().is_some())
            .count()
    }

    /// Snapshot of a chain's versions, newest first. Diagnostic surface.
    pub fn versions_of(&self, table: &str, pk: &Value) -> Vec<Version> {
        self.chains
            .get(&(table.to_string(), pk.clone()))
            .map(|chain| chain.lock().versions.clone())
            .unwrap_or_default()
    }

    /// A chain's current read timestamp. Diagnostic surface.
    pub fn read_ts_of(&self, table: &str, pk: &Value) -> Option<Timestamp> {
        self.chains
            .get(&(table.to_string(), pk.clone()))
            .map(|chain| chain.lock().read_ts)
    }
}

/// A chain may be dropped when its only content is a committed tombstone
/// already visible to every live reader, or when it is empty and its read
/// timestamp can no longer fail any live writer's order check.
fn chain_is_droppable(chain: &VersionChain, horizon: Timestamp) -> bool {
    if chain.read_ts > horizon {
        return false;
    }
    match chain.versions.as_slice() {
        [] => true,
        [v] => v.committed && v.is_tombstone() && v.writer_ts <= horizon,
        _ => false,
    }
}

impl std::fmt::Debug for VersionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionManager")
            .field("store", &self.store.name())
            .field("chain_count", &self.chain_count())
            .field("version_count", &self.version_count())
            .finish()
    }
}
