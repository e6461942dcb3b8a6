// Transaction coordinator: lifecycle, retry loop, and the workload-facing
// `Tx` handle.
//
// The coordinator owns every shared component — the two record stores and
// their version managers, the concurrency controller, the two-phase-commit
// machinery, and the statistics — and threads them through the `Tx` handles
// it hands out. Business code submits work as a closure over a `Tx` so the
// coordinator owns the abort-and-restart loop; bodies must be idempotent
// under retry and must not perform external side effects.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::catalog::{financial_tables, inventory_tables, FINANCIAL, INVENTORY};
use crate::common::{Row, Timestamp, TransactionId, Value};
use crate::error::DbError;
use crate::storage::RecordStore;
use crate::Config;

use super::controller::{ConcurrencyController, TxnHandle};
use super::deadlock::DeadlockStats;
use super::error::{AbortCause, TransactionError, TransactionResult};
use super::statistics::{StatsSnapshot, TransactionStatistics};
use super::two_phase_commit::{Participant, TwoPhaseCommitCoordinator, TwoPhaseCommitStats};
use super::types::{ChainKey, TransactionState, TxnMeta};
use super::undo::{UndoEntry, UndoLog};
use super::version::{ChainRead, ChainWrite, VersionManager, WriteIntent};

/// One store's runtime pair: committed rowset plus version chains.
struct StoreRuntime {
    records: Arc<RecordStore>,
    versions: Arc<VersionManager>,
}

/// The orchestrator of the engine.
pub struct TransactionCoordinator {
    config: Config,
    controller: ConcurrencyController,
    stores: BTreeMap<String, StoreRuntime>,
    two_pc: TwoPhaseCommitCoordinator,
    stats: TransactionStatistics,
}

impl TransactionCoordinator {
    /// Builds a coordinator over the two fixed stores and installs the
    /// bootstrap schema into both.
    pub fn new(config: Config) -> crate::Result<Self> {
        let mut stores = BTreeMap::new();
        for (name, tables) in [
            (FINANCIAL, financial_tables()),
            (INVENTORY, inventory_tables()),
        ] {
            let records = Arc::new(RecordStore::new(name));
            for schema in tables {
                records.create_table(schema)?;
            }
            let versions = Arc::new(VersionManager::new(
                Arc::clone(&records),
                config.gc_interval,
            ));
            stores.insert(name.to_string(), StoreRuntime { records, versions });
        }

        let controller =
            ConcurrencyController::new(config.initial_timestamp, config.wait_timeout);
        let two_pc = TwoPhaseCommitCoordinator::new(stores.keys().cloned());

        info!(
            stores = stores.len(),
            max_restarts = config.max_restarts,
            "transaction coordinator initialized"
        );
        Ok(Self {
            config,
            controller,
            stores,
            two_pc,
            stats: TransactionStatistics::new(),
        })
    }

    pub fn with_defaults() -> crate::Result<Self> {
        Self::new(Config::default())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn runtime(&self, store: &str) -> TransactionResult<&StoreRuntime> {
        self.stores
            .get(store)
            .ok_or_else(|| DbError::UnknownStore(store.to_string()).into())
    }

    /// Committed-state access for embedders and tests; transactional reads
    /// go through a [`Tx`].
    pub fn records(&self, store: &str) -> crate::Result<Arc<RecordStore>> {
        self.stores
            .get(store)
            .map(|rt| Arc::clone(&rt.records))
            .ok_or_else(|| DbError::UnknownStore(store.to_string()))
    }

    /// Version-chain diagnostics for one store.
    pub fn versions(&self, store: &str) -> crate::Result<Arc<VersionManager>> {
        self.stores
            .get(store)
            .map(|rt| Arc::clone(&rt.versions))
            .ok_or_else(|| DbError::UnknownStore(store.to_string()))
    }

    /// Opens a transaction with a fresh timestamp.
    pub fn begin(&self) -> Tx<'_> {
        self.begin_attempt(0)
    }

    fn begin_attempt(&self, restart_count: u32) -> Tx<'_> {
        let handle = self.controller.begin();
        self.stats.record_begin();
        debug!(txn = handle.id, ts = handle.ts, restart_count, "transaction begun");
        Tx {
            coordinator: self,
            meta: Mutex::new(TxnMeta::new(handle.id, handle.ts, restart_count)),
            undo: Mutex::new(UndoLog::new()),
            handle,
        }
    }

    /// Runs `body` under the abort-and-restart loop.
    ///
    /// Restartable aborts (timestamp order, deadlock, prepare veto, wait
    /// timeout) re-run the body under a brand-new transaction until
    /// `max_restarts` is exhausted, at which point the last error surfaces
    /// wrapped as [`TransactionError::RetriesExhausted`]. Non-restartable
    /// errors surface immediately.
    pub fn run<T>(&self, body: impl Fn(&Tx<'_>) -> TransactionResult<T>) -> TransactionResult<T> {
        let mut attempt: u32 = 0;
        loop {
            let tx = self.begin_attempt(attempt);
            let txn_id = tx.id();
            let outcome = match body(&tx) {
                Ok(value) => tx.commit().map(|()| value),
                Err(err) => {
                    let cause = err.cause().unwrap_or(AbortCause::UserAbort);
                    tx.rollback_if_live(cause);
                    Err(err)
                }
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_restartable() && attempt < self.config.max_restarts => {
                    attempt += 1;
                    self.stats.record_restart();
                    warn!(txn = txn_id, attempt, %err, "restarting transaction body");
                }
                Err(err) if err.is_restartable() => {
                    let cause = err.cause().unwrap_or(AbortCause::UserAbort);
                    return Err(TransactionError::RetriesExhausted {
                        cause,
                        attempts: attempt + 1,
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Coordinator counters in the shape of the introspection contract.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn two_pc_stats(&self) -> TwoPhaseCommitStats {
        self.two_pc.stats()
    }

    pub fn deadlock_stats(&self) -> DeadlockStats {
        self.controller.deadlock_stats()
    }

    /// Number of live transactions as seen by the controller.
    pub fn active_transactions(&self) -> usize {
        self.controller.live_count()
    }

    /// Wait edges currently in the wait-for graph. Diagnostic surface.
    pub fn wait_edge_count(&self) -> usize {
        self.controller.wait_edge_count()
    }

    /// Interval-gated garbage collection across both stores.
    pub fn collect_garbage(&self) {
        let horizon = self.controller.min_live_ts();
        for runtime in self.stores.values() {
            runtime.versions.collect(horizon);
        }
    }

    /// Immediate garbage collection across both stores.
    pub fn force_collect_garbage(&self) {
        let horizon = self.controller.min_live_ts();
        for runtime in self.stores.values() {
            runtime.versions.force_collect(horizon);
        }
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("stores", &self.stores.keys().collect::<Vec<_>>())
            .field("active", &self.active_transactions())
            .finish()
    }
}

/// Cancellation signal for a running transaction; honored at the next
/// suspension point.
#[derive(Clone)]
pub struct CancelToken {
    handle: Arc<TxnHandle>,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.handle.cancel();
    }
}

/// A transaction handle: the contract between the coordinator and the
/// business layer.
///
/// All data operations validate against the version manager under timestamp
/// order; mutations stage uncommitted versions and record their inverse in
/// the undo log. `commit` drives two-phase commit across every store the
/// transaction touched.
pub struct Tx<'c> {
    coordinator: &'c TransactionCoordinator,
    handle: Arc<TxnHandle>,
    meta: Mutex<TxnMeta>,
    undo: Mutex<UndoLog>,
}

impl<'c> Tx<'c> {
    pub fn id(&self) -> TransactionId {
        self.handle.id
    }

    pub fn ts(&self) -> Timestamp {
        self.handle.ts
    }

    pub fn state(&self) -> TransactionState {
        self.handle.state()
    }

    /// How many times the coordinator has restarted this body.
    pub fn restart_count(&self) -> u32 {
        self.meta.lock().restart_count
    }

    pub fn cancel_token(&self) -> CancelToken {
        CancelToken {
            handle: Arc::clone(&self.handle),
        }
    }

    fn ensure_active(&self) -> TransactionResult<()> {
        let state = self.handle.state();
        if !state.is_active() {
            return Err(TransactionError::InvalidStateTransition {
                txn_id: self.handle.id,
                from: state,
                to: TransactionState::Active,
            });
        }
        self.coordinator.controller.poll_doom(&self.handle)
    }

    /// Reads one row by primary key.
    pub fn read(
        &self,
        store: &str,
        table: &str,
        pk: impl Into<Value>,
    ) -> TransactionResult<Option<Row>> {
        self.ensure_active()?;
        let key = ChainKey::new(store, table, pk.into());
        self.read_key(&key)
    }

    fn read_key(&self, key: &ChainKey) -> TransactionResult<Option<Row>> {
        let runtime = self.coordinator.runtime(&key.store)?;
        self.meta.lock().participants.insert(key.store.clone());

        loop {
            match runtime
                .versions
                .read(self.handle.id, self.handle.ts, key)?
            {
                ChainRead::Resolved(row) => {
                    self.meta.lock().read_set.insert(key.clone());
                    return Ok(row);
                }
                ChainRead::Busy { holder } => {
                    self.coordinator
                        .controller
                        .wait_for(&self.handle, holder, key)?;
                }
            }
        }
    }

    /// Scans a table: committed rows plus this transaction's own staged
    /// inserts, resolved through the version chains and filtered by
    /// `predicate`. Rows come back in primary-key order.
    pub fn scan(
        &self,
        store: &str,
        table: &str,
        predicate: impl Fn(&Row) -> bool,
    ) -> TransactionResult<Vec<Row>> {
        self.ensure_active()?;
        let runtime = self.coordinator.runtime(store)?;
        runtime.records.schema(table)?;
        self.meta.lock().participants.insert(store.to_string());

        let mut pks = runtime.records.primary_keys(table)?;
        {
            let meta = self.meta.lock();
            for key in meta
                .write_set
                .iter()
                .filter(|k| k.store == store && k.table == table)
            {
                if !pks.contains(&key.pk) {
                    pks.push(key.pk.clone());
                }
            }
        }
        pks.sort_by(|a, b| a.try_cmp(b).unwrap_or(CmpOrdering::Equal));

        let mut rows = Vec::new();
        for pk in pks {
            let key = ChainKey::new(store, table, pk);
            if let Some(row) = self.read_key(&key)? {
                if predicate(&row) {
                    rows.push(row);
                }
            }
        }
        Ok(rows)
    }

    /// Inserts a new row. The primary key must not already hold a visible
    /// row, and unique indexes are pre-checked deterministically.
    pub fn insert(&self, store: &str, table: &str, row: Row) -> TransactionResult<()> {
        self.ensure_active()?;
        let runtime = self.coordinator.runtime(store)?;
        let schema = runtime.records.schema(table)?;
        schema.validate_row(&row)?;
        let pk = schema.pk_of(&row)?;
        let key = ChainKey::new(store, table, pk);

        self.check_unique(runtime, &schema, &key, &row)?;

        self.stage(runtime, &key, WriteIntent::Insert, Some(row))?;
        self.undo
            .lock()
            .push(UndoEntry::DeleteInserted { chain: key });
        Ok(())
    }

    /// Replaces the row with the given primary key. The write is blind with
    /// respect to timestamp ordering: the pre-image comes from the chain at
    /// staging time, without lifting the chain's read timestamp.
    pub fn update(&self, store: &str, table: &str, row: Row) -> TransactionResult<()> {
        self.ensure_active()?;
        let runtime = self.coordinator.runtime(store)?;
        let schema = runtime.records.schema(table)?;
        schema.validate_row(&row)?;
        let pk = schema.pk_of(&row)?;
        let key = ChainKey::new(store, table, pk);

        self.check_unique(runtime, &schema, &key, &row)?;

        let prior = self.stage(runtime, &key, WriteIntent::Update, Some(row))?;
        if let Some(prior) = prior {
            self.undo
                .lock()
                .push(UndoEntry::RestoreUpdated { chain: key, prior });
        }
        Ok(())
    }

    /// Deletes the row with the given primary key.
    pub fn delete(&self, store: &str, table: &str, pk: impl Into<Value>) -> TransactionResult<()> {
        self.ensure_active()?;
        let runtime = self.coordinator.runtime(store)?;
        runtime.records.schema(table)?;
        let key = ChainKey::new(store, table, pk.into());

        let prior = self.stage(runtime, &key, WriteIntent::Delete, None)?;
        if let Some(prior) = prior {
            self.undo
                .lock()
                .push(UndoEntry::ReinsertDeleted { chain: key, prior });
        }
        Ok(())
    }

    /// Drives one staged write to completion, waiting out any peer holding
    /// the chain's uncommitted version. Returns the pre-image.
    fn stage(
        &self,
        runtime: &StoreRuntime,
        key: &ChainKey,
        intent: WriteIntent,
        row: Option<Row>,
    ) -> TransactionResult<Option<Row>> {
        loop {
            match runtime.versions.stage(
                self.handle.id,
                self.handle.ts,
                key,
                intent,
                row.clone(),
            )? {
                ChainWrite::Staged { prior } => {
                    let mut meta = self.meta.lock();
                    meta.participants.insert(key.store.clone());
                    meta.write_set.insert(key.clone());
                    return Ok(prior);
                }
                ChainWrite::Busy { holder } => {
                    self.coordinator
                        .controller
                        .wait_for(&self.handle, holder, key)?;
                }
            }
        }
    }

    /// Deterministic unique-index pre-check against the committed rowset and
    /// this transaction's own staged rows. Cross-transaction races that slip
    /// past this check are caught by prepare-time re-validation under the
    /// store's prepare latch.
    fn check_unique(
        &self,
        runtime: &StoreRuntime,
        schema: &crate::catalog::TableSchema,
        key: &ChainKey,
        row: &Row,
    ) -> TransactionResult<()> {
        for index in schema.indexes.iter().filter(|i| i.unique) {
            let Some(value) = row.get(&index.column).filter(|v| !v.is_null()) else {
                continue;
            };

            for owner_pk in runtime
                .records
                .index_owners(&key.table, &index.column, value)?
            {
                if owner_pk == key.pk {
                    continue;
                }
                let owner_key = ChainKey::new(key.store.clone(), key.table.clone(), owner_pk);
                let conflict = match runtime.versions.staged_row(self.handle.id, &owner_key) {
                    // We staged a delete of the committed owner.
                    Some(None) => false,
                    // We rewrote the owner; conflict only if it still holds
                    // the value.
                    Some(Some(staged)) => staged.get(&index.column) == Some(value),
                    None => true,
                };
                if conflict {
                    return Err(TransactionError::constraint(format!(
                        "unique index {}.{} already contains {}",
                        key.table, index.column, value
                    )));
                }
            }

            let own_writes: Vec<ChainKey> = {
                let meta = self.meta.lock();
                meta.write_set
                    .iter()
                    .filter(|k| k.store == key.store && k.table == key.table && k.pk != key.pk)
                    .cloned()
                    .collect()
            };
            for other in own_writes {
                if let Some(Some(staged)) = runtime.versions.staged_row(self.handle.id, &other) {
                    if staged.get(&index.column) == Some(value) {
                        return Err(TransactionError::constraint(format!(
                            "unique index {}.{} already contains {}",
                            key.table, index.column, value
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Commits via two-phase commit over every participant store.
    ///
    /// On any error the transaction has been rolled back before this
    /// returns.
    pub fn commit(self) -> TransactionResult<()> {
        match self.try_commit() {
            Ok(()) => Ok(()),
            Err(err) => {
                let cause = err.cause().unwrap_or(AbortCause::UserAbort);
                self.rollback_if_live(cause);
                Err(err)
            }
        }
    }

    fn try_commit(&self) -> TransactionResult<()> {
        self.coordinator.controller.poll_doom(&self.handle)?;
        self.coordinator
            .controller
            .transition(&self.handle, TransactionState::Preparing)?;

        let meta = self.meta.lock().clone();
        let mut participants: Vec<(&dyn Participant, Vec<ChainKey>)> = Vec::new();
        for store in &meta.participants {
            let runtime = self.coordinator.runtime(store)?;
            participants.push((
                runtime.versions.as_ref() as &dyn Participant,
                meta.writes_in(store),
            ));
        }

        self.coordinator
            .two_pc
            .execute(self.handle.id, &participants, || {
                self.coordinator
                    .controller
                    .transition(&self.handle, TransactionState::Committed)
            })?;

        self.coordinator.controller.retire(&self.handle);
        self.coordinator.stats.record_commit();
        self.coordinator.collect_garbage();
        debug!(
            txn = self.handle.id,
            reads = meta.read_set.len(),
            writes = meta.write_set.len(),
            participants = meta.participants.len(),
            "transaction committed"
        );
        Ok(())
    }

    /// Aborts the transaction at the caller's request.
    pub fn abort(self) {
        self.rollback_if_live(AbortCause::UserAbort);
    }

    fn rollback_if_live(&self, cause: AbortCause) {
        if self.handle.is_terminal() {
            return;
        }
        let summary = self.undo.lock().replay(self.handle.id);
        let meta = self.meta.lock().clone();
        for store in &meta.participants {
            if let Ok(runtime) = self.coordinator.runtime(store) {
                runtime
                    .versions
                    .discard(self.handle.id, &meta.writes_in(store));
            }
        }
        if let Err(err) = self
            .coordinator
            .controller
            .finish(&self.handle, TransactionState::Aborted)
        {
            debug!(txn = self.handle.id, %err, "abort finish raced with terminal state");
        }
        self.coordinator.stats.record_abort(cause);
        self.coordinator.collect_garbage();
        debug!(
            txn = self.handle.id,
            %cause,
            undone = summary.total(),
            "transaction aborted"
        );
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if !self.handle.is_terminal() {
            warn!(txn = self.handle.id, "transaction dropped without commit or abort");
            self.rollback_if_live(AbortCause::UserAbort);
        }
    }
}

impl std::fmt::Debug for Tx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let meta = self.meta.lock();
        f.debug_struct("Tx")
            .field("id", &self.handle.id)
            .field("ts", &self.handle.ts)
            .field("state", &self.handle.state())
            .field("reads", &meta.read_set.len())
            .field("writes", &meta.write_set.len())
            .finish()
    }
}
