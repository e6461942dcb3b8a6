// Record store: the committed, indexed rowset of one store.
//
// The record store never enforces isolation. It holds the current committed
// rows per table together with the secondary indexes, and exposes base
// mutators that only the version manager calls while applying a commit.
// Readers inside a transaction go through the version manager; `scan` and
// `lookup` here answer in terms of committed state only.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::catalog::{Catalog, TableSchema};
use crate::common::{Row, Value};
use crate::error::DbError;
use crate::Result;

/// Single-column secondary index: value -> set of primary keys.
#[derive(Debug, Default)]
struct SecondaryIndex {
    unique: bool,
    entries: HashMap<Value, HashSet<Value>>,
}

impl SecondaryIndex {
    fn insert(&mut self, value: Value, pk: Value) {
        self.entries.entry(value).or_default().insert(pk);
    }

    fn remove(&mut self, value: &Value, pk: &Value) {
        if let Some(pks) = self.entries.get_mut(value) {
            pks.remove(pk);
            if pks.is_empty() {
                self.entries.remove(value);
            }
        }
    }

    fn owners(&self, value: &Value) -> Option<&HashSet<Value>> {
        self.entries.get(value)
    }
}

/// One table: schema, committed rowset keyed by primary key, indexes.
pub struct Table {
    schema: TableSchema,
    rows: HashMap<Value, Row>,
    indexes: HashMap<String, SecondaryIndex>,
}

impl Table {
    fn new(schema: TableSchema) -> Self {
        let mut indexes = HashMap::new();
        for def in &schema.indexes {
            indexes.insert(
                def.column.clone(),
                SecondaryIndex {
                    unique: def.unique,
                    entries: HashMap::new(),
                },
            );
        }
        Self {
            schema,
            rows: HashMap::new(),
            indexes,
        }
    }

    fn index_row(&mut self, pk: &Value, row: &Row) {
        for (column, index) in self.indexes.iter_mut() {
            match row.get(column) {
                Some(value) if !value.is_null() => index.insert(value.clone(), pk.clone()),
                _ => {}
            }
        }
    }

    fn unindex_row(&mut self, pk: &Value, row: &Row) {
        for (column, index) in self.indexes.iter_mut() {
            match row.get(column) {
                Some(value) if !value.is_null() => index.remove(value, pk),
                _ => {}
            }
        }
    }

    fn put(&mut self, pk: Value, row: Row) {
        if let Some(old) = self.rows.remove(&pk) {
            self.unindex_row(&pk, &old);
        }
        self.index_row(&pk, &row);
        self.rows.insert(pk, row);
    }

    fn delete(&mut self, pk: &Value) {
        if let Some(old) = self.rows.remove(pk) {
            self.unindex_row(pk, &old);
        }
    }
}

/// A named collection of tables, thread-safe at the record level.
pub struct RecordStore {
    name: String,
    catalog: Catalog,
    tables: DashMap<String, Arc<RwLock<Table>>>,
}

impl RecordStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            catalog: Catalog::new(),
            tables: DashMap::new(),
        }
    }

    /// Store identifier, e.g. `financial`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Creates a table. Idempotent by name (see [`Catalog::create_table`]).
    pub fn create_table(&self, schema: TableSchema) -> Result<()> {
        self.catalog.create_table(schema.clone())?;
        self.tables
            .entry(schema.name.clone())
            .or_insert_with(|| Arc::new(RwLock::new(Table::new(schema))));
        Ok(())
    }

    pub fn schema(&self, table: &str) -> Result<TableSchema> {
        self.catalog.get_table(table)
    }

    fn table(&self, name: &str) -> Result<Arc<RwLock<Table>>> {
        self.tables
            .get(name)
            .map(|t| Arc::clone(t.value()))
            .ok_or_else(|| DbError::UnknownTable(format!("{}.{}", self.name, name)))
    }

    /// Current committed row for a primary key.
    pub fn lookup(&self, table: &str, pk: &Value) -> Result<Option<Row>> {
        let table = self.table(table)?;
        let guard = table.read();
        Ok(guard.rows.get(pk).cloned())
    }

    /// Snapshot of all current committed rows.
    pub fn scan(&self, table: &str) -> Result<Vec<Row>> {
        let table = self.table(table)?;
        let guard = table.read();
        Ok(guard.rows.values().cloned().collect())
    }

    /// All committed primary keys of a table.
    pub fn primary_keys(&self, table: &str) -> Result<Vec<Value>> {
        let table = self.table(table)?;
        let guard = table.read();
        Ok(guard.rows.keys().cloned().collect())
    }

    pub fn row_count(&self, table: &str) -> Result<usize> {
        let table = self.table(table)?;
        let guard = table.read();
        Ok(guard.rows.len())
    }

    /// Primary keys currently holding `value` in the index over `column`.
    ///
    /// Used for uniqueness pre-checks and prepare-time re-validation. Only
    /// indexed columns can be queried.
    pub fn index_owners(&self, table: &str, column: &str, value: &Value) -> Result<Vec<Value>> {
        let table_ref = self.table(table)?;
        let guard = table_ref.read();
        let index = guard.indexes.get(column).ok_or_else(|| {
            DbError::InvalidOperation(format!(
                "column {}.{}.{} is not indexed",
                self.name, guard.schema.name, column
            ))
        })?;
        Ok(index
            .owners(value)
            .map(|pks| pks.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Whether the index over `column` is declared unique.
    pub fn index_is_unique(&self, table: &str, column: &str) -> Result<bool> {
        let table_ref = self.table(table)?;
        let guard = table_ref.read();
        Ok(guard.indexes.get(column).map(|i| i.unique).unwrap_or(false))
    }

    /// Base mutator: installs `row` as the committed state for `pk`,
    /// refreshing the secondary indexes. Reserved to the version manager's
    /// commit-apply path; it never fails beyond table lookup and never
    /// checks isolation.
    pub(crate) fn apply_put(&self, table: &str, pk: Value, row: Row) -> Result<()> {
        let table = self.table(table)?;
        table.write().put(pk, row);
        Ok(())
    }

    /// Base mutator: removes the committed state for `pk`, if any.
    pub(crate) fn apply_delete(&self, table: &str, pk: &Value) -> Result<()> {
        let table = self.table(table)?;
        table.write().delete(pk);
        Ok(())
    }
}

impl fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordStore")
            .field("name", &self.name)
            .field("tables", &self.catalog.list_tables())
            .finish()
    }
}
