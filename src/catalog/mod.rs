// Catalog: table schemas and the fixed bootstrap layout.
//
// The catalog owns schema metadata only. Row storage lives in the record
// store; version history lives in the version manager.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::common::{Row, Value, ValueKind};
use crate::error::DbError;
use crate::Result;

/// Column definition: name, expected value tag, nullability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ValueKind,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

/// Secondary index definition over a single column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexDef {
    pub column: String,
    pub unique: bool,
}

/// Table schema: primary key column, typed columns, secondary indexes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub primary_key: String,
    pub columns: Vec<Column>,
    pub indexes: Vec<IndexDef>,
}

impl TableSchema {
    /// Starts a schema with the given primary-key column. The pk column is
    /// registered as the first column and is never nullable.
    pub fn new(name: impl Into<String>, pk: impl Into<String>, pk_kind: ValueKind) -> Self {
        let pk = pk.into();
        Self {
            name: name.into(),
            primary_key: pk.clone(),
            columns: vec![Column::new(pk, pk_kind)],
            indexes: Vec::new(),
        }
    }

    pub fn column(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.columns.push(Column::new(name, kind));
        self
    }

    pub fn nullable_column(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.columns.push(Column::new(name, kind).nullable());
        self
    }

    pub fn index(mut self, column: impl Into<String>) -> Self {
        self.indexes.push(IndexDef {
            column: column.into(),
            unique: false,
        });
        self
    }

    pub fn unique_index(mut self, column: impl Into<String>) -> Self {
        self.indexes.push(IndexDef {
            column: column.into(),
            unique: true,
        });
        self
    }

    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Extracts the primary-key value of a row.
    pub fn pk_of(&self, row: &Row) -> Result<Value> {
        match row.get(&self.primary_key) {
            Some(Value::Null) | None => Err(DbError::constraint(format!(
                "row for table {} is missing primary key column {}",
                self.name, self.primary_key
            ))),
            Some(v) => Ok(v.clone()),
        }
    }

    /// Validates a full row against this schema.
    ///
    /// Every non-nullable column must be present and non-null; every present
    /// value must match its column tag; columns unknown to the schema are
    /// rejected.
    pub fn validate_row(&self, row: &Row) -> Result<()> {
        for (name, value) in row.columns() {
            let column = self.get_column(name).ok_or_else(|| {
                DbError::constraint(format!("unknown column {} in table {}", name, self.name))
            })?;
            if value.is_null() {
                if !column.nullable {
                    return Err(DbError::constraint(format!(
                        "column {}.{} is not nullable",
                        self.name, column.name
                    )));
                }
            } else if value.kind() != column.kind {
                return Err(DbError::type_mismatch(format!(
                    "column {}.{} expects {}, got {}",
                    self.name,
                    column.name,
                    column.kind,
                    value.kind()
                )));
            }
        }
        for column in &self.columns {
            if !column.nullable && row.get(&column.name).is_none() {
                return Err(DbError::constraint(format!(
                    "column {}.{} is required",
                    self.name, column.name
                )));
            }
        }
        Ok(())
    }
}

/// Catalog manages table schemas for one store.
#[derive(Clone)]
pub struct Catalog {
    schemas: Arc<RwLock<HashMap<String, TableSchema>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            schemas: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Registers a schema. Idempotent by table name: re-creating an existing
    /// table is a no-op, but re-creating it with a different shape is a
    /// catalog error.
    pub fn create_table(&self, schema: TableSchema) -> Result<()> {
        let mut schemas = self.schemas.write();
        if let Some(existing) = schemas.get(&schema.name) {
            if *existing != schema {
                return Err(DbError::Catalog(format!(
                    "table {} already exists with a different schema",
                    schema.name
                )));
            }
            return Ok(());
        }
        schemas.insert(schema.name.clone(), schema);
        Ok(())
    }

    pub fn get_table(&self, name: &str) -> Result<TableSchema> {
        self.schemas
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::UnknownTable(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.schemas.read().contains_key(name)
    }

    pub fn list_tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schemas.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Bootstrap schema
// ============================================================================

/// Store identifier for the financial store.
pub const FINANCIAL: &str = "financial";

/// Store identifier for the inventory store.
pub const INVENTORY: &str = "inventory";

/// Tables installed into the financial store at initialization.
pub fn financial_tables() -> Vec<TableSchema> {
    vec![
        TableSchema::new("users", "id", ValueKind::Integer)
            .column("username", ValueKind::String)
            .column("email", ValueKind::String)
            .unique_index("username"),
        TableSchema::new("accounts", "id", ValueKind::Integer)
            .column("user_id", ValueKind::Integer)
            .column("type", ValueKind::String)
            .column("balance", ValueKind::Decimal)
            .index("user_id"),
        TableSchema::new("transactions", "id", ValueKind::Integer)
            .column("account_id", ValueKind::Integer)
            .column("kind", ValueKind::String)
            .column("amount", ValueKind::Decimal)
            .column("ts", ValueKind::Timestamp)
            .index("account_id"),
    ]
}

/// Tables installed into the inventory store at initialization.
pub fn inventory_tables() -> Vec<TableSchema> {
    vec![
        TableSchema::new("categories", "id", ValueKind::Integer)
            .column("name", ValueKind::String)
            .nullable_column("parent_id", ValueKind::Integer)
            .unique_index("name")
            .index("parent_id"),
        TableSchema::new("products", "id", ValueKind::Integer)
            .column("category_id", ValueKind::Integer)
            .column("name", ValueKind::String)
            .column("price", ValueKind::Decimal)
            .column("stock", ValueKind::Integer)
            .index("category_id"),
        TableSchema::new("orders", "id", ValueKind::Integer)
            .column("user_id", ValueKind::Integer)
            .column("status", ValueKind::String)
            .column("total", ValueKind::Decimal)
            .column("ts", ValueKind::Timestamp)
            .index("user_id"),
        TableSchema::new("order_items", "id", ValueKind::Integer)
            .column("order_id", ValueKind::Integer)
            .column("product_id", ValueKind::Integer)
            .column("qty", ValueKind::Integer)
            .column("unit_price", ValueKind::Decimal)
            .index("order_id")
            .index("product_id"),
    ]
}
