use thiserror::Error;

/// Crate-level result alias.
pub type Result<T> = std::result::Result<T, DbError>;

/// Errors raised by the catalog and record-store layers.
///
/// These are deterministic pre-checks: raising one does not by itself abort a
/// transaction. The coordinator decides whether an operation failure becomes
/// an abort.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("Unknown store: {0}")]
    UnknownStore(String),

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Duplicate primary key {key} in table {table}")]
    DuplicatePk { table: String, key: String },

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl DbError {
    pub fn duplicate_pk(table: impl Into<String>, key: impl std::fmt::Display) -> Self {
        DbError::DuplicatePk {
            table: table.into(),
            key: key.to_string(),
        }
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        DbError::TypeMismatch(message.into())
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        DbError::ConstraintViolation(message.into())
    }
}
