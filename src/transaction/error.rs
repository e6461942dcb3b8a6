//! Transaction-layer error types.
//!
//! Every abort carries a cause from the closed [`AbortCause`] taxonomy. The
//! coordinator's retry loop absorbs restartable causes up to the configured
//! bound; non-restartable causes surface to the caller immediately.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::{Timestamp, TransactionId};
use crate::error::DbError;

use super::types::TransactionState;

/// Result type alias for transaction operations.
pub type TransactionResult<T> = std::result::Result<T, TransactionError>;

/// Why a transaction was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbortCause {
    /// A write violated timestamp order against a committed read or write.
    TimestampOrder,
    /// Chosen as the victim of wait-for cycle resolution.
    Deadlock,
    /// A two-phase-commit participant vetoed prepare.
    PrepareFail,
    /// A wait exceeded the configured timeout.
    Timeout,
    /// A unique/PK/schema invariant was broken by the caller.
    ConstraintViolation,
    /// A value tag was incompatible with a column.
    TypeMismatch,
    /// The caller aborted or cancelled the transaction.
    UserAbort,
}

impl AbortCause {
    /// Whether the coordinator may transparently re-run the body.
    pub fn is_restartable(&self) -> bool {
        matches!(
            self,
            AbortCause::TimestampOrder
                | AbortCause::Deadlock
                | AbortCause::PrepareFail
                | AbortCause::Timeout
        )
    }
}

impl std::fmt::Display for AbortCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortCause::TimestampOrder => write!(f, "timestamp-order"),
            AbortCause::Deadlock => write!(f, "deadlock"),
            AbortCause::PrepareFail => write!(f, "prepare-fail"),
            AbortCause::Timeout => write!(f, "timeout"),
            AbortCause::ConstraintViolation => write!(f, "constraint-violation"),
            AbortCause::TypeMismatch => write!(f, "type-mismatch"),
            AbortCause::UserAbort => write!(f, "user-abort"),
        }
    }
}

/// Error type for the transaction layer.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// A write landed behind a committed read or write in timestamp order.
    #[error("timestamp order violation: transaction {txn_id} (ts {ts}) conflicts with ts {conflict_ts} on {chain}")]
    TimestampOrder {
        txn_id: TransactionId,
        ts: Timestamp,
        conflict_ts: Timestamp,
        chain: String,
    },

    /// This transaction was the victim of cycle resolution.
    #[error("deadlock detected: cycle {} broken by aborting transaction {victim}", format_txn_cycle(cycle))]
    Deadlock {
        /// The transactions involved in the deadlock cycle.
        cycle: Vec<TransactionId>,
        /// The transaction selected as the victim.
        victim: TransactionId,
    },

    /// A participant store vetoed the prepare phase.
    #[error("prepare vetoed by store '{store}' for transaction {txn_id}: {reason}")]
    PrepareFail {
        txn_id: TransactionId,
        store: String,
        reason: String,
    },

    /// A wait on a peer writer exceeded the timeout.
    #[error("transaction {txn_id} timed out after {waited:?} waiting on {chain}")]
    WaitTimeout {
        txn_id: TransactionId,
        chain: String,
        waited: Duration,
    },

    /// A caller-level invariant was broken.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// A value tag was incompatible with a column.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// The caller aborted the transaction.
    #[error("transaction {0} aborted by caller")]
    UserAbort(TransactionId),

    /// A restartable cause persisted past the restart bound.
    #[error("transaction aborted ({cause}) with restarts exhausted after {attempts} attempts")]
    RetriesExhausted { cause: AbortCause, attempts: u32 },

    /// Operation addressed to a transaction no longer known.
    #[error("transaction {0} not found")]
    TransactionNotFound(TransactionId),

    /// Illegal lifecycle transition.
    #[error("invalid state transition for transaction {txn_id}: {from} -> {to}")]
    InvalidStateTransition {
        txn_id: TransactionId,
        from: TransactionState,
        to: TransactionState,
    },

    /// A catalog or record-store pre-check failed.
    #[error(transparent)]
    Store(#[from] DbError),
}

impl TransactionError {
    pub fn timestamp_order(
        txn_id: TransactionId,
        ts: Timestamp,
        conflict_ts: Timestamp,
        chain: impl ToString,
    ) -> Self {
        TransactionError::TimestampOrder {
            txn_id,
            ts,
            conflict_ts,
            chain: chain.to_string(),
        }
    }

    pub fn deadlock(cycle: Vec<TransactionId>, victim: TransactionId) -> Self {
        TransactionError::Deadlock { cycle, victim }
    }

    pub fn prepare_fail(
        txn_id: TransactionId,
        store: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        TransactionError::PrepareFail {
            txn_id,
            store: store.into(),
            reason: reason.into(),
        }
    }

    pub fn wait_timeout(txn_id: TransactionId, chain: impl ToString, waited: Duration) -> Self {
        TransactionError::WaitTimeout {
            txn_id,
            chain: chain.to_string(),
            waited,
        }
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        TransactionError::Constraint(message.into())
    }

    /// The abort cause this error carries, if it is an abort at all.
    pub fn cause(&self) -> Option<AbortCause> {
        match self {
            TransactionError::TimestampOrder { .. } => Some(AbortCause::TimestampOrder),
            TransactionError::Deadlock { .. } => Some(AbortCause::Deadlock),
            TransactionError::PrepareFail { .. } => Some(AbortCause::PrepareFail),
            TransactionError::WaitTimeout { .. } => Some(AbortCause::Timeout),
            TransactionError::Constraint(_) => Some(AbortCause::ConstraintViolation),
            TransactionError::TypeMismatch(_) => Some(AbortCause::TypeMismatch),
            TransactionError::UserAbort(_) => Some(AbortCause::UserAbort),
            TransactionError::RetriesExhausted { cause, .. } => Some(*cause),
            TransactionError::Store(inner) => Some(match inner {
                DbError::TypeMismatch(_) => AbortCause::TypeMismatch,
                _ => AbortCause::ConstraintViolation,
            }),
            TransactionError::TransactionNotFound(_)
            | TransactionError::InvalidStateTransition { .. } => None,
        }
    }

    /// True if the coordinator's retry loop may absorb this error.
    ///
    /// An exhausted retry is final even though its cause was restartable.
    pub fn is_restartable(&self) -> bool {
        match self {
            TransactionError::RetriesExhausted { .. } => false,
            other => other.cause().is_some_and(|c| c.is_restartable()),
        }
    }

    pub fn is_deadlock(&self) -> bool {
        matches!(self, TransactionError::Deadlock { .. })
    }

    /// True if this error is a restartable cause that ran out of restarts.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, TransactionError::RetriesExhausted { .. })
    }
}

/// Helper to format a deadlock cycle for display.
fn format_txn_cycle(cycle: &[TransactionId]) -> String {
    cycle
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}
