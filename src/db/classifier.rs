//! Transient conflict detection.
//!
//! Decides whether a failed transaction attempt hit a concurrency conflict
//! that a fresh attempt may resolve, or a failure that must surface as is.

use crate::error::DbError;

/// SQLSTATE class for "transaction rollback" (serialization failure, deadlock).
const TRANSACTION_ROLLBACK_CLASS: &str = "40";

/// Message fragments of drivers that don't expose structured codes.
const CONFLICT_MESSAGE_FRAGMENTS: &[&str] = &[
    "concurrent update",
    "concurrent delete",
    "the transaction might succeed if retried",
    "deadlock",
];

/// Outcome of classifying a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    RetryableConflict,
    Fatal,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryableConflict)
    }
}

/// Classify a failure surfaced by the driver or by the transaction body.
pub fn classify(error: &DbError) -> ErrorClass {
    match error {
        // Already classified and wrapped; never retry a second time around.
        DbError::RetriesExhausted { .. }
        | DbError::StorageDisabled { .. }
        | DbError::ShutdownRequested
        | DbError::PoolUnavailable { .. } => return ErrorClass::Fatal,
        _ => {}
    }

    if error
        .sql_state()
        .is_some_and(|code| code.starts_with(TRANSACTION_ROLLBACK_CLASS))
    {
        return ErrorClass::RetryableConflict;
    }

    if message_indicates_conflict(&error.to_string()) {
        return ErrorClass::RetryableConflict;
    }

    ErrorClass::Fatal
}

/// Legacy fallback: case-insensitive substring match on the error text.
fn message_indicates_conflict(message: &str) -> bool {
    let lower = message.to_lowercase();
    CONFLICT_MESSAGE_FRAGMENTS
        .iter()
        .any(|fragment| lower.contains(fragment))
}
