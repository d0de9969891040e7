//! Transaction-related data models.

use crate::models::DatabaseType;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Isolation level requested for a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    #[default]
    Serializable,
    RepeatableRead,
    ReadCommitted,
    ReadUncommitted,
    /// Leave the connection's current level untouched.
    None,
}

impl IsolationLevel {
    /// SQL keyword form, e.g. `REPEATABLE READ`. `None` has no keyword.
    pub fn as_sql(&self) -> Option<&'static str> {
        match self {
            Self::Serializable => Some("SERIALIZABLE"),
            Self::RepeatableRead => Some("REPEATABLE READ"),
            Self::ReadCommitted => Some("READ COMMITTED"),
            Self::ReadUncommitted => Some("READ UNCOMMITTED"),
            Self::None => None,
        }
    }

    /// Level a freshly pooled connection of this engine runs at.
    pub fn engine_default(db_type: DatabaseType) -> Self {
        match db_type {
            DatabaseType::PostgreSQL => Self::ReadCommitted,
            DatabaseType::MySQL => Self::RepeatableRead,
            DatabaseType::SQLite => Self::Serializable,
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_sql().unwrap_or("NONE"))
    }
}

/// One pass through acquire/configure/execute/commit/release.
#[derive(Debug, Clone, Copy)]
pub struct TransactionAttempt {
    /// 1-based.
    pub number: u32,
    pub isolation_level: IsolationLevel,
    pub started_at: Instant,
}

impl TransactionAttempt {
    pub fn new(number: u32, isolation_level: IsolationLevel) -> Self {
        Self {
            number,
            isolation_level,
            started_at: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.started_at.elapsed().as_millis()
    }
}

/// State of a pinned transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

impl TransactionState {
    /// Check if the transaction is still active.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Check if the transaction has ended (committed or rolled back).
    pub fn is_ended(&self) -> bool {
        !self.is_active()
    }
}
