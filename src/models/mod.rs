//! Data models for the storage adapter.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod resource_key;
pub mod transaction;

// Re-export commonly used types
pub use connection::{DatabaseType, StorageConfig, StorageConfigError, validate_tenant_id};
pub use resource_key::ResourceKey;
pub use transaction::{IsolationLevel, TransactionAttempt, TransactionState};
