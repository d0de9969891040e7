//! Relational storage adapter for authentication services.
//!
//! Provides the transactional core beneath per-recipe CRUD code: a retrying
//! transaction executor, connection pool bootstrap tolerant of databases that
//! are still starting, and a keyed cache letting tenants on the same physical
//! database share one pool (SQLite, PostgreSQL, MySQL).

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod storage;

pub use config::Config;
pub use error::{DbError, DbResult};
pub use storage::StorageLayer;
