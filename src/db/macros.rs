//! Database dispatch macros for reducing code duplication.
//!
//! This module provides declarative macros that generate engine-specific
//! match arms while maintaining linear readability. The macros expand
//! at compile time with zero runtime overhead.

/// Macro for generating engine dispatch match arms.
///
/// Works on any of the per-engine enums in [`pool`](crate::db::pool)
/// (`DbPool`, `SqlConnection`), which share variant names.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(DbPool, pool, {
///     MySql(p) => p.close().await,
///     Postgres(p) => p.close().await,
///     SQLite(p) => p.close().await,
/// });
/// ```
#[macro_export]
macro_rules! impl_db_dispatch {
    ($enum:ident, $value:expr, { $($variant:ident($p:ident) => $body:expr),+ $(,)? }) => {
        match $value {
            $(
                $crate::db::pool::$enum::$variant($p) => $body,
            )+
        }
    };
}

pub use impl_db_dispatch;
