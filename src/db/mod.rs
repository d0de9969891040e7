//! Database abstraction layer.
//!
//! This module provides the transactional engine:
//! - Error classification and retry profiles
//! - Retrying transaction executor and pinned batch transactions
//! - Leased sessions that restore pool defaults on release
//! - Connection pool bootstrap and per-target pool management
//! - Keyed singleton cache shared across tenants
//! - Database dispatch macros for reducing code duplication

pub mod bootstrap;
pub mod classifier;
pub mod distributor;
pub mod events;
pub mod executor;
#[macro_use]
pub mod macros;
pub mod pinned;
pub mod pool;
pub mod pool_manager;
pub mod retry;
pub mod session;

pub use classifier::{ErrorClass, classify};
pub use distributor::ResourceDistributor;
pub use events::{EventCounts, EventSink, StorageEvent, TracingEventSink};
pub use executor::{PoolResolver, StorageSwitch, TransactionExecutor};
pub use pinned::PinnedTransaction;
pub use pool::{DbPool, SqlConnection, SqlConnector, SqlSession};
pub use pool_manager::{ConnectionPoolManager, Connector};
pub use retry::{RetryDecision, RetryProfile};
pub use session::{LeasedSession, Session, SessionDefaults, SessionSource};
