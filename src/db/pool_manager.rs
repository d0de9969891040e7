//! One connection pool per physical database target.
//!
//! Pools live in the shared [`ResourceDistributor`] under their
//! [`ResourceKey`], next to the [`StorageConfig`] they were built from, so
//! tenants resolving to the same target share one pool.
//!
//! # Single initializer
//!
//! Bootstrap runs inside the distributor's single-flight slot: exactly one
//! task constructs the pool (including the whole unreachable-database wait),
//! every concurrent caller for the same key awaits that task's outcome.

use crate::db::bootstrap::bootstrap_with_retry;
use crate::db::distributor::ResourceDistributor;
use crate::db::events::EventSink;
use crate::db::session::SessionSource;
use crate::error::{DbError, DbResult};
use crate::models::{ResourceKey, StorageConfig};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Builds a pool for a storage configuration.
pub trait Connector: Send + Sync + 'static {
    type Pool: SessionSource;

    fn connect(&self, config: &StorageConfig) -> impl Future<Output = DbResult<Self::Pool>> + Send;
}

pub struct ConnectionPoolManager<C: Connector> {
    connector: C,
    distributor: Arc<ResourceDistributor>,
    events: Arc<dyn EventSink>,
    shutdown: CancellationToken,
}

impl<C: Connector> ConnectionPoolManager<C> {
    pub fn new(
        connector: C,
        distributor: Arc<ResourceDistributor>,
        events: Arc<dyn EventSink>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            connector,
            distributor,
            events,
            shutdown,
        }
    }

    /// Bootstrap the pool for `key`, or return the existing one.
    ///
    /// Waits out an unreachable database as configured in
    /// `config.bootstrap`; fails with [`DbError::PoolUnavailable`] when the
    /// budget is spent and [`DbError::ShutdownRequested`] on shutdown.
    pub async fn bootstrap(
        &self,
        key: &ResourceKey,
        config: &StorageConfig,
    ) -> DbResult<Arc<C::Pool>> {
        let resource = key.to_string();
        self.distributor
            .get_or_try_create(key, || async {
                info!(
                    resource = %resource,
                    target = %config.masked_connection_string(),
                    "Bootstrapping connection pool"
                );
                bootstrap_with_retry(
                    &resource,
                    &config.bootstrap,
                    &self.shutdown,
                    self.events.as_ref(),
                    || self.connector.connect(config),
                )
                .await
            })
            .await
    }

    /// Pool for `key`. Bootstraps from the registered config on first use.
    pub async fn get_pool(&self, key: &ResourceKey) -> DbResult<Arc<C::Pool>> {
        if let Some(pool) = self.distributor.get::<C::Pool>(key).await {
            return Ok(pool);
        }

        let config = self
            .distributor
            .get::<StorageConfig>(key)
            .await
            .ok_or_else(|| {
                DbError::invalid_input(format!("No storage configuration registered for {}", key))
            })?;
        self.bootstrap(key, &config).await
    }

    /// Already bootstrapped pool, without triggering a bootstrap.
    pub async fn existing_pool(&self, key: &ResourceKey) -> Option<Arc<C::Pool>> {
        self.distributor.get::<C::Pool>(key).await
    }

    /// Close the pool for `key` and forget it; the next `get_pool` re-bootstraps.
    pub async fn shutdown(&self, key: &ResourceKey) {
        if let Some(pool) = self.distributor.remove::<C::Pool>(key).await {
            info!(resource = %key, "Closing connection pool");
            pool.close().await;
        }
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}

impl<C: Connector> std::fmt::Debug for ConnectionPoolManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPoolManager")
            .field("shutdown_requested", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BootstrapOptions;
    use crate::db::events::TracingEventSink;
    use crate::db::pool::{DbPool, SqlConnector};
    use std::time::{Duration, Instant};

    struct Unreachable;

    impl Connector for Unreachable {
        type Pool = DbPool;

        async fn connect(&self, _config: &StorageConfig) -> DbResult<DbPool> {
            Err(DbError::connection("connection refused", "start the database"))
        }
    }

    fn manager<C: Connector>(connector: C) -> ConnectionPoolManager<C> {
        ConnectionPoolManager::new(
            connector,
            Arc::new(ResourceDistributor::new()),
            Arc::new(TracingEventSink::new()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_get_pool_without_config_fails() {
        let manager = manager(SqlConnector);
        let config = StorageConfig::new("sqlite::memory:").unwrap();
        let key = ResourceKey::derive(&config).unwrap();
        let result = manager.get_pool(&key).await;
        assert!(matches!(result, Err(DbError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn test_bootstrap_reuses_pool_and_shutdown_forgets_it() {
        let manager = manager(SqlConnector);
        let config = StorageConfig::new("sqlite::memory:").unwrap();
        let key = ResourceKey::derive(&config).unwrap();

        let first = manager.bootstrap(&key, &config).await.unwrap();
        let second = manager.bootstrap(&key, &config).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        manager.shutdown(&key).await;
        assert!(first.is_closed());
        assert!(manager.existing_pool(&key).await.is_none());

        let third = manager.bootstrap(&key, &config).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[tokio::test]
    async fn test_unreachable_database_times_out() {
        let manager = manager(Unreachable);
        let config = StorageConfig::new("postgres://u:p@db.invalid/auth")
            .unwrap()
            .with_bootstrap(BootstrapOptions {
                retry_interval_ms: Some(25),
                max_wait_ms: Some(200),
            });
        let key = ResourceKey::derive(&config).unwrap();

        let started = Instant::now();
        let result = manager.bootstrap(&key, &config).await;
        assert!(matches!(result, Err(DbError::PoolUnavailable { .. })));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(manager.existing_pool(&key).await.is_none());
    }
}
