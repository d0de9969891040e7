//! Multi-tenant storage layer.
//!
//! Maps logical tenants onto shared physical resources. Each tenant's
//! [`StorageConfig`] resolves to a [`ResourceKey`]; tenants with equal keys
//! share one configuration object, one on/off switch and one connection pool
//! in the [`ResourceDistributor`].

use crate::db::distributor::ResourceDistributor;
use crate::db::events::{EventSink, TracingEventSink};
use crate::db::executor::{PoolResolver, StorageSwitch, TransactionExecutor};
use crate::db::pinned::PinnedTransaction;
use crate::db::pool::SqlConnector;
use crate::db::pool_manager::{ConnectionPoolManager, Connector};
use crate::db::retry::RetryProfile;
use crate::db::session::SessionSource;
use crate::error::{DbError, DbResult};
use crate::models::{IsolationLevel, ResourceKey, StorageConfig, validate_tenant_id};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

type SessionOf<C> = <<C as Connector>::Pool as SessionSource>::Session;

struct TenantEntry {
    key: ResourceKey,
}

pub struct StorageLayer<C: Connector = SqlConnector> {
    distributor: Arc<ResourceDistributor>,
    pools: Arc<ConnectionPoolManager<C>>,
    tenants: RwLock<HashMap<String, TenantEntry>>,
    events: Arc<dyn EventSink>,
    shutdown: CancellationToken,
}

impl StorageLayer<SqlConnector> {
    /// Storage layer over sqlx pools, logging events through `tracing`.
    pub fn new() -> Self {
        Self::with_connector(SqlConnector, Arc::new(TracingEventSink::new()))
    }
}

impl Default for StorageLayer<SqlConnector> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Connector> StorageLayer<C> {
    pub fn with_connector(connector: C, events: Arc<dyn EventSink>) -> Self {
        let distributor = Arc::new(ResourceDistributor::new());
        let shutdown = CancellationToken::new();
        let pools = Arc::new(ConnectionPoolManager::new(
            connector,
            Arc::clone(&distributor),
            Arc::clone(&events),
            shutdown.clone(),
        ));
        Self {
            distributor,
            pools,
            tenants: RwLock::new(HashMap::new()),
            events,
            shutdown,
        }
    }

    /// Register a tenant without connecting.
    ///
    /// The first tenant registered for a physical target decides the shared
    /// configuration and initial `disabled` state of that target.
    pub async fn register_tenant(
        &self,
        tenant_id: &str,
        config: StorageConfig,
    ) -> DbResult<ResourceKey> {
        validate_tenant_id(tenant_id).map_err(|e| DbError::invalid_input(e.to_string()))?;
        let key = ResourceKey::derive(&config)?;

        let mut tenants = self.tenants.write().await;
        if tenants.contains_key(tenant_id) {
            return Err(DbError::invalid_input(format!(
                "Tenant '{}' is already registered",
                tenant_id
            )));
        }

        let disabled = config.disabled;
        let shared = config.clone();
        self.distributor
            .get_or_create(&key, || async move { shared })
            .await?;
        self.distributor
            .get_or_create(&key, || async move { StorageSwitch::new(disabled) })
            .await?;

        info!(
            tenant_id = %tenant_id,
            resource = %key,
            db_type = %config.db_type,
            "Registered tenant"
        );
        tenants.insert(
            tenant_id.to_string(),
            TenantEntry { key: key.clone() },
        );
        Ok(key)
    }

    /// Bootstrap the tenant's pool, waiting out an unreachable database.
    ///
    /// Intended for process startup: the caller treats
    /// [`DbError::PoolUnavailable`] as fatal.
    pub async fn bootstrap_tenant(&self, tenant_id: &str) -> DbResult<Arc<C::Pool>> {
        let key = self.resource_key(tenant_id).await?;
        let config = self.shared_config(&key).await?;
        self.pools.bootstrap(&key, &config).await
    }

    /// Configuration shared by every tenant on the same physical target.
    pub async fn tenant_config(&self, tenant_id: &str) -> DbResult<Arc<StorageConfig>> {
        let key = self.resource_key(tenant_id).await?;
        self.shared_config(&key).await
    }

    pub async fn resource_key(&self, tenant_id: &str) -> DbResult<ResourceKey> {
        let tenants = self.tenants.read().await;
        tenants
            .get(tenant_id)
            .map(|entry| entry.key.clone())
            .ok_or_else(|| DbError::tenant_not_found(tenant_id))
    }

    /// The tenant's pool, bootstrapping it on first use.
    pub async fn pool(&self, tenant_id: &str) -> DbResult<Arc<C::Pool>> {
        let key = self.resource_key(tenant_id).await?;
        self.pools.get_pool(&key).await
    }

    /// Executor with the default retry profile.
    pub async fn executor(&self, tenant_id: &str) -> DbResult<TransactionExecutor<C::Pool>> {
        self.executor_with(tenant_id, RetryProfile::Default).await
    }

    /// Executor with the bulk retry profile for high-contention batch work.
    pub async fn bulk_executor(&self, tenant_id: &str) -> DbResult<TransactionExecutor<C::Pool>> {
        self.executor_with(tenant_id, RetryProfile::Bulk).await
    }

    pub async fn begin_pinned(
        &self,
        tenant_id: &str,
        isolation_level: IsolationLevel,
    ) -> DbResult<PinnedTransaction<SessionOf<C>>> {
        self.executor(tenant_id)
            .await?
            .begin_pinned(isolation_level)
            .await
    }

    /// Administratively turn storage for the tenant's physical target off or on.
    pub async fn set_disabled(&self, tenant_id: &str, disabled: bool) -> DbResult<()> {
        let key = self.resource_key(tenant_id).await?;
        let switch = self.switch(&key).await?;
        switch.set_disabled(disabled);
        info!(tenant_id = %tenant_id, resource = %key, disabled, "Storage switch changed");
        Ok(())
    }

    /// Forget a tenant. Shared resources are torn down once no tenant uses them.
    pub async fn remove_tenant(&self, tenant_id: &str) -> DbResult<()> {
        let mut tenants = self.tenants.write().await;
        let entry = tenants
            .remove(tenant_id)
            .ok_or_else(|| DbError::tenant_not_found(tenant_id))?;

        let still_shared = tenants.values().any(|other| other.key == entry.key);
        drop(tenants);

        info!(tenant_id = %tenant_id, resource = %entry.key, still_shared, "Removed tenant");
        if !still_shared {
            self.pools.shutdown(&entry.key).await;
            self.distributor.remove::<StorageConfig>(&entry.key).await;
            self.distributor.remove::<StorageSwitch>(&entry.key).await;
        }
        Ok(())
    }

    /// Cancel pending bootstraps and retries, then close every pool.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let mut tenants = self.tenants.write().await;
        let mut keys: Vec<ResourceKey> = tenants.drain().map(|(_, entry)| entry.key).collect();
        drop(tenants);
        keys.sort_by_cached_key(|key| key.to_string());
        keys.dedup();

        for key in &keys {
            self.pools.shutdown(key).await;
        }
        self.distributor.clear().await;
        info!(resources = keys.len(), "Storage layer shut down");
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub async fn tenant_count(&self) -> usize {
        self.tenants.read().await.len()
    }

    async fn executor_with(
        &self,
        tenant_id: &str,
        profile: RetryProfile,
    ) -> DbResult<TransactionExecutor<C::Pool>> {
        let key = self.resource_key(tenant_id).await?;
        let switch = self.switch(&key).await?;
        // Bootstrap now so configuration problems surface here, not on first use.
        self.pools.get_pool(&key).await?;

        let resource = key.to_string();
        let pools = Arc::clone(&self.pools);
        let resolver: PoolResolver<C::Pool> =
            Arc::new(move || -> BoxFuture<'static, DbResult<Arc<C::Pool>>> {
                let pools = Arc::clone(&pools);
                let key = key.clone();
                Box::pin(async move { pools.get_pool(&key).await })
            });
        Ok(TransactionExecutor::with_resolver(resolver, resource)
            .with_profile(profile)
            .with_events(Arc::clone(&self.events))
            .with_switch(switch)
            .with_shutdown(self.shutdown.clone()))
    }

    async fn shared_config(&self, key: &ResourceKey) -> DbResult<Arc<StorageConfig>> {
        self.distributor
            .get::<StorageConfig>(key)
            .await
            .ok_or_else(|| {
                DbError::internal(format!("No storage configuration registered for {}", key))
            })
    }

    async fn switch(&self, key: &ResourceKey) -> DbResult<Arc<StorageSwitch>> {
        self.distributor
            .get::<StorageSwitch>(key)
            .await
            .ok_or_else(|| DbError::internal(format!("No storage switch registered for {}", key)))
    }
}

impl<C: Connector> std::fmt::Debug for StorageLayer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageLayer")
            .field("shutdown_requested", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}
