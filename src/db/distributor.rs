//! Keyed cache of singleton resources shared across tenants.
//!
//! Every physical database target (a [`ResourceKey`]) owns at most one
//! instance of each resource type: one config object, one connection pool.
//! Tenants resolving to the same key receive the same `Arc`.
//!
//! # Single-flight creation
//!
//! Each (key, type) slot is an `Arc<OnceCell<_>>`. The first caller runs the
//! factory; concurrent callers await the same initialization and observe its
//! result. A factory error leaves the cell empty so a later call may retry.
//!
//! The map lock is never held across the factory's await points: the cell is
//! cloned out under a brief lock and initialized outside it.

use crate::error::{DbError, DbResult};
use crate::models::ResourceKey;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::debug;

type Resource = Arc<dyn Any + Send + Sync>;
type Slot = Arc<OnceCell<Resource>>;

/// Explicit, passed-around keyed store of lazily constructed singletons.
#[derive(Default)]
pub struct ResourceDistributor {
    slots: RwLock<HashMap<(ResourceKey, TypeId), Slot>>,
}

impl ResourceDistributor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the resource of type `T` for `key`, constructing it on first use.
    ///
    /// `factory` runs at most once per key and type until the slot is removed.
    pub async fn get_or_try_create<T, F, Fut>(&self, key: &ResourceKey, factory: F) -> DbResult<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let cell = self.slot::<T>(key).await;
        let resource = cell
            .get_or_try_init(|| async {
                debug!(resource = %key, kind = std::any::type_name::<T>(), "Creating shared resource");
                let value = factory().await?;
                Ok::<Resource, DbError>(Arc::new(value))
            })
            .await?;
        Self::downcast(resource.clone())
    }

    /// Infallible variant of [`get_or_try_create`](Self::get_or_try_create).
    pub async fn get_or_create<T, F, Fut>(&self, key: &ResourceKey, factory: F) -> DbResult<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.get_or_try_create(key, || async { Ok(factory().await) })
            .await
    }

    /// Get an already constructed resource without creating it.
    pub async fn get<T: Any + Send + Sync>(&self, key: &ResourceKey) -> Option<Arc<T>> {
        let slots = self.slots.read().await;
        let resource = slots.get(&(key.clone(), TypeId::of::<T>()))?.get()?.clone();
        Self::downcast(resource).ok()
    }

    /// Remove the resource of type `T` for `key`. Only used during teardown.
    ///
    /// The next `get_or_*` call for the same key and type constructs afresh.
    pub async fn remove<T: Any + Send + Sync>(&self, key: &ResourceKey) -> Option<Arc<T>> {
        let removed = {
            let mut slots = self.slots.write().await;
            slots.remove(&(key.clone(), TypeId::of::<T>()))
        }?;
        let resource = removed.get()?.clone();
        Self::downcast(resource).ok()
    }

    /// Number of constructed resources across all keys and types.
    pub async fn len(&self) -> usize {
        let slots = self.slots.read().await;
        slots.values().filter(|cell| cell.get().is_some()).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every cached resource.
    pub async fn clear(&self) {
        let mut slots = self.slots.write().await;
        slots.clear();
    }

    async fn slot<T: Any>(&self, key: &ResourceKey) -> Slot {
        let slot_key = (key.clone(), TypeId::of::<T>());
        {
            let slots = self.slots.read().await;
            if let Some(cell) = slots.get(&slot_key) {
                return Arc::clone(cell);
            }
        }

        let mut slots = self.slots.write().await;
        // Double-check after acquiring write lock
        Arc::clone(slots.entry(slot_key).or_default())
    }

    fn downcast<T: Any + Send + Sync>(resource: Resource) -> DbResult<Arc<T>> {
        resource.downcast::<T>().map_err(|_| {
            DbError::internal(format!(
                "Shared resource has unexpected type, expected {}",
                std::any::type_name::<T>()
            ))
        })
    }
}

impl std::fmt::Debug for ResourceDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceDistributor").finish_non_exhaustive()
    }
}
