//! Remote store contract.
//!
//! A [`RemoteStore`] is one connection to the backing in-memory data store.
//! The store applies its namespace prefix to every physical key. Keys handed
//! to it are already encoded; it validates them and rejects anything the
//! protocol cannot carry.
//!
//! # Result conventions
//!
//! - `Ok(CacheItem)` with `is_hit() == false` is a miss, not an error.
//! - `Ok(false)` from a write means the backend refused it.
//! - `Err(..)` means validation failed or the backend could not be reached.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use larder_core::{CacheItem, LarderResult, StorageError, TagSet, Timestamp};

/// One connection to the backing store.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Short backend name used in errors and logs.
    fn backend_name(&self) -> &str;

    /// Namespace prefix prepended to every physical key.
    fn namespace(&self) -> &str;

    /// The store's notion of "now". Expiry decisions use this clock.
    fn now(&self) -> Timestamp {
        chrono::Utc::now()
    }

    /// Fetch one item. Misses return an empty handle carrying the key.
    async fn get_item(&self, key: &str) -> LarderResult<CacheItem>;

    /// Fetch many items, returned in input order.
    async fn get_items(&self, keys: &[String]) -> LarderResult<Vec<CacheItem>> {
        let mut items = Vec::with_capacity(keys.len());
        for key in keys {
            items.push(self.get_item(key).await?);
        }
        Ok(items)
    }

    /// Persist an item together with its expiry and tags in one step.
    ///
    /// An item whose expiry has already passed is removed instead.
    async fn save(&self, item: CacheItem) -> LarderResult<bool>;

    /// Delete one item. Deleting an absent key succeeds.
    async fn delete_item(&self, key: &str) -> LarderResult<bool>;

    /// Delete every item in this connection's namespace.
    async fn clear(&self) -> LarderResult<bool>;

    /// Delete every item carrying any of `tags`.
    ///
    /// Must not scan the namespace. Once this returns `Ok(true)` no read may
    /// observe an invalidated item.
    async fn invalidate_tags(&self, tags: &TagSet) -> LarderResult<bool>;

    /// Capability hook: native single-round-trip lock primitives.
    fn as_atomic_lock_store(self: Arc<Self>) -> Option<Arc<dyn AtomicLockStore>> {
        None
    }
}

/// Native conditional-set / conditional-delete primitives for locks.
///
/// Lock names are physical: callers apply any prefix themselves and no
/// namespace is added.
#[async_trait]
pub trait AtomicLockStore: Send + Sync {
    /// Set `name` to `owner` only if unset. `ttl` of `None` never expires.
    async fn acquire_lock(&self, name: &str, owner: &str, ttl: Option<Duration>)
        -> LarderResult<bool>;

    /// Delete `name` only if it is held by `owner`.
    async fn release_lock(&self, name: &str, owner: &str) -> LarderResult<bool>;

    /// Delete `name` regardless of owner.
    async fn force_release_lock(&self, name: &str) -> LarderResult<()>;

    /// Current owner of `name`, if held.
    async fn lock_owner(&self, name: &str) -> LarderResult<Option<String>>;

    /// Reset the lifetime of `name` only if it is held by `owner`.
    async fn refresh_lock(&self, name: &str, owner: &str, ttl: Option<Duration>)
        -> LarderResult<bool>;
}

// ============================================================================
// CONNECTION PROVIDER
// ============================================================================

/// Hands out live connections by name.
///
/// Pooling, retries, and reconnection belong to the implementation.
pub trait ConnectionProvider<R: RemoteStore>: Send + Sync {
    fn connection(&self, name: &str) -> LarderResult<Arc<R>>;
}

/// Fixed name → connection registry.
pub struct StaticConnections<R: RemoteStore> {
    connections: HashMap<String, Arc<R>>,
}

impl<R: RemoteStore> StaticConnections<R> {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    /// Register a connection under `name`, replacing any previous one.
    pub fn with(mut self, name: impl Into<String>, connection: Arc<R>) -> Self {
        self.connections.insert(name.into(), connection);
        self
    }
}

impl<R: RemoteStore> Default for StaticConnections<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: RemoteStore> ConnectionProvider<R> for StaticConnections<R> {
    fn connection(&self, name: &str) -> LarderResult<Arc<R>> {
        self.connections.get(name).cloned().ok_or_else(|| {
            StorageError::ConnectionNotFound {
                name: name.to_string(),
            }
            .into()
        })
    }
}
