//! Lock backends.
//!
//! A backend is picked once, when the lock object is built, by asking the
//! lock connection whether it offers native lock primitives:
//!
//! - [`AtomicLockBackend`]: one round trip per operation through
//!   [`AtomicLockStore`]. Names are used verbatim.
//! - [`GenericLockBackend`]: built from plain item reads and writes. Names go
//!   through the key codec like any other cache key. Acquisition is
//!   check, write, then re-read. That catches a contender whose write landed
//!   before ours, but it does not exclude truly concurrent acquirers: if each
//!   re-reads its own write before the other writes, both acquire.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use larder_core::{encode_key, CacheItem, CacheValue, Expiry, LarderResult, TagSet};
use larder_store::{AtomicLockStore, RemoteStore};

/// Which strategy a lock runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Atomic,
    Generic,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Atomic => write!(f, "atomic"),
            BackendKind::Generic => write!(f, "generic"),
        }
    }
}

/// Strategy object behind a lock. `ttl` of `None` never expires.
#[async_trait]
pub trait LockBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn try_acquire(&self, name: &str, owner: &str, ttl: Option<Duration>)
        -> LarderResult<bool>;

    async fn release(&self, name: &str, owner: &str) -> LarderResult<bool>;

    async fn force_release(&self, name: &str) -> LarderResult<()>;

    async fn owner(&self, name: &str) -> LarderResult<Option<String>>;

    async fn refresh(&self, name: &str, owner: &str, ttl: Option<Duration>) -> LarderResult<bool>;
}

/// Choose the backend for `connection` by capability.
pub fn select_backend<R: RemoteStore>(connection: &Arc<R>) -> Arc<dyn LockBackend> {
    match Arc::clone(connection).as_atomic_lock_store() {
        Some(store) => Arc::new(AtomicLockBackend::new(store)),
        None => Arc::new(GenericLockBackend::new(Arc::clone(connection))),
    }
}

// ============================================================================
// ATOMIC
// ============================================================================

pub struct AtomicLockBackend {
    store: Arc<dyn AtomicLockStore>,
}

impl AtomicLockBackend {
    pub fn new(store: Arc<dyn AtomicLockStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl LockBackend for AtomicLockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Atomic
    }

    async fn try_acquire(
        &self,
        name: &str,
        owner: &str,
        ttl: Option<Duration>,
    ) -> LarderResult<bool> {
        self.store.acquire_lock(name, owner, ttl).await
    }

    async fn release(&self, name: &str, owner: &str) -> LarderResult<bool> {
        self.store.release_lock(name, owner).await
    }

    async fn force_release(&self, name: &str) -> LarderResult<()> {
        self.store.force_release_lock(name).await
    }

    async fn owner(&self, name: &str) -> LarderResult<Option<String>> {
        self.store.lock_owner(name).await
    }

    async fn refresh(&self, name: &str, owner: &str, ttl: Option<Duration>) -> LarderResult<bool> {
        self.store.refresh_lock(name, owner, ttl).await
    }
}

// ============================================================================
// GENERIC
// ============================================================================

pub struct GenericLockBackend<R: RemoteStore> {
    remote: Arc<R>,
}

impl<R: RemoteStore> GenericLockBackend<R> {
    pub fn new(remote: Arc<R>) -> Self {
        Self { remote }
    }

    async fn held_by(&self, key: &str) -> LarderResult<Option<String>> {
        let item = self.remote.get_item(key).await?;
        Ok(match item.into_value() {
            Some(CacheValue::String(owner)) => Some(owner),
            _ => None,
        })
    }

    async fn write(&self, key: &str, owner: &str, ttl: Option<Duration>) -> LarderResult<bool> {
        let mut item = CacheItem::miss(key);
        item.set(CacheValue::from(owner))
            .with_expiry(ttl.map_or(Expiry::Never, Expiry::After))
            .tag(TagSet::empty());
        self.remote.save(item).await
    }
}

#[async_trait]
impl<R: RemoteStore> LockBackend for GenericLockBackend<R> {
    fn kind(&self) -> BackendKind {
        BackendKind::Generic
    }

    async fn try_acquire(
        &self,
        name: &str,
        owner: &str,
        ttl: Option<Duration>,
    ) -> LarderResult<bool> {
        let key = encode_key(name);
        if self.held_by(&key).await?.is_some() {
            return Ok(false);
        }
        if !self.write(&key, owner, ttl).await? {
            return Ok(false);
        }
        Ok(self.held_by(&key).await?.as_deref() == Some(owner))
    }

    async fn release(&self, name: &str, owner: &str) -> LarderResult<bool> {
        let key = encode_key(name);
        if self.held_by(&key).await?.as_deref() != Some(owner) {
            return Ok(false);
        }
        self.remote.delete_item(&key).await
    }

    async fn force_release(&self, name: &str) -> LarderResult<()> {
        self.remote.delete_item(&encode_key(name)).await?;
        Ok(())
    }

    async fn owner(&self, name: &str) -> LarderResult<Option<String>> {
        self.held_by(&encode_key(name)).await
    }

    async fn refresh(&self, name: &str, owner: &str, ttl: Option<Duration>) -> LarderResult<bool> {
        let key = encode_key(name);
        if self.held_by(&key).await?.as_deref() != Some(owner) {
            return Ok(false);
        }
        self.write(&key, owner, ttl).await
    }
}
