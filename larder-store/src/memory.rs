//! In-memory remote store.
//!
//! A [`MemoryServer`] plays the part of the remote data store. Each
//! [`InMemoryRemoteStore`] is a connection to it bound to one namespace, so
//! several stores with different prefixes can share a server the way
//! applications share a cache cluster.
//!
//! # Tag index
//!
//! Each namespace keeps a reverse index from tag to member keys. Saving an
//! item moves its key between index sets; invalidating a tag drains that
//! tag's set and deletes only those members. Cost is proportional to the
//! number of affected items, never to the namespace size.
//!
//! # Expiry
//!
//! Expired items are treated as misses on read and dropped by
//! [`MemoryServer::purge_expired`]. No background task is spawned.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use larder_core::{
    validate_key, CacheItem, CacheValue, Clock, LarderResult, SystemClock, TagSet, Timestamp,
    ValidationError,
};
use tokio::sync::RwLock;

use crate::remote::{AtomicLockStore, RemoteStore};

/// A live item as the server holds it.
#[derive(Debug, Clone)]
struct StoredItem {
    value: CacheValue,
    expires_at: Option<Timestamp>,
    tags: TagSet,
}

impl StoredItem {
    fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Items and tag index for one namespace.
#[derive(Debug, Default)]
struct Namespace {
    items: HashMap<String, StoredItem>,
    tag_index: HashMap<String, HashSet<String>>,
}

impl Namespace {
    fn live(&self, key: &str, now: Timestamp) -> Option<&StoredItem> {
        self.items.get(key).filter(|item| !item.is_expired(now))
    }

    fn insert(&mut self, key: &str, item: StoredItem) {
        self.remove(key);
        for tag in item.tags.iter() {
            self.tag_index
                .entry(tag.to_string())
                .or_default()
                .insert(key.to_string());
        }
        self.items.insert(key.to_string(), item);
    }

    fn remove(&mut self, key: &str) -> Option<StoredItem> {
        let removed = self.items.remove(key)?;
        for tag in removed.tags.iter() {
            if let Some(members) = self.tag_index.get_mut(tag) {
                members.remove(key);
                if members.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
        Some(removed)
    }

    fn invalidate(&mut self, tag: &str) -> usize {
        let Some(members) = self.tag_index.remove(tag) else {
            return 0;
        };
        members
            .iter()
            .filter(|key| self.remove(key).is_some())
            .count()
    }

    fn purge_expired(&mut self, now: Timestamp) -> usize {
        let expired: Vec<String> = self
            .items
            .iter()
            .filter(|(_, item)| item.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }
}

#[derive(Debug, Clone)]
struct LockEntry {
    owner: String,
    expires_at: Option<Timestamp>,
}

impl LockEntry {
    fn is_live(&self, now: Timestamp) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Operation counters, for tests and diagnostics.
#[derive(Debug, Default)]
struct ServerCounters {
    saves: AtomicU64,
    deletes: AtomicU64,
    clears: AtomicU64,
    invalidations: AtomicU64,
}

/// Point-in-time snapshot of server counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStats {
    /// Successful saves.
    pub saves: u64,
    /// Delete calls, including deletes of absent keys.
    pub deletes: u64,
    /// Namespace clears.
    pub clears: u64,
    /// Items removed by tag invalidation.
    pub invalidated_items: u64,
}

// ============================================================================
// SERVER
// ============================================================================

/// Shared in-memory data store.
pub struct MemoryServer {
    namespaces: RwLock<HashMap<String, Namespace>>,
    locks: RwLock<HashMap<String, LockEntry>>,
    clock: Arc<dyn Clock>,
    counters: ServerCounters,
}

impl MemoryServer {
    /// Server on the system clock.
    pub fn new() -> Arc<Self> {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            namespaces: RwLock::new(HashMap::new()),
            locks: RwLock::new(HashMap::new()),
            clock,
            counters: ServerCounters::default(),
        })
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Open a connection bound to `namespace`.
    pub fn connect(self: &Arc<Self>, namespace: impl Into<String>) -> InMemoryRemoteStore {
        InMemoryRemoteStore {
            server: Arc::clone(self),
            namespace: namespace.into(),
            atomic_locks: true,
            read_only: AtomicBool::new(false),
            max_item_bytes: None,
        }
    }

    /// Drop expired items in every namespace. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.now();
        let mut namespaces = self.namespaces.write().await;
        let removed = namespaces
            .values_mut()
            .map(|ns| ns.purge_expired(now))
            .sum();
        namespaces.retain(|_, ns| !ns.items.is_empty());
        let mut locks = self.locks.write().await;
        locks.retain(|_, lock| lock.is_live(now));
        removed
    }

    /// Number of physical items (live or not yet purged) in `namespace`.
    pub async fn item_count(&self, namespace: &str) -> usize {
        self.namespaces
            .read()
            .await
            .get(namespace)
            .map_or(0, |ns| ns.items.len())
    }

    /// Number of keys indexed under `tag` in `namespace`.
    pub async fn tag_member_count(&self, namespace: &str, tag: &str) -> usize {
        self.namespaces
            .read()
            .await
            .get(namespace)
            .and_then(|ns| ns.tag_index.get(tag))
            .map_or(0, HashSet::len)
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            saves: self.counters.saves.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            clears: self.counters.clears.load(Ordering::Relaxed),
            invalidated_items: self.counters.invalidations.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// CONNECTION
// ============================================================================

/// Connection to a [`MemoryServer`] bound to one namespace.
pub struct InMemoryRemoteStore {
    server: Arc<MemoryServer>,
    namespace: String,
    atomic_locks: bool,
    read_only: AtomicBool,
    max_item_bytes: Option<usize>,
}

impl InMemoryRemoteStore {
    /// Standalone store with its own server on the system clock.
    pub fn new(namespace: impl Into<String>) -> Self {
        MemoryServer::new().connect(namespace)
    }

    /// Hide the native lock primitives, forcing lock users onto the
    /// generic set-then-check backend.
    pub fn without_atomic_locks(mut self) -> Self {
        self.atomic_locks = false;
        self
    }

    /// Refuse saves whose serialized value exceeds `bytes`.
    pub fn with_max_item_bytes(mut self, bytes: usize) -> Self {
        self.max_item_bytes = Some(bytes);
        self
    }

    /// Refuse every write until switched back.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn server(&self) -> &Arc<MemoryServer> {
        &self.server
    }

    fn refuses_writes(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    fn exceeds_capacity(&self, value: &CacheValue) -> bool {
        match self.max_item_bytes {
            Some(limit) => serde_json::to_vec(value).map_or(true, |bytes| bytes.len() > limit),
            None => false,
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    fn backend_name(&self) -> &str {
        "memory"
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn now(&self) -> Timestamp {
        self.server.now()
    }

    async fn get_item(&self, key: &str) -> LarderResult<CacheItem> {
        validate_key(key)?;
        let now = self.now();
        let namespaces = self.server.namespaces.read().await;
        let item = namespaces
            .get(&self.namespace)
            .and_then(|ns| ns.live(key, now))
            .map_or_else(
                || CacheItem::miss(key),
                |stored| {
                    CacheItem::hit(
                        key,
                        stored.value.clone(),
                        stored.expires_at,
                        stored.tags.clone(),
                    )
                },
            );
        Ok(item)
    }

    async fn get_items(&self, keys: &[String]) -> LarderResult<Vec<CacheItem>> {
        for key in keys {
            validate_key(key)?;
        }
        let now = self.now();
        let namespaces = self.server.namespaces.read().await;
        let ns = namespaces.get(&self.namespace);
        Ok(keys
            .iter()
            .map(|key| match ns.and_then(|ns| ns.live(key, now)) {
                Some(stored) => CacheItem::hit(
                    key.as_str(),
                    stored.value.clone(),
                    stored.expires_at,
                    stored.tags.clone(),
                ),
                None => CacheItem::miss(key.as_str()),
            })
            .collect())
    }

    async fn save(&self, item: CacheItem) -> LarderResult<bool> {
        validate_key(item.key())?;
        item.tags().validate()?;
        let Some(value) = item.get() else {
            return Err(ValidationError::InvalidValue {
                key: item.key().to_string(),
                reason: "cannot save an item without a value".to_string(),
            }
            .into());
        };
        if self.refuses_writes() || self.exceeds_capacity(value) {
            return Ok(false);
        }

        let now = self.now();
        let expires_at = item.expiry().resolve(now)?;
        let mut namespaces = self.server.namespaces.write().await;
        let ns = namespaces.entry(self.namespace.clone()).or_default();
        if expires_at.is_some_and(|at| at <= now) {
            ns.remove(item.key());
        } else {
            ns.insert(
                item.key(),
                StoredItem {
                    value: value.clone(),
                    expires_at,
                    tags: item.tags().clone(),
                },
            );
        }
        self.server.counters.saves.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn delete_item(&self, key: &str) -> LarderResult<bool> {
        validate_key(key)?;
        if self.refuses_writes() {
            return Ok(false);
        }
        let mut namespaces = self.server.namespaces.write().await;
        if let Some(ns) = namespaces.get_mut(&self.namespace) {
            ns.remove(key);
        }
        self.server.counters.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn clear(&self) -> LarderResult<bool> {
        if self.refuses_writes() {
            return Ok(false);
        }
        self.server.namespaces.write().await.remove(&self.namespace);
        self.server.counters.clears.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn invalidate_tags(&self, tags: &TagSet) -> LarderResult<bool> {
        tags.validate()?;
        if self.refuses_writes() {
            return Ok(false);
        }
        let mut namespaces = self.server.namespaces.write().await;
        if let Some(ns) = namespaces.get_mut(&self.namespace) {
            let removed: usize = tags.iter().map(|tag| ns.invalidate(tag)).sum();
            self.server
                .counters
                .invalidations
                .fetch_add(removed as u64, Ordering::Relaxed);
        }
        Ok(true)
    }

    fn as_atomic_lock_store(self: Arc<Self>) -> Option<Arc<dyn AtomicLockStore>> {
        if self.atomic_locks {
            Some(self)
        } else {
            None
        }
    }
}

fn lock_expiry(now: Timestamp, ttl: Option<Duration>) -> LarderResult<Option<Timestamp>> {
    match ttl {
        Some(ttl) => larder_core::Expiry::After(ttl).resolve(now),
        None => Ok(None),
    }
}

#[async_trait]
impl AtomicLockStore for InMemoryRemoteStore {
    async fn acquire_lock(
        &self,
        name: &str,
        owner: &str,
        ttl: Option<Duration>,
    ) -> LarderResult<bool> {
        let now = self.now();
        let expires_at = lock_expiry(now, ttl)?;
        let mut locks = self.server.locks.write().await;
        if locks.get(name).is_some_and(|held| held.is_live(now)) {
            return Ok(false);
        }
        locks.insert(
            name.to_string(),
            LockEntry {
                owner: owner.to_string(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn release_lock(&self, name: &str, owner: &str) -> LarderResult<bool> {
        let now = self.now();
        let mut locks = self.server.locks.write().await;
        match locks.get(name) {
            Some(held) if held.is_live(now) && held.owner == owner => {
                locks.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn force_release_lock(&self, name: &str) -> LarderResult<()> {
        self.server.locks.write().await.remove(name);
        Ok(())
    }

    async fn lock_owner(&self, name: &str) -> LarderResult<Option<String>> {
        let now = self.now();
        Ok(self
            .server
            .locks
            .read()
            .await
            .get(name)
            .filter(|held| held.is_live(now))
            .map(|held| held.owner.clone()))
    }

    async fn refresh_lock(
        &self,
        name: &str,
        owner: &str,
        ttl: Option<Duration>,
    ) -> LarderResult<bool> {
        let now = self.now();
        let expires_at = lock_expiry(now, ttl)?;
        let mut locks = self.server.locks.write().await;
        match locks.get_mut(name) {
            Some(held) if held.is_live(now) && held.owner == owner => {
                held.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use larder_core::{Expiry, LarderError, ManualClock};
    use serde_json::json;

    fn store_with_clock() -> (InMemoryRemoteStore, ManualClock) {
        let clock = ManualClock::epoch_2024();
        let server = MemoryServer::with_clock(Arc::new(clock.clone()));
        (server.connect("app_"), clock)
    }

    fn item(key: &str, value: CacheValue, expiry: Expiry, tags: &[&str]) -> CacheItem {
        let mut item = CacheItem::miss(key);
        item.set(value)
            .with_expiry(expiry)
            .tag(TagSet::new(tags.iter().copied()));
        item
    }

    #[tokio::test]
    async fn test_save_then_get_hit() {
        let (store, _) = store_with_clock();
        assert!(store
            .save(item("a", json!(1), Expiry::Never, &[]))
            .await
            .unwrap());

        let read = store.get_item("a").await.unwrap();
        assert!(read.is_hit());
        assert_eq!(read.get(), Some(&json!(1)));
        assert_eq!(read.metadata().expires_at, None);
    }

    #[tokio::test]
    async fn test_relative_expiry_uses_server_clock() {
        let (store, clock) = store_with_clock();
        store
            .save(item("a", json!(1), Expiry::After(Duration::from_secs(5)), &[]))
            .await
            .unwrap();

        let read = store.get_item("a").await.unwrap();
        assert_eq!(
            read.metadata().expires_at,
            Some(clock.now() + chrono::Duration::seconds(5))
        );

        clock.advance(Duration::from_secs(5));
        assert!(!store.get_item("a").await.unwrap().is_hit());
    }

    #[tokio::test]
    async fn test_save_already_expired_removes() {
        let (store, clock) = store_with_clock();
        store
            .save(item("a", json!(1), Expiry::Never, &[]))
            .await
            .unwrap();
        let past = clock.now() - chrono::Duration::seconds(1);
        assert!(store
            .save(item("a", json!(2), Expiry::At(past), &[]))
            .await
            .unwrap());
        assert!(!store.get_item("a").await.unwrap().is_hit());
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let server = MemoryServer::new();
        let left = server.connect("left_");
        let right = server.connect("right_");

        left.save(item("k", json!("l"), Expiry::Never, &[]))
            .await
            .unwrap();
        right
            .save(item("k", json!("r"), Expiry::Never, &[]))
            .await
            .unwrap();
        assert!(left.clear().await.unwrap());

        assert!(!left.get_item("k").await.unwrap().is_hit());
        assert_eq!(
            right.get_item("k").await.unwrap().get(),
            Some(&json!("r"))
        );
    }

    #[tokio::test]
    async fn test_invalidate_only_touches_tag_members() {
        let (store, _) = store_with_clock();
        store
            .save(item("a", json!(1), Expiry::Never, &["x"]))
            .await
            .unwrap();
        store
            .save(item("b", json!(2), Expiry::Never, &["x", "y"]))
            .await
            .unwrap();
        store
            .save(item("c", json!(3), Expiry::Never, &["y"]))
            .await
            .unwrap();

        assert!(store.invalidate_tags(&TagSet::new(["x"])).await.unwrap());

        assert!(!store.get_item("a").await.unwrap().is_hit());
        assert!(!store.get_item("b").await.unwrap().is_hit());
        assert!(store.get_item("c").await.unwrap().is_hit());
        // b was unindexed from "y" as well
        assert_eq!(store.server().tag_member_count("app_", "y").await, 1);
        assert_eq!(store.server().stats().invalidated_items, 2);
    }

    #[tokio::test]
    async fn test_rewrite_moves_key_between_tags() {
        let (store, _) = store_with_clock();
        store
            .save(item("a", json!(1), Expiry::Never, &["x"]))
            .await
            .unwrap();
        store
            .save(item("a", json!(2), Expiry::Never, &["y"]))
            .await
            .unwrap();

        store.invalidate_tags(&TagSet::new(["x"])).await.unwrap();

        assert_eq!(store.get_item("a").await.unwrap().get(), Some(&json!(2)));
        assert_eq!(store.server().tag_member_count("app_", "x").await, 0);
    }

    #[tokio::test]
    async fn test_reserved_key_is_rejected() {
        let (store, _) = store_with_clock();
        let err = store.get_item("a:b").await.unwrap_err();
        assert!(matches!(err, LarderError::Validation(_)));
    }

    #[tokio::test]
    async fn test_reserved_tag_is_rejected() {
        let (store, _) = store_with_clock();
        let err = store
            .save(item("a", json!(1), Expiry::Never, &["bad/tag"]))
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_read_only_refuses_writes() {
        let (store, _) = store_with_clock();
        store.set_read_only(true);
        assert!(!store
            .save(item("a", json!(1), Expiry::Never, &[]))
            .await
            .unwrap());
        assert!(!store.delete_item("a").await.unwrap());
        assert!(!store.clear().await.unwrap());
        store.set_read_only(false);
        assert!(store.delete_item("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_capacity_limit_refuses_large_values() {
        let (store, _) = store_with_clock();
        let store = store.with_max_item_bytes(8);
        assert!(store
            .save(item("a", json!("tiny"), Expiry::Never, &[]))
            .await
            .unwrap());
        assert!(!store
            .save(item("b", json!("far too large"), Expiry::Never, &[]))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (store, clock) = store_with_clock();
        store
            .save(item("a", json!(1), Expiry::After(Duration::from_secs(1)), &["t"]))
            .await
            .unwrap();
        store
            .save(item("b", json!(2), Expiry::Never, &[]))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(2));

        assert_eq!(store.server().purge_expired().await, 1);
        assert_eq!(store.server().item_count("app_").await, 1);
        assert_eq!(store.server().tag_member_count("app_", "t").await, 0);
    }

    #[tokio::test]
    async fn test_lock_set_if_absent_and_compare_delete() {
        let (store, _) = store_with_clock();
        assert!(store.acquire_lock("app_job", "p1", None).await.unwrap());
        assert!(!store.acquire_lock("app_job", "p2", None).await.unwrap());
        assert!(!store.release_lock("app_job", "p2").await.unwrap());
        assert_eq!(
            store.lock_owner("app_job").await.unwrap().as_deref(),
            Some("p1")
        );
        assert!(store.release_lock("app_job", "p1").await.unwrap());
        assert_eq!(store.lock_owner("app_job").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_lock_expires_after_ttl() {
        let (store, clock) = store_with_clock();
        assert!(store
            .acquire_lock("job", "p1", Some(Duration::from_secs(10)))
            .await
            .unwrap());
        clock.advance(Duration::from_secs(10));
        assert!(store.acquire_lock("job", "p2", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_requires_owner() {
        let (store, clock) = store_with_clock();
        store
            .acquire_lock("job", "p1", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(!store
            .refresh_lock("job", "p2", Some(Duration::from_secs(60)))
            .await
            .unwrap());
        assert!(store
            .refresh_lock("job", "p1", Some(Duration::from_secs(60)))
            .await
            .unwrap());
        clock.advance(Duration::from_secs(30));
        assert_eq!(store.lock_owner("job").await.unwrap().as_deref(), Some("p1"));
    }

    #[test]
    fn test_capability_toggle() {
        let store = Arc::new(InMemoryRemoteStore::new("app_"));
        assert!(store.as_atomic_lock_store().is_some());

        let plain = Arc::new(InMemoryRemoteStore::new("app_").without_atomic_locks());
        assert!(plain.as_atomic_lock_store().is_none());
    }
}
