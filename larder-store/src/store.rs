//! The cache store.
//!
//! `CacheStore` is the key-value engine callers talk to. Every public method
//! that takes a raw key encodes it exactly once, here, before the remote store
//! sees it. Internal helpers suffixed `_encoded` take keys that have already
//! been through [`encode_key`] and never encode again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use larder_core::{
    encode_key, CacheItem, CacheValue, Expiry, LarderResult, ResolvedTtl, StorageError,
    StoreConfig, TagSet, Ttl, ValidationError,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::observer::WriteObserver;
use crate::remote::{ConnectionProvider, RemoteStore};
use crate::tagged::TaggedCache;

/// Tag-aware cache store over a [`RemoteStore`].
///
/// Holds no mutable state of its own beyond the remote connections, so it can
/// be cloned freely and shared across tasks.
pub struct CacheStore<R: RemoteStore> {
    remote: Arc<R>,
    lock_remote: Arc<R>,
    config: Arc<StoreConfig>,
    observer: Option<Arc<dyn WriteObserver>>,
}

impl<R: RemoteStore> Clone for CacheStore<R> {
    fn clone(&self) -> Self {
        Self {
            remote: Arc::clone(&self.remote),
            lock_remote: Arc::clone(&self.lock_remote),
            config: Arc::clone(&self.config),
            observer: self.observer.clone(),
        }
    }
}

impl<R: RemoteStore> std::fmt::Debug for CacheStore<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("backend", &self.remote.backend_name())
            .field("namespace", &self.remote.namespace())
            .field("config", &self.config)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

impl<R: RemoteStore> CacheStore<R> {
    /// Store whose locks share the cache connection.
    pub fn new(remote: Arc<R>, config: StoreConfig) -> Self {
        Self {
            lock_remote: Arc::clone(&remote),
            remote,
            config: Arc::new(config),
            observer: None,
        }
    }

    /// Resolve the cache and lock connections named in `config`.
    pub fn connect<P>(provider: &P, config: StoreConfig) -> LarderResult<Self>
    where
        P: ConnectionProvider<R> + ?Sized,
    {
        config.validate()?;
        let remote = provider.connection(&config.connection)?;
        let lock_remote = provider.connection(config.lock_connection())?;
        tracing::debug!(
            store = %config.store_name,
            connection = %config.connection,
            lock_connection = %config.lock_connection(),
            "Cache store connected"
        );
        Ok(Self {
            remote,
            lock_remote,
            config: Arc::new(config),
            observer: None,
        })
    }

    /// Use a separate connection for locks.
    pub fn with_lock_connection(mut self, lock_remote: Arc<R>) -> Self {
        self.lock_remote = lock_remote;
        self
    }

    /// Notify `observer` of confirmed tagged writes.
    pub fn with_observer(mut self, observer: Arc<dyn WriteObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn prefix(&self) -> &str {
        &self.config.prefix
    }

    pub fn connection(&self) -> &str {
        &self.config.connection
    }

    pub fn lock_connection(&self) -> &str {
        self.config.lock_connection()
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub fn lock_remote(&self) -> &Arc<R> {
        &self.lock_remote
    }

    pub(crate) fn observer(&self) -> Option<&Arc<dyn WriteObserver>> {
        self.observer.as_ref()
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Value under `key`, or `None` on a miss.
    pub async fn get(&self, key: &str) -> LarderResult<Option<CacheValue>> {
        self.get_encoded(&encode_key(key)).await
    }

    pub(crate) async fn get_encoded(&self, encoded: &str) -> LarderResult<Option<CacheValue>> {
        let item = self.remote.get_item(encoded).await?;
        Ok(item.into_value())
    }

    /// Value under `key` deserialized into `T`.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> LarderResult<Option<T>> {
        match self.get(key).await? {
            Some(value) => serde_json::from_value(value).map(Some).map_err(|e| {
                StorageError::CorruptPayload {
                    key: key.to_string(),
                    reason: e.to_string(),
                }
                .into()
            }),
            None => Ok(None),
        }
    }

    /// Values for every key, keyed by the raw key. Misses map to `None`.
    pub async fn many<I, S>(&self, keys: I) -> LarderResult<HashMap<String, Option<CacheValue>>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let raw: Vec<String> = keys.into_iter().map(Into::into).collect();
        if raw.is_empty() {
            return Ok(HashMap::new());
        }
        let encoded: Vec<String> = raw.iter().map(|key| encode_key(key)).collect();
        let items = self.remote.get_items(&encoded).await?;
        Ok(raw
            .into_iter()
            .zip(items)
            .map(|(key, item)| (key, item.into_value()))
            .collect())
    }

    pub async fn has(&self, key: &str) -> LarderResult<bool> {
        Ok(self.remote.get_item(&encode_key(key)).await?.is_hit())
    }

    /// Read `key` and delete it.
    pub async fn pull(&self, key: &str) -> LarderResult<Option<CacheValue>> {
        let encoded = encode_key(key);
        let value = self.get_encoded(&encoded).await?;
        if value.is_some() {
            self.forget_encoded(&encoded).await?;
        }
        Ok(value)
    }

    /// Remaining lifetime of `key`.
    ///
    /// `None` on a miss, `Ttl::Forever` for entries without expiry, otherwise
    /// the time left according to the remote store's clock.
    pub async fn remaining_ttl(&self, key: &str) -> LarderResult<Option<Ttl>> {
        let item = self.remote.get_item(&encode_key(key)).await?;
        if !item.is_hit() {
            return Ok(None);
        }
        let ttl = match item.metadata().expires_at {
            Some(at) => Ttl::Duration(
                at.signed_duration_since(self.remote.now())
                    .to_std()
                    .unwrap_or_default(),
            ),
            None => Ttl::Forever,
        };
        Ok(Some(ttl))
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Store `value` under `key`.
    ///
    /// A TTL that resolves to zero or less deletes the key instead. Positive
    /// TTLs round up to whole seconds.
    pub async fn put(
        &self,
        key: &str,
        value: impl Into<CacheValue>,
        ttl: impl Into<Ttl>,
    ) -> LarderResult<bool> {
        self.put_encoded(&encode_key(key), value.into(), ttl.into(), TagSet::empty())
            .await
    }

    /// Serialize `value` and store it under `key`.
    pub async fn put_as<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: impl Into<Ttl>,
    ) -> LarderResult<bool> {
        let value = serde_json::to_value(value).map_err(|e| ValidationError::InvalidValue {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.put(key, value, ttl).await
    }

    /// Same as [`put`](Self::put).
    ///
    /// This overwrites an existing value. It is not a set-if-absent.
    pub async fn add(
        &self,
        key: &str,
        value: impl Into<CacheValue>,
        ttl: impl Into<Ttl>,
    ) -> LarderResult<bool> {
        self.put(key, value, ttl).await
    }

    /// Write every entry with the same TTL.
    ///
    /// Every entry is attempted even after a failure. Returns `false` for an
    /// empty input.
    pub async fn put_many<I, K, V>(&self, values: I, ttl: impl Into<Ttl>) -> LarderResult<bool>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<CacheValue>,
    {
        let ttl = ttl.into();
        let mut wrote_any = false;
        let mut all_ok = true;
        for (key, value) in values {
            wrote_any = true;
            let ok = self.put(key.as_ref(), value, ttl).await?;
            all_ok &= ok;
        }
        Ok(wrote_any && all_ok)
    }

    pub async fn forever(&self, key: &str, value: impl Into<CacheValue>) -> LarderResult<bool> {
        self.put(key, value, Ttl::Forever).await
    }

    /// Delete `key`. Deleting an absent key succeeds.
    pub async fn forget(&self, key: &str) -> LarderResult<bool> {
        self.forget_encoded(&encode_key(key)).await
    }

    /// Delete every key under this store's namespace.
    pub async fn flush(&self) -> LarderResult<bool> {
        let cleared = self.remote.clear().await?;
        if cleared {
            tracing::debug!(namespace = %self.remote.namespace(), "Cache namespace flushed");
        } else {
            tracing::warn!(namespace = %self.remote.namespace(), "Cache flush refused by backend");
        }
        Ok(cleared)
    }

    /// Read through the cache: return the value under `key`, or compute,
    /// store, and return it.
    pub async fn remember<F, Fut>(
        &self,
        key: &str,
        ttl: impl Into<Ttl>,
        compute: F,
    ) -> LarderResult<CacheValue>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = LarderResult<CacheValue>>,
    {
        let encoded = encode_key(key);
        if let Some(value) = self.get_encoded(&encoded).await? {
            return Ok(value);
        }
        let value = compute().await?;
        self.put_encoded(&encoded, value.clone(), ttl.into(), TagSet::empty())
            .await?;
        Ok(value)
    }

    // ========================================================================
    // COUNTERS
    // ========================================================================

    /// Add `delta` to the integer under `key`, keeping its remaining TTL.
    ///
    /// Returns `None` when the key is absent; nothing is created. The read
    /// and the write are two round trips, so concurrent increments may race.
    pub async fn increment(&self, key: &str, delta: i64) -> LarderResult<Option<i64>> {
        self.adjust(key, delta, i64::checked_add).await
    }

    /// Subtract `delta` from the integer under `key`. See [`increment`](Self::increment).
    pub async fn decrement(&self, key: &str, delta: i64) -> LarderResult<Option<i64>> {
        self.adjust(key, delta, i64::checked_sub).await
    }

    async fn adjust(
        &self,
        key: &str,
        delta: i64,
        apply: fn(i64, i64) -> Option<i64>,
    ) -> LarderResult<Option<i64>> {
        let encoded = encode_key(key);
        let item = self.remote.get_item(&encoded).await?;
        let Some(current) = item.get() else {
            return Ok(None);
        };
        let current = counter_value(key, current)?;
        let next = apply(current, delta).ok_or_else(|| ValidationError::CounterOverflow {
            key: key.to_string(),
            delta,
        })?;

        // the original deadline is written back as-is, never re-rounded
        let expiry = match item.metadata().expires_at {
            Some(at) if at <= self.remote.now() => {
                // expired between the read and now: behave as a miss
                return Ok(None);
            }
            Some(at) => Expiry::At(at),
            None => Expiry::Never,
        };
        let saved = self
            .save_encoded(&encoded, CacheValue::from(next), expiry, item.tags().clone())
            .await?;
        Ok(saved.then_some(next))
    }

    // ========================================================================
    // TAGS
    // ========================================================================

    /// A view whose writes carry `tags` and whose flush invalidates them.
    pub fn tags<I, S>(&self, tags: I) -> TaggedCache<R>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TaggedCache::new(self.clone(), TagSet::new(tags))
    }

    // ========================================================================
    // ENCODED-KEY HELPERS
    // ========================================================================

    pub(crate) async fn put_encoded(
        &self,
        encoded: &str,
        value: CacheValue,
        ttl: Ttl,
        tags: TagSet,
    ) -> LarderResult<bool> {
        let resolved = ttl.resolve(self.remote.now())?;
        self.write_resolved(encoded, value, resolved, tags).await
    }

    async fn write_resolved(
        &self,
        encoded: &str,
        value: CacheValue,
        resolved: ResolvedTtl,
        tags: TagSet,
    ) -> LarderResult<bool> {
        match resolved.to_expiry() {
            Some(expiry) => self.save_encoded(encoded, value, expiry, tags).await,
            None => self.forget_encoded(encoded).await,
        }
    }

    /// One save carrying value, expiry, and tags together.
    pub(crate) async fn save_encoded(
        &self,
        encoded: &str,
        value: CacheValue,
        expiry: Expiry,
        tags: TagSet,
    ) -> LarderResult<bool> {
        let mut item = CacheItem::miss(encoded);
        item.set(value).with_expiry(expiry).tag(tags);
        let saved = self.remote.save(item).await?;
        if !saved {
            tracing::warn!(
                namespace = %self.remote.namespace(),
                key = %encoded,
                "Cache save refused by backend"
            );
        }
        Ok(saved)
    }

    pub(crate) async fn forget_encoded(&self, encoded: &str) -> LarderResult<bool> {
        let deleted = self.remote.delete_item(encoded).await?;
        if !deleted {
            tracing::warn!(
                namespace = %self.remote.namespace(),
                key = %encoded,
                "Cache delete refused by backend"
            );
        }
        Ok(deleted)
    }
}

/// Parse a stored counter. Integers and integer strings are accepted.
fn counter_value(key: &str, value: &CacheValue) -> LarderResult<i64> {
    let parsed = match value {
        CacheValue::Number(n) => n.as_i64(),
        CacheValue::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        ValidationError::NotACounter {
            key: key.to_string(),
        }
        .into()
    })
}
