//! Tagged cache views.

use std::collections::HashMap;

use larder_core::{encode_key, CacheValue, Expiry, KeyWritten, LarderResult, TagSet, Ttl};

use crate::remote::RemoteStore;
use crate::store::CacheStore;

/// A [`CacheStore`] view bound to a fixed set of tags.
///
/// Writes through the view attach its tags to the item in the same save.
/// [`flush`](Self::flush) invalidates only items carrying one of those tags.
/// The tag set is captured at construction and never changes.
pub struct TaggedCache<R: RemoteStore> {
    store: CacheStore<R>,
    tags: TagSet,
}

impl<R: RemoteStore> Clone for TaggedCache<R> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            tags: self.tags.clone(),
        }
    }
}

impl<R: RemoteStore> std::fmt::Debug for TaggedCache<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaggedCache")
            .field("store", &self.store)
            .field("tags", &self.tags)
            .finish()
    }
}

impl<R: RemoteStore> TaggedCache<R> {
    pub(crate) fn new(store: CacheStore<R>, tags: TagSet) -> Self {
        Self { store, tags }
    }

    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    pub fn store(&self) -> &CacheStore<R> {
        &self.store
    }

    /// Store `value` under `key` carrying this view's tags.
    ///
    /// Succeeds only if a read straight after the save sees the item. A TTL
    /// that resolves to zero or less deletes the key instead.
    pub async fn put(
        &self,
        key: &str,
        value: impl Into<CacheValue>,
        ttl: impl Into<Ttl>,
    ) -> LarderResult<bool> {
        self.tags.validate()?;
        let encoded = encode_key(key);
        let resolved = ttl.into().resolve(self.store.remote().now())?;
        match resolved.to_expiry() {
            Some(expiry) => {
                self.write_confirmed(key, &encoded, value.into(), expiry, resolved.as_seconds())
                    .await
            }
            None => self.store.forget_encoded(&encoded).await,
        }
    }

    pub async fn forever(&self, key: &str, value: impl Into<CacheValue>) -> LarderResult<bool> {
        self.put(key, value, Ttl::Forever).await
    }

    /// Tagged counterpart of [`CacheStore::put_many`].
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
            all_ok &= self.put(key.as_ref(), value, ttl).await?;
        }
        Ok(wrote_any && all_ok)
    }

    /// Invalidate every item carrying any of this view's tags.
    ///
    /// Items written without these tags are untouched.
    pub async fn flush(&self) -> LarderResult<bool> {
        self.tags.validate()?;
        let remote = self.store.remote();
        let invalidated = remote.invalidate_tags(&self.tags).await?;
        if invalidated {
            tracing::debug!(
                namespace = %remote.namespace(),
                tags = ?self.tags.as_slice(),
                "Cache tags invalidated"
            );
        } else {
            tracing::warn!(
                namespace = %remote.namespace(),
                tags = ?self.tags.as_slice(),
                "Tag invalidation refused by backend"
            );
        }
        Ok(invalidated)
    }

    pub async fn get(&self, key: &str) -> LarderResult<Option<CacheValue>> {
        self.store.get(key).await
    }

    pub async fn many<I, S>(&self, keys: I) -> LarderResult<HashMap<String, Option<CacheValue>>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.store.many(keys).await
    }

    pub async fn has(&self, key: &str) -> LarderResult<bool> {
        self.store.has(key).await
    }

    pub async fn remaining_ttl(&self, key: &str) -> LarderResult<Option<Ttl>> {
        self.store.remaining_ttl(key).await
    }

    pub async fn forget(&self, key: &str) -> LarderResult<bool> {
        self.store.forget(key).await
    }

    /// Counters keep whatever tags they were written with.
    pub async fn increment(&self, key: &str, delta: i64) -> LarderResult<Option<i64>> {
        self.store.increment(key, delta).await
    }

    pub async fn decrement(&self, key: &str, delta: i64) -> LarderResult<Option<i64>> {
        self.store.decrement(key, delta).await
    }

    async fn write_confirmed(
        &self,
        key: &str,
        encoded: &str,
        value: CacheValue,
        expiry: Expiry,
        ttl_seconds: Option<u64>,
    ) -> LarderResult<bool> {
        let saved = self
            .store
            .save_encoded(encoded, value.clone(), expiry, self.tags.clone())
            .await?;
        if !saved {
            return Ok(false);
        }

        let landed = self.store.remote().get_item(encoded).await?.is_hit();
        if !landed {
            tracing::warn!(
                namespace = %self.store.remote().namespace(),
                key = %encoded,
                "Tagged write not visible after save"
            );
            return Ok(false);
        }

        if let Some(observer) = self.store.observer() {
            observer.key_written(&KeyWritten {
                store_name: self.store.config().store_name.clone(),
                key: key.to_string(),
                value,
                ttl_seconds,
            });
        }
        Ok(true)
    }
}
