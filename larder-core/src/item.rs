//! Cache items and tag sets.

use crate::error::LarderResult;
use crate::key::validate_tag;
use crate::ttl::Expiry;
use crate::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Values are stored as JSON so counters, strings, and structured payloads
/// share one representation.
pub type CacheValue = serde_json::Value;

// ============================================================================
// TAG SET
// ============================================================================

/// Immutable, sorted, de-duplicated set of tag names.
///
/// Cloning is cheap; the names live behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TagSet {
    tags: Arc<[String]>,
}

impl TagSet {
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sorted: BTreeSet<String> = tags.into_iter().map(Into::into).collect();
        Self {
            tags: sorted.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.tags.binary_search_by(|t| t.as_str().cmp(tag)).is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.tags
    }

    /// Validate every tag against the reserved character set.
    pub fn validate(&self) -> LarderResult<()> {
        self.iter().try_for_each(validate_tag)
    }
}

impl<S: Into<String>> FromIterator<S> for TagSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl Serialize for TagSet {
    fn serialize<Ser: serde::Serializer>(&self, serializer: Ser) -> Result<Ser::Ok, Ser::Error> {
        serializer.collect_seq(self.tags.iter())
    }
}

impl<'de> Deserialize<'de> for TagSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tags = Vec::<String>::deserialize(deserializer)?;
        Ok(Self::new(tags))
    }
}

// ============================================================================
// CACHE ITEM
// ============================================================================

/// Metadata the remote store reports for an item.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ItemMetadata {
    /// Absolute expiry, `None` for items that never expire.
    pub expires_at: Option<Timestamp>,
    pub tags: TagSet,
}

/// A handle on one slot of the remote store.
///
/// Obtained from `RemoteStore::get_item`. On a miss the handle is empty but
/// still carries the key, so it can be filled and saved:
///
/// ```
/// use larder_core::{CacheItem, TagSet};
/// use std::time::Duration;
///
/// let mut item = CacheItem::miss("users.42");
/// item.set(serde_json::json!({"name": "Ada"}))
///     .expires_after(Some(Duration::from_secs(60)))
///     .tag(TagSet::new(["users"]));
/// assert!(!item.is_hit());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct CacheItem {
    key: String,
    value: Option<CacheValue>,
    expiry: Expiry,
    tags: TagSet,
    hit: bool,
}

impl CacheItem {
    /// An empty handle for a key that is not in the store.
    pub fn miss(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            expiry: Expiry::Never,
            tags: TagSet::empty(),
            hit: false,
        }
    }

    /// A handle for a live item, as built by a remote store on read.
    pub fn hit(
        key: impl Into<String>,
        value: CacheValue,
        expires_at: Option<Timestamp>,
        tags: TagSet,
    ) -> Self {
        Self {
            key: key.into(),
            value: Some(value),
            expiry: expires_at.map_or(Expiry::Never, Expiry::At),
            tags,
            hit: true,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_hit(&self) -> bool {
        self.hit
    }

    /// The value, only present for hits or after `set`.
    pub fn get(&self) -> Option<&CacheValue> {
        self.value.as_ref()
    }

    pub fn into_value(self) -> Option<CacheValue> {
        self.value
    }

    pub fn expiry(&self) -> Expiry {
        self.expiry
    }

    pub fn tags(&self) -> &TagSet {
        &self.tags
    }

    pub fn metadata(&self) -> ItemMetadata {
        ItemMetadata {
            expires_at: match self.expiry {
                Expiry::At(at) => Some(at),
                Expiry::Never | Expiry::After(_) => None,
            },
            tags: self.tags.clone(),
        }
    }

    pub fn set(&mut self, value: CacheValue) -> &mut Self {
        self.value = Some(value);
        self
    }

    /// Relative expiry, `None` meaning never.
    pub fn expires_after(&mut self, after: Option<Duration>) -> &mut Self {
        self.expiry = after.map_or(Expiry::Never, Expiry::After);
        self
    }

    /// Absolute expiry, `None` meaning never.
    pub fn expires_at(&mut self, at: Option<Timestamp>) -> &mut Self {
        self.expiry = at.map_or(Expiry::Never, Expiry::At);
        self
    }

    pub fn with_expiry(&mut self, expiry: Expiry) -> &mut Self {
        self.expiry = expiry;
        self
    }

    /// Replace the tags this item will be saved with.
    pub fn tag(&mut self, tags: TagSet) -> &mut Self {
        self.tags = tags;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_tag_set_sorts_and_dedups() {
        let tags = TagSet::new(["b", "a", "b"]);
        assert_eq!(tags.as_slice(), &["a".to_string(), "b".to_string()]);
        assert!(tags.contains("a"));
        assert!(!tags.contains("c"));
    }

    #[test]
    fn test_tag_set_validate_rejects_reserved() {
        assert!(TagSet::new(["ok", "bad:tag"]).validate().is_err());
        assert!(TagSet::new(["ok", "fine"]).validate().is_ok());
    }

    #[test]
    fn test_tag_set_serde_roundtrip_normalizes() {
        let tags: TagSet = serde_json::from_str(r#"["y","x","y"]"#).unwrap();
        assert_eq!(serde_json::to_string(&tags).unwrap(), r#"["x","y"]"#);
    }

    #[test]
    fn test_miss_has_no_value() {
        let item = CacheItem::miss("k");
        assert!(!item.is_hit());
        assert!(item.get().is_none());
        assert_eq!(item.metadata(), ItemMetadata::default());
    }

    #[test]
    fn test_hit_reports_expiry_metadata() {
        let at = Utc::now();
        let item = CacheItem::hit("k", json!(1), Some(at), TagSet::new(["t"]));
        assert!(item.is_hit());
        assert_eq!(item.metadata().expires_at, Some(at));
        assert!(item.metadata().tags.contains("t"));
    }

    #[test]
    fn test_builder_chain() {
        let mut item = CacheItem::miss("k");
        item.set(json!("v"))
            .expires_after(Some(Duration::from_secs(3)))
            .tag(TagSet::new(["t"]));
        assert_eq!(item.get(), Some(&json!("v")));
        assert_eq!(item.expiry(), Expiry::After(Duration::from_secs(3)));
        // relative expiry is not reported until the store resolves it
        assert_eq!(item.metadata().expires_at, None);
    }
}
