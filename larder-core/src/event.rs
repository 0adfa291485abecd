//! Write notifications.

use crate::item::CacheValue;
use serde::{Deserialize, Serialize};

/// Emitted after a tagged write has been confirmed by the remote store.
///
/// Informational only. Delivery never affects the write's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyWritten {
    /// Configured store name.
    pub store_name: String,
    /// Key as supplied by the caller, before encoding.
    pub key: String,
    pub value: CacheValue,
    /// Lifetime in seconds, `None` for entries that never expire.
    pub ttl_seconds: Option<u64>,
}
