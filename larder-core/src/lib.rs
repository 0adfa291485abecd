//! LARDER Core - Data Types
//!
//! Plain data, the key codec, errors, and configuration shared by every other
//! LARDER crate. Nothing in here performs I/O against a remote store.

pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod item;
pub mod key;
pub mod ttl;

use chrono::{DateTime, Utc};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{StoreConfig, DEFAULT_CONNECTION, DEFAULT_STORE_NAME};
pub use error::{
    ConfigError, IdentifierKind, LarderError, LarderResult, LockError, StorageError,
    ValidationError,
};
pub use event::KeyWritten;
pub use item::{CacheItem, CacheValue, ItemMetadata, TagSet};
pub use key::{encode_key, is_reserved, validate_key, validate_tag, PLACEHOLDER, RESERVED_CHARACTERS};
pub use ttl::{Expiry, ResolvedTtl, Ttl, MAX_TTL_SECONDS};

/// Generate an opaque owner token (UUIDv7, timestamp-sortable).
pub fn new_owner_token() -> String {
    uuid::Uuid::now_v7().to_string()
}
