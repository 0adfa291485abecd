//! LARDER Store - Tag-Aware Cache Store
//!
//! The key-value engine and the remote store contract it talks to.
//!
//! ```text
//! CacheStore ──┬── encode_key ──► RemoteStore ──► backing data store
//! TaggedCache ─┘
//! ```
//!
//! Every raw key passes through [`encode_key`](larder_core::encode_key)
//! exactly once, inside `CacheStore` or `TaggedCache`, before it reaches a
//! [`RemoteStore`]. Remote stores never see reserved characters.
//!
//! Two remote stores ship here: [`InMemoryRemoteStore`] and, behind the
//! `redis` feature, `RedisRemoteStore`.

pub mod memory;
pub mod observer;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod remote;
pub mod store;
pub mod tagged;

pub use memory::{InMemoryRemoteStore, MemoryServer, MemoryStats};
pub use observer::{TracingObserver, WriteObserver};
#[cfg(feature = "redis")]
pub use redis_store::RedisRemoteStore;
pub use remote::{AtomicLockStore, ConnectionProvider, RemoteStore, StaticConnections};
pub use store::CacheStore;
pub use tagged::TaggedCache;
