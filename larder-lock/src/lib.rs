//! LARDER Lock - Distributed Locks
//!
//! Named mutual-exclusion locks backed by the same remote store as the cache.
//! Exactly one owner token holds a given name at a time; only that token can
//! release or refresh it. Locks with a lifetime expire on their own, so a
//! crashed holder cannot wedge a name forever.
//!
//! ```ignore
//! use larder_lock::LockProvider;
//!
//! let lock = store.lock("reports", 30, None);
//! if let Some(held) = lock.acquire().await?.acquired() {
//!     build_reports().await?;
//!     held.release().await?;
//! }
//! ```

pub mod backend;
pub mod lock;
pub mod provider;

pub use backend::{
    select_backend, AtomicLockBackend, BackendKind, GenericLockBackend, LockBackend,
};
pub use lock::{Acquired, Acquisition, Lock, LockData, LockState, Pending, RETRY_INTERVAL};
pub use provider::LockProvider;
