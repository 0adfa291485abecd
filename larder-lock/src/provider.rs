//! Lock construction from a cache store.

use larder_core::new_owner_token;
use larder_store::{CacheStore, RemoteStore};

use crate::backend::select_backend;
use crate::lock::{Acquired, Lock, LockData, Pending};

/// Something that can hand out named locks.
pub trait LockProvider {
    /// A pending lock on `name`, prefixed with the store's namespace.
    ///
    /// `seconds` of zero never expires. A fresh owner token is generated when
    /// `owner` is `None`.
    fn lock(&self, name: &str, seconds: u64, owner: Option<String>) -> Lock<Pending>;

    /// Reattach to a lock already held by `owner` without acquiring it.
    ///
    /// Release and refresh through the returned handle fail if `owner` does
    /// not actually hold the lock.
    fn restore_lock(&self, name: &str, owner: impl Into<String>) -> Lock<Acquired>;
}

impl<R: RemoteStore> LockProvider for CacheStore<R> {
    fn lock(&self, name: &str, seconds: u64, owner: Option<String>) -> Lock<Pending> {
        let data = LockData {
            name: format!("{}{}", self.prefix(), name),
            owner: owner.unwrap_or_else(new_owner_token),
            seconds,
        };
        Lock::new(data, select_backend(self.lock_remote()))
    }

    fn restore_lock(&self, name: &str, owner: impl Into<String>) -> Lock<Acquired> {
        let data = LockData {
            name: format!("{}{}", self.prefix(), name),
            owner: owner.into(),
            seconds: 0,
        };
        Lock::restored(data, select_backend(self.lock_remote()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use larder_core::StoreConfig;
    use larder_store::{InMemoryRemoteStore, MemoryServer};
    use std::sync::Arc;

    fn store(prefix: &str) -> CacheStore<InMemoryRemoteStore> {
        let remote = Arc::new(InMemoryRemoteStore::new(prefix));
        CacheStore::new(remote, StoreConfig::new().with_prefix(prefix))
    }

    #[test]
    fn test_lock_name_is_prefixed() {
        let lock = store("app_").lock("job", 10, Some("p1".to_string()));
        assert_eq!(lock.name(), "app_job");
        assert_eq!(lock.owner(), "p1");
        assert_eq!(lock.seconds(), 10);
    }

    #[test]
    fn test_generated_owners_are_distinct() {
        let store = store("app_");
        let a = store.lock("job", 0, None);
        let b = store.lock("job", 0, None);
        assert!(!a.owner().is_empty());
        assert_ne!(a.owner(), b.owner());
    }

    #[test]
    fn test_backend_follows_lock_connection() {
        let server = MemoryServer::new();
        let cache = Arc::new(server.connect("app_"));
        let locks = Arc::new(server.connect("app_").without_atomic_locks());
        let store = CacheStore::new(cache, StoreConfig::new().with_prefix("app_"))
            .with_lock_connection(locks);

        assert_eq!(store.lock("job", 5, None).backend_kind(), BackendKind::Generic);
    }

    #[tokio::test]
    async fn test_restore_lock_releases_for_owner() {
        let store = store("app_");
        let held = store
            .lock("job", 10, Some("p1".to_string()))
            .acquire()
            .await
            .unwrap();
        assert!(held.is_acquired());

        let restored = store.restore_lock("job", "p1");
        assert!(restored.is_owned_by_current_holder().await.unwrap());
        assert!(restored.release().await.unwrap());
        assert_eq!(store.lock("job", 0, None).current_owner().await.unwrap(), None);
    }
}
