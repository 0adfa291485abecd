//! Lock typestate.
//!
//! A lock handle starts out `Pending`. Acquiring it yields an `Acquired`
//! handle, which is the only state that can release, refresh, or
//! force-release. Transitions consume the handle.
//!
//! ```text
//! Pending ─── acquire() ──→ Acquired ─── release() ──→ (consumed)
//!    ↑            │             │
//!    └─ Contended ┘        refresh() ↺
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use larder_core::{LarderResult, LockError};

use crate::backend::{BackendKind, LockBackend};

/// Delay between attempts in [`Lock::block`].
pub const RETRY_INTERVAL: Duration = Duration::from_millis(250);

// ============================================================================
// LOCK DATA
// ============================================================================

/// State-independent lock identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockData {
    /// Prefixed lock name.
    pub name: String,
    /// Owner token.
    pub owner: String,
    /// Lifetime in seconds. Zero never expires.
    pub seconds: u64,
}

impl LockData {
    pub fn ttl(&self) -> Option<Duration> {
        (self.seconds > 0).then(|| Duration::from_secs(self.seconds))
    }
}

// ============================================================================
// TYPESTATE MARKERS
// ============================================================================

/// Marker trait for lock states.
pub trait LockState: private::Sealed + Send + Sync {}

/// Not yet acquired by this handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pending;
impl LockState for Pending {}

/// Held by this handle's owner token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired;
impl LockState for Acquired {}

mod private {
    pub trait Sealed {}
    impl Sealed for super::Pending {}
    impl Sealed for super::Acquired {}
}

// ============================================================================
// LOCK
// ============================================================================

/// A named distributed lock with compile-time state tracking.
pub struct Lock<S: LockState> {
    data: LockData,
    backend: Arc<dyn LockBackend>,
    _state: PhantomData<S>,
}

/// Outcome of a single acquisition attempt.
pub enum Acquisition {
    Acquired(Lock<Acquired>),
    /// Someone else holds the lock. The pending handle can try again.
    Contended(Lock<Pending>),
}

impl Acquisition {
    pub fn is_acquired(&self) -> bool {
        matches!(self, Acquisition::Acquired(_))
    }

    pub fn acquired(self) -> Option<Lock<Acquired>> {
        match self {
            Acquisition::Acquired(lock) => Some(lock),
            Acquisition::Contended(_) => None,
        }
    }
}

impl<S: LockState> std::fmt::Debug for Lock<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("data", &self.data)
            .field("backend", &self.backend.kind())
            .field("state", &std::any::type_name::<S>())
            .finish()
    }
}

impl std::fmt::Debug for Acquisition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Acquisition::Acquired(lock) => f.debug_tuple("Acquired").field(lock).finish(),
            Acquisition::Contended(lock) => f.debug_tuple("Contended").field(lock).finish(),
        }
    }
}

impl<S: LockState> Lock<S> {
    fn transition<T: LockState>(self) -> Lock<T> {
        Lock {
            data: self.data,
            backend: self.backend,
            _state: PhantomData,
        }
    }

    pub fn data(&self) -> &LockData {
        &self.data
    }

    pub fn name(&self) -> &str {
        &self.data.name
    }

    pub fn owner(&self) -> &str {
        &self.data.owner
    }

    pub fn seconds(&self) -> u64 {
        self.data.seconds
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Owner currently recorded in the store, whoever that is.
    pub async fn current_owner(&self) -> LarderResult<Option<String>> {
        self.backend.owner(&self.data.name).await
    }
}

impl Lock<Pending> {
    pub(crate) fn new(data: LockData, backend: Arc<dyn LockBackend>) -> Self {
        Lock {
            data,
            backend,
            _state: PhantomData,
        }
    }

    /// Try once to take the lock.
    pub async fn acquire(self) -> LarderResult<Acquisition> {
        let acquired = self
            .backend
            .try_acquire(&self.data.name, &self.data.owner, self.data.ttl())
            .await?;
        tracing::debug!(
            lock = %self.data.name,
            backend = %self.backend.kind(),
            acquired,
            "Lock acquisition attempt"
        );
        Ok(if acquired {
            Acquisition::Acquired(self.transition())
        } else {
            Acquisition::Contended(self)
        })
    }

    /// Retry every [`RETRY_INTERVAL`] until acquired or `wait` has elapsed.
    ///
    /// # Errors
    ///
    /// Returns `LockError::Timeout` when the lock is still held by someone
    /// else after `wait`.
    pub async fn block(self, wait: Duration) -> LarderResult<Lock<Acquired>> {
        let started = tokio::time::Instant::now();
        let mut pending = self;
        loop {
            match pending.acquire().await? {
                Acquisition::Acquired(lock) => return Ok(lock),
                Acquisition::Contended(lock) => pending = lock,
            }
            let waited = started.elapsed();
            if waited >= wait {
                return Err(LockError::Timeout {
                    name: pending.data.name,
                    waited,
                }
                .into());
            }
            tokio::time::sleep(RETRY_INTERVAL.min(wait - waited)).await;
        }
    }

    /// Acquire, run `f`, release.
    ///
    /// Returns `None` without running `f` when the lock is contended. The
    /// lock is released even if `f` returns an error.
    pub async fn run<F, Fut, T>(self, f: F) -> LarderResult<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = LarderResult<T>>,
    {
        let Some(lock) = self.acquire().await?.acquired() else {
            return Ok(None);
        };
        let outcome = f().await;
        lock.release().await?;
        outcome.map(Some)
    }
}

impl Lock<Acquired> {
    pub(crate) fn restored(data: LockData, backend: Arc<dyn LockBackend>) -> Self {
        Lock {
            data,
            backend,
            _state: PhantomData,
        }
    }

    /// Release the lock if this handle's owner still holds it.
    ///
    /// Returns `false`, leaving the lock untouched, when another owner holds
    /// it or it has expired.
    pub async fn release(self) -> LarderResult<bool> {
        let released = self
            .backend
            .release(&self.data.name, &self.data.owner)
            .await?;
        if released {
            tracing::debug!(lock = %self.data.name, "Lock released");
        } else {
            tracing::warn!(
                lock = %self.data.name,
                owner = %self.data.owner,
                "Lock release refused: not held by this owner"
            );
        }
        Ok(released)
    }

    /// Release regardless of owner.
    pub async fn force_release(self) -> LarderResult<()> {
        self.backend.force_release(&self.data.name).await?;
        tracing::debug!(lock = %self.data.name, "Lock force-released");
        Ok(())
    }

    /// Restart the lock's lifetime at `seconds` (zero: never expires).
    ///
    /// Only succeeds while this owner holds the lock.
    pub async fn refresh(&mut self, seconds: u64) -> LarderResult<bool> {
        let ttl = (seconds > 0).then(|| Duration::from_secs(seconds));
        let refreshed = self
            .backend
            .refresh(&self.data.name, &self.data.owner, ttl)
            .await?;
        if refreshed {
            self.data.seconds = seconds;
        } else {
            tracing::warn!(
                lock = %self.data.name,
                owner = %self.data.owner,
                "Lock refresh refused: not held by this owner"
            );
        }
        Ok(refreshed)
    }

    /// Check whether the store still records this handle's owner.
    pub async fn is_owned_by_current_holder(&self) -> LarderResult<bool> {
        Ok(self.current_owner().await?.as_deref() == Some(self.data.owner.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::select_backend;
    use larder_store::InMemoryRemoteStore;

    fn pending(backend: &Arc<dyn LockBackend>, owner: &str, seconds: u64) -> Lock<Pending> {
        Lock::new(
            LockData {
                name: "app_job".to_string(),
                owner: owner.to_string(),
                seconds,
            },
            Arc::clone(backend),
        )
    }

    #[test]
    fn test_zero_seconds_never_expires() {
        let data = LockData {
            name: "n".to_string(),
            owner: "o".to_string(),
            seconds: 0,
        };
        assert_eq!(data.ttl(), None);
        assert_eq!(
            LockData { seconds: 3, ..data }.ttl(),
            Some(Duration::from_secs(3))
        );
    }

    #[tokio::test]
    async fn test_contended_handle_can_retry() {
        let backend = select_backend(&Arc::new(InMemoryRemoteStore::new("app_")));
        let first = pending(&backend, "p1", 10).acquire().await.unwrap();
        let Acquisition::Acquired(held) = first else {
            panic!("first attempt should acquire");
        };

        let second = pending(&backend, "p2", 10).acquire().await.unwrap();
        let Acquisition::Contended(waiting) = second else {
            panic!("second attempt should be contended");
        };

        assert!(held.release().await.unwrap());
        assert!(waiting.acquire().await.unwrap().is_acquired());
    }

    #[tokio::test]
    async fn test_refresh_updates_seconds() {
        let backend = select_backend(&Arc::new(InMemoryRemoteStore::new("app_")));
        let mut held = pending(&backend, "p1", 10)
            .acquire()
            .await
            .unwrap()
            .acquired()
            .unwrap();
        assert!(held.refresh(60).await.unwrap());
        assert_eq!(held.seconds(), 60);
        assert!(held.is_owned_by_current_holder().await.unwrap());
    }
}
