//! LARDER Test Utilities
//!
//! Shared test infrastructure for the LARDER workspace:
//! - Proptest generators for keys, tags, values, and TTLs
//! - Fixtures wiring a `CacheStore` to an in-memory server on a manual clock
//! - A recording write observer

pub use larder_core::{
    encode_key, CacheValue, Clock, KeyWritten, LarderError, LarderResult, ManualClock,
    StoreConfig, TagSet, Timestamp, Ttl, RESERVED_CHARACTERS,
};
pub use larder_store::{CacheStore, InMemoryRemoteStore, MemoryServer, WriteObserver};

use std::sync::{Arc, Mutex};

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for LARDER inputs.

    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    /// Raw key drawn from an alphabet rich in reserved characters.
    pub fn arb_raw_key() -> impl Strategy<Value = String> {
        r"[a-z0-9{}()/\\@:._-]{1,24}"
    }

    /// Key containing no reserved characters.
    pub fn arb_clean_key() -> impl Strategy<Value = String> {
        r"[a-z0-9_.-]{1,24}"
    }

    pub fn arb_tag() -> impl Strategy<Value = String> {
        r"[a-z][a-z0-9_-]{0,11}"
    }

    pub fn arb_tag_set() -> impl Strategy<Value = TagSet> {
        prop::collection::vec(arb_tag(), 1..4).prop_map(TagSet::new)
    }

    /// Non-null JSON scalar or small object.
    pub fn arb_cache_value() -> impl Strategy<Value = CacheValue> {
        prop_oneof![
            any::<i64>().prop_map(CacheValue::from),
            any::<bool>().prop_map(CacheValue::from),
            "[ -~]{0,32}".prop_map(CacheValue::from),
            ("[a-z]{1,8}", any::<i32>()).prop_map(|(field, n)| {
                let mut object = serde_json::Map::new();
                object.insert(field, CacheValue::from(n));
                CacheValue::Object(object)
            }),
        ]
    }

    /// Whole-second TTL of at least one second.
    pub fn arb_ttl_seconds() -> impl Strategy<Value = u64> {
        1u64..=3600
    }

    /// Any finite or infinite TTL that does not resolve to expired.
    pub fn arb_ttl() -> impl Strategy<Value = Ttl> {
        prop_oneof![
            Just(Ttl::Forever),
            arb_ttl_seconds().prop_map(Ttl::seconds),
            (1u64..5000).prop_map(|ms| Ttl::Duration(Duration::from_millis(ms))),
        ]
    }

    /// Counter value far from the i64 limits.
    pub fn arb_counter() -> impl Strategy<Value = i64> {
        -1_000_000i64..1_000_000
    }

    /// Counter delta far from the i64 limits.
    pub fn arb_delta() -> impl Strategy<Value = i64> {
        -10_000i64..10_000
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-wired stores for common testing scenarios.

    use super::*;
    use std::time::Duration;

    /// Prefix used by fixture stores.
    pub const TEST_PREFIX: &str = "test_";

    /// A cache store on an in-memory server driven by a manual clock.
    pub struct StoreFixture {
        pub store: CacheStore<InMemoryRemoteStore>,
        pub clock: ManualClock,
        pub server: Arc<MemoryServer>,
    }

    impl StoreFixture {
        pub fn new() -> Self {
            Self::build(test_config(), |remote| remote)
        }

        pub fn with_config(config: StoreConfig) -> Self {
            Self::build(config, |remote| remote)
        }

        /// Store whose connection hides the native lock primitives.
        pub fn without_atomic_locks() -> Self {
            Self::build(test_config(), InMemoryRemoteStore::without_atomic_locks)
        }

        /// Build with a hook to adjust the remote connection.
        pub fn build<F>(config: StoreConfig, adjust: F) -> Self
        where
            F: FnOnce(InMemoryRemoteStore) -> InMemoryRemoteStore,
        {
            let clock = ManualClock::epoch_2024();
            let server = MemoryServer::with_clock(Arc::new(clock.clone()));
            let remote = adjust(server.connect(config.prefix.clone()));
            Self {
                store: CacheStore::new(Arc::new(remote), config),
                clock,
                server,
            }
        }

        /// A second store on the same server and namespace, like another
        /// process sharing the cache.
        pub fn peer(&self) -> CacheStore<InMemoryRemoteStore> {
            let remote = self.server.connect(self.store.prefix().to_string());
            CacheStore::new(Arc::new(remote), self.store.config().clone())
        }

        pub fn remote(&self) -> &Arc<InMemoryRemoteStore> {
            self.store.remote()
        }

        pub fn advance(&self, by: Duration) {
            self.clock.advance(by);
        }

        pub fn now(&self) -> Timestamp {
            self.clock.now()
        }
    }

    impl Default for StoreFixture {
        fn default() -> Self {
            Self::new()
        }
    }

    /// Configuration with the fixture prefix.
    pub fn test_config() -> StoreConfig {
        StoreConfig::new()
            .with_store_name("test")
            .with_prefix(TEST_PREFIX)
    }
}

// ============================================================================
// OBSERVERS
// ============================================================================

/// Observer that keeps every notification for later inspection.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<KeyWritten>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<KeyWritten> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.key).collect()
    }
}

impl WriteObserver for RecordingObserver {
    fn key_written(&self, event: &KeyWritten) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

/// True when `s` contains any reserved character.
pub fn contains_reserved(s: &str) -> bool {
    s.chars().any(|c| RESERVED_CHARACTERS.contains(&c))
}

#[cfg(test)]
mod tests {
    use super::fixtures::StoreFixture;
    use super::*;

    #[test]
    fn test_recording_observer_keeps_order() {
        let observer = RecordingObserver::new();
        for key in ["a", "b"] {
            observer.key_written(&KeyWritten {
                store_name: "test".to_string(),
                key: key.to_string(),
                value: CacheValue::from(1),
                ttl_seconds: None,
            });
        }
        assert_eq!(observer.keys(), vec!["a", "b"]);
    }

    #[test]
    fn test_fixture_uses_prefix_as_namespace() {
        let fixture = StoreFixture::new();
        assert_eq!(fixture.store.prefix(), fixtures::TEST_PREFIX);
        assert_eq!(
            larder_store::RemoteStore::namespace(fixture.remote().as_ref()),
            fixtures::TEST_PREFIX
        );
    }

    #[test]
    fn test_contains_reserved() {
        assert!(contains_reserved("a:b"));
        assert!(!contains_reserved(&encode_key("a:b")));
    }
}
