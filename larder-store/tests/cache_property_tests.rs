//! Property-Based Tests for the Cache Store
//!
//! Exercises `CacheStore` against the in-memory remote store on a manual
//! clock: key encoding at the boundary, TTL rounding and expiry, forgetting
//! through non-positive TTLs, and TTL-preserving counters.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use larder_core::{encode_key, CacheValue, Ttl};
use larder_test_utils::contains_reserved;
use larder_test_utils::fixtures::StoreFixture;
use larder_test_utils::generators::*;
use larder_store::RemoteStore;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Whatever the caller passes, the remote store only ever sees the
    /// encoded key, and reading back through the same raw key finds it.
    #[test]
    fn prop_forever_roundtrip_through_encoded_key(
        key in arb_raw_key(),
        value in arb_cache_value(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let fixture = StoreFixture::new();
            let store = &fixture.store;

            prop_assert!(store.forever(&key, value.clone()).await.unwrap());
            prop_assert_eq!(store.get(&key).await.unwrap(), Some(value));
            prop_assert_eq!(store.remaining_ttl(&key).await.unwrap(), Some(Ttl::Forever));

            let encoded = encode_key(&key);
            prop_assert!(!contains_reserved(&encoded));
            prop_assert!(fixture.remote().get_item(&encoded).await.unwrap().is_hit());

            Ok(())
        })?;
    }

    /// A positive TTL is visible as a remaining lifetime in (0, ttl] and the
    /// entry disappears once the clock passes it.
    #[test]
    fn prop_ttl_window(
        key in arb_clean_key(),
        seconds in arb_ttl_seconds(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let fixture = StoreFixture::new();
            let store = &fixture.store;
            store.put(&key, "v", Ttl::seconds(seconds)).await.unwrap();

            let remaining = store.remaining_ttl(&key).await.unwrap();
            let Some(Ttl::Duration(left)) = remaining else {
                return Err(TestCaseError::fail(format!("unexpected ttl {:?}", remaining)));
            };
            prop_assert!(left > Duration::ZERO);
            prop_assert!(left <= Duration::from_secs(seconds));

            fixture.advance(Duration::from_secs(seconds));
            prop_assert_eq!(store.get(&key).await.unwrap(), None);

            Ok(())
        })?;
    }

    /// Sub-second TTLs round up to one second rather than vanishing.
    #[test]
    fn prop_sub_second_ttl_lasts_one_second(
        key in arb_clean_key(),
        millis in 1u64..1000,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let fixture = StoreFixture::new();
            let store = &fixture.store;
            store.put(&key, 1, Duration::from_millis(millis)).await.unwrap();

            fixture.advance(Duration::from_millis(999));
            prop_assert!(store.has(&key).await.unwrap());
            fixture.advance(Duration::from_millis(1));
            prop_assert!(!store.has(&key).await.unwrap());

            Ok(())
        })?;
    }

    /// A zero TTL or an instant already in the past behaves like forget.
    #[test]
    fn prop_non_positive_ttl_forgets(
        key in arb_raw_key(),
        value in arb_cache_value(),
        past_seconds in 0i64..3600,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let fixture = StoreFixture::new();
            let store = &fixture.store;

            store.forever(&key, value.clone()).await.unwrap();
            prop_assert!(store.put(&key, value.clone(), Duration::ZERO).await.unwrap());
            prop_assert_eq!(store.get(&key).await.unwrap(), None);

            store.forever(&key, value.clone()).await.unwrap();
            let past = fixture.now() - chrono::Duration::seconds(past_seconds);
            prop_assert!(store.put(&key, value, past).await.unwrap());
            prop_assert_eq!(store.get(&key).await.unwrap(), None);

            Ok(())
        })?;
    }

    /// Incrementing an absent key reports failure and creates nothing.
    #[test]
    fn prop_increment_absent_creates_nothing(
        key in arb_raw_key(),
        delta in arb_delta(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let fixture = StoreFixture::new();
            let store = &fixture.store;

            prop_assert_eq!(store.increment(&key, delta).await.unwrap(), None);
            prop_assert_eq!(store.decrement(&key, delta).await.unwrap(), None);
            prop_assert!(!store.has(&key).await.unwrap());
            prop_assert_eq!(fixture.server.item_count(store.prefix()).await, 0);

            Ok(())
        })?;
    }

    /// Counters keep their exact remaining lifetime across increments, down
    /// to the millisecond.
    #[test]
    fn prop_increment_preserves_remaining_ttl(
        key in arb_raw_key(),
        start in arb_counter(),
        delta in arb_delta(),
        (ttl, elapsed_ms) in (2u64..3600).prop_flat_map(|ttl| (Just(ttl), 0..ttl * 1000)),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let fixture = StoreFixture::new();
            let store = &fixture.store;
            store.put(&key, start, Ttl::seconds(ttl)).await.unwrap();
            fixture.advance(Duration::from_millis(elapsed_ms));
            let left = Duration::from_millis(ttl * 1000 - elapsed_ms);

            prop_assert_eq!(store.increment(&key, delta).await.unwrap(), Some(start + delta));
            prop_assert_eq!(store.get(&key).await.unwrap(), Some(CacheValue::from(start + delta)));
            prop_assert_eq!(store.remaining_ttl(&key).await.unwrap(), Some(Ttl::Duration(left)));

            prop_assert_eq!(store.decrement(&key, delta).await.unwrap(), Some(start));
            fixture.advance(left);
            prop_assert_eq!(store.get(&key).await.unwrap(), None);

            Ok(())
        })?;
    }

    /// Incrementing more often than once a second never pushes a counter
    /// past the deadline it was written with.
    #[test]
    fn prop_repeated_increments_expire_at_original_deadline(
        key in arb_raw_key(),
        ttl in 1u64..30,
        step_ms in 1u64..1000,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let fixture = StoreFixture::new();
            let store = &fixture.store;
            store.put(&key, 0, Ttl::seconds(ttl)).await.unwrap();

            let deadline_ms = ttl * 1000;
            let mut elapsed_ms = 0;
            let mut count = 0;
            while elapsed_ms + step_ms < deadline_ms {
                fixture.advance(Duration::from_millis(step_ms));
                elapsed_ms += step_ms;
                count += 1;
                prop_assert_eq!(store.increment(&key, 1).await.unwrap(), Some(count));
            }

            fixture.advance(Duration::from_millis(deadline_ms - elapsed_ms));
            prop_assert_eq!(store.get(&key).await.unwrap(), None);
            prop_assert_eq!(store.increment(&key, 1).await.unwrap(), None);

            Ok(())
        })?;
    }

    /// `many` reports every requested key, hits and misses alike.
    #[test]
    fn prop_many_keeps_per_key_misses(
        entries in prop::collection::btree_map(arb_clean_key(), arb_cache_value(), 0..8),
        extra in prop::collection::btree_set(arb_clean_key(), 0..8),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let fixture = StoreFixture::new();
            let store = &fixture.store;
            for (key, value) in &entries {
                store.forever(key, value.clone()).await.unwrap();
            }

            let requested: BTreeSet<String> =
                entries.keys().cloned().chain(extra.iter().cloned()).collect();
            let found = store.many(requested.iter().cloned()).await.unwrap();

            prop_assert_eq!(found.len(), requested.len());
            for key in &requested {
                prop_assert_eq!(found.get(key).cloned().flatten(), entries.get(key).cloned());
            }

            Ok(())
        })?;
    }

    /// Non-empty `put_many` succeeds and writes every entry.
    #[test]
    fn prop_put_many_writes_everything(
        entries in prop::collection::btree_map(arb_clean_key(), arb_cache_value(), 1..8),
        ttl in arb_ttl(),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let fixture = StoreFixture::new();
            let store = &fixture.store;

            let pairs: Vec<(String, CacheValue)> = entries.clone().into_iter().collect();
            prop_assert!(store.put_many(pairs, ttl).await.unwrap());
            for (key, value) in entries {
                prop_assert_eq!(store.get(&key).await.unwrap(), Some(value));
            }

            Ok(())
        })?;
    }
}

// ============================================================================
// EDGE CASES
// ============================================================================

#[tokio::test]
async fn test_put_many_empty_map_is_false() {
    let fixture = StoreFixture::new();
    let empty: BTreeMap<String, CacheValue> = BTreeMap::new();
    assert!(!fixture.store.put_many(empty, Ttl::seconds(60)).await.unwrap());
}

#[tokio::test]
async fn test_flush_leaves_other_namespaces() {
    let fixture = StoreFixture::new();
    let other = fixture.server.connect("other_");
    fixture.store.forever("k", 1).await.unwrap();
    let mut item = larder_core::CacheItem::miss("k");
    item.set(CacheValue::from(2));
    other.save(item).await.unwrap();

    assert!(fixture.store.flush().await.unwrap());

    assert_eq!(fixture.store.get("k").await.unwrap(), None);
    assert!(other.get_item("k").await.unwrap().is_hit());
}

#[tokio::test]
async fn test_peer_store_shares_state() {
    let fixture = StoreFixture::new();
    let peer = fixture.peer();
    fixture.store.put("shared", "v", Ttl::seconds(30)).await.unwrap();
    assert_eq!(peer.get("shared").await.unwrap(), Some(CacheValue::from("v")));
    assert!(peer.forget("shared").await.unwrap());
    assert!(!fixture.store.has("shared").await.unwrap());
}

#[tokio::test]
async fn test_refused_save_is_false_not_error() {
    let fixture = StoreFixture::new();
    fixture.remote().set_read_only(true);
    assert!(!fixture.store.put("k", 1, Ttl::Forever).await.unwrap());
    assert!(!fixture.store.flush().await.unwrap());
}
