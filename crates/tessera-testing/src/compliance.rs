//! Backend compliance suite
//!
//! Every function here exercises one property of the [`Backend`] contract and
//! panics when the backend violates it. Backend crates call [`run_all`] (or
//! the individual checks) from their own integration tests:
//!
//! ```rust,ignore
//! #[tokio::test]
//! async fn test_compliance() -> anyhow::Result<()> {
//!     let backend = MemoryBackend::new();
//!     tessera_testing::compliance::run_all(&backend, "compliance").await?;
//!     Ok(())
//! }
//! ```
//!
//! All keys are placed under `prefix`, so several suites can share one store.
//! Expired items are produced with an expiry one hour in the past of
//! [`Backend::clock`], which keeps the checks independent of sweeping.

use bytes::Bytes;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use futures::future::join_all;
use std::time::Duration as StdDuration;

use tessera_core::{
    Backend, BackendExt, Error, Event, EventKind, Item, Lease, Result, Watch, Watcher,
};

/// How long [`next_event`] waits before failing
pub const EVENT_TIMEOUT: StdDuration = StdDuration::from_secs(10);

/// Build a key under `prefix`
pub fn key(prefix: &str, suffix: &str) -> Bytes {
    Bytes::from(format!("{}/{}", prefix, suffix))
}

/// An expiry in the future of the backend clock, at microsecond precision
pub fn future_expiry(backend: &dyn Backend) -> DateTime<Utc> {
    (backend.clock().now() + Duration::hours(1)).trunc_subsecs(6)
}

/// An expiry in the past of the backend clock
pub fn past_expiry(backend: &dyn Backend) -> DateTime<Utc> {
    (backend.clock().now() - Duration::hours(1)).trunc_subsecs(6)
}

/// Receive the next event or fail after [`EVENT_TIMEOUT`]
pub async fn next_event(watcher: &mut Watcher) -> Result<Event> {
    tokio::time::timeout(EVENT_TIMEOUT, watcher.recv())
        .await
        .map_err(|_| Error::timeout(format!("no event on watcher {:?}", watcher.name())))?
}

/// Run every check in this module
pub async fn run_all(backend: &dyn Backend, prefix: &str) -> Result<()> {
    create_and_get(backend, prefix).await?;
    create_on_live_key_fails(backend, prefix).await?;
    create_over_expired_key(backend, prefix).await?;
    put_round_trip(backend, prefix).await?;
    missing_and_expired_are_not_found(backend, prefix).await?;
    update_live_key(backend, prefix).await?;
    compare_and_swap_scenario(backend, prefix).await?;
    compare_and_swap_rejects_mismatched_keys(backend, prefix).await?;
    compare_and_swap_is_exclusive(backend, prefix).await?;
    keep_alive_extends_expiry(backend, prefix).await?;
    range_bounds_order_and_limit(backend, prefix).await?;
    delete_range_removes_everything(backend, prefix).await?;
    watcher_sees_mutations_in_order(backend, prefix).await?;
    close_watchers_forces_resync(backend, prefix).await?;
    Ok(())
}

/// A created item reads back unchanged
pub async fn create_and_get(backend: &dyn Backend, prefix: &str) -> Result<()> {
    let k = key(prefix, "create-and-get");
    let lease = backend.create(Item::new(k.clone(), "v1")).await?;
    assert_eq!(lease, Lease { key: k.clone(), expires: None });

    let got = backend.get(&k).await?;
    assert_eq!(got.key, k);
    assert_eq!(got.value, Bytes::from_static(b"v1"));
    assert_eq!(got.expires, None);
    Ok(())
}

/// Creating over a live key fails and leaves the item alone
pub async fn create_on_live_key_fails(backend: &dyn Backend, prefix: &str) -> Result<()> {
    let k = key(prefix, "create-live");
    backend.create(Item::new(k.clone(), "first")).await?;

    let err = backend
        .create(Item::new(k.clone(), "second"))
        .await
        .expect_err("create on a live key must fail");
    assert!(err.is_already_exists(), "unexpected error: {err}");
    assert_eq!(backend.get(&k).await?.value, Bytes::from_static(b"first"));
    Ok(())
}

/// Creating over an expired key succeeds
pub async fn create_over_expired_key(backend: &dyn Backend, prefix: &str) -> Result<()> {
    let k = key(prefix, "create-expired");
    backend
        .put(Item::new(k.clone(), "stale").with_expires(past_expiry(backend)))
        .await?;

    backend.create(Item::new(k.clone(), "fresh")).await?;
    assert_eq!(backend.get(&k).await?.value, Bytes::from_static(b"fresh"));
    Ok(())
}

/// Value and expiry survive a put
pub async fn put_round_trip(backend: &dyn Backend, prefix: &str) -> Result<()> {
    let k = key(prefix, "put");
    let expires = future_expiry(backend);
    let value = Bytes::from_static(&[0x00, 0xff, 0x10, 0x80]);

    let lease = backend
        .put(Item::new(k.clone(), value.clone()).with_expires(expires))
        .await?;
    assert_eq!(lease.expires, Some(expires));

    let got = backend.get(&k).await?;
    assert_eq!(got.value, value);
    assert_eq!(got.expires, Some(expires));

    backend.put(Item::new(k.clone(), "overwritten")).await?;
    let got = backend.get(&k).await?;
    assert_eq!(got.value, Bytes::from_static(b"overwritten"));
    assert_eq!(got.expires, None);
    Ok(())
}

/// Missing and expired items are absent for every keyed operation
pub async fn missing_and_expired_are_not_found(backend: &dyn Backend, prefix: &str) -> Result<()> {
    let expired = key(prefix, "absent-expired");
    backend
        .put(Item::new(expired.clone(), "gone").with_expires(past_expiry(backend)))
        .await?;

    for k in [key(prefix, "absent-missing"), expired] {
        let err = backend.get(&k).await.expect_err("get must fail");
        assert!(err.is_not_found(), "get: unexpected error: {err}");

        let err = backend
            .update(Item::new(k.clone(), "x"))
            .await
            .expect_err("update must fail");
        assert!(err.is_not_found(), "update: unexpected error: {err}");

        let err = backend.delete(&k).await.expect_err("delete must fail");
        assert!(err.is_not_found(), "delete: unexpected error: {err}");

        let lease = Lease { key: k.clone(), expires: None };
        let err = backend
            .keep_alive(&lease, Some(future_expiry(backend)))
            .await
            .expect_err("keep_alive must fail");
        assert!(err.is_not_found(), "keep_alive: unexpected error: {err}");

        let err = backend
            .compare_and_swap(Item::new(k.clone(), "gone"), Item::new(k.clone(), "y"))
            .await
            .expect_err("compare_and_swap must fail");
        assert!(err.is_compare_failed(), "compare_and_swap: unexpected error: {err}");
    }
    Ok(())
}

/// Update overwrites value and expiry of a live item
pub async fn update_live_key(backend: &dyn Backend, prefix: &str) -> Result<()> {
    let k = key(prefix, "update");
    backend.put(Item::new(k.clone(), "v1")).await?;

    let expires = future_expiry(backend);
    backend
        .update(Item::new(k.clone(), "v2").with_expires(expires))
        .await?;

    let got = backend.get(&k).await?;
    assert_eq!(got.value, Bytes::from_static(b"v2"));
    assert_eq!(got.expires, Some(expires));

    backend.delete(&k).await?;
    assert!(backend.get(&k).await.expect_err("deleted").is_not_found());
    Ok(())
}

/// create, swap, read back, then a stale swap fails
pub async fn compare_and_swap_scenario(backend: &dyn Backend, prefix: &str) -> Result<()> {
    let k = key(prefix, "cas");
    backend.create(Item::new(k.clone(), "v1")).await?;

    backend
        .compare_and_swap(Item::new(k.clone(), "v1"), Item::new(k.clone(), "v2"))
        .await?;
    assert_eq!(backend.get(&k).await?.value, Bytes::from_static(b"v2"));

    let err = backend
        .compare_and_swap(Item::new(k.clone(), "v1"), Item::new(k.clone(), "v3"))
        .await
        .expect_err("stale compare_and_swap must fail");
    assert!(err.is_compare_failed(), "unexpected error: {err}");
    assert_eq!(backend.get(&k).await?.value, Bytes::from_static(b"v2"));
    Ok(())
}

/// Keys of the expected and replacement items must match
pub async fn compare_and_swap_rejects_mismatched_keys(
    backend: &dyn Backend,
    prefix: &str,
) -> Result<()> {
    let a = key(prefix, "cas-key-a");
    let b = key(prefix, "cas-key-b");
    backend.put(Item::new(a.clone(), "v")).await?;

    let err = backend
        .compare_and_swap(Item::new(a.clone(), "v"), Item::new(b.clone(), "w"))
        .await
        .expect_err("mismatched keys must fail");
    assert!(err.is_bad_parameter(), "unexpected error: {err}");
    assert_eq!(backend.get(&a).await?.value, Bytes::from_static(b"v"));
    assert!(backend.get(&b).await.expect_err("untouched").is_not_found());
    Ok(())
}

/// Of many racing swaps from the same expected value, exactly one wins
pub async fn compare_and_swap_is_exclusive(backend: &dyn Backend, prefix: &str) -> Result<()> {
    const CONTENDERS: usize = 8;

    let k = key(prefix, "cas-race");
    backend.put(Item::new(k.clone(), "start")).await?;

    let results = join_all((0..CONTENDERS).map(|i| {
        let k = k.clone();
        async move {
            backend
                .compare_and_swap(
                    Item::new(k.clone(), "start"),
                    Item::new(k, format!("winner-{}", i)),
                )
                .await
        }
    }))
    .await;

    let mut winners = 0;
    for result in results {
        match result {
            Ok(_) => winners += 1,
            Err(err) => assert!(err.is_compare_failed(), "unexpected error: {err}"),
        }
    }
    assert_eq!(winners, 1);
    assert!(backend.get(&k).await?.value.starts_with(b"winner-"));
    Ok(())
}

/// keep_alive moves the expiry and keeps the value
pub async fn keep_alive_extends_expiry(backend: &dyn Backend, prefix: &str) -> Result<()> {
    let k = key(prefix, "keep-alive");
    let first = future_expiry(backend);
    let lease = backend
        .put(Item::new(k.clone(), "v").with_expires(first))
        .await?;

    let second = first + Duration::hours(1);
    backend.keep_alive(&lease, Some(second)).await?;
    let got = backend.get(&k).await?;
    assert_eq!(got.value, Bytes::from_static(b"v"));
    assert_eq!(got.expires, Some(second));

    backend.keep_alive(&lease, None).await?;
    assert_eq!(backend.get(&k).await?.expires, None);
    Ok(())
}

/// Range reads are inclusive, ordered, limited and skip expired items
pub async fn range_bounds_order_and_limit(backend: &dyn Backend, prefix: &str) -> Result<()> {
    let base = format!("{}/range", prefix);
    for name in ["d", "b", "a", "c", "e"] {
        backend
            .put(Item::new(key(&base, name), name.to_string()))
            .await?;
    }
    backend
        .put(Item::new(key(&base, "bb"), "expired").with_expires(past_expiry(backend)))
        .await?;

    let got = backend
        .get_range(&key(&base, "b"), &key(&base, "d"), 0)
        .await?;
    let keys: Vec<_> = got.items.iter().map(|i| i.key.clone()).collect();
    assert_eq!(keys, vec![key(&base, "b"), key(&base, "c"), key(&base, "d")]);

    let got = backend
        .get_range(&key(&base, "a"), &key(&base, "e"), 2)
        .await?;
    let keys: Vec<_> = got.items.iter().map(|i| i.key.clone()).collect();
    assert_eq!(keys, vec![key(&base, "a"), key(&base, "b")]);

    let got = backend.get_prefix(format!("{}/", base).as_bytes(), 0).await?;
    assert_eq!(got.items.len(), 5);
    assert!(got.items.windows(2).all(|w| w[0].key < w[1].key));

    let got = backend
        .get_range(&key(&base, "x"), &key(&base, "z"), 0)
        .await?;
    assert!(got.items.is_empty());
    Ok(())
}

/// delete_range removes live and expired items alike
pub async fn delete_range_removes_everything(backend: &dyn Backend, prefix: &str) -> Result<()> {
    let base = format!("{}/delete-range", prefix);
    for name in ["a", "b", "c"] {
        backend.put(Item::new(key(&base, name), "v")).await?;
    }
    backend
        .put(Item::new(key(&base, "bb"), "v").with_expires(past_expiry(backend)))
        .await?;

    backend
        .delete_range(&key(&base, "a"), &key(&base, "b"))
        .await?;
    let got = backend.get_prefix(format!("{}/", base).as_bytes(), 0).await?;
    let keys: Vec<_> = got.items.iter().map(|i| i.key.clone()).collect();
    assert_eq!(keys, vec![key(&base, "c")]);

    backend
        .delete_range(&key(&base, "x"), &key(&base, "z"))
        .await?;

    // the expired row at "bb" is past "b" and survives, but a create over it works
    backend.create(Item::new(key(&base, "bb"), "again")).await?;
    Ok(())
}

/// A watcher sees init, then each committed mutation once and in order
pub async fn watcher_sees_mutations_in_order(backend: &dyn Backend, prefix: &str) -> Result<()> {
    let base = format!("{}/watch", prefix);
    let mut watcher = backend
        .new_watcher(Watch::all("compliance-watch").with_prefix(format!("{}/", base)))
        .await?;
    assert_eq!(next_event(&mut watcher).await?.kind, EventKind::Init);

    let a = key(&base, "a");
    let b = key(&base, "b");
    backend.put(Item::new(a.clone(), "1")).await?;
    backend.put(Item::new(b.clone(), "2")).await?;
    backend
        .compare_and_swap(Item::new(a.clone(), "1"), Item::new(a.clone(), "3"))
        .await?;
    backend.delete(&b).await?;

    let mut seen = Vec::new();
    for _ in 0..4 {
        let ev = next_event(&mut watcher).await?;
        seen.push((ev.kind, ev.item.key, ev.item.value));
    }
    assert_eq!(
        seen,
        vec![
            (EventKind::Put, a.clone(), Bytes::from_static(b"1")),
            (EventKind::Put, b.clone(), Bytes::from_static(b"2")),
            (EventKind::Put, a, Bytes::from_static(b"3")),
            (EventKind::Delete, b, Bytes::new()),
        ]
    );
    Ok(())
}

/// close_watchers terminates open watchers with a resync error
pub async fn close_watchers_forces_resync(backend: &dyn Backend, prefix: &str) -> Result<()> {
    let mut watcher = backend
        .new_watcher(Watch::all("compliance-close").with_prefix(format!("{}/close/", prefix)))
        .await?;
    assert_eq!(next_event(&mut watcher).await?.kind, EventKind::Init);

    backend.close_watchers();
    let err = next_event(&mut watcher).await.expect_err("watcher must close");
    assert!(
        matches!(err, Error::WatcherClosed { .. }),
        "unexpected error: {err}"
    );
    assert!(watcher.is_closed());
    Ok(())
}
