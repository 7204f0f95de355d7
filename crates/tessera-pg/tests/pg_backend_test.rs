//! PgBackend tests against a PostgreSQL container
//!
//! Every test starts its own server with `wal_level = logical` and `wal2json`
//! through [`TestPostgres`], so Docker must be running.

use anyhow::{bail, Result};
use bytes::Bytes;
use chrono::{Duration, SubsecRound, Utc};
use futures::future::join_all;
use std::time::Duration as StdDuration;
use tessera_core::prelude::*;
use tessera_pg::{Config, PgBackend};
use tessera_testing::{compliance, key, next_event, TestPostgres};

/// Created by the backend on first start
const DATABASE: &str = "tessera";

/// Time allowed for a fresh change feed to emit its init event
const FEED_START_TIMEOUT: StdDuration = StdDuration::from_secs(30);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tessera_pg=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

/// Start a server; keep the returned container alive for the whole test
async fn postgres() -> Result<(TestPostgres, Config)> {
    init_tracing();
    let postgres = TestPostgres::start().await?;
    let config = Config::new(postgres.connection_string(DATABASE));
    Ok((postgres, config))
}

fn unique_prefix(test: &str) -> String {
    format!("/tessera-test/{}/{}", test, uuid::Uuid::new_v4().simple())
}

/// Wait for the init event on a watcher created around a feed (re)start
async fn wait_for_init(watcher: &mut Watcher) -> Result<()> {
    match tokio::time::timeout(FEED_START_TIMEOUT, watcher.recv()).await {
        Ok(Ok(ev)) if ev.kind == EventKind::Init => Ok(()),
        Ok(Ok(ev)) => bail!("unexpected first event {:?}", ev.kind),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => bail!("change feed did not start within {:?}", FEED_START_TIMEOUT),
    }
}

/// Start a backend and wait until its change feed is running
async fn start(config: Config) -> Result<PgBackend> {
    let backend = PgBackend::new(config).await?;
    let mut watcher = backend.new_watcher(Watch::all("feed-ready")).await?;
    wait_for_init(&mut watcher).await?;
    Ok(backend)
}

#[tokio::test]
async fn test_compliance_suite() -> Result<()> {
    let (_postgres, config) = postgres().await?;
    let backend = start(config).await?;
    compliance::run_all(&backend, &unique_prefix("compliance")).await?;
    backend.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_sweeper_deletes_expired_rows() -> Result<()> {
    let (_postgres, config) = postgres().await?;
    let backend = start(config.with_expiry_interval(StdDuration::from_millis(500))).await?;
    let base = unique_prefix("sweeper");
    let mut watcher = backend
        .new_watcher(Watch::all("sweeper").with_prefix(format!("{}/", base)))
        .await?;
    assert_eq!(next_event(&mut watcher).await?.kind, EventKind::Init);

    let short = key(&base, "short");
    let expires = (Utc::now() + Duration::seconds(1)).trunc_subsecs(6);
    backend
        .put(Item::new(short.clone(), "v").with_expires(expires))
        .await?;
    backend.put(Item::new(key(&base, "forever"), "v")).await?;

    let put = next_event(&mut watcher).await?;
    assert_eq!((put.kind, put.item.key.clone()), (EventKind::Put, short.clone()));
    assert_eq!(put.item.expires, Some(expires));
    assert_eq!(next_event(&mut watcher).await?.kind, EventKind::Put);

    // the sweep turns the expiry into a delete on the feed
    let deleted = next_event(&mut watcher).await?;
    assert_eq!(deleted, Event::delete(short.clone()));
    assert!(backend.get(&short).await.unwrap_err().is_not_found());
    assert!(backend.get(&key(&base, "forever")).await.is_ok());

    backend.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_expired_rows_are_invisible_before_sweeping() -> Result<()> {
    let (_postgres, config) = postgres().await?;
    let backend = start(config.with_disable_expiry(true)).await?;
    let base = unique_prefix("manual-sweep");

    let k = key(&base, "k");
    backend
        .put(Item::new(k.clone(), "v").with_expires(Utc::now() - Duration::minutes(5)))
        .await?;
    assert!(backend.get(&k).await.unwrap_err().is_not_found());
    let range = backend.get_prefix(format!("{}/", base).as_bytes(), 0).await?;
    assert!(range.items.is_empty());

    assert!(backend.delete_expired().await? >= 1);
    // the row is gone for good: a create no longer needs to overwrite it
    backend.create(Item::new(k.clone(), "fresh")).await?;
    assert_eq!(backend.get(&k).await?.value, Bytes::from_static(b"fresh"));

    backend.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_delete_range_publishes_each_row() -> Result<()> {
    let (_postgres, config) = postgres().await?;
    let backend = start(config).await?;
    let base = unique_prefix("delete-range");
    let mut watcher = backend
        .new_watcher(Watch::all("delete-range").with_prefix(format!("{}/", base)))
        .await?;
    assert_eq!(next_event(&mut watcher).await?.kind, EventKind::Init);

    let keys: Vec<Bytes> = ["a", "b", "c"].iter().map(|s| key(&base, s)).collect();
    for k in &keys {
        backend.put(Item::new(k.clone(), "v")).await?;
    }
    for _ in &keys {
        assert_eq!(next_event(&mut watcher).await?.kind, EventKind::Put);
    }

    backend.delete_range(&keys[0], &keys[2]).await?;
    let mut deleted = Vec::new();
    for _ in &keys {
        let ev = next_event(&mut watcher).await?;
        assert_eq!(ev.kind, EventKind::Delete);
        deleted.push(ev.item.key);
    }
    deleted.sort();
    assert_eq!(deleted, keys);

    backend.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_compare_and_swap_across_backends() -> Result<()> {
    let (_postgres, config) = postgres().await?;
    let first = start(config.clone()).await?;
    let second = start(config).await?;
    let k = key(&unique_prefix("cas"), "lock");
    first.create(Item::new(k.clone(), "free")).await?;

    let attempts = (0..8).map(|i| {
        let backend = if i % 2 == 0 { &first } else { &second };
        let k = k.clone();
        async move {
            backend
                .compare_and_swap(
                    Item::new(k.clone(), "free"),
                    Item::new(k, format!("owner-{}", i)),
                )
                .await
        }
    });
    let results = join_all(attempts).await;

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "{:?}", results);
    for err in results.iter().filter_map(|r| r.as_ref().err()) {
        assert!(err.is_compare_failed(), "unexpected error: {err}");
    }

    // the winning write is visible through the other backend
    let value = second.get(&k).await?.value;
    assert!(value.starts_with(b"owner-"));

    first.close().await?;
    second.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_close_is_idempotent() -> Result<()> {
    let (_postgres, config) = postgres().await?;
    let backend = start(config).await?;
    let mut watcher = backend.new_watcher(Watch::all("close")).await?;
    assert_eq!(next_event(&mut watcher).await?.kind, EventKind::Init);

    backend.close().await?;
    backend.close().await?;

    assert!(next_event(&mut watcher).await.is_err());
    let err = backend.new_watcher(Watch::all("late")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Closed);
    let err = backend.get(b"/anything").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Closed);
    Ok(())
}

#[tokio::test]
async fn test_feed_restarts_after_losing_its_session() -> Result<()> {
    let (postgres, config) = postgres().await?;
    let backend = start(config).await?;
    let base = unique_prefix("restart");
    let watch = Watch::all("restart").with_prefix(format!("{}/", base));
    let mut watcher = backend.new_watcher(watch.clone()).await?;
    assert_eq!(next_event(&mut watcher).await?.kind, EventKind::Init);

    // the temporary slot is held by the feed session for its whole life
    let admin = postgres.connect(DATABASE).await?;
    let killed = admin
        .query(
            "SELECT pg_terminate_backend(active_pid) FROM pg_replication_slots
                WHERE temporary AND active_pid IS NOT NULL",
            &[],
        )
        .await?;
    assert_eq!(killed.len(), 1);

    let err = next_event(&mut watcher).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Watcher, "{err}");

    let mut watcher = backend.new_watcher(watch).await?;
    wait_for_init(&mut watcher).await?;
    let k = key(&base, "after");
    backend.put(Item::new(k.clone(), "v")).await?;
    let put = next_event(&mut watcher).await?;
    assert_eq!((put.kind, put.item.key), (EventKind::Put, k));

    backend.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_key_change_by_another_writer() -> Result<()> {
    let (postgres, config) = postgres().await?;
    let backend = start(config).await?;
    let base = unique_prefix("rename");
    let mut watcher = backend
        .new_watcher(Watch::all("rename").with_prefix(format!("{}/", base)))
        .await?;
    assert_eq!(next_event(&mut watcher).await?.kind, EventKind::Init);

    let old = key(&base, "old");
    let new = key(&base, "new");
    backend.put(Item::new(old.clone(), "v")).await?;
    assert_eq!(next_event(&mut watcher).await?.kind, EventKind::Put);

    let admin = postgres.connect(DATABASE).await?;
    let (new_key, old_key): (&[u8], &[u8]) = (&new, &old);
    let renamed = admin
        .execute("UPDATE kv SET key = $1 WHERE key = $2", &[&new_key, &old_key])
        .await?;
    assert_eq!(renamed, 1);

    assert_eq!(next_event(&mut watcher).await?, Event::delete(old.clone()));
    let put = next_event(&mut watcher).await?;
    assert_eq!(put.kind, EventKind::Put);
    assert_eq!(put.item.key, new);
    assert_eq!(put.item.value, Bytes::from_static(b"v"));

    assert!(backend.get(&old).await.unwrap_err().is_not_found());
    backend.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_truncate_forces_resync() -> Result<()> {
    let (postgres, config) = postgres().await?;
    let backend = start(config).await?;
    let mut watcher = backend.new_watcher(Watch::all("truncate")).await?;
    assert_eq!(next_event(&mut watcher).await?.kind, EventKind::Init);

    let k = key(&unique_prefix("truncate"), "k");
    backend.put(Item::new(k.clone(), "v")).await?;
    assert_eq!(next_event(&mut watcher).await?.kind, EventKind::Put);

    postgres.connect(DATABASE).await?.batch_execute("TRUNCATE kv").await?;
    let err = next_event(&mut watcher).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Watcher, "{err}");

    // the feed comes back on a new slot
    let mut watcher = backend.new_watcher(Watch::all("after-truncate")).await?;
    wait_for_init(&mut watcher).await?;
    assert!(backend.get(&k).await.unwrap_err().is_not_found());

    backend.close().await?;
    Ok(())
}
