//! MemoryBackend tests
//!
//! Runs the shared compliance suite plus the expiry behavior that depends on
//! moving the clock.

use anyhow::Result;
use bytes::Bytes;
use chrono::Duration;
use std::sync::Arc;
use tessera_core::prelude::*;
use tessera_core::ManualClock;
use tessera_testing::compliance;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tessera_core=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn test_compliance_suite() -> Result<()> {
    init_tracing();
    let backend = MemoryBackend::with_clock(Arc::new(ManualClock::default()));
    compliance::run_all(&backend, "compliance").await?;
    Ok(())
}

#[tokio::test]
async fn test_item_expires_when_clock_passes_expiry() -> Result<()> {
    init_tracing();
    let clock = Arc::new(ManualClock::default());
    let backend = MemoryBackend::with_clock(clock.clone());

    let expires = clock.now() + Duration::seconds(30);
    let lease = backend
        .put(Item::new("/sessions/a", "s").with_expires(expires))
        .await?;
    assert!(backend.get(b"/sessions/a").await.is_ok());

    clock.advance(Duration::seconds(30));
    assert!(backend.get(b"/sessions/a").await.unwrap_err().is_not_found());
    assert!(backend
        .keep_alive(&lease, None)
        .await
        .unwrap_err()
        .is_not_found());

    // invisible, yet still stored until swept
    assert_eq!(backend.stored_len(), 1);
    assert_eq!(backend.remove_expired(), 1);
    assert_eq!(backend.stored_len(), 0);
    Ok(())
}

#[tokio::test]
async fn test_sweep_publishes_deletes() -> Result<()> {
    init_tracing();
    let clock = Arc::new(ManualClock::default());
    let backend = MemoryBackend::with_clock(clock.clone());

    let mut watcher = backend.new_watcher(Watch::all("sweep")).await?;
    assert_eq!(compliance::next_event(&mut watcher).await?.kind, EventKind::Init);

    backend
        .put(Item::new("a", "1").with_expires(clock.now() + Duration::seconds(1)))
        .await?;
    clock.advance(Duration::seconds(2));
    backend.remove_expired();

    let put = compliance::next_event(&mut watcher).await?;
    assert_eq!(put.kind, EventKind::Put);
    let delete = compliance::next_event(&mut watcher).await?;
    assert_eq!(delete.kind, EventKind::Delete);
    assert_eq!(delete.item.key, Bytes::from_static(b"a"));
    Ok(())
}

#[tokio::test]
async fn test_close_rejects_new_watchers() -> Result<()> {
    let backend = MemoryBackend::new();
    let mut watcher = backend.new_watcher(Watch::all("before-close")).await?;
    backend.close().await?;

    assert!(watcher.recv().await.is_err());
    let err = backend.new_watcher(Watch::all("after-close")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Closed);
    Ok(())
}

#[tokio::test]
async fn test_range_limit_zero_uses_default() -> Result<()> {
    let backend = MemoryBackend::new();
    for i in 0..50 {
        backend
            .put(Item::new(format!("/k/{:03}", i), "v"))
            .await?;
    }
    let got = backend.get_prefix(b"/k/", 0).await?;
    assert_eq!(got.items.len(), 50);
    let got = backend.get_prefix(b"/k/", 10).await?;
    assert_eq!(got.items.len(), 10);
    assert_eq!(&got.items[9].key[..], b"/k/009");
    Ok(())
}
