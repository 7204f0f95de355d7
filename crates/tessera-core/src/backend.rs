//! The backend contract
//!
//! A backend stores [`Item`]s and publishes every committed mutation to its
//! watchers. Liveness is decided by the backend, never by the caller: an item
//! whose expiry has passed is absent for every operation below.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::Result;
use crate::item::{GetResult, Item, Lease, Watch};
use crate::watch::Watcher;

/// A transactional, expiry-aware key-value backend
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend name
    fn name(&self) -> &'static str;

    /// Insert `item` if no live item exists at its key
    ///
    /// An expired item at the key is overwritten. Fails with `AlreadyExists`
    /// when a live item is present.
    async fn create(&self, item: Item) -> Result<Lease>;

    /// Insert or overwrite `item` unconditionally
    async fn put(&self, item: Item) -> Result<Lease>;

    /// Overwrite the live item at `item.key`; fails with `NotFound` otherwise
    async fn update(&self, item: Item) -> Result<Lease>;

    /// Replace the live item at `replace_with.key` if its value equals
    /// `expected.value`
    ///
    /// Fails with `BadParameter` when the keys differ and with `CompareFailed`
    /// when there is no live item or the value differs.
    async fn compare_and_swap(&self, expected: Item, replace_with: Item) -> Result<Lease>;

    /// Read the live item at `key`; fails with `NotFound` otherwise
    async fn get(&self, key: &[u8]) -> Result<Item>;

    /// Read live items with `start <= key <= end` in ascending key order
    ///
    /// A `limit` of zero means [`crate::DEFAULT_RANGE_LIMIT`].
    async fn get_range(&self, start: &[u8], end: &[u8], limit: usize) -> Result<GetResult>;

    /// Delete the live item at `key`; fails with `NotFound` otherwise
    async fn delete(&self, key: &[u8]) -> Result<()>;

    /// Delete every item with `start <= key <= end`, live or not
    ///
    /// Meant for small ranges: every deleted row becomes a change feed event.
    async fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<()>;

    /// Set a new expiry on the live item at `lease.key`
    ///
    /// The value is left untouched. Fails with `NotFound` when the item is not
    /// live.
    async fn keep_alive(&self, lease: &Lease, expires: Option<DateTime<Utc>>) -> Result<()>;

    /// Subscribe to mutations matching `watch`
    async fn new_watcher(&self, watch: Watch) -> Result<Watcher>;

    /// Close every open watcher; they must resynchronize
    fn close_watchers(&self);

    /// Clock the backend uses for expiry
    fn clock(&self) -> Arc<dyn Clock>;

    /// Stop background work and release resources
    async fn close(&self) -> Result<()>;
}

/// Convenience wrappers over [`Backend`]
#[async_trait]
pub trait BackendExt: Backend {
    /// Read every live item whose key starts with `prefix`
    async fn get_prefix(&self, prefix: &[u8], limit: usize) -> Result<GetResult> {
        let end = range_end_for_prefix(prefix);
        self.get_range(prefix, &end, limit).await
    }
}

impl<T: Backend + ?Sized> BackendExt for T {}

/// Smallest inclusive upper bound covering every key that starts with `prefix`
///
/// Keys that continue the prefix with more than 64 `0xff` bytes fall outside
/// the bound.
pub fn range_end_for_prefix(prefix: &[u8]) -> Bytes {
    let mut end = prefix.to_vec();
    end.extend(std::iter::repeat(0xff).take(RANGE_END_PADDING));
    Bytes::from(end)
}

const RANGE_END_PADDING: usize = 64;
