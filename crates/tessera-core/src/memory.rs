//! In-memory backend
//!
//! Implements the full [`Backend`] contract over an ordered map. Liveness is
//! decided by the injected [`Clock`], so tests can move time explicitly.
//! Mutations are published straight into the backend's own [`WatchBuffer`].
//! Expired rows stay in the map, invisible, until [`MemoryBackend::remove_expired`]
//! runs.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use tracing::debug;

use crate::backend::Backend;
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::item::{
    is_live, Event, GetResult, Item, KeyDisplay, Lease, Watch, DEFAULT_BUFFER_CAPACITY,
    DEFAULT_RANGE_LIMIT,
};
use crate::watch::{WatchBuffer, Watcher};

/// Name reported by [`MemoryBackend`]
pub const NAME: &str = "memory";

#[derive(Debug, Clone)]
struct Row {
    value: Bytes,
    expires: Option<DateTime<Utc>>,
}

/// Ordered in-memory backend
pub struct MemoryBackend {
    rows: Mutex<BTreeMap<Bytes, Row>>,
    clock: Arc<dyn Clock>,
    buf: WatchBuffer,
}

impl MemoryBackend {
    /// Create a backend on the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a backend on `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let buf = WatchBuffer::new(DEFAULT_BUFFER_CAPACITY);
        buf.set_init();
        Self {
            rows: Mutex::new(BTreeMap::new()),
            clock,
            buf,
        }
    }

    /// Number of stored rows, including expired ones not yet removed
    pub fn stored_len(&self) -> usize {
        self.rows.lock().len()
    }

    /// Physically remove expired rows, publishing a delete for each
    pub fn remove_expired(&self) -> usize {
        let now = self.clock.now();
        let mut rows = self.rows.lock();
        let expired: Vec<Bytes> = rows
            .iter()
            .filter(|(_, row)| !is_live(row.expires, now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            rows.remove(key);
        }
        self.buf.emit(expired.iter().cloned().map(Event::delete));
        if !expired.is_empty() {
            debug!(deleted = expired.len(), "Deleted expired items");
        }
        expired.len()
    }

    fn live_row<'a>(
        rows: &'a BTreeMap<Bytes, Row>,
        key: &[u8],
        now: DateTime<Utc>,
    ) -> Option<&'a Row> {
        rows.get(key).filter(|row| is_live(row.expires, now))
    }

    fn store(&self, rows: &mut BTreeMap<Bytes, Row>, item: &Item) {
        rows.insert(
            item.key.clone(),
            Row {
                value: item.value.clone(),
                expires: item.expires,
            },
        );
        self.buf.emit([Event::put(item.clone())]);
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("rows", &self.stored_len())
            .field("buffer", &self.buf)
            .finish()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn create(&self, item: Item) -> Result<Lease> {
        let now = self.clock.now();
        let mut rows = self.rows.lock();
        if Self::live_row(&rows, &item.key, now).is_some() {
            return Err(Error::already_exists(format!(
                "key {} already exists",
                KeyDisplay(&item.key)
            )));
        }
        self.store(&mut rows, &item);
        Ok(item.lease())
    }

    async fn put(&self, item: Item) -> Result<Lease> {
        let mut rows = self.rows.lock();
        self.store(&mut rows, &item);
        Ok(item.lease())
    }

    async fn update(&self, item: Item) -> Result<Lease> {
        let now = self.clock.now();
        let mut rows = self.rows.lock();
        if Self::live_row(&rows, &item.key, now).is_none() {
            return Err(Error::not_found(format!(
                "key {} does not exist",
                KeyDisplay(&item.key)
            )));
        }
        self.store(&mut rows, &item);
        Ok(item.lease())
    }

    async fn compare_and_swap(&self, expected: Item, replace_with: Item) -> Result<Lease> {
        if expected.key != replace_with.key {
            return Err(Error::bad_parameter(
                "expected and replace_with keys should match",
            ));
        }
        let now = self.clock.now();
        let mut rows = self.rows.lock();
        match Self::live_row(&rows, &replace_with.key, now) {
            Some(row) if row.value == expected.value => {}
            _ => {
                return Err(Error::compare_failed(format!(
                    "key {} does not exist or does not match expected",
                    KeyDisplay(&replace_with.key)
                )))
            }
        }
        self.store(&mut rows, &replace_with);
        Ok(replace_with.lease())
    }

    async fn get(&self, key: &[u8]) -> Result<Item> {
        let now = self.clock.now();
        let rows = self.rows.lock();
        Self::live_row(&rows, key, now)
            .map(|row| Item {
                key: Bytes::copy_from_slice(key),
                value: row.value.clone(),
                expires: row.expires,
            })
            .ok_or_else(|| Error::not_found(format!("key {} does not exist", KeyDisplay(key))))
    }

    async fn get_range(&self, start: &[u8], end: &[u8], limit: usize) -> Result<GetResult> {
        let limit = if limit == 0 { DEFAULT_RANGE_LIMIT } else { limit };
        if start > end {
            return Ok(GetResult::default());
        }
        let now = self.clock.now();
        let rows = self.rows.lock();
        let items = rows
            .range::<[u8], _>((Bound::Included(start), Bound::Included(end)))
            .filter(|(_, row)| is_live(row.expires, now))
            .take(limit)
            .map(|(key, row)| Item {
                key: key.clone(),
                value: row.value.clone(),
                expires: row.expires,
            })
            .collect();
        Ok(GetResult { items })
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        let now = self.clock.now();
        let mut rows = self.rows.lock();
        if Self::live_row(&rows, key, now).is_none() {
            return Err(Error::not_found(format!(
                "key {} does not exist",
                KeyDisplay(key)
            )));
        }
        rows.remove(key);
        self.buf.emit([Event::delete(Bytes::copy_from_slice(key))]);
        Ok(())
    }

    async fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<()> {
        if start > end {
            return Ok(());
        }
        let mut rows = self.rows.lock();
        let keys: Vec<Bytes> = rows
            .range::<[u8], _>((Bound::Included(start), Bound::Included(end)))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            rows.remove(key);
        }
        self.buf.emit(keys.into_iter().map(Event::delete));
        Ok(())
    }

    async fn keep_alive(&self, lease: &Lease, expires: Option<DateTime<Utc>>) -> Result<()> {
        let now = self.clock.now();
        let mut rows = self.rows.lock();
        let row = rows
            .get_mut(&lease.key)
            .filter(|row| is_live(row.expires, now))
            .ok_or_else(|| {
                Error::not_found(format!("key {} does not exist", KeyDisplay(&lease.key)))
            })?;
        row.expires = expires;
        let item = Item {
            key: lease.key.clone(),
            value: row.value.clone(),
            expires,
        };
        self.buf.emit([Event::put(item)]);
        Ok(())
    }

    async fn new_watcher(&self, watch: Watch) -> Result<Watcher> {
        self.buf.new_watcher(watch)
    }

    fn close_watchers(&self) {
        self.buf.clear();
    }

    fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    async fn close(&self) -> Result<()> {
        self.buf.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::item::EventKind;
    use chrono::Duration;

    #[tokio::test]
    async fn test_expired_rows_are_invisible_until_removed() {
        let clock = Arc::new(ManualClock::default());
        let bk = MemoryBackend::with_clock(clock.clone());

        let expires = clock.now() + Duration::seconds(10);
        bk.put(Item::new("a", "1").with_expires(expires)).await.unwrap();
        bk.put(Item::new("b", "2")).await.unwrap();

        clock.advance(Duration::seconds(11));
        assert!(bk.get(b"a").await.unwrap_err().is_not_found());
        assert_eq!(bk.stored_len(), 2);

        assert_eq!(bk.remove_expired(), 1);
        assert_eq!(bk.stored_len(), 1);
        assert_eq!(bk.get(b"b").await.unwrap().value, Bytes::from_static(b"2"));
    }

    #[tokio::test]
    async fn test_keep_alive_publishes_put() {
        let bk = MemoryBackend::new();
        let lease = bk.put(Item::new("a", "1")).await.unwrap();
        let mut w = bk.new_watcher(Watch::all("w")).await.unwrap();
        assert_eq!(w.recv().await.unwrap().kind, EventKind::Init);

        let expires = Utc::now() + Duration::hours(1);
        bk.keep_alive(&lease, Some(expires)).await.unwrap();

        let ev = w.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Put);
        assert_eq!(ev.item.value, Bytes::from_static(b"1"));
        assert_eq!(ev.item.expires, Some(expires));
    }

    #[tokio::test]
    async fn test_inverted_range_is_empty() {
        let bk = MemoryBackend::new();
        bk.put(Item::new("a", "1")).await.unwrap();
        assert!(bk.get_range(b"z", b"a", 0).await.unwrap().items.is_empty());
        bk.delete_range(b"z", b"a").await.unwrap();
        assert!(bk.get(b"a").await.is_ok());
    }
}
