//! Items, leases, events and watch filters
//!
//! Keys are raw byte strings ordered lexicographically. An item without an
//! expiry never expires; an item whose expiry has passed is treated as absent
//! by every operation, whether or not it has been physically removed yet.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::serde_utils::{byte_string, byte_strings};

/// Default number of items returned by a range read when no limit is given
pub const DEFAULT_RANGE_LIMIT: usize = 1_000_000;

/// Default change feed poll period shared by polling backends
pub const DEFAULT_POLL_STREAM_PERIOD: std::time::Duration = std::time::Duration::from_secs(1);

/// Default capacity of a watch buffer
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// A key-value pair with an optional expiry
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Item {
    /// Key
    #[serde(with = "byte_string")]
    pub key: Bytes,
    /// Value
    #[serde(with = "byte_string", default)]
    pub value: Bytes,
    /// Expiry; `None` never expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

impl Item {
    /// Create an item that never expires
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            expires: None,
        }
    }

    /// Create an item carrying only a key (used by delete events)
    pub fn key_only(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    /// Set the expiry
    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    /// The lease for this item
    pub fn lease(&self) -> Lease {
        Lease {
            key: self.key.clone(),
            expires: self.expires,
        }
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Item")
            .field("key", &KeyDisplay(&self.key))
            .field("value_len", &self.value.len())
            .field("expires", &self.expires)
            .finish()
    }
}

/// Liveness rule shared by every backend: no expiry, or an expiry in the future
#[inline]
pub fn is_live(expires: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match expires {
        None => true,
        Some(at) => at > now,
    }
}

/// Capability returned by successful writes, used to extend the expiry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Key of the leased item
    #[serde(with = "byte_string")]
    pub key: Bytes,
    /// Expiry at the time of the write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
}

/// Result of a range read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetResult {
    /// Live items in ascending key order
    pub items: Vec<Item>,
}

/// Kind of a watch event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The watcher is synced; every later event is a live change
    Init,
    /// The item was created or modified
    Put,
    /// The item was deleted; only the key is set
    Delete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Put => write!(f, "put"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// A committed mutation observed through a watcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event kind
    pub kind: EventKind,
    /// Affected item
    pub item: Item,
}

impl Event {
    /// The synced marker
    pub fn init() -> Self {
        Self {
            kind: EventKind::Init,
            item: Item::default(),
        }
    }

    /// A put event
    pub fn put(item: Item) -> Self {
        Self {
            kind: EventKind::Put,
            item,
        }
    }

    /// A delete event
    pub fn delete(key: impl Into<Bytes>) -> Self {
        Self {
            kind: EventKind::Delete,
            item: Item::key_only(key),
        }
    }
}

/// Inclusive key range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    /// First key, inclusive
    #[serde(with = "byte_string")]
    pub start: Bytes,
    /// Last key, inclusive
    #[serde(with = "byte_string")]
    pub end: Bytes,
}

impl KeyRange {
    /// Create an inclusive range
    pub fn new(start: impl Into<Bytes>, end: impl Into<Bytes>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Whether `key` falls within the range
    #[inline]
    pub fn contains(&self, key: &[u8]) -> bool {
        &self.start[..] <= key && key <= &self.end[..]
    }
}

/// Subscription parameters for a watcher
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watch {
    /// Name used in logs and errors
    #[serde(default)]
    pub name: String,
    /// Key prefixes to match
    #[serde(with = "byte_strings", default)]
    pub prefixes: Vec<Bytes>,
    /// Key range to match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<KeyRange>,
}

impl Watch {
    /// Watch every key
    pub fn all(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a prefix filter
    pub fn with_prefix(mut self, prefix: impl Into<Bytes>) -> Self {
        self.prefixes.push(prefix.into());
        self
    }

    /// Set a range filter
    pub fn with_range(mut self, range: KeyRange) -> Self {
        self.range = Some(range);
        self
    }

    /// Whether the watch has no filter at all
    pub fn matches_all(&self) -> bool {
        self.prefixes.is_empty() && self.range.is_none()
    }

    /// Whether `key` passes the filter
    pub fn matches(&self, key: &[u8]) -> bool {
        if self.matches_all() {
            return true;
        }
        self.prefixes.iter().any(|p| key.starts_with(p))
            || self.range.as_ref().is_some_and(|r| r.contains(key))
    }
}

/// Renders a key as text when printable, hex otherwise
pub struct KeyDisplay<'a>(pub &'a [u8]);

impl fmt::Debug for KeyDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for KeyDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(self.0) {
            Ok(s) if !s.chars().any(char::is_control) => write!(f, "{:?}", s),
            _ => {
                write!(f, "0x")?;
                for b in self.0 {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_liveness() {
        let now = Utc::now();
        assert!(is_live(None, now));
        assert!(is_live(Some(now + Duration::seconds(1)), now));
        assert!(!is_live(Some(now), now));
        assert!(!is_live(Some(now - Duration::seconds(1)), now));
    }

    #[test]
    fn test_lease_from_item() {
        let expires = Utc::now();
        let item = Item::new("a", "1").with_expires(expires);
        let lease = item.lease();
        assert_eq!(lease.key, Bytes::from_static(b"a"));
        assert_eq!(lease.expires, Some(expires));
    }

    #[test]
    fn test_watch_filters() {
        let watch = Watch::all("all");
        assert!(watch.matches(b"anything"));

        let watch = Watch::all("nodes").with_prefix("/nodes/");
        assert!(watch.matches(b"/nodes/a"));
        assert!(!watch.matches(b"/roles/a"));

        let watch = Watch::all("range").with_range(KeyRange::new("b", "d"));
        assert!(watch.matches(b"b"));
        assert!(watch.matches(b"c/deep"));
        assert!(watch.matches(b"d"));
        assert!(!watch.matches(b"d0"));
        assert!(!watch.matches(b"a"));

        let watch = Watch::all("both")
            .with_prefix("/x/")
            .with_range(KeyRange::new("a", "b"));
        assert!(watch.matches(b"/x/1"));
        assert!(watch.matches(b"a1"));
        assert!(!watch.matches(b"c"));
    }

    #[test]
    fn test_key_display() {
        assert_eq!(KeyDisplay(b"/nodes/a").to_string(), "\"/nodes/a\"");
        assert_eq!(KeyDisplay(&[0xff, 0x00]).to_string(), "0xff00");
    }

    #[test]
    fn test_event_constructors() {
        assert_eq!(Event::init().kind, EventKind::Init);
        let ev = Event::delete("k");
        assert_eq!(ev.kind, EventKind::Delete);
        assert_eq!(ev.item.key, Bytes::from_static(b"k"));
        assert!(ev.item.value.is_empty());
        assert_eq!(ev.item.expires, None);
    }

    #[test]
    fn test_item_debug_hides_value() {
        let item = Item::new("k", "secret-value");
        let dbg = format!("{:?}", item);
        assert!(!dbg.contains("secret-value"));
        assert!(dbg.contains("value_len"));
    }
}
