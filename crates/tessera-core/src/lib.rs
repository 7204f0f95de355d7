//! # tessera-core
//!
//! Data model and backend contract for the Tessera key-value store.
//!
//! A backend stores byte-string keys and values with an optional expiry,
//! supports optimistic concurrency through compare-and-swap, and publishes
//! every committed mutation to watchers through a [`WatchBuffer`].
//!
//! ## Modules
//!
//! - [`item`]: items, leases, events and watch filters
//! - [`backend`]: the [`Backend`] trait
//! - [`watch`]: the in-memory event fan-out shared by backends
//! - [`memory`]: an embedded [`MemoryBackend`]
//!
//! ## Quick Start
//!
//! ```rust
//! use tessera_core::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> tessera_core::Result<()> {
//! let backend = MemoryBackend::new();
//! backend.create(Item::new("/nodes/a", "v1")).await?;
//! backend
//!     .compare_and_swap(Item::new("/nodes/a", "v1"), Item::new("/nodes/a", "v2"))
//!     .await?;
//!
//! let item = backend.get(b"/nodes/a").await?;
//! assert_eq!(&item.value[..], b"v2");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod backend;
pub mod clock;
pub mod error;
pub mod item;
pub mod memory;
pub mod serde_utils;
pub mod watch;

pub use backend::{range_end_for_prefix, Backend, BackendExt};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, ErrorKind, Result};
pub use item::{
    is_live, Event, EventKind, GetResult, Item, KeyDisplay, KeyRange, Lease, Watch,
    DEFAULT_BUFFER_CAPACITY, DEFAULT_POLL_STREAM_PERIOD, DEFAULT_RANGE_LIMIT,
};
pub use memory::MemoryBackend;
pub use watch::{WatchBuffer, Watcher};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::{Backend, BackendExt};
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::item::{Event, EventKind, GetResult, Item, KeyRange, Lease, Watch};
    pub use crate::memory::MemoryBackend;
    pub use crate::watch::{WatchBuffer, Watcher};
}
