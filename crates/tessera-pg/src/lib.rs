//! # tessera-pg
//!
//! PostgreSQL backend for the Tessera key-value store.
//!
//! Items live in a single `kv` table. Writes are serializable single-statement
//! transactions retried on conflicts, expired rows are swept in the background,
//! and watchers are fed from logical decoding through a temporary `wal2json`
//! replication slot.
//!
//! ## Server Requirements
//!
//! - `wal_level = logical` and the `wal2json` output plugin
//! - a role allowed to create replication slots, and to create the database
//!   and schema on first start (or an administrator who did it beforehand)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tessera_core::prelude::*;
//! use tessera_pg::{Config, PgBackend};
//!
//! let backend = PgBackend::new(Config::new("postgres://tessera@localhost/tessera")).await?;
//!
//! let mut watcher = backend.new_watcher(Watch::all("nodes").with_prefix("/nodes/")).await?;
//! assert_eq!(watcher.recv().await?.kind, EventKind::Init);
//!
//! backend.put(Item::new("/nodes/a", "v1")).await?;
//! let event = watcher.recv().await?;
//! assert_eq!(event.kind, EventKind::Put);
//!
//! backend.close().await?;
//! ```
//!
//! ## Configuration
//!
//! [`Config`] can be deserialized from a parameter map; see
//! [`Config::from_params`] and [`PgBackend::from_params`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod auth;
pub mod backend;
pub mod changefeed;
pub mod config;
pub mod expiry;
pub mod migrate;
pub mod pool;
pub mod retry;

pub use auth::{Authenticator, AzureTokenProvider, TokenProvider};
pub use backend::{is_backend_name, PgBackend, Revision, ALT_NAME, NAME};
pub use config::{redact_connection_string, AuthMode, Config};
pub use migrate::Migration;
pub use pool::{PoolConfig, PoolStats};
pub use retry::RetryPolicy;
