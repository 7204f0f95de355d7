//! # tessera-testing
//!
//! Shared test support for Tessera backends. Not published.
//!
//! - [`compliance`]: checks every [`tessera_core::Backend`] must pass
//! - [`postgres`]: a PostgreSQL container with logical decoding and `wal2json`
//!
//! ```bash
//! cargo test -p tessera-pg
//! RUST_LOG=debug cargo test -p tessera-pg --test pg_backend_test -- --nocapture
//! ```
//!
//! The PostgreSQL tests use testcontainers and need Docker.

#![warn(missing_docs)]

pub mod compliance;
pub mod postgres;

pub use compliance::{key, next_event, run_all};
pub use postgres::TestPostgres;
