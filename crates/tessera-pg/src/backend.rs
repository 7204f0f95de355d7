//! PostgreSQL backend
//!
//! Every operation is a single statement in its own serializable transaction;
//! the isolation level is the connection default set by
//! [`PgConnectionFactory`]. Liveness is decided by the database clock through
//! `now()`, so rows expire consistently for every client of the database.
//!
//! Mutations are not published by the writer. The change feed task reads them
//! back from the write-ahead log and feeds the watch buffer, so watchers see
//! exactly what was committed, in commit order, whichever process wrote it.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tessera_core::{
    Backend, Clock, Error, GetResult, Item, KeyDisplay, Lease, Result, SystemClock, Watch,
    WatchBuffer, Watcher, DEFAULT_RANGE_LIMIT,
};
use tokio::task::JoinHandle;
use tokio_postgres::Row;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::changefeed::ChangeFeed;
use crate::config::Config;
use crate::expiry::Expiry;
use crate::migrate::{setup_and_migrate, SCHEMAS, VERSION_TABLE};
use crate::pool::{try_ensure_database, PgConnectionFactory, PgPool, PoolStats};
use crate::retry::{retry, retry_idempotent, storage_error, RetryPolicy};

/// Name of the backend
pub const NAME: &str = "postgresql";

/// Alternative name accepted for the backend
pub const ALT_NAME: &str = "postgres";

/// Whether `name` selects this backend
pub fn is_backend_name(name: &str) -> bool {
    name == NAME || name == ALT_NAME
}

/// Opaque version of a row, replaced on every mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Revision(Uuid);

impl Revision {
    /// A fresh random revision
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for Revision {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for Revision {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

const CREATE_SQL: &str = "INSERT INTO kv (key, value, expires, revision) VALUES ($1, $2, $3, $4)
    ON CONFLICT (key) DO UPDATE SET
        value = excluded.value, expires = excluded.expires, revision = excluded.revision
    WHERE kv.expires IS NOT NULL AND kv.expires <= now()";

const PUT_SQL: &str = "INSERT INTO kv (key, value, expires, revision) VALUES ($1, $2, $3, $4)
    ON CONFLICT (key) DO UPDATE SET
        value = excluded.value, expires = excluded.expires, revision = excluded.revision";

const UPDATE_SQL: &str = "UPDATE kv SET value = $2, expires = $3, revision = $4
    WHERE kv.key = $1 AND (kv.expires IS NULL OR kv.expires > now())";

const COMPARE_AND_SWAP_SQL: &str = "UPDATE kv SET value = $2, expires = $3, revision = $4
    WHERE kv.key = $1 AND kv.value = $5 AND (kv.expires IS NULL OR kv.expires > now())";

const GET_SQL: &str = "SELECT kv.value, kv.expires FROM kv
    WHERE kv.key = $1 AND (kv.expires IS NULL OR kv.expires > now())";

const GET_RANGE_SQL: &str = "SELECT kv.key, kv.value, kv.expires FROM kv
    WHERE kv.key BETWEEN $1 AND $2 AND (kv.expires IS NULL OR kv.expires > now())
    ORDER BY kv.key LIMIT $3";

const DELETE_SQL: &str =
    "DELETE FROM kv WHERE kv.key = $1 AND (kv.expires IS NULL OR kv.expires > now())";

const DELETE_RANGE_SQL: &str = "DELETE FROM kv WHERE kv.key BETWEEN $1 AND $2";

const KEEP_ALIVE_SQL: &str = "UPDATE kv SET expires = $2, revision = $3
    WHERE kv.key = $1 AND (kv.expires IS NULL OR kv.expires > now())";

/// Key-value backend on PostgreSQL with a logical decoding change feed
///
/// Requires the `wal2json` output plugin and `wal_level = logical` on the
/// server, and a role allowed to create replication slots.
pub struct PgBackend {
    config: Config,
    pool: Arc<PgPool>,
    factory: Arc<PgConnectionFactory>,
    buf: Arc<WatchBuffer>,
    token: CancellationToken,
    policy: RetryPolicy,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PgBackend {
    /// Connect, migrate the schema and start the background tasks
    pub async fn new(mut config: Config) -> Result<Self> {
        config.apply_defaults()?;
        let auth = Authenticator::for_mode(config.auth_mode)?;
        let factory = Arc::new(PgConnectionFactory::new(&config.conn_string, auth)?);

        info!(config = ?config, "Setting up backend.");
        try_ensure_database(&factory).await;

        let pool = PgPool::new(config.pool_config(), factory.clone());
        let token = CancellationToken::new();
        let policy = RetryPolicy::default();

        if let Err(e) = setup_and_migrate(&pool, &token, &policy, VERSION_TABLE, SCHEMAS).await {
            error!(error = %e, "Failed to set up the backend.");
            pool.close();
            return Err(e);
        }

        let backend = Self {
            buf: Arc::new(WatchBuffer::new(config.buffer_capacity())),
            config,
            pool,
            factory,
            token,
            policy,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };
        backend.start_background_tasks();
        Ok(backend)
    }

    /// Build the backend from a parameter map, see [`Config::from_params`]
    pub async fn from_params(params: serde_json::Value) -> Result<Self> {
        Self::new(Config::from_params(params)?).await
    }

    fn start_background_tasks(&self) {
        let mut tasks = self.tasks.lock();
        if !self.config.disable_expiry {
            let expiry = self.expiry();
            tasks.push(tokio::spawn(
                expiry
                    .run()
                    .instrument(info_span!("tessera_pg", component = "expiry")),
            ));
        }

        let feed = ChangeFeed {
            factory: Arc::clone(&self.factory),
            buf: Arc::clone(&self.buf),
            token: self.token.clone(),
            poll_interval: self.config.change_feed_poll_interval(),
            batch_size: self.config.change_feed_batch_size,
        };
        tasks.push(tokio::spawn(
            feed.run()
                .instrument(info_span!("tessera_pg", component = "change_feed")),
        ));
    }

    fn expiry(&self) -> Expiry {
        Expiry {
            pool: Arc::clone(&self.pool),
            token: self.token.clone(),
            policy: self.policy.clone(),
            interval: self.config.expiry_interval(),
            batch_size: self.config.expiry_batch_size,
        }
    }

    /// Delete expired rows now, returning how many were deleted
    ///
    /// The sweeper task does the same every expiry interval.
    pub async fn delete_expired(&self) -> Result<u64> {
        self.ensure_open()?;
        self.expiry().sweep().await
    }

    /// The effective configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Connection pool statistics
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Operations after [`Backend::close`] fail with a closed error
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::closed("backend is closed"));
        }
        Ok(())
    }

    async fn write(&self, sql: &'static str, item: &Item) -> Result<u64> {
        self.ensure_open()?;
        let revision = Revision::new();
        let key: &[u8] = &item.key;
        let value: &[u8] = &item.value;
        retry(&self.token, &self.policy, || async {
            let conn = self.pool.get().await?;
            conn.execute(sql, &[&key, &value, &item.expires, revision.as_uuid()])
                .await
                .map_err(|e| storage_error("failed to write item", e))
        })
        .await
    }
}

fn decode_item(key: Bytes, row: &Row, value_idx: usize) -> Result<Item> {
    let decode = |e| storage_error("failed to decode item", e);
    let value: Vec<u8> = row.try_get(value_idx).map_err(decode)?;
    let expires: Option<DateTime<Utc>> = row.try_get(value_idx + 1).map_err(decode)?;
    Ok(Item {
        key,
        value: Bytes::from(value),
        expires,
    })
}

fn not_found(key: &[u8]) -> Error {
    Error::not_found(format!("key {} does not exist", KeyDisplay(key)))
}

impl std::fmt::Debug for PgBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgBackend")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("buffer", &self.buf)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl Backend for PgBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn create(&self, item: Item) -> Result<Lease> {
        if self.write(CREATE_SQL, &item).await? == 0 {
            return Err(Error::already_exists(format!(
                "key {} already exists",
                KeyDisplay(&item.key)
            )));
        }
        Ok(item.lease())
    }

    async fn put(&self, item: Item) -> Result<Lease> {
        self.write(PUT_SQL, &item).await?;
        Ok(item.lease())
    }

    async fn update(&self, item: Item) -> Result<Lease> {
        if self.write(UPDATE_SQL, &item).await? == 0 {
            return Err(not_found(&item.key));
        }
        Ok(item.lease())
    }

    async fn compare_and_swap(&self, expected: Item, replace_with: Item) -> Result<Lease> {
        self.ensure_open()?;
        if expected.key != replace_with.key {
            return Err(Error::bad_parameter(
                "expected and replace_with keys should match",
            ));
        }

        let revision = Revision::new();
        let key: &[u8] = &replace_with.key;
        let value: &[u8] = &replace_with.value;
        let expected_value: &[u8] = &expected.value;
        let swapped = retry(&self.token, &self.policy, || async {
            let conn = self.pool.get().await?;
            conn.execute(
                COMPARE_AND_SWAP_SQL,
                &[
                    &key,
                    &value,
                    &replace_with.expires,
                    revision.as_uuid(),
                    &expected_value,
                ],
            )
            .await
            .map_err(|e| storage_error("failed to compare and swap", e))
        })
        .await?;

        if swapped == 0 {
            return Err(Error::compare_failed(format!(
                "key {} does not exist or does not match expected",
                KeyDisplay(key)
            )));
        }
        Ok(replace_with.lease())
    }

    async fn get(&self, key: &[u8]) -> Result<Item> {
        self.ensure_open()?;
        let row = retry_idempotent(&self.token, &self.policy, || async {
            let mut conn = self.pool.get().await?;
            let tx = conn
                .build_transaction()
                .read_only(true)
                .start()
                .await
                .map_err(|e| storage_error("failed to begin read", e))?;
            let row = tx
                .query_opt(GET_SQL, &[&key])
                .await
                .map_err(|e| storage_error("failed to get item", e))?;
            tx.commit()
                .await
                .map_err(|e| storage_error("failed to finish read", e))?;
            Ok(row)
        })
        .await?;

        match row {
            Some(row) => decode_item(Bytes::copy_from_slice(key), &row, 0),
            None => Err(not_found(key)),
        }
    }

    async fn get_range(&self, start: &[u8], end: &[u8], limit: usize) -> Result<GetResult> {
        self.ensure_open()?;
        let limit = if limit == 0 { DEFAULT_RANGE_LIMIT } else { limit };
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = retry_idempotent(&self.token, &self.policy, || async {
            let mut conn = self.pool.get().await?;
            let tx = conn
                .build_transaction()
                .read_only(true)
                .start()
                .await
                .map_err(|e| storage_error("failed to begin read", e))?;
            let rows = tx
                .query(GET_RANGE_SQL, &[&start, &end, &limit])
                .await
                .map_err(|e| storage_error("failed to get range", e))?;
            tx.commit()
                .await
                .map_err(|e| storage_error("failed to finish read", e))?;
            Ok(rows)
        })
        .await?;

        let items = rows
            .iter()
            .map(|row| {
                let key: Vec<u8> = row
                    .try_get(0)
                    .map_err(|e| storage_error("failed to decode item", e))?;
                decode_item(Bytes::from(key), row, 1)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(GetResult { items })
    }

    async fn delete(&self, key: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let deleted = retry(&self.token, &self.policy, || async {
            let conn = self.pool.get().await?;
            conn.execute(DELETE_SQL, &[&key])
                .await
                .map_err(|e| storage_error("failed to delete item", e))
        })
        .await?;

        if deleted == 0 {
            return Err(not_found(key));
        }
        Ok(())
    }

    async fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<()> {
        self.ensure_open()?;
        retry(&self.token, &self.policy, || async {
            let conn = self.pool.get().await?;
            conn.execute(DELETE_RANGE_SQL, &[&start, &end])
                .await
                .map_err(|e| storage_error("failed to delete range", e))
        })
        .await?;
        Ok(())
    }

    async fn keep_alive(&self, lease: &Lease, expires: Option<DateTime<Utc>>) -> Result<()> {
        self.ensure_open()?;
        let revision = Revision::new();
        let key: &[u8] = &lease.key;
        let updated = retry(&self.token, &self.policy, || async {
            let conn = self.pool.get().await?;
            conn.execute(KEEP_ALIVE_SQL, &[&key, &expires, revision.as_uuid()])
                .await
                .map_err(|e| storage_error("failed to keep item alive", e))
        })
        .await?;

        if updated == 0 {
            return Err(not_found(key));
        }
        Ok(())
    }

    async fn new_watcher(&self, watch: Watch) -> Result<Watcher> {
        self.ensure_open()?;
        self.buf.new_watcher(watch)
    }

    fn close_watchers(&self) {
        self.buf.clear();
    }

    fn clock(&self) -> Arc<dyn Clock> {
        Arc::new(SystemClock)
    }

    /// Stop the background tasks, close every watcher and the pool
    ///
    /// Calling it again is a no-op.
    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.token.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Background task failed.");
            }
        }

        self.buf.close();
        self.pool.close();
        info!("Closed backend.");
        Ok(())
    }
}

impl Drop for PgBackend {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_names() {
        assert!(is_backend_name("postgresql"));
        assert!(is_backend_name("postgres"));
        assert!(!is_backend_name("pg"));
        assert!(!is_backend_name("memory"));
    }

    #[test]
    fn test_revisions_are_unique() {
        let a = Revision::new();
        let b = Revision::new();
        assert_ne!(a, b);
        assert_eq!(Revision::from(*a.as_uuid()), a);
        assert_eq!(a.to_string().len(), 36);
    }

    /// A backend that never connected, with no background tasks
    fn unconnected() -> PgBackend {
        let mut config = Config::new("postgres://tessera@localhost/tessera");
        config.apply_defaults().unwrap();
        let factory = Arc::new(
            PgConnectionFactory::new(&config.conn_string, Authenticator::Static).unwrap(),
        );
        PgBackend {
            buf: Arc::new(WatchBuffer::new(config.buffer_capacity())),
            pool: PgPool::new(config.pool_config(), factory.clone()),
            config,
            factory,
            token: CancellationToken::new(),
            policy: RetryPolicy::default(),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    #[tokio::test]
    async fn test_operations_after_close_fail_closed() {
        let backend = unconnected();
        backend.close().await.unwrap();
        backend.close().await.unwrap();

        let item = Item::new("/k", "v");
        let lease = item.lease();
        let results = [
            backend.create(item.clone()).await.map(drop),
            backend.put(item.clone()).await.map(drop),
            backend.update(item.clone()).await.map(drop),
            backend
                .compare_and_swap(item.clone(), Item::new("/k", "w"))
                .await
                .map(drop),
            backend.get(b"/k").await.map(drop),
            backend.get_range(b"/a", b"/z", 0).await.map(drop),
            backend.delete(b"/k").await,
            backend.delete_range(b"/a", b"/z").await,
            backend.keep_alive(&lease, None).await,
            backend.new_watcher(Watch::all("late")).await.map(drop),
            backend.delete_expired().await.map(drop),
        ];
        for (i, result) in results.into_iter().enumerate() {
            let err = result.unwrap_err();
            assert_eq!(err.kind(), tessera_core::ErrorKind::Closed, "operation {i}: {err}");
        }
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_connecting() {
        let err = PgBackend::new(Config::default()).await.unwrap_err();
        assert!(err.is_bad_parameter());

        let err = PgBackend::from_params(serde_json::json!({
            "conn_string": "postgres://localhost/db",
            "expiry_batch_size": -1,
        }))
        .await
        .unwrap_err();
        assert!(err.is_bad_parameter());
    }
}
