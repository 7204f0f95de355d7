//! Connection pool for the PostgreSQL backend
//!
//! Connection pooling with:
//! - Semaphore-bounded size and acquire timeout
//! - LIFO idle list with lifetime and idle recycling
//! - Per-connect authentication and runtime parameters
//! - Statistics
//!
//! # Example
//!
//! ```rust,ignore
//! let factory = Arc::new(PgConnectionFactory::new(&config.conn_string, Authenticator::Static)?);
//! let pool = PgPool::new(PoolConfig::default(), factory);
//!
//! let conn = pool.get().await?;
//! conn.execute("SELECT 1", &[]).await?;
//! // Connection is returned to the pool when dropped
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_core::{Error, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_postgres::error::SqlState;
use tokio_postgres::Client;
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, info, warn};

use crate::auth::Authenticator;

const ISOLATION_PARAM: &str = "default_transaction_isolation";

/// Opens new server connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a connection with the factory's defaults
    async fn connect(&self) -> Result<Client>;
}

/// Connection factory for PostgreSQL
///
/// Every connection runs with `default_transaction_isolation = serializable`
/// and gets fresh credentials from the [`Authenticator`].
#[derive(Clone)]
pub struct PgConnectionFactory {
    config: tokio_postgres::Config,
    auth: Authenticator,
    tls: MakeRustlsConnect,
}

impl std::fmt::Debug for PgConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnectionFactory")
            .field("hosts", &self.config.get_hosts())
            .field("dbname", &self.config.get_dbname())
            .field("user", &self.config.get_user())
            .field("auth", &self.auth)
            .finish()
    }
}

impl PgConnectionFactory {
    /// Parse `conn_string` and prepare the connection defaults
    pub fn new(conn_string: &str, auth: Authenticator) -> Result<Self> {
        let mut config: tokio_postgres::Config = conn_string
            .parse()
            .map_err(|e| Error::bad_parameter(format!("invalid connection string: {}", e)))?;

        let options = config.get_options().unwrap_or_default().to_string();
        if options.contains(ISOLATION_PARAM) {
            tracing::error!(
                "The {} runtime parameter should not be overridden, the backend relies on serializable transactions.",
                ISOLATION_PARAM
            );
        } else {
            let options = format!("{} -c {}=serializable", options, ISOLATION_PARAM);
            config.options(options.trim_start());
        }

        Ok(Self {
            config,
            auth,
            tls: make_tls_connector()?,
        })
    }

    /// Connection defaults shared by every connection
    pub fn config(&self) -> &tokio_postgres::Config {
        &self.config
    }

    /// Open a connection with a modified copy of the defaults
    pub async fn connect_with(&self, mut config: tokio_postgres::Config) -> Result<Client> {
        self.auth.apply(&mut config).await?;
        let (client, connection) = config
            .connect(self.tls.clone())
            .await
            .map_err(|e| Error::connection_with_source(format!("failed to connect: {}", e), e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "Connection closed with error");
            }
        });

        Ok(client)
    }
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self) -> Result<Client> {
        self.connect_with(self.config.clone()).await
    }
}

/// TLS connector used when the connection string asks for TLS
///
/// `sslmode=disable` skips TLS entirely, `prefer` (the default) falls back to
/// plain TCP when the server does not offer it.
fn make_tls_connector() -> Result<MakeRustlsConnect> {
    let root_store = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::internal(format!("failed to configure TLS: {}", e)))?
    .with_root_certificates(root_store)
    .with_no_client_auth();
    Ok(MakeRustlsConnect::new(tls_config))
}

/// Make sure the database named in the connection string exists
///
/// Connects to the `postgres` maintenance database and issues `CREATE
/// DATABASE`. Failures are logged and otherwise ignored: the database usually
/// exists already, or the user lacks the privilege and an administrator
/// created it.
pub async fn try_ensure_database(factory: &PgConnectionFactory) {
    let Some(dbname) = factory.config().get_dbname().map(str::to_string) else {
        return;
    };
    let mut config = factory.config().clone();
    config.dbname("postgres");

    let client = match factory.connect_with(config).await {
        Ok(client) => client,
        Err(e) => {
            debug!(error = %e, "Failed to connect to the \"postgres\" database.");
            return;
        }
    };

    let sql = format!("CREATE DATABASE {}", quote_identifier(&dbname));
    match client.batch_execute(&sql).await {
        Ok(()) => info!(database = %dbname, "Created database."),
        Err(e) if e.code() == Some(&SqlState::DUPLICATE_DATABASE) => {}
        Err(e) => debug!(database = %dbname, error = %e, "Failed to create database."),
    }
}

/// Quote an identifier for interpolation into SQL
pub fn quote_identifier(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum pool size
    pub max_size: usize,
    /// Maximum time to wait for a connection
    pub acquire_timeout: Duration,
    /// Maximum connection lifetime (for recycling)
    pub max_lifetime: Duration,
    /// Idle timeout (connections idle longer are closed)
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            max_size: cpus.max(4),
            acquire_timeout: crate::config::DEFAULT_POOL_ACQUIRE_TIMEOUT,
            max_lifetime: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(1800),
        }
    }
}

impl PoolConfig {
    /// Set maximum pool size
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size.max(1);
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of connections created
    pub connections_created: u64,
    /// Total number of connections closed
    pub connections_closed: u64,
    /// Total number of connection acquisitions
    pub acquisitions: u64,
    /// Number of times acquisition timed out
    pub exhausted_count: u64,
    /// Total wait time for connections (in milliseconds)
    pub total_wait_time_ms: u64,
}

/// Atomic pool stats for concurrent updates
#[derive(Debug, Default)]
struct AtomicPoolStats {
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    acquisitions: AtomicU64,
    exhausted_count: AtomicU64,
    total_wait_time_ms: AtomicU64,
}

impl AtomicPoolStats {
    fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_acquisition(&self, wait_time_ms: u64) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
    }

    fn record_exhausted(&self) {
        self.exhausted_count.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            exhausted_count: self.exhausted_count.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
        }
    }
}

/// Idle connection with metadata
struct PoolEntry {
    client: Client,
    created_at: Instant,
    last_used: Instant,
}

/// Semaphore-bounded pool of PostgreSQL clients
pub struct PgPool {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    /// Idle connections (LIFO)
    idle: Mutex<Vec<PoolEntry>>,
    semaphore: Arc<Semaphore>,
    total_connections: AtomicUsize,
    stats: AtomicPoolStats,
    shutdown: AtomicBool,
}

impl PgPool {
    /// Create an empty pool; connections are opened on demand
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            idle: Mutex::new(Vec::with_capacity(config.max_size)),
            config,
            factory,
            total_connections: AtomicUsize::new(0),
            stats: AtomicPoolStats::default(),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Borrow a connection, opening one if none is idle
    pub async fn get(self: &Arc<Self>) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(Error::closed("connection pool is closed"));
        }

        let start = Instant::now();
        let permit = tokio::time::timeout(
            self.config.acquire_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| {
            self.stats.record_exhausted();
            Error::timeout(format!(
                "timed out waiting for a connection ({}ms)",
                self.config.acquire_timeout.as_millis()
            ))
        })?
        .map_err(|_| Error::closed("connection pool is closed"))?;

        let entry = match self.pop_idle() {
            Some(entry) => entry,
            None => {
                let client = self.factory.connect().await?;
                self.total_connections.fetch_add(1, Ordering::AcqRel);
                self.stats.record_created();
                PoolEntry {
                    client,
                    created_at: Instant::now(),
                    last_used: Instant::now(),
                }
            }
        };

        self.stats
            .record_acquisition(start.elapsed().as_millis() as u64);

        Ok(PooledConnection {
            entry: Some(entry),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Pop the most recently used healthy idle connection
    fn pop_idle(&self) -> Option<PoolEntry> {
        let mut idle = self.idle.lock();
        while let Some(entry) = idle.pop() {
            if self.should_recycle(&entry) {
                self.discard();
                continue;
            }
            return Some(entry);
        }
        None
    }

    fn should_recycle(&self, entry: &PoolEntry) -> bool {
        entry.client.is_closed()
            || entry.created_at.elapsed() > self.config.max_lifetime
            || entry.last_used.elapsed() > self.config.idle_timeout
    }

    fn discard(&self) {
        self.total_connections.fetch_sub(1, Ordering::AcqRel);
        self.stats.record_closed();
    }

    fn release(&self, mut entry: PoolEntry) {
        if self.is_closed() || entry.client.is_closed() {
            self.discard();
            return;
        }
        entry.last_used = Instant::now();
        self.idle.lock().push(entry);
    }

    /// Number of open connections, idle or in use
    pub fn size(&self) -> usize {
        self.total_connections.load(Ordering::Acquire)
    }

    /// Number of idle connections
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }

    /// Pool statistics
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Whether [`PgPool::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Drop idle connections and refuse new acquisitions
    ///
    /// Borrowed connections are closed when they are returned.
    pub fn close(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.semaphore.close();
        let drained: Vec<PoolEntry> = self.idle.lock().drain(..).collect();
        for _ in &drained {
            self.discard();
        }
        let in_use = self.size();
        if in_use > 0 {
            warn!(in_use, "Closing pool with connections still borrowed");
        }
        debug!(closed = drained.len(), "Connection pool closed");
    }
}

impl std::fmt::Debug for PgPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgPool")
            .field("config", &self.config)
            .field("size", &self.size())
            .field("idle", &self.idle())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A connection borrowed from the pool
///
/// Dereferences to [`tokio_postgres::Client`] and goes back to the pool on drop.
pub struct PooledConnection {
    /// Only `None` while being dropped
    entry: Option<PoolEntry>,
    pool: Arc<PgPool>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("PooledConnection");
        if let Some(entry) = &self.entry {
            dbg.field("age", &entry.created_at.elapsed())
                .field("closed", &entry.client.is_closed());
        }
        dbg.finish_non_exhaustive()
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = Client;

    fn deref(&self) -> &Client {
        &self
            .entry
            .as_ref()
            .expect("connection already returned")
            .client
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Client {
        &mut self
            .entry
            .as_mut()
            .expect("connection already returned")
            .client
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.pool.release(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Factory that never reaches a server
    struct FailingFactory;

    #[async_trait]
    impl ConnectionFactory for FailingFactory {
        async fn connect(&self) -> Result<Client> {
            Err(Error::connection("no server"))
        }
    }

    #[test]
    fn test_factory_forces_serializable() {
        let factory =
            PgConnectionFactory::new("postgres://u@localhost/db", Authenticator::Static).unwrap();
        assert_eq!(
            factory.config().get_options(),
            Some("-c default_transaction_isolation=serializable")
        );
    }

    #[test]
    fn test_factory_keeps_existing_options() {
        let factory = PgConnectionFactory::new(
            "host=localhost user=u options='-c statement_timeout=5s'",
            Authenticator::Static,
        )
        .unwrap();
        assert_eq!(
            factory.config().get_options(),
            Some("-c statement_timeout=5s -c default_transaction_isolation=serializable")
        );
    }

    #[test]
    fn test_factory_respects_override() {
        let factory = PgConnectionFactory::new(
            "host=localhost user=u options='-c default_transaction_isolation=serializable'",
            Authenticator::Static,
        )
        .unwrap();
        assert_eq!(
            factory.config().get_options(),
            Some("-c default_transaction_isolation=serializable")
        );
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("kv"), "\"kv\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[tokio::test]
    async fn test_connect_failure_releases_permit() {
        let pool = PgPool::new(
            PoolConfig::default().with_max_size(1),
            Arc::new(FailingFactory),
        );
        for _ in 0..3 {
            let err = pool.get().await.unwrap_err();
            assert_eq!(err.kind(), tessera_core::ErrorKind::Connection);
        }
        assert_eq!(pool.size(), 0);
        assert_eq!(pool.stats().acquisitions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_exhausted() {
        let pool = PgPool::new(
            PoolConfig::default()
                .with_max_size(1)
                .with_acquire_timeout(Duration::from_millis(50)),
            Arc::new(FailingFactory),
        );
        let _held = Arc::clone(&pool.semaphore).acquire_owned().await.unwrap();
        let err = pool.get().await.unwrap_err();
        assert_eq!(err.kind(), tessera_core::ErrorKind::Timeout);
        assert_eq!(pool.stats().exhausted_count, 1);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let pool = PgPool::new(PoolConfig::default(), Arc::new(FailingFactory));
        pool.close();
        assert!(pool.is_closed());
        let err = pool.get().await.unwrap_err();
        assert_eq!(err.kind(), tessera_core::ErrorKind::Closed);
    }
}
