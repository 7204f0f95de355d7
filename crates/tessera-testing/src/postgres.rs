//! PostgreSQL container for backend tests
//!
//! The stock image does not ship the `wal2json` output plugin, so the container
//! installs it from the PGDG repository the image is built from before handing
//! over to the regular entrypoint with logical decoding enabled. Docker must be
//! running, and the container needs network access on first start.

use anyhow::{Context, Result};
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::time::sleep;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info};

/// Debian based tag; `PG_MAJOR` selects the matching plugin package
const IMAGE_TAG: &str = "16";

const USER: &str = "tessera";
const PASSWORD: &str = "tessera";

/// Database created with the container; backends are pointed elsewhere so
/// they create their own
pub const ADMIN_DATABASE: &str = "postgres";

const STARTUP: &str = "apt-get update -qq \
    && apt-get install -y -qq postgresql-$PG_MAJOR-wal2json > /dev/null \
    && exec docker-entrypoint.sh postgres \
        -c wal_level=logical \
        -c max_wal_senders=20 \
        -c max_replication_slots=20";

/// PostgreSQL container with `wal2json` and logical decoding
pub struct TestPostgres {
    #[allow(dead_code)]
    container: ContainerAsync<Postgres>,
    /// Host the mapped port is reachable on
    pub host: String,
    /// Mapped server port
    pub port: u16,
}

impl TestPostgres {
    /// Start the container and wait until it accepts queries
    pub async fn start() -> Result<Self> {
        info!("Starting PostgreSQL container with wal2json");
        let container = Postgres::default()
            .with_tag(IMAGE_TAG)
            .with_env_var("POSTGRES_USER", USER)
            .with_env_var("POSTGRES_PASSWORD", PASSWORD)
            .with_env_var("POSTGRES_DB", ADMIN_DATABASE)
            .with_cmd(["bash", "-c", STARTUP])
            .with_startup_timeout(Duration::from_secs(300))
            .start()
            .await
            .context("failed to start PostgreSQL container")?;

        let host = container.get_host().await?.to_string();
        let mut port = None;
        for i in 0..10u64 {
            match container.get_host_port_ipv4(5432).await {
                Ok(p) => {
                    port = Some(p);
                    break;
                }
                Err(e) => {
                    debug!(attempt = i + 1, error = %e, "Waiting for PostgreSQL port");
                    sleep(Duration::from_millis(100 * (i + 1))).await;
                }
            }
        }
        let port = port.context("PostgreSQL port not exposed after retries")?;

        let postgres = Self {
            container,
            host,
            port,
        };
        postgres.wait_until_ready().await?;
        Ok(postgres)
    }

    async fn wait_until_ready(&self) -> Result<()> {
        for i in 0..60 {
            match self.connect(ADMIN_DATABASE).await {
                Ok(client) => {
                    if client.simple_query("SELECT 1").await.is_ok() {
                        info!(attempts = i + 1, "PostgreSQL ready");
                        return Ok(());
                    }
                }
                Err(e) => debug!(attempt = i + 1, error = %e, "Waiting for PostgreSQL"),
            }
            sleep(Duration::from_millis(500)).await;
        }
        anyhow::bail!("PostgreSQL did not become ready in time")
    }

    /// Connection string for `database`, in `key=value` form
    pub fn connection_string(&self, database: &str) -> String {
        format!(
            "host={} port={} user={} password={} dbname={}",
            self.host, self.port, USER, PASSWORD, database
        )
    }

    /// Open a plain connection to `database`
    pub async fn connect(&self, database: &str) -> Result<Client> {
        let (client, connection) =
            tokio_postgres::connect(&self.connection_string(database), NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection error");
            }
        });
        Ok(client)
    }
}
