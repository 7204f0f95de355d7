//! Schema migrations
//!
//! Schemas are applied in order, each in the same transaction that records
//! its version, so concurrent backends starting against an empty database
//! serialize on the version table and only one of them migrates.

use std::sync::Arc;
use tessera_core::{Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::pool::{quote_identifier, PgPool};
use crate::retry::{retry_idempotent, storage_error, RetryPolicy};

/// Name of the version table used by the key-value schema
pub const VERSION_TABLE: &str = "backend_version";

/// Schemas of the key-value table, in application order
pub const SCHEMAS: &[&str] = &[
    "CREATE TABLE kv (
        key bytea NOT NULL,
        value bytea NOT NULL,
        expires timestamptz,
        revision uuid NOT NULL,
        CONSTRAINT kv_pkey PRIMARY KEY (key)
    );
    CREATE INDEX kv_expires_idx ON kv (expires) WHERE expires IS NOT NULL;",
    "ALTER TABLE kv REPLICA IDENTITY FULL;
    CREATE PUBLICATION kv_pub FOR TABLE kv;",
];

/// Outcome of [`setup_and_migrate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    /// Version found in the database
    pub previous_version: i32,
    /// Version after migrating
    pub current_version: i32,
}

/// Create the version table if needed and apply missing schemas
///
/// Fails with `BadParameter` when the database carries a version newer than
/// `schemas` knows about.
pub async fn setup_and_migrate(
    pool: &Arc<PgPool>,
    token: &CancellationToken,
    policy: &RetryPolicy,
    version_table: &str,
    schemas: &[&str],
) -> Result<Migration> {
    let table = quote_identifier(version_table);
    let target = i32::try_from(schemas.len())
        .map_err(|_| Error::bad_parameter("too many schemas"))?;

    let create_table = format!(
        "CREATE TABLE IF NOT EXISTS {} (
            version integer PRIMARY KEY CHECK (version > 0),
            created timestamptz NOT NULL DEFAULT now()
        )",
        table
    );
    // the user may lack CREATE, in which case the table has to exist already
    if let Err(e) = retry_idempotent(token, policy, || async {
        let conn = pool.get().await?;
        conn.batch_execute(&create_table)
            .await
            .map_err(|e| storage_error("failed to create version table", e))
    })
    .await
    {
        debug!(error = %e, "Failed to create version table.");
    }

    let select_version = format!("SELECT COALESCE(max(version), 0) FROM {}", table);
    let insert_version = format!("INSERT INTO {} (version) VALUES ($1)", table);

    let migration = retry_idempotent(token, policy, || async {
        let mut conn = pool.get().await?;
        let tx = conn
            .build_transaction()
            .isolation_level(tokio_postgres::IsolationLevel::Serializable)
            .start()
            .await
            .map_err(|e| storage_error("failed to begin migration", e))?;

        let row = tx
            .query_one(select_version.as_str(), &[])
            .await
            .map_err(|e| storage_error("failed to read schema version", e))?;
        let version: i32 = row.get(0);

        if version > target {
            return Err(Error::bad_parameter(format!(
                "unsupported schema version {} (latest known is {})",
                version, target
            )));
        }
        if version == target {
            return Ok(Migration {
                previous_version: version,
                current_version: version,
            });
        }

        for (index, schema) in schemas.iter().enumerate().skip(version as usize) {
            tx.batch_execute(schema)
                .await
                .map_err(|e| storage_error(&format!("failed to apply schema {}", index + 1), e))?;
        }
        tx.execute(insert_version.as_str(), &[&target])
            .await
            .map_err(|e| storage_error("failed to record schema version", e))?;
        tx.commit()
            .await
            .map_err(|e| storage_error("failed to commit migration", e))?;

        Ok(Migration {
            previous_version: version,
            current_version: target,
        })
    })
    .await?;

    if migration.previous_version != migration.current_version {
        info!(
            previous_version = migration.previous_version,
            current_version = migration.current_version,
            "Migrated database schema."
        );
    }
    Ok(migration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schemas_define_kv_table_then_publication() {
        assert_eq!(SCHEMAS.len(), 2);
        assert!(SCHEMAS[0].contains("CREATE TABLE kv"));
        assert!(SCHEMAS[0].contains("kv_expires_idx"));
        assert!(SCHEMAS[1].contains("REPLICA IDENTITY FULL"));
    }
}
