//! Background deletion of expired rows
//!
//! Expired rows are already invisible to reads and writes; deleting them keeps
//! the table small and turns each expiry into a change feed delete.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_core::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::pool::PgPool;
use crate::retry::{retry_idempotent, storage_error, RetryPolicy};

/// Batches deleted per tick at most
pub const MAX_BATCHES_PER_TICK: usize = 20;

const DELETE_EXPIRED_SQL: &str = "DELETE FROM kv WHERE kv.key IN (
    SELECT kv.key FROM kv WHERE kv.expires IS NOT NULL AND kv.expires <= now() LIMIT $1
)";

/// Expiry sweeper task
pub(crate) struct Expiry {
    pub pool: Arc<PgPool>,
    pub token: CancellationToken,
    pub policy: RetryPolicy,
    pub interval: Duration,
    pub batch_size: i64,
}

impl Expiry {
    /// Sweep every interval until cancelled
    pub async fn run(self) {
        loop {
            let start = Instant::now();
            match self.sweep().await {
                Ok(deleted) if deleted > 0 => debug!(
                    deleted,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Deleted expired items."
                ),
                Ok(_) => {}
                Err(e) if self.token.is_cancelled() => {
                    debug!(error = %e, "Expiry sweep interrupted.");
                }
                Err(e) => error!(error = %e, "Failed to delete expired items."),
            }

            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("Exited expiry loop.");
    }

    /// Delete expired rows in batches, returning how many were deleted
    ///
    /// Stops early once a batch comes back short, since the backlog is then
    /// gone.
    pub async fn sweep(&self) -> Result<u64> {
        let mut total = 0;
        for _ in 0..MAX_BATCHES_PER_TICK {
            let deleted = retry_idempotent(&self.token, &self.policy, || async {
                let conn = self.pool.get().await?;
                conn.execute(DELETE_EXPIRED_SQL, &[&self.batch_size])
                    .await
                    .map_err(|e| storage_error("failed to delete expired items", e))
            })
            .await?;
            total += deleted;
            if deleted < self.batch_size as u64 {
                break;
            }
        }
        Ok(total)
    }
}
