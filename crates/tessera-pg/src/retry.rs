//! Retry strategies for database operations
//!
//! Two strategies share one loop:
//! - [`retry`] for writes: retried only when the server certainly did not
//!   apply the statement (serialization conflicts, failures before sending)
//! - [`retry_idempotent`] for reads and sweeps: also retried when the outcome
//!   of an in-flight statement is unknown
//!
//! The first retry after a serialization conflict is instant. Every later
//! retry, conflict or not, waits one linear back-off step longer than the last.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tessera_core::{Error, Result};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Convert a driver error into a storage error, keeping the SQLSTATE
pub fn storage_error(context: &str, err: tokio_postgres::Error) -> Error {
    let (message, code) = match err.as_db_error() {
        Some(db) => (
            format!("{}: {}", context, db.message()),
            Some(db.code().code().to_string()),
        ),
        None => (format!("{}: {}", context, err), None),
    };
    Error::storage_with_code(message, code, err)
}

/// Linear back-off with half jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts in total, the first one included
    pub max_attempts: u32,
    /// Delay before the first back-off step
    pub first: Duration,
    /// Added per back-off step
    pub step: Duration,
    /// Delay cap
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            first: Duration::ZERO,
            step: Duration::from_millis(100),
            max: Duration::from_millis(750),
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay after `steps` back-off increments
    pub fn base_delay(&self, steps: u32) -> Duration {
        self.first.saturating_add(self.step.saturating_mul(steps)).min(self.max)
    }

    /// Delay after `steps` increments, jittered into `[d/2, d)`
    pub fn delay(&self, steps: u32) -> Duration {
        half_jitter(self.base_delay(steps))
    }
}

fn half_jitter(d: Duration) -> Duration {
    let half = d / 2;
    if half.is_zero() {
        return d;
    }
    half + rand::thread_rng().gen_range(Duration::ZERO..half)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// Lost a race with a concurrent transaction
    Conflict,
    /// Nothing reached the server
    Unsent,
    /// The statement may or may not have been applied
    Unknown,
    /// Retrying cannot help
    Fatal,
}

fn classify(err: &Error) -> Disposition {
    if err.is_conflict() {
        Disposition::Conflict
    } else if err.is_retriable() {
        Disposition::Unsent
    } else if matches!(err, Error::Storage { code: None, .. }) {
        Disposition::Unknown
    } else {
        Disposition::Fatal
    }
}

/// Run a non-idempotent operation, retrying only when it was not applied
pub async fn retry<T, F, Fut>(token: &CancellationToken, policy: &RetryPolicy, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    run(token, policy, false, op).await
}

/// Run an idempotent operation, also retrying when its outcome is unknown
pub async fn retry_idempotent<T, F, Fut>(
    token: &CancellationToken,
    policy: &RetryPolicy,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    run(token, policy, true, op).await
}

async fn run<T, F, Fut>(
    token: &CancellationToken,
    policy: &RetryPolicy,
    idempotent: bool,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut steps: u32 = 0;
    let mut conflicts: u32 = 0;
    let mut attempt: u32 = 1;
    loop {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Canceled),
            result = op() => result,
        };
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let delay = match classify(&err) {
            Disposition::Conflict => {
                debug!(attempt, error = %err, "Operation failed due to conflicts, retrying.");
                conflicts += 1;
                if conflicts == 1 {
                    Duration::ZERO
                } else {
                    steps += 1;
                    policy.delay(steps)
                }
            }
            Disposition::Unsent => {
                debug!(attempt, error = %err, "Operation failed, retrying.");
                steps += 1;
                policy.delay(steps)
            }
            Disposition::Unknown if idempotent => {
                debug!(attempt, error = %err, "Operation failed, retrying.");
                steps += 1;
                policy.delay(steps)
            }
            Disposition::Unknown | Disposition::Fatal => return Err(err),
        };

        if attempt >= policy.max_attempts {
            return Err(Error::RetriesExhausted {
                attempts: attempt,
                source: Box::new(err),
            });
        }
        attempt += 1;

        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Canceled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
