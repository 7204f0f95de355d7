//! Change feed over logical decoding
//!
//! A dedicated connection creates a temporary `wal2json` replication slot and
//! polls it with `pg_logical_slot_get_changes`. Rows are decoded server side
//! into plain columns, turned into watch events and published to the
//! [`WatchBuffer`] in commit order.
//!
//! The slot lives as long as the connection. When the stream fails, every
//! watcher is closed, since changes between the old slot and the new one are
//! lost, and the feed starts over with a new slot after a fixed delay.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tessera_core::{Error, Event, Item, KeyDisplay, Result, WatchBuffer};
use tokio_postgres::{Client, Row};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};
use uuid::Uuid;

use crate::backend::Revision;
use crate::pool::PgConnectionFactory;
use crate::retry::storage_error;

/// `application_name` of the change feed session
pub const APPLICATION_NAME: &str = "tessera change feed";

/// Delay before a lost stream is restarted
pub const RESTART_DELAY: Duration = Duration::from_secs(5);

const POLL_SQL: &str = r#"
WITH d AS (
    SELECT data::jsonb AS data
    FROM pg_logical_slot_get_changes($1, NULL, $2,
        'format-version', '2',
        'add-tables', 'public.kv',
        'include-transaction', 'false')
)
SELECT
    d.data->>'action' AS action,
    decode(jsonb_path_query_first(d.data, '$.columns[*]?(@.name == "key")')->>'value', 'hex') AS key,
    NULLIF(
        decode(jsonb_path_query_first(d.data, '$.identity[*]?(@.name == "key")')->>'value', 'hex'),
        decode(jsonb_path_query_first(d.data, '$.columns[*]?(@.name == "key")')->>'value', 'hex')
    ) AS old_key,
    decode(COALESCE(
        jsonb_path_query_first(d.data, '$.columns[*]?(@.name == "value")'),
        jsonb_path_query_first(d.data, '$.identity[*]?(@.name == "value")')
    )->>'value', 'hex') AS value,
    (COALESCE(
        jsonb_path_query_first(d.data, '$.columns[*]?(@.name == "expires")'),
        jsonb_path_query_first(d.data, '$.identity[*]?(@.name == "expires")')
    )->>'value')::timestamptz AS expires,
    (COALESCE(
        jsonb_path_query_first(d.data, '$.columns[*]?(@.name == "revision")'),
        jsonb_path_query_first(d.data, '$.identity[*]?(@.name == "revision")')
    )->>'value')::uuid AS revision
FROM d
"#;

/// One decoded logical decoding message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeRow {
    /// wal2json action: `I`, `U`, `D`, `T`, `M`, `B` or `C`
    pub action: String,
    /// New key, absent for deletes
    pub key: Option<Bytes>,
    /// Previous key, only set when it differs from the new key
    pub old_key: Option<Bytes>,
    /// New value, or the old one for deletes
    pub value: Option<Bytes>,
    /// Expiry of the row
    pub expires: Option<DateTime<Utc>>,
    /// Revision of the row
    pub revision: Option<Revision>,
}

impl ChangeRow {
    /// Decode a row returned by the poll query
    pub fn from_row(row: &Row) -> Result<Self> {
        let decode = |e| storage_error("failed to decode change feed row", e);
        Ok(Self {
            action: row
                .try_get::<_, Option<String>>("action")
                .map_err(decode)?
                .unwrap_or_default(),
            key: row
                .try_get::<_, Option<Vec<u8>>>("key")
                .map_err(decode)?
                .map(Bytes::from),
            old_key: row
                .try_get::<_, Option<Vec<u8>>>("old_key")
                .map_err(decode)?
                .map(Bytes::from),
            value: row
                .try_get::<_, Option<Vec<u8>>>("value")
                .map_err(decode)?
                .map(Bytes::from),
            expires: row.try_get("expires").map_err(decode)?,
            revision: row
                .try_get::<_, Option<Uuid>>("revision")
                .map_err(decode)?
                .map(Revision::from),
        })
    }

    /// Events this message stands for, in order
    ///
    /// Truncation and unknown actions are errors: the feed cannot describe
    /// them as per-key events and has to restart.
    pub fn into_events(self) -> Result<Vec<Event>> {
        trace!(action = %self.action, revision = ?self.revision, "Received change.");
        match self.action.as_str() {
            "I" => Ok(vec![self.put_event()?]),
            "U" => {
                let mut events = Vec::with_capacity(2);
                // old_key is only set when the update changed the key
                if let Some(old_key) = self.old_key.clone() {
                    events.push(Event::delete(old_key));
                }
                events.push(self.put_event()?);
                Ok(events)
            }
            "D" => {
                let old_key = self
                    .old_key
                    .ok_or_else(|| Error::internal("delete message without old key"))?;
                Ok(vec![Event::delete(old_key)])
            }
            "M" => {
                debug!("Received WAL message.");
                Ok(Vec::new())
            }
            "B" | "C" => {
                debug!("Received transaction message in change feed (should not happen).");
                Ok(Vec::new())
            }
            "T" => Err(Error::internal(
                "received truncate WAL message, can't continue",
            )),
            other => Err(Error::internal(format!(
                "received unknown WAL message {:?}",
                other
            ))),
        }
    }

    fn put_event(&self) -> Result<Event> {
        let key = self
            .key
            .clone()
            .ok_or_else(|| Error::internal(format!("{} message without key", self.action)))?;
        let value = self.value.clone().ok_or_else(|| {
            Error::internal(format!("{} message for {} without value", self.action, KeyDisplay(&key)))
        })?;
        Ok(Event::put(Item {
            key,
            value,
            expires: self.expires,
        }))
    }
}

/// Change feed reader task
pub(crate) struct ChangeFeed {
    pub factory: Arc<PgConnectionFactory>,
    pub buf: Arc<WatchBuffer>,
    pub token: CancellationToken,
    pub poll_interval: Duration,
    pub batch_size: i64,
}

impl ChangeFeed {
    /// Keep a stream running until cancelled
    pub async fn run(self) {
        loop {
            info!("Starting change feed stream.");
            let result = self.stream().await;
            if self.token.is_cancelled() {
                break;
            }
            if let Err(e) = result {
                error!(error = %e, "Change feed stream lost.");
            }
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(RESTART_DELAY) => {}
            }
        }
        info!("Exited change feed loop.");
    }

    async fn stream(&self) -> Result<()> {
        let mut config = self.factory.config().clone();
        config.application_name(APPLICATION_NAME);
        let client = self.factory.connect_with(config).await?;

        if let Err(e) = client.batch_execute("SET log_min_messages TO fatal").await {
            debug!(error = %e, "Failed to silence log messages for change feed session.");
        }

        let slot_name = hex::encode(Uuid::new_v4().as_bytes());
        client
            .execute(
                "SELECT * FROM pg_create_logical_replication_slot($1, 'wal2json', true)",
                &[&slot_name],
            )
            .await
            .map_err(|e| storage_error("failed to create replication slot", e))?;
        info!(slot_name = %slot_name, "Change feed started.");

        self.buf.set_init();
        let result = self.poll_loop(&client, &slot_name).await;
        self.buf.reset();
        result
    }

    async fn poll_loop(&self, client: &Client, slot_name: &str) -> Result<()> {
        let batch_size = i32::try_from(self.batch_size).unwrap_or(i32::MAX);
        loop {
            let messages = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Ok(()),
                polled = self.poll(client, slot_name, batch_size) => polled?,
            };
            // keep draining while the slot hands out full batches
            if messages >= batch_size as usize {
                continue;
            }
            tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn poll(&self, client: &Client, slot_name: &str, batch_size: i32) -> Result<usize> {
        let start = Instant::now();
        let rows = client
            .query(POLL_SQL, &[&slot_name, &batch_size])
            .await
            .map_err(|e| storage_error("failed to poll change feed", e))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in &rows {
            events.extend(ChangeRow::from_row(row)?.into_events()?);
        }
        let messages = rows.len();
        if messages > 0 {
            debug!(
                messages,
                events = events.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Fetched change feed events."
            );
        }
        self.buf.emit(events);
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::EventKind;

    fn row(action: &str) -> ChangeRow {
        ChangeRow {
            action: action.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_insert_is_put() {
        let expires = Utc::now();
        let events = ChangeRow {
            key: Some(Bytes::from_static(b"/a")),
            value: Some(Bytes::from_static(b"1")),
            expires: Some(expires),
            revision: Some(Revision::new()),
            ..row("I")
        }
        .into_events()
        .unwrap();
        assert_eq!(
            events,
            vec![Event::put(Item::new("/a", "1").with_expires(expires))]
        );
    }

    #[test]
    fn test_update_in_place_is_put() {
        let events = ChangeRow {
            key: Some(Bytes::from_static(b"/a")),
            value: Some(Bytes::from_static(b"2")),
            ..row("U")
        }
        .into_events()
        .unwrap();
        assert_eq!(events, vec![Event::put(Item::new("/a", "2"))]);
    }

    #[test]
    fn test_update_with_key_change_deletes_old_key_first() {
        let events = ChangeRow {
            key: Some(Bytes::from_static(b"/b")),
            old_key: Some(Bytes::from_static(b"/a")),
            value: Some(Bytes::from_static(b"v")),
            ..row("U")
        }
        .into_events()
        .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], Event::delete("/a"));
        assert_eq!(events[1].kind, EventKind::Put);
        assert_eq!(events[1].item.key, Bytes::from_static(b"/b"));
    }

    #[test]
    fn test_delete_uses_old_key() {
        let events = ChangeRow {
            old_key: Some(Bytes::from_static(b"/a")),
            value: Some(Bytes::from_static(b"old")),
            ..row("D")
        }
        .into_events()
        .unwrap();
        assert_eq!(events, vec![Event::delete("/a")]);
    }

    #[test]
    fn test_messages_and_transactions_are_ignored() {
        for action in ["M", "B", "C"] {
            assert!(row(action).into_events().unwrap().is_empty(), "{action}");
        }
    }

    #[test]
    fn test_truncate_and_unknown_are_errors() {
        assert!(row("T").into_events().unwrap_err().to_string().contains("truncate"));
        assert!(row("X").into_events().is_err());
    }

    #[test]
    fn test_put_without_key_is_error() {
        assert!(row("I").into_events().is_err());
        let missing_value = ChangeRow {
            key: Some(Bytes::from_static(b"/a")),
            ..row("I")
        };
        assert!(missing_value.into_events().is_err());
    }
}
