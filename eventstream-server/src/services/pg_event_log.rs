use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::models::Event;
use sqlx::{PgPool, Row};
use tracing::{debug, info, trace, warn};

use super::{
    event_log::{EventLog, EventLogError, EventLogResult},
    memory_log::RetentionPolicy,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS eventstream_counters (
        channel TEXT PRIMARY KEY,
        current_id BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS eventstream_events (
        channel TEXT NOT NULL,
        event_id BIGINT NOT NULL,
        event_type TEXT NOT NULL,
        data JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (channel, event_id)
    )",
    "CREATE INDEX IF NOT EXISTS eventstream_events_created_at
        ON eventstream_events (created_at)",
];

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    channel: String,
    event_id: i64,
    event_type: String,
    data: Value,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Event::new(row.channel, row.event_type, row.data)
            .with_id(u64::try_from(row.event_id).unwrap_or_default())
    }
}

fn to_db_id(id: u64) -> i64 {
    i64::try_from(id).unwrap_or(i64::MAX)
}

fn to_db_count(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Postgres-backed [`EventLog`].
///
/// Ids are allocated from a per-channel counter row inside the same
/// transaction that stores the event, so concurrent appends on one channel
/// serialize on that row. Id 0 is stored as an empty placeholder with the
/// first event so that readers starting from the beginning resolve until
/// trimming removes it.
#[derive(Clone, Debug)]
pub struct PgEventLog {
    pool: PgPool,
    retention: RetentionPolicy,
}

impl PgEventLog {
    pub fn new(pool: PgPool, retention: RetentionPolicy) -> Self {
        Self { pool, retention }
    }

    /// Creates the tables used by the log when they do not exist yet.
    pub async fn ensure_schema(&self) -> EventLogResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("event log schema ready");
        Ok(())
    }

    /// Deletes at most `batch` rows created before `cutoff`.
    pub async fn trim_older_than(
        &self,
        cutoff: DateTime<Utc>,
        batch: usize,
    ) -> EventLogResult<u64> {
        let result = sqlx::query(
            "DELETE FROM eventstream_events WHERE (channel, event_id) IN (
                SELECT channel, event_id FROM eventstream_events
                WHERE created_at < $1
                ORDER BY created_at
                LIMIT $2
            )",
        )
        .bind(cutoff)
        .bind(to_db_count(batch.max(1)))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Runs retention after a committed append. The event is already stored,
    /// so a failure here is logged and never reported to the caller.
    async fn trim_quietly(&self, channel: &str, current_id: u64) {
        if let Err(err) = self.trim_after_append(channel, current_id).await {
            metrics::counter!("eventstream_trim_failures_total").increment(1);
            warn!(channel, error = %err, "trimming after append failed");
        }
    }

    async fn trim_after_append(&self, channel: &str, current_id: u64) -> EventLogResult<()> {
        if let Some(cap) = self.retention.max_events_per_channel {
            let floor = current_id.saturating_sub(cap as u64);
            if floor > 0 {
                sqlx::query("DELETE FROM eventstream_events WHERE channel = $1 AND event_id <= $2")
                    .bind(channel)
                    .bind(to_db_id(floor))
                    .execute(&self.pool)
                    .await?;
            }
        }

        if let Some(cutoff) = cutoff_for(self.retention.ttl) {
            let removed = self
                .trim_older_than(cutoff, self.retention.trim_batch)
                .await?;
            if removed > 0 {
                debug!(removed, "trimmed expired events");
            }
        }

        Ok(())
    }
}

fn cutoff_for(ttl: Duration) -> Option<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl).ok()?;
    Utc::now().checked_sub_signed(ttl)
}

#[async_trait]
impl EventLog for PgEventLog {
    async fn append(&self, channel: &str, event_type: &str, data: Value) -> EventLogResult<Event> {
        let mut tx = self.pool.begin().await?;

        let current_id: i64 = sqlx::query(
            "INSERT INTO eventstream_counters (channel, current_id) VALUES ($1, 1)
             ON CONFLICT (channel)
             DO UPDATE SET current_id = eventstream_counters.current_id + 1
             RETURNING current_id",
        )
        .bind(channel)
        .fetch_one(&mut *tx)
        .await?
        .try_get("current_id")?;

        if current_id == 1 {
            sqlx::query(
                "INSERT INTO eventstream_events (channel, event_id, event_type, data)
                 VALUES ($1, 0, '', 'null'::jsonb)
                 ON CONFLICT DO NOTHING",
            )
            .bind(channel)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            "INSERT INTO eventstream_events (channel, event_id, event_type, data)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(channel)
        .bind(current_id)
        .bind(event_type)
        .bind(&data)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let id = u64::try_from(current_id).unwrap_or_default();
        trace!(channel, id, "appended event");

        self.trim_quietly(channel, id).await;

        Ok(Event::new(channel, event_type, data).with_id(id))
    }

    async fn read_events(
        &self,
        channel: &str,
        last_id: u64,
        limit: usize,
    ) -> EventLogResult<Vec<Event>> {
        let current_id = self.current_id(channel).await?;
        if last_id == current_id {
            return Ok(Vec::new());
        }

        let referenced = sqlx::query(
            "SELECT 1 FROM eventstream_events WHERE channel = $1 AND event_id = $2",
        )
        .bind(channel)
        .bind(to_db_id(last_id))
        .fetch_optional(&self.pool)
        .await?;

        if referenced.is_none() {
            return Err(EventLogError::EventDoesNotExist {
                last_id,
                current_id,
            });
        }

        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT channel, event_id, event_type, data FROM eventstream_events
             WHERE channel = $1 AND event_id > $2
             ORDER BY event_id
             LIMIT $3",
        )
        .bind(channel)
        .bind(to_db_id(last_id))
        .bind(to_db_count(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Event::from).collect())
    }

    async fn current_id(&self, channel: &str) -> EventLogResult<u64> {
        let row = sqlx::query("SELECT current_id FROM eventstream_counters WHERE channel = $1")
            .bind(channel)
            .fetch_optional(&self.pool)
            .await?;

        let current_id = match row {
            Some(row) => row.try_get::<i64, _>("current_id")?,
            None => 0,
        };
        Ok(u64::try_from(current_id).unwrap_or_default())
    }

    async fn ping(&self) -> EventLogResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rows_convert_to_events() {
        let event: Event = EventRow {
            channel: "c".into(),
            event_id: 7,
            event_type: "message".into(),
            data: json!({"x": 1}),
        }
        .into();

        assert_eq!(event.id, Some(7));
        assert_eq!(event.event_type, "message");
    }

    #[test]
    fn ids_saturate_when_out_of_range() {
        assert_eq!(to_db_id(u64::MAX), i64::MAX);
        assert_eq!(to_db_count(3), 3);
    }

    #[test]
    fn zero_ttl_cutoff_is_now() {
        let cutoff = cutoff_for(Duration::ZERO).unwrap();
        assert!(cutoff <= Utc::now());
    }

    fn unreachable_log() -> PgEventLog {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy("postgres://eventstream@127.0.0.1:1/eventstream")
            .unwrap();
        PgEventLog::new(pool, RetentionPolicy::default())
    }

    #[tokio::test]
    async fn trim_failure_is_not_reported_to_the_appender() {
        let log = unreachable_log();

        assert!(log.trim_after_append("c", 5).await.is_err());
        tokio::time::timeout(Duration::from_secs(5), log.trim_quietly("c", 5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lazy_pool_builds_without_a_server() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/eventstream")
            .unwrap();
        let log = PgEventLog::new(pool, RetentionPolicy::default());
        assert!(log.retention.max_events_per_channel.is_none());
    }
}
