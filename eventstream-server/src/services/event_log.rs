use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use shared::models::Event;
use thiserror::Error;

/// Failures raised by an [`EventLog`].
#[derive(Debug, Error)]
pub enum EventLogError {
    /// The referenced event is not (or no longer) in the log. `current_id`
    /// is the channel head at the time of the lookup.
    #[error("no such event {last_id} (current id {current_id})")]
    EventDoesNotExist { last_id: u64, current_id: u64 },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("event payload could not be encoded: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type EventLogResult<T> = Result<T, EventLogError>;

/// Durable, per-channel, id-ordered append log.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Appends an event and returns it stamped with its id.
    async fn append(&self, channel: &str, event_type: &str, data: Value) -> EventLogResult<Event>;

    /// Reads up to `limit` events with an id greater than `last_id`.
    ///
    /// Returns an empty list when `last_id` is the current head and
    /// [`EventLogError::EventDoesNotExist`] when `last_id` cannot be resolved.
    async fn read_events(
        &self,
        channel: &str,
        last_id: u64,
        limit: usize,
    ) -> EventLogResult<Vec<Event>>;

    /// Id of the newest event in `channel`, `0` when nothing was appended.
    async fn current_id(&self, channel: &str) -> EventLogResult<u64>;

    /// Readiness probe for the backing store.
    async fn ping(&self) -> EventLogResult<()> {
        Ok(())
    }
}

pub type SharedEventLog = Arc<dyn EventLog>;
