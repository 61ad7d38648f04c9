use std::sync::Arc;

use serde_json::Value;
use shared::models::{Cursor, Event};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::auth::session::SessionUser;

use super::{
    channel_manager::ChannelManager,
    event_log::{EventLog, EventLogError, EventLogResult, SharedEventLog},
    listener_registry::ListenerRegistry,
};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("channel must not be empty")]
    EmptyChannel,
    #[error("event type must be a single non-empty line")]
    InvalidEventType,
    #[error(transparent)]
    Log(#[from] EventLogError),
}

/// Event types end up on the `event:` line of every stream that delivers
/// them, so they must be non-empty and free of line breaks.
pub fn validate_event_type(event_type: &str) -> Result<(), PublishError> {
    if event_type.trim().is_empty() || event_type.contains(['\n', '\r']) {
        return Err(PublishError::InvalidEventType);
    }
    Ok(())
}

/// Producer side: appends to the log and wakes local listeners.
#[derive(Clone)]
pub struct Publisher {
    log: SharedEventLog,
    registry: Arc<ListenerRegistry>,
    channel_manager: Arc<dyn ChannelManager>,
}

impl Publisher {
    pub fn new(
        log: SharedEventLog,
        registry: Arc<ListenerRegistry>,
        channel_manager: Arc<dyn ChannelManager>,
    ) -> Self {
        Self {
            log,
            registry,
            channel_manager,
        }
    }

    /// Stores the event when `channel` is reliable, then fans it out.
    ///
    /// Invalid channel names and event types are rejected before anything
    /// is written to the log.
    #[instrument(skip(self, data))]
    pub async fn send_event(
        &self,
        channel: &str,
        event_type: &str,
        data: Value,
    ) -> Result<Event, PublishError> {
        if channel.trim().is_empty() {
            return Err(PublishError::EmptyChannel);
        }
        validate_event_type(event_type)?;

        let event = if self.channel_manager.is_channel_reliable(channel) {
            self.log.append(channel, event_type, data).await?
        } else {
            Event::new(channel, event_type, data)
        };

        let woken = self.registry.fanout(channel, &event);
        metrics::counter!("eventstream_events_published_total").increment(1);
        debug!(id = ?event.id, listeners = woken, "event published");

        Ok(event)
    }

    /// Ends the streams of `user` on `channel` if the user can no longer
    /// read it. Returns how many streams were kicked.
    pub fn channel_permission_changed(&self, user: Option<&SessionUser>, channel: &str) -> usize {
        if self.channel_manager.can_read_channel(user, channel) {
            return 0;
        }

        let kicked = self.registry.kick(user.map(|user| user.id), channel);
        info!(channel, kicked, "read permission revoked");
        kicked
    }

    /// Cursor positioned at the current head of every reliable channel.
    pub async fn current_cursor<I, S>(&self, channels: I) -> EventLogResult<Cursor>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut cursor = Cursor::new();
        for channel in channels {
            let channel = channel.as_ref();
            if channel.is_empty() || !self.channel_manager.is_channel_reliable(channel) {
                continue;
            }
            cursor.set(channel, self.log.current_id(channel).await?);
        }
        Ok(cursor)
    }
}
