//! One paged catch-up read across the channels of a request.

use std::collections::{BTreeMap, BTreeSet};

use shared::models::{Cursor, Event, StreamErrorPayload};
use thiserror::Error;
use tracing::debug;

use crate::auth::session::SessionUser;

use super::{
    channel_manager::ChannelManager,
    event_log::{EventLog, EventLogError},
};

#[derive(Debug, Error)]
pub enum CatchUpError {
    #[error("Permission denied to channels: {}", channels.join(", "))]
    Forbidden { channels: Vec<String> },
    #[error(transparent)]
    Log(EventLogError),
}

impl CatchUpError {
    pub fn payload(&self) -> StreamErrorPayload {
        match self {
            Self::Forbidden { channels } => StreamErrorPayload::forbidden(channels),
            Self::Log(_) => StreamErrorPayload::internal("Event log unavailable"),
        }
    }
}

/// Result of one catch-up page.
#[derive(Debug, Default, Clone)]
pub struct EventResponse {
    pub channel_items: BTreeMap<String, Vec<Event>>,
    /// Cursor positioned at the end of this page (or the head for channels
    /// that were not read).
    pub channel_last_ids: Cursor,
    /// Channels whose requested position no longer resolves.
    pub channel_reset: BTreeSet<String>,
    /// Channels with more history beyond this page.
    pub channel_more: BTreeSet<String>,
}

impl EventResponse {
    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.channel_items.values().all(Vec::is_empty)
    }

    pub fn has_more(&self) -> bool {
        !self.channel_more.is_empty()
    }

    /// Items in delivery order, each paired with the cursor that includes it.
    ///
    /// `start` is the cursor before the page; the returned cursors advance one
    /// item at a time so a client resuming from any of them misses nothing.
    pub fn cursor_after_items<'a>(
        &'a self,
        start: &Cursor,
    ) -> impl Iterator<Item = (&'a Event, Cursor)> + use<'a> {
        let mut cursor = start.clone();
        self.channel_items
            .iter()
            .flat_map(|(_, items)| items.iter())
            .map(move |event| {
                if let Some(id) = event.id {
                    cursor.set(event.channel.clone(), id);
                }
                (event, cursor.clone())
            })
    }
}

/// Checks read permission on every requested channel.
pub fn check_permissions(
    channels: &BTreeSet<String>,
    user: Option<&SessionUser>,
    manager: &dyn ChannelManager,
) -> Result<(), CatchUpError> {
    let denied: Vec<String> = channels
        .iter()
        .filter(|channel| !manager.can_read_channel(user, channel))
        .cloned()
        .collect();

    if denied.is_empty() {
        Ok(())
    } else {
        Err(CatchUpError::Forbidden { channels: denied })
    }
}

/// Reads one page of history for `channels` starting at `last_ids`.
///
/// Channels without a position start at their current head and are not
/// read. A position the log cannot resolve is reported in
/// [`EventResponse::channel_reset`] with the cursor moved to the head the
/// log reported.
pub async fn read_catch_up(
    channels: &BTreeSet<String>,
    last_ids: &Cursor,
    user: Option<&SessionUser>,
    log: &dyn EventLog,
    manager: &dyn ChannelManager,
    page_size: usize,
) -> Result<EventResponse, CatchUpError> {
    check_permissions(channels, user, manager)?;

    let limit = (page_size / channels.len().max(1)).max(1);
    let mut response = EventResponse::default();

    for channel in channels {
        if !manager.is_channel_reliable(channel) {
            continue;
        }

        let current_id = log.current_id(channel).await.map_err(CatchUpError::Log)?;

        let Some(last_id) = last_ids.get(channel) else {
            response.channel_last_ids.set(channel.clone(), current_id);
            continue;
        };

        if last_id == current_id {
            response.channel_last_ids.set(channel.clone(), current_id);
            continue;
        }

        match log.read_events(channel, last_id, limit + 1).await {
            Ok(mut items) => {
                if items.len() > limit {
                    items.truncate(limit);
                    response.channel_more.insert(channel.clone());
                }
                let position = items.last().and_then(|event| event.id).unwrap_or(last_id);
                response.channel_last_ids.set(channel.clone(), position);
                response.channel_items.insert(channel.clone(), items);
            }
            Err(EventLogError::EventDoesNotExist { current_id, .. }) => {
                debug!(channel, last_id, current_id, "requested position no longer exists");
                response.channel_reset.insert(channel.clone());
                response.channel_last_ids.set(channel.clone(), current_id);
            }
            Err(err) => return Err(CatchUpError::Log(err)),
        }
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        channel_manager::{ChannelSource, DefaultChannelManager},
        memory_log::MemoryEventLog,
    };
    use serde_json::json;

    struct DenyChannel(&'static str);

    impl ChannelManager for DenyChannel {
        fn channels_for_request(
            &self,
            source: &ChannelSource,
        ) -> BTreeSet<String> {
            DefaultChannelManager.channels_for_request(source)
        }
        fn can_read_channel(&self, _user: Option<&SessionUser>, channel: &str) -> bool {
            channel != self.0
        }
        fn is_channel_reliable(&self, _channel: &str) -> bool {
            true
        }
    }

    struct Unreliable;

    impl ChannelManager for Unreliable {
        fn channels_for_request(
            &self,
            source: &ChannelSource,
        ) -> BTreeSet<String> {
            DefaultChannelManager.channels_for_request(source)
        }
        fn can_read_channel(&self, _user: Option<&SessionUser>, _channel: &str) -> bool {
            true
        }
        fn is_channel_reliable(&self, _channel: &str) -> bool {
            false
        }
    }

    fn channels(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|name| (*name).to_string()).collect()
    }

    async fn filled_log(channel: &str, count: usize) -> MemoryEventLog {
        let log = MemoryEventLog::default();
        for n in 0..count {
            log.append(channel, "message", json!(n)).await.unwrap();
        }
        log
    }

    #[tokio::test]
    async fn no_position_starts_at_head_without_reading() {
        let log = filled_log("c", 3).await;

        let response = read_catch_up(
            &channels(&["c"]),
            &Cursor::new(),
            None,
            &log,
            &DefaultChannelManager,
            100,
        )
        .await
        .unwrap();

        assert!(response.is_empty());
        assert_eq!(response.channel_last_ids.get("c"), Some(3));
    }

    #[tokio::test]
    async fn pages_are_split_across_channels() {
        let log = filled_log("a", 5).await;
        for n in 0..5 {
            log.append("b", "message", json!(n)).await.unwrap();
        }
        let start: Cursor = [("a".to_string(), 0), ("b".to_string(), 0)]
            .into_iter()
            .collect();

        let response = read_catch_up(
            &channels(&["a", "b"]),
            &start,
            None,
            &log,
            &DefaultChannelManager,
            4,
        )
        .await
        .unwrap();

        assert_eq!(response.channel_items["a"].len(), 2);
        assert_eq!(response.channel_items["b"].len(), 2);
        assert_eq!(response.channel_more, channels(&["a", "b"]));
        assert_eq!(response.channel_last_ids.get("a"), Some(2));
    }

    #[tokio::test]
    async fn page_size_below_channel_count_still_reads_one() {
        let log = filled_log("a", 2).await;
        let start: Cursor = [("a".to_string(), 0)].into_iter().collect();

        let response = read_catch_up(
            &channels(&["a", "b", "c"]),
            &start,
            None,
            &log,
            &DefaultChannelManager,
            1,
        )
        .await
        .unwrap();

        assert_eq!(response.channel_items["a"].len(), 1);
        assert!(response.has_more());
    }

    #[tokio::test]
    async fn unknown_position_resets_to_head() {
        let log = filled_log("c", 2).await;
        let start: Cursor = [("c".to_string(), 50)].into_iter().collect();

        let response = read_catch_up(
            &channels(&["c"]),
            &start,
            None,
            &log,
            &DefaultChannelManager,
            100,
        )
        .await
        .unwrap();

        assert_eq!(response.channel_reset, channels(&["c"]));
        assert_eq!(response.channel_last_ids.get("c"), Some(2));
        assert!(response.is_empty());
    }

    #[tokio::test]
    async fn forbidden_channels_are_listed() {
        let log = MemoryEventLog::default();

        let err = read_catch_up(
            &channels(&["a", "secret"]),
            &Cursor::new(),
            None,
            &log,
            &DenyChannel("secret"),
            100,
        )
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "Permission denied to channels: secret");
        assert_eq!(err.payload().extra["channels"], json!(["secret"]));
    }

    #[tokio::test]
    async fn unreliable_channels_are_not_read() {
        let log = filled_log("c", 2).await;
        let start: Cursor = [("c".to_string(), 0)].into_iter().collect();

        let response = read_catch_up(&channels(&["c"]), &start, None, &log, &Unreliable, 100)
            .await
            .unwrap();

        assert!(response.channel_items.is_empty());
        assert!(!response.channel_last_ids.contains("c"));
    }

    #[tokio::test]
    async fn cursor_advances_per_item() {
        let log = filled_log("c", 2).await;
        let start: Cursor = [("c".to_string(), 0)].into_iter().collect();

        let response = read_catch_up(
            &channels(&["c"]),
            &start,
            None,
            &log,
            &DefaultChannelManager,
            100,
        )
        .await
        .unwrap();

        let ids: Vec<String> = response
            .cursor_after_items(&start)
            .map(|(_, cursor)| cursor.encode())
            .collect();
        assert_eq!(ids, vec!["c:1", "c:2"]);
    }
}
