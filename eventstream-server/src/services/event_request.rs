//! Parsing of stream requests into an [`EventRequest`].

use std::collections::BTreeSet;

use axum::http::{HeaderMap, request::Parts};
use shared::models::{Cursor, CursorError, StreamErrorPayload};
use thiserror::Error;

use crate::auth::session::SessionUser;

use super::channel_manager::{ChannelManager, ChannelSource};

const LAST_EVENT_ID_HEADER: &str = "last-event-id";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventRequestError {
    #[error("No channels specified")]
    NoChannels,
    #[error("Channel limit exceeded")]
    ChannelLimitExceeded { requested: usize, limit: usize },
    #[error("Can't resume session after stream-error")]
    ResumeNotAllowed,
    #[error("Failed to parse Last-Event-ID or lastEventId")]
    MalformedCursor(#[source] CursorError),
}

impl EventRequestError {
    /// Payload of the single `stream-error` frame answering a rejected request.
    pub fn payload(&self) -> StreamErrorPayload {
        StreamErrorPayload::bad_request(self)
    }
}

/// Immutable description of one stream request.
#[derive(Clone, Debug)]
pub struct EventRequest {
    pub channels: BTreeSet<String>,
    /// Resume positions for the requested channels that had one.
    pub channel_last_ids: Cursor,
    /// `link=next`: continuation of a stream the client already opened.
    pub is_next: bool,
    /// `recover=true`: reconnect after a dropped connection.
    pub is_recover: bool,
    pub user: Option<SessionUser>,
}

impl EventRequest {
    /// Continuations and recoveries resume an existing stream and skip the
    /// padding and `stream-open` preamble.
    pub fn is_continuation(&self) -> bool {
        self.is_next || self.is_recover
    }

    /// Builds a request from already extracted pieces.
    pub fn new(
        channels: BTreeSet<String>,
        channel_last_ids: Cursor,
        user: Option<SessionUser>,
        channel_limit: usize,
    ) -> Result<Self, EventRequestError> {
        if channels.is_empty() {
            return Err(EventRequestError::NoChannels);
        }
        if channels.len() > channel_limit {
            return Err(EventRequestError::ChannelLimitExceeded {
                requested: channels.len(),
                limit: channel_limit,
            });
        }

        let mut channel_last_ids = channel_last_ids;
        channel_last_ids.retain(|channel| channels.contains(channel));

        Ok(Self {
            channels,
            channel_last_ids,
            is_next: false,
            is_recover: false,
            user,
        })
    }

    /// Builds a request from the HTTP request head.
    ///
    /// Channels come from `path_channel` or the repeated `channel` query
    /// parameter, as decided by `manager`. The resume cursor is read from the
    /// `Last-Event-ID` header, falling back to the last non-empty
    /// `lastEventId` query parameter.
    pub fn from_parts(
        parts: &Parts,
        path_channel: Option<String>,
        user: Option<SessionUser>,
        manager: &dyn ChannelManager,
        channel_limit: usize,
    ) -> Result<Self, EventRequestError> {
        let query: Vec<(String, String)> = parts
            .uri
            .query()
            .map(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();

        let source = ChannelSource {
            path_channel,
            query_channels: query_values(&query, "channel").map(str::to_string).collect(),
        };
        let channels = manager.channels_for_request(&source);

        let token = header_cursor(&parts.headers).or_else(|| {
            query_values(&query, "lastEventId")
                .filter(|value| !value.trim().is_empty())
                .last()
                .map(str::to_string)
        });

        let cursor = match token {
            Some(token) if token.trim() == Cursor::ERROR_TOKEN => {
                return Err(EventRequestError::ResumeNotAllowed);
            }
            Some(token) => Cursor::parse(&token).map_err(EventRequestError::MalformedCursor)?,
            None => Cursor::new(),
        };

        let mut request = Self::new(channels, cursor, user, channel_limit)?;
        request.is_next = query_values(&query, "link").any(|value| value == "next");
        request.is_recover = query_values(&query, "recover").any(|value| value == "true");
        Ok(request)
    }

    pub fn user_id(&self) -> Option<uuid::Uuid> {
        self.user.as_ref().map(|user| user.id)
    }
}

fn query_values<'a>(query: &'a [(String, String)], key: &'a str) -> impl Iterator<Item = &'a str> {
    query
        .iter()
        .filter(move |(name, _)| name == key)
        .map(|(_, value)| value.as_str())
}

fn header_cursor(headers: &HeaderMap) -> Option<String> {
    headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::channel_manager::DefaultChannelManager;
    use axum::http::Request;

    fn parts(uri: &str, last_event_id: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri(uri);
        if let Some(id) = last_event_id {
            builder = builder.header(LAST_EVENT_ID_HEADER, id);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn parse(uri: &str, last_event_id: Option<&str>) -> Result<EventRequest, EventRequestError> {
        EventRequest::from_parts(
            &parts(uri, last_event_id),
            None,
            None,
            &DefaultChannelManager,
            10,
        )
    }

    #[test]
    fn no_channels_is_rejected() {
        assert_eq!(
            parse("/events", None).unwrap_err(),
            EventRequestError::NoChannels
        );
    }

    #[test]
    fn channel_limit_is_enforced() {
        let uri = format!(
            "/events?{}",
            (0..11)
                .map(|n| format!("channel=c{n}"))
                .collect::<Vec<_>>()
                .join("&")
        );

        assert!(matches!(
            parse(&uri, None),
            Err(EventRequestError::ChannelLimitExceeded {
                requested: 11,
                limit: 10
            })
        ));
    }

    #[test]
    fn header_cursor_wins_and_is_filtered_to_requested_channels() {
        let request = parse(
            "/events?channel=a&channel=b&lastEventId=a:9",
            Some("a:3,b:4,z:1"),
        )
        .unwrap();

        assert_eq!(request.channel_last_ids.get("a"), Some(3));
        assert_eq!(request.channel_last_ids.get("b"), Some(4));
        assert!(!request.channel_last_ids.contains("z"));
    }

    #[test]
    fn last_non_empty_query_cursor_is_used() {
        let request = parse("/events?channel=a&lastEventId=a:1&lastEventId=a:2&lastEventId=", None)
            .unwrap();

        assert_eq!(request.channel_last_ids.get("a"), Some(2));
    }

    #[test]
    fn error_token_cannot_be_resumed() {
        assert_eq!(
            parse("/events?channel=a", Some("error")).unwrap_err(),
            EventRequestError::ResumeNotAllowed
        );
    }

    #[test]
    fn malformed_cursor_is_rejected() {
        let err = parse("/events?channel=a", Some("a:x")).unwrap_err();

        assert!(matches!(err, EventRequestError::MalformedCursor(_)));
        assert_eq!(
            err.payload().text,
            "Invalid request: Failed to parse Last-Event-ID or lastEventId."
        );
    }

    #[test]
    fn link_and_recover_flags() {
        let request = parse("/events?channel=a&link=next&recover=true", None).unwrap();
        assert!(request.is_next);
        assert!(request.is_recover);

        let request = parse("/events?channel=a", None).unwrap();
        assert!(!request.is_next);
        assert!(!request.is_recover);
        assert!(!request.is_continuation());

        let request = parse("/events?channel=a&link=next", None).unwrap();
        assert!(request.is_continuation());
    }

    #[test]
    fn path_channel_is_used() {
        let request = EventRequest::from_parts(
            &parts("/events/room", None),
            Some("room".into()),
            None,
            &DefaultChannelManager,
            10,
        )
        .unwrap();

        assert!(request.channels.contains("room"));
    }

    #[test]
    fn escaped_channel_names_round_trip_through_the_query() {
        let request = parse("/events?channel=a%2Cb&lastEventId=a%252Cb:5", None).unwrap();
        assert_eq!(request.channel_last_ids.get("a,b"), Some(5));
    }
}
