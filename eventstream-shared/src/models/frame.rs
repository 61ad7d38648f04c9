use serde_json::{Value, json};

use super::{cursor::Cursor, errors::StreamErrorPayload};

/// One unit written to a `text/event-stream` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// A comment line, ignored by clients.
    Comment(String),
    /// A dispatched event.
    Event {
        /// Value of the `event:` field.
        event: String,
        /// Value of the `id:` field, omitted when `None`.
        id: Option<String>,
        /// Payload, written as one `data:` line per line.
        data: String,
    },
}

impl SseFrame {
    /// Event name written when a stream opens.
    pub const STREAM_OPEN: &'static str = "stream-open";
    /// Event name written when a channel's history was lost.
    pub const STREAM_RESET: &'static str = "stream-reset";
    /// Event name written on idle timeouts.
    pub const KEEP_ALIVE: &'static str = "keep-alive";
    /// Event name of the terminal error frame.
    pub const STREAM_ERROR: &'static str = "stream-error";

    fn control(event: &str, id: Option<String>, data: String) -> Self {
        Self::Event {
            event: event.to_string(),
            id,
            data,
        }
    }

    /// Leading whitespace comment that pushes the response past proxy buffers.
    #[must_use]
    pub fn padding(bytes: usize) -> Self {
        Self::Comment(" ".repeat(bytes))
    }

    /// `stream-open` control frame.
    #[must_use]
    pub fn stream_open() -> Self {
        Self::control(Self::STREAM_OPEN, None, String::new())
    }

    /// `stream-reset` control frame listing the channels whose history was lost.
    #[must_use]
    pub fn stream_reset<S: AsRef<str>>(channels: &[S], cursor: &Cursor) -> Self {
        let names: Vec<&str> = channels.iter().map(AsRef::as_ref).collect();
        Self::control(
            Self::STREAM_RESET,
            cursor_id(cursor),
            json!({ "channels": names }).to_string(),
        )
    }

    /// `keep-alive` control frame with empty data.
    #[must_use]
    pub fn keep_alive() -> Self {
        Self::control(Self::KEEP_ALIVE, None, String::new())
    }

    /// Terminal `stream-error` frame.
    #[must_use]
    pub fn stream_error(payload: &StreamErrorPayload) -> Self {
        let data = serde_json::to_string(payload).unwrap_or_else(|_| {
            json!({ "condition": payload.condition, "text": payload.text }).to_string()
        });
        Self::control(Self::STREAM_ERROR, Some(Cursor::ERROR_TOKEN.to_string()), data)
    }

    /// Application event carrying `data` as compact JSON.
    ///
    /// Line breaks in `event_type` would split the `event:` field, so they
    /// are replaced with spaces.
    #[must_use]
    pub fn message(event_type: &str, data: &Value, cursor: Option<&Cursor>) -> Self {
        Self::Event {
            event: event_type.replace(['\r', '\n'], " "),
            id: cursor.and_then(cursor_id),
            data: data.to_string(),
        }
    }

    /// The event name, `None` for comments.
    #[must_use]
    pub fn event_name(&self) -> Option<&str> {
        match self {
            Self::Event { event, .. } => Some(event),
            Self::Comment(_) => None,
        }
    }

    /// The `id:` value, if any.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Event { id, .. } => id.as_deref(),
            Self::Comment(_) => None,
        }
    }

    /// The raw data, empty for comments.
    #[must_use]
    pub fn data(&self) -> &str {
        match self {
            Self::Event { data, .. } => data,
            Self::Comment(_) => "",
        }
    }

    /// Whether this frame ends the stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.event_name() == Some(Self::STREAM_ERROR)
    }

    /// Renders the frame in `text/event-stream` wire format.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Comment(text) => format!(":{text}\n\n"),
            Self::Event { event, id, data } => {
                let mut out = format!("event: {event}\n");
                if let Some(id) = id {
                    out.push_str("id: ");
                    out.push_str(id);
                    out.push('\n');
                }
                for line in data.split('\n') {
                    if line.is_empty() {
                        out.push_str("data:\n");
                    } else {
                        out.push_str("data: ");
                        out.push_str(line);
                        out.push('\n');
                    }
                }
                out.push('\n');
                out
            }
        }
    }
}

fn cursor_id(cursor: &Cursor) -> Option<String> {
    if cursor.is_empty() {
        None
    } else {
        Some(cursor.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_open_encodes_empty_data_line() {
        assert_eq!(
            SseFrame::stream_open().encode(),
            "event: stream-open\ndata:\n\n"
        );
    }

    #[test]
    fn message_carries_cursor_id() {
        let cursor: Cursor = [("c".to_string(), 1)].into_iter().collect();
        let frame = SseFrame::message("message", &json!({"x": 1}), Some(&cursor));

        assert_eq!(frame.encode(), "event: message\nid: c:1\ndata: {\"x\":1}\n\n");
    }

    #[test]
    fn line_breaks_in_event_type_are_flattened() {
        let frame = SseFrame::message("bad\ntype\r", &json!(1), None);

        assert_eq!(frame.event_name(), Some("bad type "));
        assert_eq!(frame.encode(), "event: bad type \ndata: 1\n\n");
    }

    #[test]
    fn multi_line_data_is_split_across_data_fields() {
        let frame = SseFrame::Event {
            event: "note".into(),
            id: None,
            data: "one\ntwo".into(),
        };
        assert_eq!(frame.encode(), "event: note\ndata: one\ndata: two\n\n");
    }

    #[test]
    fn stream_error_uses_reserved_id() {
        let frame = SseFrame::stream_error(&StreamErrorPayload::forbidden(&["c"]));

        assert!(frame.is_terminal());
        assert_eq!(frame.id(), Some("error"));
        let payload: Value = serde_json::from_str(frame.data()).unwrap();
        assert_eq!(payload["channels"], json!(["c"]));
    }

    #[test]
    fn stream_reset_lists_channels() {
        let cursor: Cursor = [("c".to_string(), 12)].into_iter().collect();
        let frame = SseFrame::stream_reset(&["c"], &cursor);

        assert_eq!(frame.id(), Some("c:12"));
        assert_eq!(frame.data(), r#"{"channels":["c"]}"#);
    }

    #[test]
    fn padding_is_a_comment() {
        let frame = SseFrame::padding(4);
        assert_eq!(frame.encode(), ":    \n\n");
        assert_eq!(frame.event_name(), None);
    }
}
