use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Payload of a terminal `stream-error` frame.
///
/// `extra` is flattened into the payload, so a permission failure renders as
/// `{"condition": "forbidden", "text": "...", "channels": ["a"]}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamErrorPayload {
    /// Machine readable condition (`bad-request`, `forbidden`, `internal-error`).
    pub condition: String,
    /// Human readable description.
    pub text: String,
    /// Additional condition specific fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StreamErrorPayload {
    /// Condition for requests that could not be parsed or validated.
    pub const BAD_REQUEST: &'static str = "bad-request";
    /// Condition for channels the caller may not read.
    pub const FORBIDDEN: &'static str = "forbidden";
    /// Condition for server side failures.
    pub const INTERNAL_ERROR: &'static str = "internal-error";

    /// Creates a payload without extra fields.
    pub fn new(condition: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            text: text.into(),
            extra: Map::new(),
        }
    }

    /// Adds an extra field.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Permission failure listing the denied channels.
    pub fn forbidden<S: AsRef<str>>(channels: &[S]) -> Self {
        let names: Vec<&str> = channels.iter().map(AsRef::as_ref).collect();
        Self::new(
            Self::FORBIDDEN,
            format!("Permission denied to channels: {}", names.join(", ")),
        )
        .with_extra("channels", Value::from(names))
    }

    /// Validation failure.
    pub fn bad_request(reason: impl std::fmt::Display) -> Self {
        Self::new(Self::BAD_REQUEST, format!("Invalid request: {reason}."))
    }

    /// Server side failure.
    pub fn internal(text: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, text)
    }
}
