//! Composite resumption cursor carried in the SSE `id:` field.
//!
//! The encoded form is a comma separated list of `channel:id` pairs. Channel
//! names are percent-escaped so that `,`, `:` and `%` inside a name can never
//! be mistaken for delimiters.

use std::collections::BTreeMap;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use thiserror::Error;

/// Characters left untouched when escaping channel names.
const CHANNEL_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~')
    .remove(b'/');

/// Errors produced while parsing an encoded cursor.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CursorError {
    /// The token was empty.
    #[error("empty cursor")]
    Empty,
    /// A pair did not consist of exactly one channel and one id.
    #[error("malformed cursor entry '{0}'")]
    MalformedEntry(String),
    /// The id part was not a non-negative integer.
    #[error("invalid event id '{0}'")]
    InvalidId(String),
    /// The channel name did not unescape to UTF-8.
    #[error("invalid channel encoding '{0}'")]
    InvalidChannel(String),
}

/// Per-channel last delivered event ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cursor {
    ids: BTreeMap<String, u64>,
}

impl Cursor {
    /// Id of terminal `stream-error` frames. Clients that reconnect with it
    /// are refused instead of resumed.
    pub const ERROR_TOKEN: &'static str = "error";

    /// Creates an empty cursor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Last delivered id for `channel`.
    #[must_use]
    pub fn get(&self, channel: &str) -> Option<u64> {
        self.ids.get(channel).copied()
    }

    /// Sets the position of `channel`.
    pub fn set(&mut self, channel: impl Into<String>, id: u64) {
        self.ids.insert(channel.into(), id);
    }

    /// Drops `channel` from the cursor.
    pub fn remove(&mut self, channel: &str) -> Option<u64> {
        self.ids.remove(channel)
    }

    /// Whether `channel` has a position.
    #[must_use]
    pub fn contains(&self, channel: &str) -> bool {
        self.ids.contains_key(channel)
    }

    /// `true` when no channel has a position.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Iterates `(channel, id)` pairs in channel order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.ids.iter().map(|(channel, id)| (channel.as_str(), *id))
    }

    /// Keeps only the channels accepted by `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.ids.retain(|channel, _| keep(channel));
    }

    /// Renders the cursor as `channel:id` pairs joined by commas.
    #[must_use]
    pub fn encode(&self) -> String {
        self.ids
            .iter()
            .map(|(channel, id)| format!("{}:{id}", utf8_percent_encode(channel, CHANNEL_ESCAPE)))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Encoded cursor with `%` doubled, for embedding into templates that
    /// treat `%` as a placeholder marker.
    #[must_use]
    pub fn template_escaped(&self) -> String {
        self.encode().replace('%', "%%")
    }

    /// Parses an encoded cursor.
    ///
    /// # Errors
    /// Returns a [`CursorError`] when the token is empty, an entry is not a
    /// single `channel:id` pair, an id is not an integer, or a channel name
    /// is not valid percent-encoded UTF-8.
    pub fn parse(token: &str) -> Result<Self, CursorError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(CursorError::Empty);
        }

        let mut ids = BTreeMap::new();
        for part in token.split(',') {
            let mut pieces = part.split(':');
            let (Some(channel), Some(id), None) = (pieces.next(), pieces.next(), pieces.next())
            else {
                return Err(CursorError::MalformedEntry(part.to_string()));
            };

            let id = id
                .trim()
                .parse::<u64>()
                .map_err(|_| CursorError::InvalidId(id.to_string()))?;
            let channel = percent_decode_str(channel.trim())
                .decode_utf8()
                .map_err(|_| CursorError::InvalidChannel(channel.to_string()))?;

            ids.insert(channel.into_owned(), id);
        }

        Ok(Self { ids })
    }
}

impl FromIterator<(String, u64)> for Cursor {
    fn from_iter<T: IntoIterator<Item = (String, u64)>>(iter: T) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}
