use std::collections::BTreeSet;

use crate::auth::session::SessionUser;

/// Channel names a request asked for, before any policy is applied.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelSource {
    /// Channel taken from the request path, e.g. `/events/{channel}`.
    pub path_channel: Option<String>,
    /// Repeated `channel` query parameters.
    pub query_channels: Vec<String>,
}

impl ChannelSource {
    pub fn from_path(channel: impl Into<String>) -> Self {
        Self {
            path_channel: Some(channel.into()),
            query_channels: Vec::new(),
        }
    }

    pub fn from_query<I, S>(channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            path_channel: None,
            query_channels: channels.into_iter().map(Into::into).collect(),
        }
    }
}

/// Policy collaborator deciding which channels a request maps to and who
/// may read them.
pub trait ChannelManager: Send + Sync {
    /// Channels requested by `source`.
    fn channels_for_request(&self, source: &ChannelSource) -> BTreeSet<String>;

    /// Whether `user` (anonymous when `None`) may read `channel`.
    fn can_read_channel(&self, user: Option<&SessionUser>, channel: &str) -> bool;

    /// Reliable channels are replayed from the event log; unreliable ones
    /// only forward live events.
    fn is_channel_reliable(&self, channel: &str) -> bool;
}

/// Everything is readable and reliable.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultChannelManager;

impl ChannelManager for DefaultChannelManager {
    fn channels_for_request(&self, source: &ChannelSource) -> BTreeSet<String> {
        if let Some(channel) = source.path_channel.as_deref().filter(|c| !c.is_empty()) {
            return BTreeSet::from([channel.to_string()]);
        }

        source
            .query_channels
            .iter()
            .filter(|channel| !channel.is_empty())
            .cloned()
            .collect()
    }

    fn can_read_channel(&self, _user: Option<&SessionUser>, _channel: &str) -> bool {
        true
    }

    fn is_channel_reliable(&self, _channel: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_channel_wins_over_query() {
        let source = ChannelSource {
            path_channel: Some("room".into()),
            query_channels: vec!["other".into()],
        };

        let channels = DefaultChannelManager.channels_for_request(&source);
        assert_eq!(channels, BTreeSet::from(["room".to_string()]));
    }

    #[test]
    fn query_channels_are_deduplicated_and_empty_names_dropped() {
        let source = ChannelSource::from_query(["b", "", "a", "b"]);

        let channels: Vec<_> = DefaultChannelManager
            .channels_for_request(&source)
            .into_iter()
            .collect();
        assert_eq!(channels, vec!["a", "b"]);
    }

    #[test]
    fn default_manager_allows_everything() {
        let manager = DefaultChannelManager;
        assert!(manager.can_read_channel(None, "x"));
        assert!(manager.is_channel_reliable("x"));
    }
}
