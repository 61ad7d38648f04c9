use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::{config::server::StorageConfig, models::Event};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::debug;

use super::event_log::{EventLog, EventLogError, EventLogResult};

/// How long events are kept and how much trimming one append may do.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub ttl: Duration,
    pub trim_batch: usize,
    pub max_events_per_channel: Option<usize>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from_config(&StorageConfig::default())
    }
}

impl RetentionPolicy {
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            ttl: config.event_ttl(),
            trim_batch: config.trim_batch.max(1),
            max_events_per_channel: config.max_events_per_channel.filter(|cap| *cap > 0),
        }
    }
}

#[derive(Debug)]
struct StoredEvent {
    event: Event,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ChannelLog {
    events: VecDeque<StoredEvent>,
    current_id: u64,
    // Pre-history placeholder that lets clients read from id 0; created with
    // the first event and trimmed like any other entry.
    origin: Option<DateTime<Utc>>,
}

impl ChannelLog {
    fn first_id(&self) -> Option<u64> {
        self.events.front().and_then(|stored| stored.event.id)
    }

    fn resolves(&self, last_id: u64) -> bool {
        if last_id == 0 {
            return self.origin.is_some();
        }
        self.first_id()
            .is_some_and(|first| first <= last_id && last_id <= self.current_id)
    }

    fn drop_oldest(&mut self) -> bool {
        if self.origin.take().is_some() {
            return true;
        }
        self.events.pop_front().is_some()
    }

    fn oldest_created_at(&self) -> Option<DateTime<Utc>> {
        self.origin
            .or_else(|| self.events.front().map(|stored| stored.created_at))
    }
}

/// Process-local [`EventLog`] with time based trimming.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    channels: Mutex<HashMap<String, ChannelLog>>,
    retention: RetentionPolicy,
}

impl MemoryEventLog {
    pub fn new(retention: RetentionPolicy) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            retention,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ChannelLog>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes every entry created before `cutoff`, returning how many were dropped.
    pub fn trim_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut channels = self.lock();
        trim_expired(&mut channels, cutoff, usize::MAX)
    }

    /// Drops every event older than the retention TTL.
    pub fn sweep_expired(&self) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(self.retention.ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl))
        else {
            return 0;
        };
        let removed = self.trim_older_than(cutoff);
        if removed > 0 {
            debug!(removed, "retention sweep dropped expired events");
        }
        removed
    }

    /// Sweeps on a fixed interval. Append-time trimming only visits channels
    /// that are still written to; this covers idle ones.
    pub fn spawn_retention_sweep(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep_expired();
            }
        })
    }
}

fn trim_expired(
    channels: &mut HashMap<String, ChannelLog>,
    cutoff: DateTime<Utc>,
    budget: usize,
) -> usize {
    let mut removed = 0;
    for log in channels.values_mut() {
        while removed < budget
            && log
                .oldest_created_at()
                .is_some_and(|created_at| created_at < cutoff)
        {
            if !log.drop_oldest() {
                break;
            }
            removed += 1;
        }
    }
    removed
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn append(&self, channel: &str, event_type: &str, data: Value) -> EventLogResult<Event> {
        let now = Utc::now();
        let mut channels = self.lock();

        let log = channels.entry(channel.to_string()).or_default();
        if log.current_id == 0 {
            log.origin = Some(now);
        }
        log.current_id += 1;

        let event = Event::new(channel, event_type, data).with_id(log.current_id);
        log.events.push_back(StoredEvent {
            event: event.clone(),
            created_at: now,
        });

        if let Some(cap) = self.retention.max_events_per_channel {
            while log.events.len() > cap {
                log.origin = None;
                log.events.pop_front();
            }
        }

        let ttl = chrono::Duration::from_std(self.retention.ttl)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        if let Some(cutoff) = now.checked_sub_signed(ttl) {
            let removed = trim_expired(&mut channels, cutoff, self.retention.trim_batch);
            if removed > 0 {
                debug!(removed, "trimmed expired events");
            }
        }

        Ok(event)
    }

    async fn read_events(
        &self,
        channel: &str,
        last_id: u64,
        limit: usize,
    ) -> EventLogResult<Vec<Event>> {
        let channels = self.lock();

        let Some(log) = channels.get(channel) else {
            return if last_id == 0 {
                Ok(Vec::new())
            } else {
                Err(EventLogError::EventDoesNotExist {
                    last_id,
                    current_id: 0,
                })
            };
        };

        if last_id == log.current_id {
            return Ok(Vec::new());
        }

        if !log.resolves(last_id) {
            return Err(EventLogError::EventDoesNotExist {
                last_id,
                current_id: log.current_id,
            });
        }

        let first_id = log.first_id().unwrap_or(last_id + 1);
        let skip = usize::try_from((last_id + 1).saturating_sub(first_id)).unwrap_or(usize::MAX);

        Ok(log
            .events
            .iter()
            .skip(skip)
            .take(limit)
            .map(|stored| stored.event.clone())
            .collect())
    }

    async fn current_id(&self, channel: &str) -> EventLogResult<u64> {
        Ok(self.lock().get(channel).map_or(0, |log| log.current_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log() -> MemoryEventLog {
        MemoryEventLog::default()
    }

    #[tokio::test]
    async fn sweep_drops_expired_events_on_idle_channels() {
        let log = MemoryEventLog::new(RetentionPolicy {
            ttl: Duration::from_millis(50),
            trim_batch: 50,
            max_events_per_channel: None,
        });
        log.append("idle", "message", json!(1)).await.unwrap();
        log.append("idle", "message", json!(2)).await.unwrap();
        assert_eq!(log.sweep_expired(), 0);

        tokio::time::sleep(Duration::from_millis(120)).await;

        // Both events plus the pre-history placeholder.
        assert_eq!(log.sweep_expired(), 3);
        assert_eq!(log.current_id("idle").await.unwrap(), 2);
        assert!(matches!(
            log.read_events("idle", 1, 10).await,
            Err(EventLogError::EventDoesNotExist { current_id: 2, .. })
        ));
    }

    #[tokio::test]
    async fn empty_channel_has_zero_head() {
        let log = log();
        assert_eq!(log.current_id("empty").await.unwrap(), 0);
        assert!(log.read_events("empty", 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_channel_rejects_unknown_id() {
        let err = log().read_events("empty", 1, 10).await.unwrap_err();
        assert!(matches!(
            err,
            EventLogError::EventDoesNotExist {
                last_id: 1,
                current_id: 0
            }
        ));
    }

    #[tokio::test]
    async fn append_then_read() {
        let log = log();
        let data = json!({"a": "b"});

        let event = log.append("channel", "message", data.clone()).await.unwrap();
        assert_eq!(event.id, Some(1));
        assert_eq!(log.current_id("channel").await.unwrap(), 1);

        let events = log.read_events("channel", 0, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, data);

        assert!(log.read_events("channel", 1, 10).await.unwrap().is_empty());

        let err = log.read_events("channel", 2, 10).await.unwrap_err();
        assert!(matches!(
            err,
            EventLogError::EventDoesNotExist { current_id: 1, .. }
        ));
    }

    #[tokio::test]
    async fn reads_are_paged_in_id_order() {
        let log = log();
        for n in 0..5 {
            log.append("c", "message", json!(n)).await.unwrap();
        }

        let first: Vec<_> = log
            .read_events("c", 0, 2)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id.unwrap())
            .collect();
        assert_eq!(first, vec![1, 2]);

        let second: Vec<_> = log
            .read_events("c", 2, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id.unwrap())
            .collect();
        assert_eq!(second, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn channels_are_numbered_independently() {
        let log = log();
        log.append("a", "message", json!(1)).await.unwrap();
        log.append("a", "message", json!(2)).await.unwrap();
        let b = log.append("b", "message", json!(3)).await.unwrap();

        assert_eq!(b.id, Some(1));
        assert_eq!(log.current_id("a").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cap_trims_history_and_origin() {
        let log = MemoryEventLog::new(RetentionPolicy {
            max_events_per_channel: Some(2),
            ..RetentionPolicy::default()
        });
        for n in 0..4 {
            log.append("c", "message", json!(n)).await.unwrap();
        }

        assert!(matches!(
            log.read_events("c", 0, 10).await,
            Err(EventLogError::EventDoesNotExist { current_id: 4, .. })
        ));
        assert!(log.read_events("c", 1, 10).await.is_err());

        let events = log.read_events("c", 3, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, Some(4));
    }

    #[tokio::test]
    async fn trim_older_than_drops_everything_before_cutoff() {
        let log = log();
        log.append("c", "message", json!(1)).await.unwrap();
        log.append("c", "message", json!(2)).await.unwrap();

        let removed = log.trim_older_than(Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(removed, 3);

        assert!(log.read_events("c", 1, 10).await.is_err());
        // The head itself stays resolvable as an empty read.
        assert!(log.read_events("c", 2, 10).await.unwrap().is_empty());
    }
}
