//! Per-connection catch-up / live-tail loop.
//!
//! A stream starts by paging through the event log from the client's cursor.
//! Once every channel is caught up it waits on the listener's wake. Items that
//! arrive while a catch-up read is in flight are discarded and picked up by
//! another read instead, so every event is delivered exactly once.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use futures::Stream;
use shared::{
    config::server::StreamConfig,
    models::{Cursor, SseFrame, StreamErrorPayload},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::{
    channel_manager::ChannelManager,
    event_log::SharedEventLog,
    event_request::EventRequest,
    event_response::{CatchUpError, check_permissions, read_catch_up},
    listener_registry::{ListenerHandle, ListenerRegistry, PendingBatch, RegistryError, Wake},
};

#[derive(Debug, Error)]
pub enum OpenError {
    #[error(transparent)]
    Forbidden(#[from] CatchUpError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl OpenError {
    pub fn payload(&self) -> StreamErrorPayload {
        match self {
            Self::Forbidden(err) => err.payload(),
            Self::Registry(err) => StreamErrorPayload::internal(err.to_string()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StreamSettings {
    pub keep_alive: Duration,
    pub page_size: usize,
    pub padding_bytes: usize,
}

impl From<&StreamConfig> for StreamSettings {
    fn from(config: &StreamConfig) -> Self {
        Self {
            keep_alive: config.keep_alive(),
            page_size: config.page_size.max(1),
            padding_bytes: config.padding_bytes,
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

#[derive(Clone)]
pub struct StreamCoordinator {
    registry: Arc<ListenerRegistry>,
    log: SharedEventLog,
    channel_manager: Arc<dyn ChannelManager>,
    settings: StreamSettings,
}

/// What the live-tail step decided after draining a batch.
enum Drained {
    Continue,
    Resync,
    Terminate(StreamErrorPayload),
}

impl StreamCoordinator {
    pub fn new(
        registry: Arc<ListenerRegistry>,
        log: SharedEventLog,
        channel_manager: Arc<dyn ChannelManager>,
        settings: StreamSettings,
    ) -> Self {
        Self {
            registry,
            log,
            channel_manager,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    /// Opens a stream for `request`.
    ///
    /// Permissions are checked and the listener is registered before this
    /// returns, so no event appended afterwards can be missed. The listener
    /// is deregistered when the returned stream is dropped.
    pub fn open(
        &self,
        request: EventRequest,
    ) -> Result<impl Stream<Item = SseFrame> + Send + 'static, OpenError> {
        check_permissions(
            &request.channels,
            request.user.as_ref(),
            self.channel_manager.as_ref(),
        )?;

        let handle = self
            .registry
            .register(request.user_id(), request.channels.clone())?;

        metrics::counter!("eventstream_streams_opened_total").increment(1);
        info!(
            listener_id = handle.id(),
            channels = ?request.channels,
            resume = %request.channel_last_ids.encode(),
            "stream opened"
        );

        Ok(self.clone().run(request, handle))
    }

    fn run(
        self,
        request: EventRequest,
        handle: ListenerHandle,
    ) -> impl Stream<Item = SseFrame> + Send + 'static {
        async_stream::stream! {
            let listener_id = handle.id();
            let continuation = request.is_continuation();
            let channels = request.channels;
            let user = request.user;
            let mut cursor = request.channel_last_ids;

            if !continuation {
                yield SseFrame::padding(self.settings.padding_bytes);
                yield SseFrame::stream_open();
            }

            'catch_up: loop {
                let response = match read_catch_up(
                    &channels,
                    &cursor,
                    user.as_ref(),
                    self.log.as_ref(),
                    self.channel_manager.as_ref(),
                    self.settings.page_size,
                )
                .await
                {
                    Ok(response) => response,
                    Err(err) => {
                        match &err {
                            CatchUpError::Forbidden { channels } => {
                                info!(listener_id, ?channels, "stream ended: permission denied");
                            }
                            CatchUpError::Log(source) => {
                                error!(listener_id, error = %source, "stream ended: event log failure");
                            }
                        }
                        yield SseFrame::stream_error(&err.payload());
                        return;
                    }
                };

                if !response.channel_reset.is_empty() {
                    for channel in &response.channel_reset {
                        if let Some(id) = response.channel_last_ids.get(channel) {
                            cursor.set(channel.clone(), id);
                        }
                    }
                    let reset: Vec<&str> = response.channel_reset.iter().map(String::as_str).collect();
                    debug!(listener_id, channels = ?reset, "history lost, resetting");
                    metrics::counter!("eventstream_stream_resets_total").increment(1);
                    yield SseFrame::stream_reset(&reset, &cursor);
                }

                for (event, position) in response.cursor_after_items(&cursor) {
                    yield SseFrame::message(&event.event_type, &event.data, Some(&position));
                }
                for (channel, id) in response.channel_last_ids.iter() {
                    cursor.set(channel, id);
                }

                if response.has_more() {
                    continue 'catch_up;
                }

                if handle.discard_pending() {
                    debug!(listener_id, "events arrived during catch-up, reading again");
                    continue 'catch_up;
                }

                loop {
                    match handle.wait(self.settings.keep_alive).await {
                        Wake::Shutdown => {
                            info!(listener_id, "stream ended: server shutting down");
                            return;
                        }
                        Wake::TimedOut => {
                            yield SseFrame::keep_alive();
                        }
                        Wake::Woken => {
                            let batch = handle.take_pending();
                            let (frames, outcome) = drain(batch, &channels, &mut cursor);
                            for frame in frames {
                                yield frame;
                            }
                            match outcome {
                                Drained::Continue => {}
                                Drained::Resync => {
                                    debug!(listener_id, "live queue incomplete, resynchronising");
                                    metrics::counter!("eventstream_stream_resyncs_total").increment(1);
                                    continue 'catch_up;
                                }
                                Drained::Terminate(payload) => {
                                    warn!(listener_id, condition = %payload.condition, "stream ended: {}", payload.text);
                                    yield SseFrame::stream_error(&payload);
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Turns a drained batch into frames, advancing `cursor`.
///
/// Items at or below the cursor were already delivered by a catch-up read
/// and are skipped. An item past `cursor + 1` means something in between was
/// not queued, so the rest of that channel is left to a catch-up read.
fn drain(
    batch: PendingBatch,
    channels: &BTreeSet<String>,
    cursor: &mut Cursor,
) -> (Vec<SseFrame>, Drained) {
    let mut frames = Vec::with_capacity(batch.items.len());
    let mut gapped = BTreeSet::new();

    for event in batch.items {
        if !channels.contains(&event.channel) || gapped.contains(&event.channel) {
            continue;
        }

        if cursor.contains(&event.channel) {
            match (event.id, cursor.get(&event.channel)) {
                (Some(id), Some(last)) if id <= last => continue,
                (Some(id), Some(last)) if id > last + 1 => {
                    gapped.insert(event.channel.clone());
                    continue;
                }
                (Some(id), _) => cursor.set(event.channel.clone(), id),
                (None, _) => {
                    cursor.remove(&event.channel);
                }
            }
        }

        let position = (!cursor.is_empty()).then_some(&*cursor);
        frames.push(SseFrame::message(&event.event_type, &event.data, position));
    }

    let outcome = match batch.error {
        Some(payload) => Drained::Terminate(payload),
        None if batch.overflow || !gapped.is_empty() => Drained::Resync,
        None => Drained::Continue,
    };
    (frames, outcome)
}

#[cfg(test)]
#[path = "stream_coordinator_tests.rs"]
mod tests;
