//! In-process registry of connected stream listeners.
//!
//! One mutex guards the channel index and every listener's mailbox, overflow
//! flag and pending error. Wakes are issued after the lock is released.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use shared::models::{Event, StreamErrorPayload};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ListenerId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("listener registry is shutting down")]
    ShuttingDown,
}

/// Everything a listener received since it last looked.
#[derive(Debug, Default)]
pub struct PendingBatch {
    /// Live events in arrival order.
    pub items: Vec<Event>,
    /// At least one event was dropped because a mailbox was full.
    pub overflow: bool,
    /// Terminal error stored by [`ListenerRegistry::kick`].
    pub error: Option<StreamErrorPayload>,
}

/// Outcome of [`ListenerHandle::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Woken,
    TimedOut,
    Shutdown,
}

#[derive(Debug)]
struct ListenerSlot {
    user_id: Option<Uuid>,
    channels: BTreeSet<String>,
    mailbox: Vec<Event>,
    pending: HashMap<String, usize>,
    overflow: bool,
    error: Option<StreamErrorPayload>,
    wake: Arc<Notify>,
}

impl ListenerSlot {
    fn clear_mailbox(&mut self) {
        self.mailbox.clear();
        self.pending.clear();
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    next_id: ListenerId,
    listeners: HashMap<ListenerId, ListenerSlot>,
    by_channel: HashMap<String, HashSet<ListenerId>>,
    shut_down: bool,
}

#[derive(Debug)]
pub struct ListenerRegistry {
    state: Mutex<RegistryState>,
    max_pending: usize,
    shutdown: CancellationToken,
}

impl ListenerRegistry {
    pub fn new(max_pending: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RegistryState::default()),
            max_pending: max_pending.max(1),
            shutdown: CancellationToken::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a listener on `channels`. The listener stays registered
    /// until the returned handle is dropped.
    pub fn register(
        self: &Arc<Self>,
        user_id: Option<Uuid>,
        channels: BTreeSet<String>,
    ) -> Result<ListenerHandle, RegistryError> {
        let wake = Arc::new(Notify::new());

        let (id, active) = {
            let mut state = self.lock();
            if state.shut_down {
                return Err(RegistryError::ShuttingDown);
            }

            state.next_id += 1;
            let id = state.next_id;
            for channel in &channels {
                state
                    .by_channel
                    .entry(channel.clone())
                    .or_default()
                    .insert(id);
            }
            state.listeners.insert(
                id,
                ListenerSlot {
                    user_id,
                    channels: channels.clone(),
                    mailbox: Vec::new(),
                    pending: HashMap::new(),
                    overflow: false,
                    error: None,
                    wake: Arc::clone(&wake),
                },
            );
            (id, state.listeners.len())
        };

        metrics::gauge!("eventstream_active_listeners").set(active as f64);
        debug!(listener_id = id, ?channels, "listener registered");

        Ok(ListenerHandle {
            id,
            registry: Arc::clone(self),
            wake,
            shutdown: self.shutdown.clone(),
        })
    }

    fn remove(&self, id: ListenerId) {
        let active = {
            let mut state = self.lock();
            let Some(slot) = state.listeners.remove(&id) else {
                return;
            };
            for channel in &slot.channels {
                if let Some(ids) = state.by_channel.get_mut(channel) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        state.by_channel.remove(channel);
                    }
                }
            }
            state.listeners.len()
        };

        metrics::gauge!("eventstream_active_listeners").set(active as f64);
        debug!(listener_id = id, "listener removed");
    }

    /// Queues `event` for every listener on `channel`, returning how many
    /// listeners were woken. Full mailboxes get the overflow flag instead.
    pub fn fanout(&self, channel: &str, event: &Event) -> usize {
        let mut overflowed = 0_u64;
        let mut wakes = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            let Some(ids) = state.by_channel.get(channel) else {
                return 0;
            };

            for id in ids {
                let Some(slot) = state.listeners.get_mut(id) else {
                    continue;
                };
                let pending = slot.pending.entry(channel.to_string()).or_insert(0);
                if *pending < self.max_pending {
                    *pending += 1;
                    slot.mailbox.push(event.clone());
                } else {
                    if !slot.overflow {
                        overflowed += 1;
                    }
                    slot.overflow = true;
                }
                wakes.push(Arc::clone(&slot.wake));
            }
        }

        if overflowed > 0 {
            metrics::counter!("eventstream_mailbox_overflows_total").increment(overflowed);
            debug!(channel, listeners = overflowed, "mailbox overflow");
        }

        for wake in &wakes {
            wake.notify_one();
        }
        wakes.len()
    }

    /// Ends the streams of `user_id` on `channel` with a `forbidden` error.
    pub fn kick(&self, user_id: Option<Uuid>, channel: &str) -> usize {
        let mut wakes = Vec::new();
        {
            let mut guard = self.lock();
            let state = &mut *guard;
            let Some(ids) = state.by_channel.get(channel) else {
                return 0;
            };

            for id in ids {
                let Some(slot) = state.listeners.get_mut(id) else {
                    continue;
                };
                if slot.user_id == user_id {
                    slot.error = Some(StreamErrorPayload::forbidden(&[channel]));
                    wakes.push(Arc::clone(&slot.wake));
                }
            }
        }

        if !wakes.is_empty() {
            metrics::counter!("eventstream_listener_kicks_total").increment(wakes.len() as u64);
            info!(user_id = ?user_id, channel, listeners = wakes.len(), "kicked listeners");
        }

        for wake in &wakes {
            wake.notify_one();
        }
        wakes.len()
    }

    /// Drops queued items and the overflow flag of listener `id`, returning
    /// whether anything had arrived. A pending error is kept.
    pub fn discard_pending(&self, id: ListenerId) -> bool {
        let mut state = self.lock();
        let Some(slot) = state.listeners.get_mut(&id) else {
            return false;
        };

        let had_pending = !slot.mailbox.is_empty() || slot.overflow;
        slot.clear_mailbox();
        slot.overflow = false;
        had_pending
    }

    /// Drains the mailbox, overflow flag and pending error of listener `id`.
    pub fn take_pending(&self, id: ListenerId) -> PendingBatch {
        let mut state = self.lock();
        let Some(slot) = state.listeners.get_mut(&id) else {
            return PendingBatch::default();
        };

        slot.pending.clear();
        PendingBatch {
            items: std::mem::take(&mut slot.mailbox),
            overflow: std::mem::take(&mut slot.overflow),
            error: slot.error.take(),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    pub fn channel_count(&self) -> usize {
        self.lock().by_channel.len()
    }

    /// Refuses new listeners and ends every open stream.
    pub fn shutdown(&self) {
        let active = {
            let mut state = self.lock();
            state.shut_down = true;
            state.listeners.len()
        };
        if active > 0 {
            warn!(listeners = active, "closing open streams");
        }
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Registration of one listener; deregisters on drop.
#[derive(Debug)]
pub struct ListenerHandle {
    id: ListenerId,
    registry: Arc<ListenerRegistry>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
}

impl ListenerHandle {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Waits for a wake, the keep-alive `timeout`, or registry shutdown.
    ///
    /// A wake issued before this call is not lost: it is consumed here.
    pub async fn wait(&self, timeout: Duration) -> Wake {
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Wake::Shutdown,
            () = self.wake.notified() => Wake::Woken,
            () = tokio::time::sleep(timeout) => Wake::TimedOut,
        }
    }

    pub fn discard_pending(&self) -> bool {
        self.registry.discard_pending(self.id)
    }

    pub fn take_pending(&self) -> PendingBatch {
        self.registry.take_pending(self.id)
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
