//! Fan-out core: event logs, listener registry, stream coordinator and publisher.
pub mod channel_manager;
pub mod event_log;
pub mod event_request;
pub mod event_response;
pub mod listener_registry;
pub mod memory_log;
pub mod pg_event_log;
pub mod publisher;
pub mod stream_coordinator;

pub use channel_manager::{ChannelManager, ChannelSource, DefaultChannelManager};
pub use event_log::{EventLog, EventLogError, SharedEventLog};
pub use event_request::{EventRequest, EventRequestError};
pub use listener_registry::ListenerRegistry;
pub use memory_log::{MemoryEventLog, RetentionPolicy};
pub use pg_event_log::PgEventLog;
pub use publisher::{PublishError, Publisher};
pub use stream_coordinator::{StreamCoordinator, StreamSettings};
