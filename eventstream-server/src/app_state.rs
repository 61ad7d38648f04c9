use std::sync::Arc;

use shared::config::server::Config;

use crate::services::{
    ChannelManager, DefaultChannelManager, ListenerRegistry, MemoryEventLog, Publisher,
    RetentionPolicy, SharedEventLog, StreamCoordinator, StreamSettings,
};

/// Everything handlers need, composed once at startup.
#[derive(Clone)]
pub struct AppState {
    pub(crate) config: Arc<Config>,
    pub(crate) registry: Arc<ListenerRegistry>,
    pub(crate) log: SharedEventLog,
    pub(crate) channel_manager: Arc<dyn ChannelManager>,
    pub(crate) coordinator: StreamCoordinator,
    pub(crate) publisher: Publisher,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        log: SharedEventLog,
        channel_manager: Arc<dyn ChannelManager>,
    ) -> Self {
        let registry = ListenerRegistry::new(config.stream.max_pending);
        let coordinator = StreamCoordinator::new(
            Arc::clone(&registry),
            Arc::clone(&log),
            Arc::clone(&channel_manager),
            StreamSettings::from(&config.stream),
        );
        let publisher = Publisher::new(
            Arc::clone(&log),
            Arc::clone(&registry),
            Arc::clone(&channel_manager),
        );

        Self {
            config,
            registry,
            log,
            channel_manager,
            coordinator,
            publisher,
        }
    }

    /// State backed by the in-process log and the permissive channel manager.
    pub fn in_memory(config: Arc<Config>) -> Self {
        let log = Arc::new(MemoryEventLog::new(RetentionPolicy::from_config(
            &config.storage,
        )));
        Self::new(config, log, Arc::new(DefaultChannelManager))
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }
}
