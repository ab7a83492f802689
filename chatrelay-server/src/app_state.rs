use std::{sync::Arc, time::Duration};

use shared::config::server::Config;
use sqlx::PgPool;

use crate::services::{
    ChatService, HistoryPager, InMemoryConversationStore, ResponseStreamController,
    SharedStore, StreamBroadcaster, SubscriberRegistry,
    generator::{self, GeneratorError, SharedGenerator},
};

/// State shared by every route.
#[derive(Clone, Debug)]
pub struct AppState {
    pub config: Arc<Config>,
    pub chat: ChatService,
    pub pool: Option<PgPool>,
}

impl AppState {
    /// Wires registry, broadcaster, controller and pager around `store`.
    pub fn new(
        config: Arc<Config>,
        store: SharedStore,
        generator: SharedGenerator,
        pool: Option<PgPool>,
    ) -> Self {
        let registry = Arc::new(SubscriberRegistry::new(config.stream.channel_capacity));
        let broadcaster = StreamBroadcaster::new(registry);
        let run_timeout = (config.stream.run_timeout_seconds > 0)
            .then(|| Duration::from_secs(config.stream.run_timeout_seconds));
        let controller = Arc::new(ResponseStreamController::new(
            broadcaster.clone(),
            Arc::clone(&store),
            generator,
            run_timeout,
        ));
        let pager = HistoryPager::new(Arc::clone(&store), &config.pagination);
        let chat = ChatService::new(store, broadcaster, controller, pager);

        Self {
            config,
            chat,
            pool,
        }
    }

    /// In-memory state using the configured generator.
    ///
    /// # Errors
    /// Returns an error when the configured generator cannot be built.
    pub fn in_memory(config: Arc<Config>) -> Result<Self, GeneratorError> {
        let generator = generator::from_config(&config.generator)?;
        Ok(Self::new(
            config,
            Arc::new(InMemoryConversationStore::new()),
            generator,
            None,
        ))
    }
}

pub type SharedState = Arc<AppState>;
