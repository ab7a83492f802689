pub mod broadcaster;
pub mod chat_service;
pub mod generator;
pub mod history_pager;
pub mod registry;
pub mod store;
pub mod stream_controller;

pub use broadcaster::StreamBroadcaster;
pub use chat_service::{ChatService, ChatServiceError};
pub use history_pager::HistoryPager;
pub use registry::{SharedRegistry, SubscriberRegistry, Subscription, Topic};
pub use store::{ConversationStore, InMemoryConversationStore, SharedStore, StoreError};
pub use stream_controller::{ResponseStreamController, SharedStreamController, StreamError};
