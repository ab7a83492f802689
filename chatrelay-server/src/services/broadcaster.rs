use std::sync::Arc;

use shared::models::{ConversationSummary, StreamEvent};
use tokio::sync::mpsc;
use tracing::{error, trace};
use uuid::Uuid;

use super::registry::{BroadcastReport, Delivery, SharedRegistry, Subscription, Topic};

/// Typed event emission on top of the subscriber registry.
///
/// Events are not buffered: an observer only sees what is broadcast while it
/// is attached. Late joiners read the persisted history instead.
#[derive(Debug, Clone)]
pub struct StreamBroadcaster {
    registry: SharedRegistry,
}

impl StreamBroadcaster {
    pub fn new(registry: SharedRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Attaches a new observer to `topic` and returns its membership along
    /// with the receiving end of its channel.
    pub fn subscribe(&self, topic: Topic) -> (Subscription, mpsc::Receiver<Delivery>) {
        let (observer, receiver) = self.registry.channel();
        let subscription = self.registry.attach(topic, &observer);
        (subscription, receiver)
    }

    pub fn emit_fragment(&self, conversation_id: Uuid, text: &str) -> BroadcastReport {
        self.emit(
            Topic::Conversation(conversation_id),
            &StreamEvent::Fragment(text.to_string()),
        )
    }

    pub fn emit_completed(&self, conversation_id: Uuid) -> BroadcastReport {
        self.emit(Topic::Conversation(conversation_id), &StreamEvent::Completed)
    }

    pub fn emit_failed(&self, conversation_id: Uuid, message: &str) -> BroadcastReport {
        self.emit(
            Topic::Conversation(conversation_id),
            &StreamEvent::Failed(message.to_string()),
        )
    }

    pub fn emit_conversation_created(&self, summary: ConversationSummary) -> BroadcastReport {
        self.emit(
            Topic::AllConversations,
            &StreamEvent::ConversationCreated(summary),
        )
    }

    fn emit(&self, topic: Topic, event: &StreamEvent) -> BroadcastReport {
        let frame = match event.to_frame() {
            Ok(frame) => Arc::new(frame),
            Err(err) => {
                error!(%topic, kind = event.kind(), error = %err, "failed to serialize stream event");
                return BroadcastReport::default();
            }
        };

        let report = self.registry.broadcast(topic, &frame);
        trace!(
            %topic,
            kind = event.kind(),
            delivered = report.delivered,
            evicted = report.evicted,
            "stream event emitted"
        );
        report
    }
}
