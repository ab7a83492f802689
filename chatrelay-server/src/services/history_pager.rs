use metrics::counter;
use shared::{
    config::server::PaginationConfig,
    models::{MessagesPage, PageCursor},
};
use tracing::debug;
use uuid::Uuid;

use super::store::{SharedStore, StoreError};

/// Backward, cursor-stable paging over a conversation's stored messages.
///
/// Every call re-reads the conversation, so appends between two requests can
/// only change `total` or add messages newer than pages already returned.
#[derive(Clone)]
pub struct HistoryPager {
    store: SharedStore,
    default_limit: usize,
    max_limit: usize,
}

impl HistoryPager {
    pub fn new(store: SharedStore, pagination: &PaginationConfig) -> Self {
        let max_limit = pagination.max_page_size.max(1);
        Self {
            store,
            default_limit: pagination.default_page_size.clamp(1, max_limit),
            max_limit,
        }
    }

    /// Clamps a requested page size into `[1, max]`; absent means the default.
    #[must_use]
    pub fn effective_limit(&self, requested: Option<i64>) -> usize {
        match requested {
            None => self.default_limit,
            Some(value) if value < 1 => 1,
            Some(value) => usize::try_from(value).map_or(self.max_limit, |v| v.min(self.max_limit)),
        }
    }

    /// Returns the most recent `limit` messages strictly older than `before`,
    /// oldest first.
    ///
    /// # Errors
    /// Returns [`StoreError::NotFound`] for unknown conversations.
    pub async fn get_page(
        &self,
        conversation_id: Uuid,
        before: Option<PageCursor>,
        limit: Option<i64>,
    ) -> Result<MessagesPage, StoreError> {
        let limit = self.effective_limit(limit);
        let conversation = self.store.get_conversation(conversation_id).await?;
        let total = conversation.messages.len();

        let mut messages = conversation.messages;
        // Append order is not trusted to be chronological.
        messages.sort_by_key(shared::models::Message::position);
        if let Some(cursor) = before {
            messages.retain(|message| cursor.admits(message));
        }

        let start = messages.len().saturating_sub(limit);
        let page = messages.split_off(start);
        let has_more = start > 0;
        let next_cursor = if has_more {
            page.first().map(PageCursor::at)
        } else {
            None
        };

        counter!("chatrelay_history_pages_total").increment(1);
        debug!(
            %conversation_id,
            limit,
            returned = page.len(),
            has_more,
            "history page computed"
        );

        Ok(MessagesPage {
            conversation_id,
            messages: page,
            total,
            has_more,
            next_cursor,
        })
    }
}

impl std::fmt::Debug for HistoryPager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryPager")
            .field("default_limit", &self.default_limit)
            .field("max_limit", &self.max_limit)
            .finish_non_exhaustive()
    }
}
