//! Client-side view of one live topic.
//!
//! An [`ObserverSession`] owns at most one open event stream. It folds
//! incoming events into a transcript (for a conversation topic) or into a
//! recency list (for the all-conversations topic), and backfills persisted
//! history through a [`HistoryClient`].

use futures_util::StreamExt;
use shared::models::{ConversationSummary, Message, MessageRole, PageCursor, StreamEvent};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    client::ObservedTopic,
    transport::{EventStream, HistoryClient, Transport, TransportError},
};

pub const CONVERSATION_LIST_CAP: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closed,
    Errored(String),
}

impl SessionState {
    const fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Errored(_) => "errored",
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no topic selected")]
    NoTopic,
    #[error("cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("history request failed: {0:#}")]
    History(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Streaming,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEntry {
    Persisted(Message),
    Live { content: String, status: ReplyStatus },
}

impl TranscriptEntry {
    #[must_use]
    pub fn role(&self) -> MessageRole {
        match self {
            Self::Persisted(message) => message.role,
            Self::Live { .. } => MessageRole::Assistant,
        }
    }

    #[must_use]
    pub fn content(&self) -> &str {
        match self {
            Self::Persisted(message) => &message.content,
            Self::Live { content, .. } => content,
        }
    }
}

/// What applying one event changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    Fragment { text: String, started: bool },
    Completed,
    Failed(String),
    ConversationCreated(ConversationSummary),
    Ignored,
    Closed,
    Errored(String),
}

pub struct ObserverSession<T, H> {
    transport: T,
    history: H,
    topic: Option<ObservedTopic>,
    state: SessionState,
    events: Option<EventStream>,
    transcript: Vec<TranscriptEntry>,
    in_progress: Option<usize>,
    has_more: bool,
    next_cursor: Option<PageCursor>,
    conversations: Vec<ConversationSummary>,
    last_error: Option<String>,
}

impl<T, H> std::fmt::Debug for ObserverSession<T, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSession")
            .field("topic", &self.topic)
            .field("state", &self.state)
            .field("transcript", &self.transcript.len())
            .field("in_progress", &self.in_progress)
            .field("has_more", &self.has_more)
            .finish_non_exhaustive()
    }
}

impl<T: Transport, H: HistoryClient> ObserverSession<T, H> {
    pub fn new(transport: T, history: H) -> Self {
        Self {
            transport,
            history,
            topic: None,
            state: SessionState::Idle,
            events: None,
            transcript: Vec::new(),
            in_progress: None,
            has_more: false,
            next_cursor: None,
            conversations: Vec::new(),
            last_error: None,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn topic(&self) -> Option<ObservedTopic> {
        self.topic
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn conversations(&self) -> &[ConversationSummary] {
        &self.conversations
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_streaming(&self) -> bool {
        self.in_progress.is_some()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Attaches to `topic`, tearing down any previous stream first.
    ///
    /// # Errors
    /// Returns the transport error after moving to `Errored`.
    pub async fn connect(&mut self, topic: ObservedTopic) -> Result<(), SessionError> {
        if self.topic != Some(topic) {
            self.teardown();
            self.reset_view();
        }
        self.topic = Some(topic);
        self.open().await
    }

    /// Re-enters `Connecting` for the current topic.
    ///
    /// # Errors
    /// Fails while a stream is open or connecting, when no topic was ever
    /// selected, or when the transport cannot connect.
    pub async fn reconnect(&mut self) -> Result<(), SessionError> {
        if matches!(self.state, SessionState::Open | SessionState::Connecting) {
            return Err(SessionError::InvalidTransition {
                action: "reconnect",
                state: self.state.label(),
            });
        }
        if self.topic.is_none() {
            return Err(SessionError::NoTopic);
        }
        self.open().await
    }

    /// Forces `Closed` and drops the transport.
    pub fn disconnect(&mut self) {
        self.teardown();
        self.state = SessionState::Closed;
    }

    /// Moves to a different topic. The old stream is closed before the new
    /// one is opened.
    ///
    /// # Errors
    /// Returns the transport error for the new topic.
    pub async fn switch_topic(&mut self, topic: ObservedTopic) -> Result<(), SessionError> {
        self.disconnect();
        self.reset_view();
        self.topic = Some(topic);
        self.open().await
    }

    async fn open(&mut self) -> Result<(), SessionError> {
        let Some(topic) = self.topic else {
            return Err(SessionError::NoTopic);
        };
        self.teardown();
        self.state = SessionState::Connecting;

        match self.transport.connect(topic).await {
            Ok(events) => {
                self.events = Some(events);
                self.state = SessionState::Open;
                self.last_error = None;
                info!(?topic, "observer session open");
                Ok(())
            }
            Err(err) => {
                warn!(?topic, error = %err, "observer session failed to connect");
                self.state = SessionState::Errored(err.to_string());
                self.last_error = Some(err.to_string());
                Err(err.into())
            }
        }
    }

    fn teardown(&mut self) {
        if self.events.take().is_some() {
            debug!(topic = ?self.topic, "closing event stream");
        }
        self.clear_in_progress(ReplyStatus::Failed);
    }

    fn reset_view(&mut self) {
        self.transcript.clear();
        self.in_progress = None;
        self.has_more = false;
        self.next_cursor = None;
        self.conversations.clear();
        self.last_error = None;
    }

    /// Waits for the next event and applies it. Returns `None` unless the
    /// session is open.
    pub async fn next_update(&mut self) -> Option<SessionUpdate> {
        if self.state != SessionState::Open {
            return None;
        }
        let events = self.events.as_mut()?;

        let update = match events.next().await {
            Some(Ok(event)) => self.apply(event),
            Some(Err(err)) => {
                let message = err.to_string();
                self.teardown();
                self.state = SessionState::Errored(message.clone());
                self.last_error = Some(message.clone());
                SessionUpdate::Errored(message)
            }
            None => {
                self.teardown();
                self.state = SessionState::Closed;
                SessionUpdate::Closed
            }
        };
        Some(update)
    }

    /// Folds one event into the session view.
    pub fn apply(&mut self, event: StreamEvent) -> SessionUpdate {
        if self.state != SessionState::Open {
            return SessionUpdate::Ignored;
        }

        match event {
            StreamEvent::Fragment(text) => {
                let started = self.in_progress.is_none();
                let index = *self.in_progress.get_or_insert_with(|| {
                    self.transcript.push(TranscriptEntry::Live {
                        content: String::new(),
                        status: ReplyStatus::Streaming,
                    });
                    self.transcript.len() - 1
                });
                if let Some(TranscriptEntry::Live { content, .. }) = self.transcript.get_mut(index) {
                    content.push_str(&text);
                }
                SessionUpdate::Fragment { text, started }
            }
            StreamEvent::Completed => {
                self.clear_in_progress(ReplyStatus::Completed);
                SessionUpdate::Completed
            }
            StreamEvent::Failed(message) => {
                self.clear_in_progress(ReplyStatus::Failed);
                self.last_error = Some(message.clone());
                SessionUpdate::Failed(message)
            }
            StreamEvent::ConversationCreated(summary) => {
                self.remember_conversation(summary.clone());
                SessionUpdate::ConversationCreated(summary)
            }
        }
    }

    fn clear_in_progress(&mut self, status: ReplyStatus) {
        if let Some(index) = self.in_progress.take()
            && let Some(TranscriptEntry::Live {
                content,
                status: current,
            }) = self.transcript.get_mut(index)
        {
            if status == ReplyStatus::Completed {
                let trimmed = content.trim().to_string();
                *content = trimmed;
            }
            *current = status;
        }
    }

    fn remember_conversation(&mut self, summary: ConversationSummary) {
        self.conversations.retain(|known| known.id != summary.id);
        self.conversations.insert(0, summary);
        self.conversations.truncate(CONVERSATION_LIST_CAP);
    }

    /// Replaces the view with the newest persisted state. A reply still
    /// streaming stays at the end of the transcript.
    ///
    /// # Errors
    /// Returns [`SessionError::NoTopic`] or the history failure.
    pub async fn hydrate(&mut self, limit: Option<i64>) -> Result<(), SessionError> {
        match self.topic.ok_or(SessionError::NoTopic)? {
            ObservedTopic::Conversation(id) => {
                let page = self.history.page(id, None, limit).await?;
                let live = self
                    .in_progress
                    .and_then(|index| self.transcript.get(index).cloned());

                self.transcript = page
                    .messages
                    .into_iter()
                    .map(TranscriptEntry::Persisted)
                    .collect();
                self.in_progress = live.map(|entry| {
                    self.transcript.push(entry);
                    self.transcript.len() - 1
                });
                self.has_more = page.has_more;
                self.next_cursor = page.next_cursor;
            }
            ObservedTopic::AllConversations => {
                let limit = i64::try_from(CONVERSATION_LIST_CAP).unwrap_or(i64::MAX);
                let mut listed = self.history.conversations(Some(limit)).await?;
                listed.truncate(CONVERSATION_LIST_CAP);
                self.conversations = listed;
            }
        }
        Ok(())
    }

    /// Prepends the next older page. Returns how many messages were added.
    ///
    /// # Errors
    /// Returns [`SessionError::NoTopic`] for the all-conversations topic or
    /// when nothing is selected, or the history failure.
    pub async fn load_older(&mut self, limit: Option<i64>) -> Result<usize, SessionError> {
        let Some(ObservedTopic::Conversation(id)) = self.topic else {
            return Err(SessionError::NoTopic);
        };
        if !self.has_more {
            return Ok(0);
        }

        let page = self.history.page(id, self.next_cursor.as_ref(), limit).await?;
        let added = page.messages.len();
        self.transcript
            .splice(0..0, page.messages.into_iter().map(TranscriptEntry::Persisted));
        if let Some(index) = self.in_progress.as_mut() {
            *index += added;
        }
        self.has_more = page.has_more;
        self.next_cursor = page.next_cursor;
        Ok(added)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use uuid::Uuid;

    fn session(messages: u64) -> (ObserverSession<FakeTransport, FakeHistory>, FakeTransport) {
        let transport = FakeTransport::default();
        let session = ObserverSession::new(transport.clone(), FakeHistory::with_messages(messages));
        (session, transport)
    }

    fn fragment(text: &str) -> StreamEvent {
        StreamEvent::Fragment(text.to_string())
    }

    #[tokio::test]
    async fn test_connect_moves_from_idle_to_open() {
        let (mut session, _) = session(0);
        assert_eq!(session.state(), &SessionState::Idle);

        session.connect(ObservedTopic::Conversation(Uuid::new_v4())).await.unwrap();
        assert_eq!(session.state(), &SessionState::Open);
    }

    #[tokio::test]
    async fn test_refused_connection_errors() {
        let (mut session, transport) = session(0);
        transport.refuse(true);

        let result = session.connect(ObservedTopic::AllConversations).await;
        assert!(matches!(result, Err(SessionError::Transport(_))));
        assert!(matches!(session.state(), SessionState::Errored(_)));
        assert!(session.last_error().is_some());
    }

    #[tokio::test]
    async fn test_fragments_build_one_entry_until_completed() {
        let (mut session, _) = session(0);
        session.connect(ObservedTopic::Conversation(Uuid::new_v4())).await.unwrap();

        assert_eq!(
            session.apply(fragment("Hello ")),
            SessionUpdate::Fragment {
                text: "Hello ".into(),
                started: true
            }
        );
        assert_eq!(
            session.apply(fragment("world ")),
            SessionUpdate::Fragment {
                text: "world ".into(),
                started: false
            }
        );
        assert_eq!(session.transcript().len(), 1);

        assert_eq!(session.apply(StreamEvent::Completed), SessionUpdate::Completed);
        assert!(!session.is_streaming());
        assert_eq!(
            session.transcript()[0],
            TranscriptEntry::Live {
                content: "Hello world".into(),
                status: ReplyStatus::Completed
            }
        );

        session.apply(fragment("Next "));
        assert_eq!(session.transcript().len(), 2);
    }

    #[tokio::test]
    async fn test_failure_clears_marker_so_next_run_starts_fresh() {
        let (mut session, _) = session(0);
        session.connect(ObservedTopic::Conversation(Uuid::new_v4())).await.unwrap();

        session.apply(fragment("partial "));
        assert_eq!(
            session.apply(StreamEvent::Failed("boom".into())),
            SessionUpdate::Failed("boom".into())
        );
        assert_eq!(session.last_error(), Some("boom"));
        assert!(matches!(
            session.transcript()[0],
            TranscriptEntry::Live {
                status: ReplyStatus::Failed,
                ..
            }
        ));

        let update = session.apply(fragment("fresh "));
        assert!(matches!(update, SessionUpdate::Fragment { started: true, .. }));
        assert_eq!(session.transcript().len(), 2);
        assert_eq!(session.transcript()[1].content(), "fresh ");
    }

    #[tokio::test]
    async fn test_events_are_ignored_unless_open() {
        let (mut session, _) = session(0);
        assert_eq!(session.apply(fragment("stray")), SessionUpdate::Ignored);

        session.connect(ObservedTopic::Conversation(Uuid::new_v4())).await.unwrap();
        session.disconnect();
        assert_eq!(session.state(), &SessionState::Closed);
        assert_eq!(session.apply(fragment("stray")), SessionUpdate::Ignored);
        assert!(session.transcript().is_empty());
    }

    #[tokio::test]
    async fn test_next_update_reads_from_transport() {
        let (mut session, transport) = session(0);
        session.connect(ObservedTopic::Conversation(Uuid::new_v4())).await.unwrap();

        let feed = transport.feed();
        feed.send(Ok(fragment("a "))).unwrap();
        feed.send(Ok(StreamEvent::Completed)).unwrap();

        assert!(matches!(
            session.next_update().await,
            Some(SessionUpdate::Fragment { .. })
        ));
        assert_eq!(session.next_update().await, Some(SessionUpdate::Completed));

        drop(feed);
        transport.feeds.lock().unwrap().clear();
        assert_eq!(session.next_update().await, Some(SessionUpdate::Closed));
        assert_eq!(session.state(), &SessionState::Closed);
        assert_eq!(session.next_update().await, None);
    }

    #[tokio::test]
    async fn test_transport_error_moves_to_errored() {
        let (mut session, transport) = session(0);
        session.connect(ObservedTopic::Conversation(Uuid::new_v4())).await.unwrap();

        transport
            .feed()
            .send(Err(TransportError::Interrupted("reset".into())))
            .unwrap();

        assert!(matches!(
            session.next_update().await,
            Some(SessionUpdate::Errored(_))
        ));
        assert!(matches!(session.state(), SessionState::Errored(_)));
    }

    #[tokio::test]
    async fn test_reconnect_only_from_idle_or_terminal_states() {
        let (mut session, transport) = session(0);
        assert!(matches!(session.reconnect().await, Err(SessionError::NoTopic)));

        let topic = ObservedTopic::Conversation(Uuid::new_v4());
        session.connect(topic).await.unwrap();
        assert!(matches!(
            session.reconnect().await,
            Err(SessionError::InvalidTransition { action: "reconnect", state: "open" })
        ));

        session.disconnect();
        session.reconnect().await.unwrap();
        assert_eq!(session.state(), &SessionState::Open);
        assert_eq!(transport.connects.load(std::sync::atomic::Ordering::SeqCst), 2);

        transport.refuse(true);
        session.disconnect();
        assert!(session.reconnect().await.is_err());
        transport.refuse(false);
        session.reconnect().await.unwrap();
        assert_eq!(session.topic(), Some(topic));
    }

    #[tokio::test]
    async fn test_switching_topic_drops_previous_stream() {
        let (mut session, transport) = session(0);
        let first = ObservedTopic::Conversation(Uuid::new_v4());
        let second = ObservedTopic::Conversation(Uuid::new_v4());

        session.connect(first).await.unwrap();
        let old_feed = transport.feed();
        session.apply(fragment("from first "));

        session.switch_topic(second).await.unwrap();
        assert!(old_feed.is_closed());
        assert!(session.transcript().is_empty());
        assert_eq!(session.topic(), Some(second));

        transport.feed().send(Ok(fragment("from second "))).unwrap();
        session.next_update().await;
        assert_eq!(session.transcript()[0].content(), "from second ");
    }

    #[tokio::test]
    async fn test_hydrate_keeps_live_reply_last() {
        let (mut session, _) = session(5);
        session.connect(ObservedTopic::Conversation(Uuid::new_v4())).await.unwrap();
        session.apply(fragment("typing "));

        session.hydrate(Some(2)).await.unwrap();
        let contents: Vec<&str> = session.transcript().iter().map(TranscriptEntry::content).collect();
        assert_eq!(contents, vec!["m3", "m4", "typing "]);
        assert!(session.has_more());

        session.apply(fragment("more "));
        assert_eq!(session.transcript()[2].content(), "typing more ");
    }

    #[tokio::test]
    async fn test_load_older_prepends_until_exhausted() {
        let (mut session, _) = session(5);
        session.connect(ObservedTopic::Conversation(Uuid::new_v4())).await.unwrap();
        session.hydrate(Some(2)).await.unwrap();
        session.apply(fragment("live "));

        assert_eq!(session.load_older(Some(2)).await.unwrap(), 2);
        assert_eq!(session.load_older(Some(2)).await.unwrap(), 1);
        assert!(!session.has_more());
        assert_eq!(session.load_older(Some(2)).await.unwrap(), 0);

        let contents: Vec<&str> = session.transcript().iter().map(TranscriptEntry::content).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4", "live "]);

        session.apply(fragment("on"));
        assert_eq!(session.transcript()[5].content(), "live on");
    }

    #[tokio::test]
    async fn test_conversation_list_dedupes_and_caps() {
        let (mut session, _) = session(0);
        session.connect(ObservedTopic::AllConversations).await.unwrap();

        let repeated = Uuid::new_v4();
        session.apply(StreamEvent::ConversationCreated(summary(repeated)));
        for _ in 0..CONVERSATION_LIST_CAP {
            session.apply(StreamEvent::ConversationCreated(summary(Uuid::new_v4())));
        }
        session.apply(StreamEvent::ConversationCreated(summary(repeated)));

        let conversations = session.conversations();
        assert_eq!(conversations.len(), CONVERSATION_LIST_CAP);
        assert_eq!(conversations[0].id, repeated);
        assert_eq!(
            conversations.iter().filter(|summary| summary.id == repeated).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_load_older_requires_conversation_topic() {
        let (mut session, _) = session(0);
        session.connect(ObservedTopic::AllConversations).await.unwrap();
        assert!(matches!(
            session.load_older(None).await,
            Err(SessionError::NoTopic)
        ));
    }
}
