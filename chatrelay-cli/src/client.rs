//! HTTP client for the ChatRelay API.

use anyhow::{Context, Result, anyhow};
use reqwest::{Client, Response, header::ACCEPT};
use shared::models::{
    ChatAccepted, ChatRequest, ConversationSummary, ErrorResponse, MessagesPage, PageCursor,
};
use url::Url;
use uuid::Uuid;

pub const DEFAULT_SERVER: &str = "http://localhost:8080";

/// Topic an observer can follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedTopic {
    Conversation(Uuid),
    AllConversations,
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base: Url,
}

impl ApiClient {
    /// # Errors
    /// Returns an error when `server` is not an absolute URL.
    pub fn new(server: &str) -> Result<Self> {
        let mut base = Url::parse(server).context("invalid server URL")?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("invalid endpoint '{path}'"))
    }

    /// URL of the SSE endpoint for `topic`.
    ///
    /// # Errors
    /// Returns an error if the URL cannot be built.
    pub fn stream_url(&self, topic: ObservedTopic) -> Result<Url> {
        match topic {
            ObservedTopic::Conversation(id) => self.endpoint(&format!("chat/stream/{id}")),
            ObservedTopic::AllConversations => self.endpoint("conversations/stream"),
        }
    }

    /// # Errors
    /// Returns an error when the request fails or the server rejects it.
    pub async fn post_chat(&self, conversation_id: Option<Uuid>, input: &str) -> Result<ChatAccepted> {
        let body = ChatRequest {
            conversation_id: conversation_id.map(|id| id.to_string()),
            input: input.to_string(),
        };
        let response = self
            .http
            .post(self.endpoint("chat")?)
            .json(&body)
            .send()
            .await
            .context("failed to send message")?;
        Ok(checked(response).await?.json().await?)
    }

    /// # Errors
    /// Returns an error when the request fails or the server rejects it.
    pub async fn get_page(
        &self,
        conversation_id: Uuid,
        before: Option<&PageCursor>,
        limit: Option<i64>,
    ) -> Result<MessagesPage> {
        let mut request = self.http.get(self.endpoint(&format!("chat/{conversation_id}"))?);
        if let Some(before) = before {
            request = request.query(&[("before", before.to_string())]);
        }
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit)]);
        }

        let response = request.send().await.context("failed to fetch history")?;
        Ok(checked(response).await?.json().await?)
    }

    /// # Errors
    /// Returns an error when the request fails or the server rejects it.
    pub async fn list_conversations(&self, limit: Option<i64>) -> Result<Vec<ConversationSummary>> {
        let mut request = self.http.get(self.endpoint("conversations")?);
        if let Some(limit) = limit {
            request = request.query(&[("limit", limit)]);
        }

        let response = request
            .send()
            .await
            .context("failed to list conversations")?;
        Ok(checked(response).await?.json().await?)
    }

    /// Opens the event stream for `topic`.
    ///
    /// # Errors
    /// Returns an error when the connection fails or the server rejects it.
    pub async fn open_stream(&self, topic: ObservedTopic) -> Result<Response> {
        let response = self
            .http
            .get(self.stream_url(topic)?)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .context("failed to open event stream")?;
        checked(response).await
    }
}

/// Turns an error status into an error carrying the server's message.
async fn checked(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorResponse>(&body) {
        Ok(error) => Err(anyhow!("{status}: {} ({})", error.message, error.code)),
        Err(_) => Err(anyhow!("{status}: {body}")),
    }
}
