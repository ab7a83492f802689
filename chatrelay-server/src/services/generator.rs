//! Reply generators: anything that turns user input into a finite, lazy
//! sequence of text fragments that may fail part way through.

use std::{pin::Pin, sync::Arc, time::Duration};

use async_stream::stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use shared::{
    config::server::{GeneratorConfig, GeneratorKind, RemoteGeneratorConfig},
    models::SseFrameParser,
};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SIMULATED_TEMPLATE: &str =
    "Simulated assistant reply for your message. Streaming tokens one by one. Detail:";
const REMOTE_DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("generator configuration error: {0}")]
    Config(String),
    #[error("generator request failed: {0}")]
    Request(String),
    #[error("generator stream failed: {0}")]
    Stream(String),
    #[error("generation timed out after {0:?}")]
    TimedOut(Duration),
}

pub type GeneratorResult<T> = Result<T, GeneratorError>;

/// Lazily produced reply fragments.
pub type FragmentStream = Pin<Box<dyn Stream<Item = GeneratorResult<String>> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyRequest {
    pub conversation_id: Uuid,
    pub input: String,
}

#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Opens a fragment stream for `request`. Failures before the first
    /// fragment are returned here; later ones arrive as stream items.
    async fn generate(&self, request: ReplyRequest) -> GeneratorResult<FragmentStream>;

    fn name(&self) -> &'static str;
}

pub type SharedGenerator = Arc<dyn ReplyGenerator>;

/// Builds the generator selected by `config.kind`.
///
/// # Errors
/// Returns [`GeneratorError::Config`] when the remote generator lacks an API key
/// or its HTTP client cannot be built.
pub fn from_config(config: &GeneratorConfig) -> GeneratorResult<SharedGenerator> {
    let generator: SharedGenerator = match config.kind {
        GeneratorKind::Simulated => Arc::new(SimulatedGenerator::new(Duration::from_millis(
            config.fragment_delay_ms,
        ))),
        GeneratorKind::Remote => Arc::new(RemoteGenerator::new(&config.remote)?),
    };
    info!(generator = generator.name(), "reply generator selected");
    Ok(generator)
}

/// Streams a fixed template reply word by word with a pacing delay.
#[derive(Debug, Clone)]
pub struct SimulatedGenerator {
    delay: Duration,
}

impl SimulatedGenerator {
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }

    fn fragments(input: &str) -> Vec<String> {
        format!("{SIMULATED_TEMPLATE} {input}")
            .split(' ')
            .map(|word| format!("{word} "))
            .collect()
    }
}

#[async_trait]
impl ReplyGenerator for SimulatedGenerator {
    async fn generate(&self, request: ReplyRequest) -> GeneratorResult<FragmentStream> {
        let delay = self.delay;
        let fragments = Self::fragments(&request.input);
        debug!(
            conversation_id = %request.conversation_id,
            fragments = fragments.len(),
            "simulated reply prepared"
        );

        let stream = stream! {
            for fragment in fragments {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok::<String, GeneratorError>(fragment);
            }
        };
        Ok(Box::pin(stream))
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

/// Streams from an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct RemoteGenerator {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    delta: CompletionDelta,
}

#[derive(Debug, Default, Deserialize)]
struct CompletionDelta {
    content: Option<String>,
}

impl RemoteGenerator {
    /// # Errors
    /// Returns [`GeneratorError::Config`] for a missing API key or client build failure.
    pub fn new(config: &RemoteGeneratorConfig) -> GeneratorResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| GeneratorError::Config("remote generator requires an API key".into()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds.max(1)))
            .build()
            .map_err(|err| GeneratorError::Config(err.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
        })
    }

    /// Extracts the text delta carried by one `data:` payload. `None` marks the
    /// end of the stream.
    fn parse_payload(data: &str) -> GeneratorResult<Option<String>> {
        if data.trim() == REMOTE_DONE_SENTINEL {
            return Ok(None);
        }
        let chunk: CompletionChunk = serde_json::from_str(data)
            .map_err(|err| GeneratorError::Stream(format!("malformed completion chunk: {err}")))?;
        Ok(Some(
            chunk
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.delta.content)
                .unwrap_or_default(),
        ))
    }
}

#[async_trait]
impl ReplyGenerator for RemoteGenerator {
    async fn generate(&self, request: ReplyRequest) -> GeneratorResult<FragmentStream> {
        let body = json!({
            "model": self.model,
            "stream": true,
            "messages": [{ "role": "user", "content": request.input }],
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| GeneratorError::Request(err.to_string()))?
            .error_for_status()
            .map_err(|err| GeneratorError::Request(err.to_string()))?;

        debug!(
            conversation_id = %request.conversation_id,
            model = %self.model,
            "remote completion stream opened"
        );

        let mut bytes = response.bytes_stream();
        let stream = stream! {
            let mut parser = SseFrameParser::new();

            'read: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        yield Err(GeneratorError::Stream(err.to_string()));
                        break 'read;
                    }
                };
                for frame in parser.push_bytes(&chunk) {
                    match RemoteGenerator::parse_payload(&frame.data) {
                        Ok(Some(content)) if content.is_empty() => {}
                        Ok(Some(content)) => {
                            yield Ok::<String, GeneratorError>(content);
                        }
                        Ok(None) => break 'read,
                        Err(err) => {
                            yield Err(err);
                            break 'read;
                        }
                    }
                }
            }

            if parser.pending_bytes() > 0 {
                warn!(bytes = parser.pending_bytes(), "remote stream ended inside a UTF-8 sequence");
            }
        };
        Ok(Box::pin(stream))
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}
