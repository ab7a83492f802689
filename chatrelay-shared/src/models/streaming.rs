//! Observer-facing stream events and their server-sent-events framing.
//!
//! Every event travels as one frame:
//!
//! ```text
//! event: <kind>
//! data: <JSON>
//!
//! ```
//!
//! with `kind` one of `token`, `done`, `error` or `conversation`.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use super::ConversationSummary;

pub const EVENT_TOKEN: &str = "token";
pub const EVENT_DONE: &str = "done";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_CONVERSATION: &str = "conversation";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct TokenPayload {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct DonePayload {
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ErrorPayload {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ConversationEventPayload {
    #[serde(rename = "type")]
    pub change: String,
    pub conversation: ConversationSummary,
}

/// Event delivered to observers of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// One incremental piece of reply text.
    Fragment(String),
    /// The run finished and its message is persisted.
    Completed,
    /// The run failed; nothing was persisted for it.
    Failed(String),
    /// A conversation was created (all-conversations topic only).
    ConversationCreated(ConversationSummary),
}

#[derive(Debug, Error)]
pub enum StreamEventError {
    #[error("unknown stream event kind '{0}'")]
    UnknownKind(String),
    #[error("malformed '{kind}' payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StreamEvent {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Fragment(_) => EVENT_TOKEN,
            Self::Completed => EVENT_DONE,
            Self::Failed(_) => EVENT_ERROR,
            Self::ConversationCreated(_) => EVENT_CONVERSATION,
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }

    /// Serializes the event into its wire frame.
    ///
    /// # Errors
    /// Returns an error if the payload cannot be serialized to JSON.
    pub fn to_frame(&self) -> Result<SseFrame, serde_json::Error> {
        let data = match self {
            Self::Fragment(token) => serde_json::to_string(&TokenPayload {
                token: token.clone(),
            })?,
            Self::Completed => serde_json::to_string(&DonePayload {
                status: "completed".to_string(),
            })?,
            Self::Failed(message) => serde_json::to_string(&ErrorPayload {
                message: message.clone(),
            })?,
            Self::ConversationCreated(summary) => {
                serde_json::to_string(&ConversationEventPayload {
                    change: "created".to_string(),
                    conversation: summary.clone(),
                })?
            }
        };

        Ok(SseFrame {
            event: self.kind().to_string(),
            data,
        })
    }

    /// Rebuilds an event from a received frame.
    ///
    /// # Errors
    /// Returns an error for unknown kinds or payloads that do not match the kind.
    pub fn from_frame(frame: &SseFrame) -> Result<Self, StreamEventError> {
        let payload_error = |source| StreamEventError::Payload {
            kind: frame.event.clone(),
            source,
        };

        match frame.event.as_str() {
            EVENT_TOKEN => serde_json::from_str::<TokenPayload>(&frame.data)
                .map(|payload| Self::Fragment(payload.token))
                .map_err(payload_error),
            EVENT_DONE => Ok(Self::Completed),
            EVENT_ERROR => serde_json::from_str::<ErrorPayload>(&frame.data)
                .map(|payload| Self::Failed(payload.message))
                .map_err(payload_error),
            EVENT_CONVERSATION => serde_json::from_str::<ConversationEventPayload>(&frame.data)
                .map(|payload| Self::ConversationCreated(payload.conversation))
                .map_err(payload_error),
            other => Err(StreamEventError::UnknownKind(other.to_string())),
        }
    }
}

/// One server-sent-events frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

impl SseFrame {
    #[must_use]
    pub fn encode(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.event, self.data)
    }
}

/// Incremental parser turning a byte stream into [`SseFrame`]s.
///
/// Chunks may split lines and frames at arbitrary points. Comment lines and
/// `id:`/`retry:` fields are ignored; multiple `data:` lines are joined with
/// a newline. Frames without an `event:` field get the kind `message`.
#[derive(Debug, Default)]
pub struct SseFrameParser {
    pending: String,
    carry: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseFrameParser {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes. A multi-byte character split across chunks is held
    /// back until the rest of it arrives.
    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.carry.extend_from_slice(chunk);
        let valid = match std::str::from_utf8(&self.carry) {
            Ok(_) => self.carry.len(),
            Err(err) if err.error_len().is_none() => err.valid_up_to(),
            Err(_) => {
                let text = String::from_utf8_lossy(&self.carry).into_owned();
                self.carry.clear();
                return self.push(&text);
            }
        };
        let rest = self.carry.split_off(valid);
        let text = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry = rest;
        self.push(&text)
    }

    /// Bytes of an incomplete character still waiting for their tail.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.carry.len()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.pending.push_str(chunk);
        let mut frames = Vec::new();

        while let Some(newline) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=newline).collect();
            let line = line.trim_end_matches('\n').trim_end_matches('\r');

            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    frames.push(frame);
                }
            } else if line.starts_with(':') {
                continue;
            } else {
                let (field, value) = line.split_once(':').unwrap_or((line, ""));
                let value = value.strip_prefix(' ').unwrap_or(value);
                match field {
                    "event" => self.event = Some(value.to_string()),
                    "data" => self.data.push(value.to_string()),
                    _ => {}
                }
            }
        }

        frames
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }

        let data = self.data.join("\n");
        self.data.clear();
        Some(SseFrame {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Conversation, Timestamp};
    use uuid::Uuid;

    #[test]
    fn test_wire_format_per_kind() {
        let token = StreamEvent::Fragment("Hello ".into()).to_frame().unwrap();
        assert_eq!(token.encode(), "event: token\ndata: {\"token\":\"Hello \"}\n\n");

        let done = StreamEvent::Completed.to_frame().unwrap();
        assert_eq!(
            done.encode(),
            "event: done\ndata: {\"status\":\"completed\"}\n\n"
        );

        let failed = StreamEvent::Failed("boom".into()).to_frame().unwrap();
        assert_eq!(failed.encode(), "event: error\ndata: {\"message\":\"boom\"}\n\n");
    }

    #[test]
    fn test_conversation_event_payload_shape() {
        let summary = Conversation::new(Uuid::nil(), Timestamp::now()).summary();
        let frame = StreamEvent::ConversationCreated(summary.clone())
            .to_frame()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame.data).unwrap();

        assert_eq!(frame.event, "conversation");
        assert_eq!(value["type"], "created");
        assert_eq!(value["conversation"]["id"], Uuid::nil().to_string());
        assert_eq!(
            StreamEvent::from_frame(&frame).unwrap(),
            StreamEvent::ConversationCreated(summary)
        );
    }

    #[test]
    fn test_terminal_events() {
        assert!(StreamEvent::Completed.is_terminal());
        assert!(StreamEvent::Failed("x".into()).is_terminal());
        assert!(!StreamEvent::Fragment("x".into()).is_terminal());
    }

    #[test]
    fn test_parser_handles_split_chunks_and_comments() {
        let mut parser = SseFrameParser::new();

        assert!(parser.push(": connected to abc\n\nevent: tok").is_empty());
        let frames = parser.push("en\ndata: {\"token\":\"a\"}\n\nevent: done\r\ndata: {}\r\n\r\n");

        assert_eq!(
            frames,
            vec![
                SseFrame {
                    event: "token".into(),
                    data: "{\"token\":\"a\"}".into(),
                },
                SseFrame {
                    event: "done".into(),
                    data: "{}".into(),
                },
            ]
        );
    }

    #[test]
    fn test_parser_defaults_kind_and_joins_data_lines() {
        let mut parser = SseFrameParser::new();
        let frames = parser.push("data: one\ndata: two\n\n");

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "message");
        assert_eq!(frames[0].data, "one\ntwo");
    }

    #[test]
    fn test_from_frame_rejects_unknown_kind() {
        let frame = SseFrame {
            event: "ping".into(),
            data: "{}".into(),
        };

        assert!(matches!(
            StreamEvent::from_frame(&frame),
            Err(StreamEventError::UnknownKind(kind)) if kind == "ping"
        ));
    }

    #[test]
    fn test_parser_holds_split_characters() {
        let frame = "data: {\"token\":\"é\"}\n\n".as_bytes();
        let split = frame.iter().position(|byte| *byte >= 0x80).unwrap() + 1;
        let mut parser = SseFrameParser::new();

        assert!(parser.push_bytes(&frame[..split]).is_empty());
        assert_eq!(parser.pending_bytes(), 1);

        let frames = parser.push_bytes(&frame[split..]);
        assert_eq!(parser.pending_bytes(), 0);
        assert_eq!(frames[0].data, "{\"token\":\"é\"}");
    }
}
