use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use utoipa::{
    PartialSchema, ToSchema,
    openapi::{ObjectBuilder, RefOr, Schema, schema::Type},
};
use uuid::Uuid;

use super::{Message, Timestamp};

const SEQUENCE_SEPARATOR: char = '~';

/// Exclusive upper bound for backward history paging.
///
/// Rendered as the RFC 3339 creation time of the oldest delivered message,
/// followed by `~<sequence>` when the pager issued it. A bare timestamp is
/// also accepted and excludes everything created at or after that instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub created_at: Timestamp,
    pub sequence: Option<u64>,
}

impl PageCursor {
    #[must_use]
    pub const fn at(message: &Message) -> Self {
        Self {
            created_at: message.created_at,
            sequence: Some(message.sequence),
        }
    }

    /// Whether `message` sorts strictly before this cursor.
    #[must_use]
    pub fn admits(&self, message: &Message) -> bool {
        match self.sequence {
            Some(sequence) => message.position() < (self.created_at, sequence),
            None => message.created_at < self.created_at,
        }
    }
}

impl PartialSchema for PageCursor {
    fn schema() -> RefOr<Schema> {
        RefOr::T(Schema::Object(
            ObjectBuilder::new()
                .schema_type(Type::String)
                .description(Some("Exclusive history bound: `<rfc3339>~<sequence>`"))
                .examples(["2025-03-08T14:30:00.120Z~3"])
                .build(),
        ))
    }
}

impl ToSchema for PageCursor {}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CursorError {
    #[error("cursor timestamp is not RFC 3339: {0}")]
    Timestamp(String),
    #[error("cursor sequence is not a number: {0}")]
    Sequence(String),
}

impl Display for PageCursor {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self.sequence {
            Some(sequence) => write!(f, "{}{SEQUENCE_SEPARATOR}{sequence}", self.created_at),
            None => write!(f, "{}", self.created_at),
        }
    }
}

impl FromStr for PageCursor {
    type Err = CursorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let (time, sequence) = match value.split_once(SEQUENCE_SEPARATOR) {
            Some((time, sequence)) => {
                let sequence = sequence
                    .parse::<u64>()
                    .map_err(|_| CursorError::Sequence(sequence.to_string()))?;
                (time, Some(sequence))
            }
            None => (value, None),
        };

        let created_at =
            Timestamp::parse(time).map_err(|_| CursorError::Timestamp(time.to_string()))?;
        Ok(Self {
            created_at,
            sequence,
        })
    }
}

impl Serialize for PageCursor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PageCursor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One page of a conversation's history, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MessagesPage {
    pub conversation_id: Uuid,
    pub messages: Vec<Message>,
    pub total: usize,
    pub has_more: bool,
    pub next_cursor: Option<PageCursor>,
}
