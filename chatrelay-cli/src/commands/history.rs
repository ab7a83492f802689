use std::io::{self, Write};

use anyhow::Result;
use clap::Args;
use shared::models::{Message, PageCursor};
use uuid::Uuid;

use crate::{
    client::{ApiClient, DEFAULT_SERVER},
    transport::HistoryClient,
};

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Conversation identifier
    #[arg(long, alias = "conv")]
    pub conversation: Uuid,

    /// Messages per page (the server clamps it to its bounds)
    #[arg(long)]
    pub limit: Option<i64>,

    /// Keep paging backwards until the first message
    #[arg(long)]
    pub all: bool,

    /// ChatRelay server base URL
    #[arg(long, default_value = DEFAULT_SERVER)]
    pub server: String,
}

/// Messages collected by walking pages backwards, oldest first.
#[derive(Debug, Default)]
pub struct Collected {
    pub messages: Vec<Message>,
    pub total: usize,
    pub has_more: bool,
}

/// Reads the newest page and, with `all`, every older one.
///
/// # Errors
/// Returns the first history failure.
pub async fn collect_history<H: HistoryClient>(
    history: &H,
    conversation_id: Uuid,
    limit: Option<i64>,
    all: bool,
) -> Result<Collected> {
    let mut collected = Collected::default();
    let mut cursor: Option<PageCursor> = None;

    loop {
        let page = history.page(conversation_id, cursor.as_ref(), limit).await?;
        collected.total = page.total;
        collected.has_more = page.has_more;
        collected.messages.splice(0..0, page.messages);

        match page.next_cursor {
            Some(next) if all && page.has_more => cursor = Some(next),
            _ => break,
        }
    }

    Ok(collected)
}

pub fn render_history(collected: &Collected, out: &mut dyn Write) -> io::Result<()> {
    if collected.messages.is_empty() {
        writeln!(out, "No messages yet.")?;
        return Ok(());
    }

    for message in &collected.messages {
        writeln!(
            out,
            "[{}] {}: {}",
            message.created_at, message.role, message.content
        )?;
    }
    if collected.has_more {
        writeln!(
            out,
            "({} of {} messages shown; pass --all for the rest)",
            collected.messages.len(),
            collected.total
        )?;
    }
    Ok(())
}

/// # Errors
/// Returns an error when the server is unreachable or rejects the request.
pub async fn handle_history(args: HistoryArgs) -> Result<()> {
    let client = ApiClient::new(&args.server)?;
    let collected = collect_history(&client, args.conversation, args.limit, args.all).await?;
    render_history(&collected, &mut io::stdout().lock())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::testing::FakeHistory;

    #[tokio::test]
    async fn test_single_page_reports_more() {
        let history = FakeHistory::with_messages(5);
        let collected = collect_history(&history, Uuid::new_v4(), Some(2), false)
            .await
            .unwrap();

        let contents: Vec<&str> = collected.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
        assert!(collected.has_more);
        assert_eq!(collected.total, 5);

        let mut out = Vec::<u8>::new();
        render_history(&collected, &mut out).unwrap();
        let rendered = String::from_utf8(out).unwrap();
        assert!(rendered.contains("user: m4"));
        assert!(rendered.contains("2 of 5 messages shown"));
    }

    #[tokio::test]
    async fn test_all_walks_to_the_first_message() {
        let history = FakeHistory::with_messages(5);
        let collected = collect_history(&history, Uuid::new_v4(), Some(2), true)
            .await
            .unwrap();

        let contents: Vec<&str> = collected.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m0", "m1", "m2", "m3", "m4"]);
        assert!(!collected.has_more);
    }

    #[test]
    fn test_empty_history_says_so() {
        let mut out = Vec::<u8>::new();
        render_history(&Collected::default(), &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "No messages yet.\n");
    }
}
