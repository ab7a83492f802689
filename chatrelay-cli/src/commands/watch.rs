use std::{
    collections::HashSet,
    io::{self, Write},
    time::Duration,
};

use anyhow::{Result, bail};
use clap::Args;
use shared::models::{ConversationSummary, Message, Timestamp};
use tokio::time::sleep;
use tracing::warn;
use uuid::Uuid;

use crate::{
    client::{ApiClient, DEFAULT_SERVER, ObservedTopic},
    observer::{ObserverSession, SessionUpdate, TranscriptEntry},
    transport::{HistoryClient, Transport},
};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Conversation to follow; all conversations when omitted
    #[arg(long, alias = "conv")]
    pub conversation: Option<Uuid>,

    /// Messages to backfill on each (re)connect
    #[arg(long, default_value_t = 10)]
    pub limit: i64,

    /// Give up after this many consecutive failed reconnects
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// ChatRelay server base URL
    #[arg(long, default_value = DEFAULT_SERVER)]
    pub server: String,
}

/// Tracks what has already been shown so reconnect backfills only print
/// what was missed.
#[derive(Debug, Default)]
struct Printer {
    last_message: Option<(Timestamp, u64)>,
    known_conversations: HashSet<Uuid>,
}

fn persisted_after(
    transcript: &[TranscriptEntry],
    last: Option<(Timestamp, u64)>,
) -> impl Iterator<Item = &Message> {
    transcript.iter().filter_map(move |entry| match entry {
        TranscriptEntry::Persisted(message)
            if last.is_none_or(|position| message.position() > position) =>
        {
            Some(message)
        }
        _ => None,
    })
}

impl Printer {
    fn print_new(&mut self, transcript: &[TranscriptEntry], out: &mut dyn Write) -> io::Result<()> {
        for message in persisted_after(transcript, self.last_message) {
            writeln!(out, "{}: {}", message.role, message.content)?;
        }
        self.skip_to_latest(transcript);
        Ok(())
    }

    fn skip_to_latest(&mut self, transcript: &[TranscriptEntry]) {
        if let Some(latest) = persisted_after(transcript, self.last_message).last() {
            self.last_message = Some(latest.position());
        }
    }

    fn print_conversation(&mut self, summary: &ConversationSummary, out: &mut dyn Write) -> io::Result<()> {
        if !self.known_conversations.insert(summary.id) {
            return Ok(());
        }
        let preview = summary
            .last_message
            .as_ref()
            .map(|last| last.content.as_str())
            .unwrap_or_default();
        writeln!(
            out,
            "[{}] {} ({} messages) {preview}",
            summary.updated_at, summary.id, summary.messages_count
        )
    }

    fn print_conversations(&mut self, listed: &[ConversationSummary], out: &mut dyn Write) -> io::Result<()> {
        for summary in listed.iter().rev() {
            self.print_conversation(summary, out)?;
        }
        Ok(())
    }
}

async fn backfill<T: Transport, H: HistoryClient>(
    session: &mut ObserverSession<T, H>,
    printer: &mut Printer,
    limit: i64,
    out: &mut dyn Write,
) -> Result<()> {
    session.hydrate(Some(limit)).await?;
    match session.topic() {
        Some(ObservedTopic::AllConversations) => {
            printer.print_conversations(session.conversations(), out)?;
        }
        _ => printer.print_new(session.transcript(), out)?,
    }
    Ok(())
}

/// Prints updates until the stream closes or errors.
async fn pump<T: Transport, H: HistoryClient>(
    session: &mut ObserverSession<T, H>,
    printer: &mut Printer,
    limit: i64,
    out: &mut dyn Write,
) -> Result<()> {
    while let Some(update) = session.next_update().await {
        match update {
            SessionUpdate::Fragment { text, started } => {
                if started {
                    // The prompt was stored before the run started.
                    if let Err(err) = backfill(session, printer, limit, out).await {
                        warn!(error = %err, "failed to backfill before reply");
                    }
                    write!(out, "assistant: ")?;
                }
                write!(out, "{text}")?;
                out.flush()?;
            }
            SessionUpdate::Completed => {
                writeln!(out)?;
                match session.hydrate(Some(limit)).await {
                    Ok(()) => printer.skip_to_latest(session.transcript()),
                    Err(err) => warn!(error = %err, "failed to refresh after reply"),
                }
            }
            SessionUpdate::Failed(message) => {
                writeln!(out)?;
                writeln!(out, "[reply failed: {message}]")?;
            }
            SessionUpdate::ConversationCreated(summary) => {
                printer.print_conversation(&summary, out)?;
            }
            SessionUpdate::Closed => {
                writeln!(out, "[stream closed]")?;
            }
            SessionUpdate::Errored(message) => {
                writeln!(out, "[stream error: {message}]")?;
            }
            SessionUpdate::Ignored => {}
        }
    }
    Ok(())
}

/// Keeps a session attached to `topic`, reconnecting with exponential
/// backoff and backfilling history after every reconnect.
///
/// # Errors
/// Fails once `max_retries` consecutive reconnects have failed.
pub async fn watch<T: Transport, H: HistoryClient>(
    session: &mut ObserverSession<T, H>,
    topic: ObservedTopic,
    limit: i64,
    max_retries: Option<u32>,
    out: &mut dyn Write,
) -> Result<()> {
    let mut printer = Printer::default();
    let mut backoff = INITIAL_BACKOFF;
    let mut failures: u32 = 0;
    let mut result = session.connect(topic).await;

    loop {
        match result {
            Ok(()) => {
                backoff = INITIAL_BACKOFF;
                failures = 0;
                if let Err(err) = backfill(session, &mut printer, limit, out).await {
                    warn!(error = %err, "history backfill failed");
                }
                pump(session, &mut printer, limit, out).await?;
            }
            Err(err) => {
                failures += 1;
                writeln!(out, "[connect failed: {err}]")?;
                if max_retries.is_some_and(|max| failures > max) {
                    bail!("giving up after {failures} failed attempts: {err}");
                }
            }
        }

        sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
        result = session.reconnect().await;
    }
}

/// # Errors
/// Returns an error when the server URL is invalid or retries run out.
pub async fn handle_watch(args: WatchArgs) -> Result<()> {
    let client = ApiClient::new(&args.server)?;
    let topic = args
        .conversation
        .map_or(ObservedTopic::AllConversations, ObservedTopic::Conversation);
    let mut session = ObserverSession::new(client.clone(), client);
    let mut stdout = io::stdout();

    println!("Watching {topic:?}... (press Ctrl+C to stop)");
    tokio::select! {
        result = watch(&mut session, topic, args.limit, args.max_retries, &mut stdout) => result,
        _ = tokio::signal::ctrl_c() => Ok(()),
    }
}
