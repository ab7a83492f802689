use std::{
    io::{self, Write},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use clap::Args;
use shared::models::MessageRole;
use uuid::Uuid;

use crate::{
    client::{ApiClient, DEFAULT_SERVER, ObservedTopic},
    observer::{ObserverSession, SessionUpdate, TranscriptEntry},
    transport::{HistoryClient, Transport},
};

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Message text
    pub text: String,

    /// Conversation to continue; a new one is started when omitted
    #[arg(long, alias = "conv")]
    pub conversation: Option<Uuid>,

    /// Seconds to wait for the reply to finish
    #[arg(long, default_value_t = 120)]
    pub timeout: u64,

    /// ChatRelay server base URL
    #[arg(long, default_value = DEFAULT_SERVER)]
    pub server: String,
}

/// Prints fragments until the run completes. Returns the streamed text.
///
/// # Errors
/// Fails when the run fails or the stream ends before completion.
pub async fn follow_reply<T: Transport, H: HistoryClient>(
    session: &mut ObserverSession<T, H>,
    out: &mut dyn Write,
) -> Result<String> {
    let mut streamed = String::new();

    while let Some(update) = session.next_update().await {
        match update {
            SessionUpdate::Fragment { text, .. } => {
                write!(out, "{text}")?;
                out.flush()?;
                streamed.push_str(&text);
            }
            SessionUpdate::Completed => {
                writeln!(out)?;
                return Ok(streamed.trim().to_string());
            }
            SessionUpdate::Failed(message) => {
                writeln!(out)?;
                bail!("reply failed: {message}");
            }
            SessionUpdate::Closed | SessionUpdate::Errored(_) => break,
            SessionUpdate::ConversationCreated(_) | SessionUpdate::Ignored => {}
        }
    }

    bail!(
        "stream ended before the reply completed{}",
        session
            .last_error()
            .map(|error| format!(": {error}"))
            .unwrap_or_default()
    )
}

/// The persisted reply, if the run already finished before we attached.
fn saved_reply<T: Transport, H: HistoryClient>(session: &ObserverSession<T, H>) -> Option<String> {
    if session.is_streaming() {
        return None;
    }
    match session.transcript().last() {
        Some(TranscriptEntry::Persisted(message)) if message.role == MessageRole::Assistant => {
            Some(message.content.clone())
        }
        _ => None,
    }
}

async fn send(args: &SendArgs, out: &mut dyn Write) -> Result<()> {
    let client = ApiClient::new(&args.server)?;
    let mut session = ObserverSession::new(client.clone(), client.clone());

    if let Some(conversation_id) = args.conversation {
        session
            .connect(ObservedTopic::Conversation(conversation_id))
            .await?;
        client.post_chat(Some(conversation_id), &args.text).await?;
        writeln!(out, "conversation {conversation_id}")?;
        follow_reply(&mut session, out).await?;
        return Ok(());
    }

    // The run starts with the request, so a new conversation is attached
    // after the fact and may already be finished.
    let accepted = client.post_chat(None, &args.text).await?;
    let conversation_id = accepted.conversation_id;
    writeln!(out, "conversation {conversation_id}")?;
    session
        .connect(ObservedTopic::Conversation(conversation_id))
        .await?;
    session.hydrate(Some(2)).await?;

    if let Some(reply) = saved_reply(&session) {
        writeln!(out, "{reply}")?;
        return Ok(());
    }

    let streamed = follow_reply(&mut session, out).await?;
    session.hydrate(Some(2)).await?;
    if let Some(reply) = saved_reply(&session)
        && reply != streamed
    {
        writeln!(out, "(attached mid-reply; full text follows)\n{reply}")?;
    }
    Ok(())
}

/// # Errors
/// Returns an error when the message is rejected, the reply fails, or the
/// timeout elapses.
pub async fn handle_send(args: SendArgs) -> Result<()> {
    let mut stdout = io::stdout();
    tokio::time::timeout(Duration::from_secs(args.timeout), send(&args, &mut stdout))
        .await
        .context("timed out waiting for the reply")?
}
