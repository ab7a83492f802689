//! Drives reply-generation runs, one per conversation at a time.
//!
//! A run pulls fragments from the generator, broadcasts each one in order,
//! persists the trimmed reply once the generator is exhausted and finally
//! emits `done`. A failing run persists nothing and ends with a single
//! `error` event. The run slot is released right after the terminal event
//! is broadcast, so `done`/`error` is always the last event of its run.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use futures::StreamExt;
use metrics::{counter, gauge, histogram};
use shared::models::{MessageRole, Timestamp};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{
    broadcaster::StreamBroadcaster,
    generator::{GeneratorError, ReplyRequest, SharedGenerator},
    store::{SharedStore, StoreError},
};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("a reply is already streaming for conversation {0}")]
    Conflict(Uuid),
    #[error(transparent)]
    Generator(#[from] GeneratorError),
    #[error("failed to persist reply: {0}")]
    Persistence(#[from] StoreError),
}

impl StreamError {
    const fn reason(&self) -> &'static str {
        match self {
            Self::Conflict(_) => "conflict",
            Self::Generator(GeneratorError::TimedOut(_)) => "timeout",
            Self::Generator(_) => "generator",
            Self::Persistence(_) => "persistence",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RunState {
    run_id: Uuid,
    started_at: Instant,
}

/// Summary of a run that completed and was persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub fragments: usize,
    pub content: String,
}

pub struct ResponseStreamController {
    runs: Mutex<HashMap<Uuid, RunState>>,
    broadcaster: StreamBroadcaster,
    store: SharedStore,
    generator: SharedGenerator,
    run_timeout: Option<Duration>,
}

pub type SharedStreamController = Arc<ResponseStreamController>;

impl ResponseStreamController {
    pub fn new(
        broadcaster: StreamBroadcaster,
        store: SharedStore,
        generator: SharedGenerator,
        run_timeout: Option<Duration>,
    ) -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            broadcaster,
            store,
            generator,
            run_timeout: run_timeout.filter(|limit| !limit.is_zero()),
        }
    }

    /// Reserves the run slot for `conversation_id`.
    ///
    /// The slot stays taken until the returned guard finishes its run or is
    /// dropped.
    ///
    /// # Errors
    /// Returns [`StreamError::Conflict`] when a run is already active.
    pub fn begin_run(self: &Arc<Self>, conversation_id: Uuid) -> Result<RunGuard, StreamError> {
        let state = RunState {
            run_id: Uuid::new_v4(),
            started_at: Instant::now(),
        };

        let active = {
            let mut runs = self.lock();
            if runs.contains_key(&conversation_id) {
                drop(runs);
                counter!("chatrelay_stream_run_conflicts_total").increment(1);
                warn!(%conversation_id, "rejecting run; one is already active");
                return Err(StreamError::Conflict(conversation_id));
            }
            runs.insert(conversation_id, state);
            runs.len()
        };

        counter!("chatrelay_stream_runs_started_total").increment(1);
        gauge!("chatrelay_stream_active_runs").set(usize_to_f64(active));
        debug!(%conversation_id, run_id = %state.run_id, "run slot reserved");

        Ok(RunGuard {
            controller: Arc::clone(self),
            conversation_id,
            state,
            released: false,
        })
    }

    /// Reserves the slot and runs generation in the background.
    ///
    /// # Errors
    /// Returns [`StreamError::Conflict`] when a run is already active.
    pub fn start_run(
        self: &Arc<Self>,
        conversation_id: Uuid,
        input: String,
    ) -> Result<JoinHandle<()>, StreamError> {
        let guard = self.begin_run(conversation_id)?;
        Ok(self.spawn_run(guard, input))
    }

    /// Runs a previously reserved slot on a background task. Failures are
    /// logged; observers learn about them through the `error` event.
    pub fn spawn_run(self: &Arc<Self>, guard: RunGuard, input: String) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let conversation_id = guard.conversation_id;
            if let Err(err) = controller.execute(guard, input).await {
                error!(%conversation_id, error = %err, "reply run failed");
            }
        })
    }

    /// Executes one run to completion or failure.
    ///
    /// # Errors
    /// Returns the generator or persistence failure after the `error` event
    /// has been emitted.
    #[instrument(skip(self, guard, input), fields(conversation_id = %guard.conversation_id, run_id = %guard.state.run_id))]
    pub async fn execute(&self, guard: RunGuard, input: String) -> Result<RunOutcome, StreamError> {
        let conversation_id = guard.conversation_id;
        let request = ReplyRequest {
            conversation_id,
            input,
        };

        let generated = match self.run_timeout {
            Some(limit) => tokio::time::timeout(limit, self.pump(request))
                .await
                .unwrap_or(Err(GeneratorError::TimedOut(limit))),
            None => self.pump(request).await,
        };

        let result = match generated {
            Ok((text, fragments)) => {
                let content = text.trim().to_string();
                let persisted = self
                    .store
                    .append_message(
                        conversation_id,
                        MessageRole::Assistant,
                        &content,
                        Timestamp::now(),
                    )
                    .await;
                persisted
                    .map(|_| RunOutcome {
                        run_id: guard.state.run_id,
                        fragments,
                        content,
                    })
                    .map_err(StreamError::from)
            }
            Err(err) => Err(StreamError::from(err)),
        };

        // The terminal event goes out while the slot is still held, so the
        // next run's fragments can never overtake it.
        match &result {
            Ok(_) => {
                self.broadcaster.emit_completed(conversation_id);
            }
            Err(err) => {
                self.broadcaster
                    .emit_failed(conversation_id, &observer_message(err));
            }
        }

        let elapsed = guard.finish();
        histogram!("chatrelay_stream_run_duration_ms").record(elapsed.as_secs_f64() * 1000.0);

        match result {
            Ok(outcome) => {
                counter!("chatrelay_stream_runs_completed_total").increment(1);
                info!(
                    fragments = outcome.fragments,
                    chars = outcome.content.len(),
                    elapsed_ms = elapsed.as_millis(),
                    "reply persisted"
                );
                Ok(outcome)
            }
            Err(err) => {
                counter!("chatrelay_stream_runs_failed_total", "reason" => err.reason())
                    .increment(1);
                Err(err)
            }
        }
    }

    /// Pulls fragments in order, broadcasting each one as it arrives.
    async fn pump(&self, request: ReplyRequest) -> Result<(String, usize), GeneratorError> {
        let conversation_id = request.conversation_id;
        let mut stream = self.generator.generate(request).await?;
        let mut text = String::new();
        let mut fragments = 0_usize;

        while let Some(fragment) = stream.next().await {
            let fragment = fragment?;
            text.push_str(&fragment);
            fragments += 1;
            self.broadcaster.emit_fragment(conversation_id, &fragment);
        }

        Ok((text, fragments))
    }

    pub fn is_running(&self, conversation_id: Uuid) -> bool {
        self.lock().contains_key(&conversation_id)
    }

    /// Conversations with an active run.
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.lock().keys().copied().collect()
    }

    pub fn generator_name(&self) -> &'static str {
        self.generator.name()
    }

    fn release(&self, conversation_id: Uuid, run_id: Uuid) {
        let remaining = {
            let mut runs = self.lock();
            if runs
                .get(&conversation_id)
                .is_some_and(|state| state.run_id == run_id)
            {
                runs.remove(&conversation_id);
            }
            runs.len()
        };
        gauge!("chatrelay_stream_active_runs").set(usize_to_f64(remaining));
        debug!(%conversation_id, %run_id, "run slot released");
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, RunState>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ResponseStreamController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStreamController")
            .field("generator", &self.generator.name())
            .field("run_timeout", &self.run_timeout)
            .field("active_runs", &self.lock().len())
            .finish_non_exhaustive()
    }
}

/// Ownership of a conversation's run slot.
///
/// Dropping the guard without running it (for example when persisting the
/// user message fails) frees the slot.
pub struct RunGuard {
    controller: SharedStreamController,
    conversation_id: Uuid,
    state: RunState,
    released: bool,
}

impl RunGuard {
    #[must_use]
    pub const fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    #[must_use]
    pub const fn run_id(&self) -> Uuid {
        self.state.run_id
    }

    fn finish(mut self) -> Duration {
        self.released = true;
        self.controller
            .release(self.conversation_id, self.state.run_id);
        self.state.started_at.elapsed()
    }
}

impl std::fmt::Debug for RunGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunGuard")
            .field("conversation_id", &self.conversation_id)
            .field("run_id", &self.state.run_id)
            .finish_non_exhaustive()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.released {
            self.controller
                .release(self.conversation_id, self.state.run_id);
        }
    }
}

fn observer_message(err: &StreamError) -> String {
    match err {
        StreamError::Persistence(_) => "failed to save the assistant reply".to_string(),
        other => other.to_string(),
    }
}

#[allow(clippy::cast_precision_loss)]
fn usize_to_f64(value: usize) -> f64 {
    value as f64
}
