//! Generation Orchestrator
//!
//! Runs one generation per claimed message: loads history, calls the
//! provider, forwards content bytes to the requesting client, mirrors them
//! into the chunk log, batches record-store writes and watches for stop
//! requests. Every run ends with exactly one terminal write attempt.
//!
//! # Run Loop
//!
//! ```text
//!   claim (pending → streaming)
//!        │
//!   load history ─► resolve profile ─► provider.send_streaming(cancel)
//!        │
//!   ┌────▼───────────────────────────────────────────┐
//!   │ select { next token | stop-poll tick }          │
//!   │   stop requested?  ──► Stopped                  │
//!   │   content   ─► accumulate, client, chunk log    │
//!   │   reasoning ─► accumulate                       │
//!   │   finish    ─► Completed | Failed               │
//!   │   flush when size or interval trigger fires     │
//!   └────┬───────────────────────────────────────────┘
//!        │  (hard ceiling wraps the whole loop)
//!   cancel provider ─► finalize ─► completion marker ─► clear stop flag
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::flush::Accumulator;
use crate::backend::{ChatTurn, LlmBackend, LlmRequest, StreamingToken};
use crate::capabilities::{CapabilityProfile, ModelCatalog, StaticModelCatalog};
use crate::chunk_log::ChunkLog;
use crate::config::GenerationSettings;
use crate::messages::{MessageId, MessageStatus, StopReason, ThreadId};
use crate::stop_signal::StopSignal;
use crate::store::{MessagePatch, MessageStore, StoreError};

// ============================================================================
// Requests, Results, Errors
// ============================================================================

/// Request to generate the content of a pending assistant message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerateRequest {
    /// Thread the message belongs to
    pub thread_id: ThreadId,
    /// Placeholder to fill
    pub message_id: MessageId,
    /// Provider model id
    pub model: String,
    /// Explicit history; replaces the store lookup when present
    pub history: Option<Vec<ChatTurn>>,
}

impl GenerateRequest {
    /// Create a request that loads history from the store
    pub fn new(thread_id: ThreadId, message_id: MessageId, model: impl Into<String>) -> Self {
        Self {
            thread_id,
            message_id,
            model: model.into(),
            history: None,
        }
    }

    /// Supply the history explicitly
    #[must_use]
    pub fn with_history(mut self, history: Vec<ChatTurn>) -> Self {
        self.history = Some(history);
        self
    }
}

/// Why a generation ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// Provider finished cleanly
    Completed,
    /// A stop request was observed
    Stopped,
    /// Provider or persistence failure
    Failed {
        /// What went wrong
        reason: String,
    },
    /// The hard ceiling elapsed
    TimedOut,
    /// The record was finalized by someone else; this run stopped writing
    Superseded,
}

impl GenerationOutcome {
    /// Terminal status and stop reason this outcome persists
    ///
    /// `None` for [`GenerationOutcome::Superseded`], which writes nothing.
    #[must_use]
    pub fn final_state(&self) -> Option<(MessageStatus, StopReason)> {
        match self {
            Self::Completed => Some((MessageStatus::Done, StopReason::Completed)),
            Self::Stopped => Some((MessageStatus::Done, StopReason::Stopped)),
            Self::Failed { .. } | Self::TimedOut => Some((MessageStatus::Error, StopReason::Error)),
            Self::Superseded => None,
        }
    }
}

/// Summary of one finished generation
#[derive(Clone, Debug)]
pub struct GenerationReport {
    /// Message that was generated
    pub message_id: MessageId,
    /// How it ended
    pub outcome: GenerationOutcome,
    /// Characters of content accumulated
    pub content_len: usize,
    /// Characters of reasoning accumulated
    pub reasoning_len: usize,
    /// Content chunks forwarded
    pub chunks: u32,
    /// Successful intermediate store writes
    pub flushes: u32,
    /// Whether the requesting client went away or fell behind mid-stream
    pub client_detached: bool,
    /// Wall time from claim to finalization
    pub elapsed: Duration,
}

/// Errors starting a generation
#[derive(Debug, Error)]
pub enum GenerationError {
    /// Unknown message
    #[error("message not found: {0}")]
    NotFound(MessageId),

    /// The message is not pending or its thread already streams
    #[error("message {0} already has (or had) a generation")]
    AlreadyActive(MessageId),

    /// The request is inconsistent with the stored record
    #[error("invalid generation request: {0}")]
    InvalidRequest(String),

    /// The record store failed
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The generation task panicked or was aborted
    #[error("generation task failed: {0}")]
    TaskFailed(String),
}

/// A running generation
pub struct GenerationHandle {
    /// Message being generated
    pub message_id: MessageId,
    /// Raw content bytes, in emission order; closes after finalization
    pub output: mpsc::Receiver<String>,
    task: JoinHandle<GenerationReport>,
}

impl GenerationHandle {
    /// Split into the output stream and the task handle
    #[must_use]
    pub fn into_parts(self) -> (mpsc::Receiver<String>, JoinHandle<GenerationReport>) {
        (self.output, self.task)
    }

    /// Wait for the run to finish, discarding unread output
    pub async fn join(self) -> Result<GenerationReport, GenerationError> {
        let (output, task) = self.into_parts();
        drop(output);
        task.await
            .map_err(|e| GenerationError::TaskFailed(e.to_string()))
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Starts and supervises generations
pub struct Orchestrator<B: LlmBackend> {
    backend: Arc<B>,
    store: Arc<dyn MessageStore>,
    chunk_log: Arc<dyn ChunkLog>,
    stop_signal: Arc<dyn StopSignal>,
    catalog: Arc<dyn ModelCatalog>,
    settings: GenerationSettings,
}

impl<B: LlmBackend> Clone for Orchestrator<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            store: Arc::clone(&self.store),
            chunk_log: Arc::clone(&self.chunk_log),
            stop_signal: Arc::clone(&self.stop_signal),
            catalog: Arc::clone(&self.catalog),
            settings: self.settings.clone(),
        }
    }
}

impl<B: LlmBackend + 'static> Orchestrator<B> {
    /// Create an orchestrator; every model resolves to the standard profile
    /// until a catalog is attached
    pub fn new(
        backend: Arc<B>,
        store: Arc<dyn MessageStore>,
        chunk_log: Arc<dyn ChunkLog>,
        stop_signal: Arc<dyn StopSignal>,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            backend,
            store,
            chunk_log,
            stop_signal,
            catalog: Arc::new(StaticModelCatalog::new()),
            settings,
        }
    }

    /// Attach a model catalog for capability profiles
    #[must_use]
    pub fn with_catalog(mut self, catalog: Arc<dyn ModelCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Active settings
    #[must_use]
    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    /// Claim the message and spawn its generation
    ///
    /// Fails with [`GenerationError::AlreadyActive`] unless the message is
    /// pending and no other message in its thread is pending or streaming.
    pub async fn start(&self, request: GenerateRequest) -> Result<GenerationHandle, GenerationError> {
        let message = self
            .store
            .get_message(&request.message_id)
            .await?
            .ok_or_else(|| GenerationError::NotFound(request.message_id.clone()))?;

        if message.thread_id != request.thread_id {
            return Err(GenerationError::InvalidRequest(format!(
                "message {} belongs to thread {}, not {}",
                message.id, message.thread_id, request.thread_id
            )));
        }

        let Some(epoch) = self.store.claim(&request.message_id).await? else {
            return Err(GenerationError::AlreadyActive(request.message_id));
        };

        let (tx, output) = mpsc::channel(self.settings.output_buffer.max(1));
        let span = info_span!(
            "generation",
            message_id = %request.message_id,
            thread_id = %request.thread_id,
            model = %request.model,
            epoch
        );
        let message_id = request.message_id.clone();

        let run = Generation {
            backend: Arc::clone(&self.backend),
            store: Arc::clone(&self.store),
            chunk_log: Arc::clone(&self.chunk_log),
            stop_signal: Arc::clone(&self.stop_signal),
            catalog: Arc::clone(&self.catalog),
            settings: self.settings.clone(),
            request,
            epoch,
        };
        let task = tokio::spawn(run.run(tx).instrument(span));

        Ok(GenerationHandle {
            message_id,
            output,
            task,
        })
    }
}

// ============================================================================
// Single Run
// ============================================================================

struct Generation<B: LlmBackend> {
    backend: Arc<B>,
    store: Arc<dyn MessageStore>,
    chunk_log: Arc<dyn ChunkLog>,
    stop_signal: Arc<dyn StopSignal>,
    catalog: Arc<dyn ModelCatalog>,
    settings: GenerationSettings,
    request: GenerateRequest,
    epoch: u64,
}

#[derive(Default)]
struct RunStats {
    chunks: u32,
    client_detached: bool,
}

/// Hand a chunk to the requesting client without waiting on it
///
/// A full buffer means the reader stopped keeping up. Its sender is dropped so
/// the byte stream ends early; the text stays in the chunk log for resume.
fn forward(client: &mut Option<mpsc::Sender<String>>, text: String, stats: &mut RunStats) {
    let Some(tx) = client.as_ref() else {
        return;
    };
    match tx.try_send(text) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            *client = None;
            stats.client_detached = true;
            info!(chunks = stats.chunks, "Client fell behind, detached; generation continues");
        }
        Err(TrySendError::Closed(_)) => {
            *client = None;
            stats.client_detached = true;
            info!("Client detached, generation continues");
        }
    }
}

impl<B: LlmBackend> Generation<B> {
    async fn run(self, tx: mpsc::Sender<String>) -> GenerationReport {
        let started = Instant::now();
        let cancel = CancellationToken::new();
        let mut acc = Accumulator::new(self.settings.flush_policy());
        let mut stats = RunStats::default();

        let mut client = Some(tx);
        let driven = tokio::time::timeout(
            self.settings.max_duration(),
            self.drive(&mut client, &cancel, &mut acc, &mut stats),
        )
        .await;

        let outcome = match driven {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(error = %e, "Generation failed");
                GenerationOutcome::Failed {
                    reason: e.to_string(),
                }
            }
            Err(_) => {
                warn!(
                    limit_secs = self.settings.max_duration_secs,
                    "Generation exceeded hard ceiling"
                );
                GenerationOutcome::TimedOut
            }
        };

        // Provider call is always abandoned before the terminal write
        cancel.cancel();
        self.finish(&outcome, &acc).await;
        drop(client);

        let report = GenerationReport {
            message_id: self.request.message_id.clone(),
            outcome,
            content_len: acc.content().chars().count(),
            reasoning_len: acc.reasoning().map_or(0, |r| r.chars().count()),
            chunks: stats.chunks,
            flushes: acc.flushes(),
            client_detached: stats.client_detached,
            elapsed: started.elapsed(),
        };
        info!(
            outcome = ?report.outcome,
            content_len = report.content_len,
            reasoning_len = report.reasoning_len,
            chunks = report.chunks,
            flushes = report.flushes,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Generation finished"
        );
        report
    }

    async fn drive(
        &self,
        client: &mut Option<mpsc::Sender<String>>,
        cancel: &CancellationToken,
        acc: &mut Accumulator,
        stats: &mut RunStats,
    ) -> anyhow::Result<GenerationOutcome> {
        let history = self.load_history().await?;
        let profile = CapabilityProfile::resolve(self.catalog.as_ref(), &self.request.model).await;

        let mut llm_request = LlmRequest::new(self.request.model.clone()).with_messages(history);
        if let Some(ref system) = self.settings.system_prompt {
            llm_request = llm_request.with_system(system.clone());
        }
        let llm_request = profile.prepare(llm_request);
        debug!(
            ?profile,
            turns = llm_request.messages.len(),
            backend = self.backend.name(),
            "Calling provider"
        );

        if self.stop_requested().await {
            return Ok(GenerationOutcome::Stopped);
        }

        let mut rx = self
            .backend
            .send_streaming(&llm_request, cancel.child_token())
            .await?;

        let mut ticker = tokio::time::interval(self.settings.stop_poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut status = MessageStatus::Streaming;

        loop {
            let next = tokio::select! {
                biased;
                token = rx.recv() => Some(token),
                _ = ticker.tick() => None,
            };

            // Checked before the token is applied: anything arriving after a
            // stop request is discarded.
            if self.stop_requested().await {
                info!(chunks = stats.chunks, "Stop requested");
                return Ok(GenerationOutcome::Stopped);
            }

            let Some(token) = next else {
                if acc.should_flush(Instant::now()) && !self.flush(acc, status).await? {
                    return Ok(GenerationOutcome::Superseded);
                }
                continue;
            };

            let previous = status;
            match token {
                Some(StreamingToken::Content(text)) => {
                    status = MessageStatus::Streaming;
                    acc.push_content(&text);
                    stats.chunks += 1;

                    if let Err(e) = self.chunk_log.append(&self.request.message_id, &text).await {
                        warn!(error = %e, "Chunk log append failed");
                    }
                    forward(client, text, stats);
                }
                Some(StreamingToken::Reasoning(text)) => {
                    status = MessageStatus::Reasoning;
                    acc.push_reasoning(&text);
                }
                Some(StreamingToken::Finish { reason }) => {
                    debug!(%reason, "Provider finished");
                    return Ok(if reason.is_clean() {
                        GenerationOutcome::Completed
                    } else {
                        GenerationOutcome::Failed {
                            reason: format!("provider finished with reason {reason}"),
                        }
                    });
                }
                Some(StreamingToken::Error(e)) => anyhow::bail!("provider error: {e}"),
                None => anyhow::bail!("provider stream closed without a finish marker"),
            }

            let due = status != previous || acc.should_flush(Instant::now());
            if due && !self.flush(acc, status).await? {
                return Ok(GenerationOutcome::Superseded);
            }
        }
    }

    /// Provider-agnostic history, oldest first
    async fn load_history(&self) -> anyhow::Result<Vec<ChatTurn>> {
        let mut turns = match self.request.history {
            Some(ref history) => history.clone(),
            None => self
                .store
                .list_history(&self.request.thread_id)
                .await?
                .into_iter()
                .filter(|m| m.id != self.request.message_id)
                .filter(|m| m.status != MessageStatus::Pending)
                .filter(|m| !m.content.is_empty())
                .map(|m| ChatTurn::new(m.role, m.content))
                .collect(),
        };

        let max = self.settings.max_history_messages;
        if max > 0 && turns.len() > max {
            turns.drain(..turns.len() - max);
        }
        Ok(turns)
    }

    /// Stop signal set, or thread flag cleared
    async fn stop_requested(&self) -> bool {
        match self
            .stop_signal
            .is_stop_requested(&self.request.message_id)
            .await
        {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Stop signal read failed"),
        }

        match self.store.get_thread(&self.request.thread_id).await {
            Ok(Some(thread)) => !thread.is_streaming,
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "Thread read failed");
                false
            }
        }
    }

    /// Write accumulated output; `Ok(false)` when the store refused
    async fn flush(&self, acc: &mut Accumulator, status: MessageStatus) -> anyhow::Result<bool> {
        let mut patch = MessagePatch::new(self.request.message_id.clone())
            .generation(self.epoch)
            .content(acc.content())
            .status(status);
        if let Some(reasoning) = acc.reasoning() {
            patch = patch.reasoning(reasoning);
        }

        if self.store.try_update(patch).await? {
            acc.mark_flushed(Instant::now());
            Ok(true)
        } else {
            debug!("Flush rejected, record finalized elsewhere");
            Ok(false)
        }
    }

    /// Terminal write, completion marker, stop flag cleanup
    async fn finish(&self, outcome: &GenerationOutcome, acc: &Accumulator) {
        let message_id = &self.request.message_id;

        let marker_status = match outcome.final_state() {
            Some((status, stop_reason)) => {
                let mut patch = MessagePatch::new(message_id.clone())
                    .generation(self.epoch)
                    .content(acc.content())
                    .finalize(status, stop_reason);
                if let Some(reasoning) = acc.reasoning() {
                    patch = patch.reasoning(reasoning);
                }

                match self.store.try_update(patch).await {
                    Ok(true) => Some(status),
                    Ok(false) => {
                        debug!("Finalize rejected, record already terminal");
                        self.persisted_terminal_status().await
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to finalize message");
                        if let Err(e) = self
                            .store
                            .set_thread_streaming(&self.request.thread_id, false)
                            .await
                        {
                            warn!(error = %e, "Failed to clear thread streaming flag");
                        }
                        Some(MessageStatus::Error)
                    }
                }
            }
            None => self.persisted_terminal_status().await,
        };

        if let Some(status) = marker_status {
            if let Err(e) = self.chunk_log.mark_complete(message_id, status).await {
                warn!(error = %e, "Failed to write completion marker");
            }
        }
        if let Err(e) = self.stop_signal.clear(message_id).await {
            warn!(error = %e, "Failed to clear stop signal");
        }
    }

    async fn persisted_terminal_status(&self) -> Option<MessageStatus> {
        match self.store.get_message(&self.request.message_id).await {
            Ok(Some(message)) if message.status.is_terminal() => Some(message.status),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Failed to read message after rejected write");
                None
            }
        }
    }
}
