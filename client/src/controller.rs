//! Stream Controller
//!
//! Client-side state machine for generated messages:
//!
//! ```text
//! idle ──► requested ──► receiving ──┬──► completed
//!                                    ├──► stopped
//!                                    └──► errored
//! ```
//!
//! The terminal phase is always taken from the persisted record once the
//! stream ends, so every message converges to one of three visual states.
//! Cancelling only sets the daemon's stop flag; the local stream keeps
//! rendering until the generation closes it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, info_span, warn, Instrument};

use relay_core::{Message, MessageId, MessageRole, MessageStatus, StopReason, ThreadId};

use crate::error::ClientError;
use crate::session::{SessionRegistry, StreamSession};
use crate::transport::{StartRequest, StreamTransport, TextStream};

/// Phase of a message's local stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamPhase {
    /// Nothing requested
    Idle,
    /// Request sent, no bytes yet
    Requested,
    /// Rendering bytes
    Receiving,
    /// Finished normally
    Completed,
    /// Stopped by the user
    Stopped,
    /// Provider, transport or timeout failure
    Errored,
}

impl StreamPhase {
    /// Whether the phase is final
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Errored)
    }

    /// Terminal phase of a finished record, `None` while it is still active
    #[must_use]
    pub fn from_message(message: &Message) -> Option<Self> {
        match (message.status, message.stop_reason) {
            (MessageStatus::Done, Some(StopReason::Stopped)) => Some(Self::Stopped),
            (MessageStatus::Done, Some(StopReason::Error)) | (MessageStatus::Error, _) => {
                Some(Self::Errored)
            }
            (MessageStatus::Done, _) => Some(Self::Completed),
            _ => None,
        }
    }
}

/// Marker rendered under a finished message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TerminalBadge {
    /// Completed, or not finished yet
    None,
    /// The user stopped the generation
    StoppedByUser,
    /// The generation failed
    ErrorOccurred,
}

impl TerminalBadge {
    /// Badge for a persisted record
    #[must_use]
    pub fn from_message(message: &Message) -> Self {
        StreamPhase::from_message(message).map_or(Self::None, Self::from_phase)
    }

    /// Badge for a local phase
    #[must_use]
    pub fn from_phase(phase: StreamPhase) -> Self {
        match phase {
            StreamPhase::Stopped => Self::StoppedByUser,
            StreamPhase::Errored => Self::ErrorOccurred,
            _ => Self::None,
        }
    }

    /// Text shown to the user
    #[must_use]
    pub fn label(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::StoppedByUser => Some("Stopped by user"),
            Self::ErrorOccurred => Some("An error occurred"),
        }
    }
}

/// Update delivered to the view rendering a message
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// Text to append
    Text(String),
    /// The stream ended; always the last event
    Finished {
        /// Terminal phase
        phase: StreamPhase,
        /// Badge to render
        badge: TerminalBadge,
        /// Final persisted record, when it could be fetched
        message: Option<Message>,
    },
}

/// Controller tuning
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    /// Interval between record fetches after a broken stream
    pub fallback_poll: Duration,
    /// Fetches before giving up and showing an error
    pub fallback_attempts: u32,
    /// Cap on concurrently active sessions
    pub max_active_sessions: usize,
    /// How long finished sessions stay readable
    pub retain_finished: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            fallback_poll: Duration::from_millis(500),
            fallback_attempts: 120,
            max_active_sessions: 8,
            retain_finished: Duration::from_secs(300),
        }
    }
}

/// Drives generation, resume and cancel flows for one client
pub struct StreamController<T: StreamTransport> {
    transport: Arc<T>,
    sessions: Arc<SessionRegistry>,
    settings: ControllerSettings,
}

impl<T: StreamTransport + 'static> StreamController<T> {
    /// Create a controller
    pub fn new(transport: Arc<T>, settings: ControllerSettings) -> Self {
        let sessions = Arc::new(SessionRegistry::new(
            settings.max_active_sessions,
            settings.retain_finished,
        ));
        Self {
            transport,
            sessions,
            settings,
        }
    }

    /// Session registry shared with views
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Local phase of a message
    #[must_use]
    pub fn phase(&self, message_id: &MessageId) -> StreamPhase {
        self.sessions
            .get(message_id)
            .map_or(StreamPhase::Idle, |s| s.phase)
    }

    /// Start a fresh generation
    ///
    /// Fails if a local session is active or the daemon refuses the request;
    /// the session is then left `Errored`.
    pub async fn generate(
        &self,
        request: StartRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, ClientError> {
        let message_id = request.message_id.clone();
        self.sessions
            .begin(request.thread_id.clone(), message_id.clone(), false)?;

        let stream = match self.transport.start(&request).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(message_id = %message_id, error = %e, "Generation request failed");
                self.sessions.set_phase(&message_id, StreamPhase::Errored);
                return Err(e);
            }
        };

        info!(message_id = %message_id, "Generation stream opened");
        Ok(self.spawn_pump(message_id, Ok(stream)))
    }

    /// Follow a generation this client did not start
    ///
    /// A resume that cannot be opened falls back to polling the record.
    pub fn resume(
        &self,
        thread_id: ThreadId,
        message_id: MessageId,
    ) -> Result<mpsc::Receiver<StreamEvent>, ClientError> {
        let session_id = self.sessions.begin(thread_id, message_id.clone(), true)?;
        let transport = Arc::clone(&self.transport);
        let id = message_id.clone();

        let (tx, rx) = mpsc::channel(64);
        let pump = Pump {
            transport: Arc::clone(&self.transport),
            sessions: Arc::clone(&self.sessions),
            settings: self.settings.clone(),
            message_id: message_id.clone(),
        };
        let span = info_span!("resume", message_id = %message_id, session_id = %session_id);
        tokio::spawn(
            async move {
                let stream = transport.resume(&id, &session_id).await;
                pump.run(stream, tx).await;
            }
            .instrument(span),
        );
        Ok(rx)
    }

    /// Ask the daemon to stop the generation; the local stream stays open
    pub async fn cancel(
        &self,
        thread_id: &ThreadId,
        message_id: &MessageId,
    ) -> Result<(), ClientError> {
        self.transport.cancel(thread_id, message_id).await?;
        info!(message_id = %message_id, "Stop requested");
        Ok(())
    }

    /// Whether a persisted message is generating with no local session
    #[must_use]
    pub fn needs_resume(&self, message: &Message) -> bool {
        message.role == MessageRole::Assistant
            && message.status.is_active()
            && !self.sessions.has_active(&message.id)
    }

    /// Start a resume flow for every message that needs one
    ///
    /// Used after a reload, when persisted records show generations in
    /// progress that this client has no session for.
    pub fn reconcile(
        &self,
        messages: &[Message],
    ) -> Vec<(MessageId, mpsc::Receiver<StreamEvent>)> {
        let mut resumed = Vec::new();
        for message in messages.iter().filter(|m| self.needs_resume(m)) {
            match self.resume(message.thread_id.clone(), message.id.clone()) {
                Ok(events) => resumed.push((message.id.clone(), events)),
                Err(e) => warn!(message_id = %message.id, error = %e, "Could not resume"),
            }
        }
        resumed
    }

    /// Snapshot of a session
    #[must_use]
    pub fn session(&self, message_id: &MessageId) -> Option<StreamSession> {
        self.sessions.get(message_id)
    }

    fn spawn_pump(
        &self,
        message_id: MessageId,
        stream: Result<TextStream, ClientError>,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(64);
        let pump = Pump {
            transport: Arc::clone(&self.transport),
            sessions: Arc::clone(&self.sessions),
            settings: self.settings.clone(),
            message_id: message_id.clone(),
        };
        let span = info_span!("stream", message_id = %message_id);
        tokio::spawn(pump.run(stream, tx).instrument(span));
        rx
    }
}

// ============================================================================
// Stream Pump
// ============================================================================

struct Pump<T: StreamTransport> {
    transport: Arc<T>,
    sessions: Arc<SessionRegistry>,
    settings: ControllerSettings,
    message_id: MessageId,
}

impl<T: StreamTransport> Pump<T> {
    async fn run(
        self,
        stream: Result<TextStream, ClientError>,
        tx: mpsc::Sender<StreamEvent>,
    ) {
        let mut broken = false;

        match stream {
            Ok(mut stream) => {
                self.sessions
                    .set_phase(&self.message_id, StreamPhase::Receiving);
                while let Some(item) = stream.recv().await {
                    match item {
                        Ok(text) => {
                            self.sessions.append(&self.message_id, &text);
                            // The view may have gone; keep recording
                            let _ = tx.send(StreamEvent::Text(text)).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "Stream broke, falling back to record polling");
                            broken = true;
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Could not open stream, falling back to record polling");
                broken = true;
            }
        }

        let message = self.settle(broken).await;
        let phase = message
            .as_ref()
            .and_then(StreamPhase::from_message)
            .unwrap_or(StreamPhase::Errored);
        self.sessions.set_phase(&self.message_id, phase);
        debug!(?phase, "Stream settled");

        let _ = tx
            .send(StreamEvent::Finished {
                phase,
                badge: TerminalBadge::from_phase(phase),
                message,
            })
            .await;
    }

    /// Fetch the record until it is terminal or attempts run out
    async fn settle(&self, broken: bool) -> Option<Message> {
        let mut ticker = tokio::time::interval(self.settings.fallback_poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = None;

        for attempt in 0..self.settings.fallback_attempts.max(1) {
            ticker.tick().await;
            match self.transport.fetch_message(&self.message_id).await {
                Ok(message) if message.status.is_terminal() => return Some(message),
                Ok(message) => {
                    debug!(attempt, status = %message.status, broken, "Record not final yet");
                    last = Some(message);
                }
                Err(e) => debug!(attempt, error = %e, "Record fetch failed"),
            }
        }

        warn!("Record never reached a final state");
        last
    }
}
