//! Session Registry
//!
//! Tracks the local stream session of every message this client is
//! rendering. Finished sessions are kept for a while (so a view can still
//! read the final text) and then evicted by age; active sessions are capped.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use relay_core::{MessageId, ThreadId};

use crate::controller::StreamPhase;
use crate::error::ClientError;

/// Local state of one stream
#[derive(Clone, Debug)]
pub struct StreamSession {
    /// Message being rendered
    pub message_id: MessageId,
    /// Its thread
    pub thread_id: ThreadId,
    /// Correlation id sent with resume requests
    pub session_id: String,
    /// Current phase
    pub phase: StreamPhase,
    /// Text rendered so far
    pub text: String,
    /// Whether this session follows a generation started elsewhere
    pub resumed: bool,
    /// When the session began
    pub started_at: Instant,
    /// When the session reached a terminal phase
    pub finished_at: Option<Instant>,
}

impl StreamSession {
    /// Whether the session still expects bytes or a final state
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.phase.is_terminal()
    }
}

/// Registry of local stream sessions, keyed by message
pub struct SessionRegistry {
    sessions: Mutex<HashMap<MessageId, StreamSession>>,
    max_active: usize,
    retain_finished: Duration,
}

impl SessionRegistry {
    /// Create a registry
    #[must_use]
    pub fn new(max_active: usize, retain_finished: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_active: max_active.max(1),
            retain_finished,
        }
    }

    /// Open a session in the `Requested` phase and return its session id
    ///
    /// A finished session for the same message is replaced; an active one is
    /// an error.
    pub fn begin(
        &self,
        thread_id: ThreadId,
        message_id: MessageId,
        resumed: bool,
    ) -> Result<String, ClientError> {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        Self::evict(&mut sessions, self.retain_finished, now);

        if sessions.get(&message_id).is_some_and(StreamSession::is_active) {
            return Err(ClientError::SessionActive(message_id));
        }
        let active = sessions.values().filter(|s| s.is_active()).count();
        if active >= self.max_active {
            return Err(ClientError::TooManySessions(self.max_active));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        sessions.insert(
            message_id.clone(),
            StreamSession {
                message_id,
                thread_id,
                session_id: session_id.clone(),
                phase: StreamPhase::Requested,
                text: String::new(),
                resumed,
                started_at: now,
                finished_at: None,
            },
        );
        Ok(session_id)
    }

    /// Move a session to `phase`; terminal phases stamp the finish time
    pub fn set_phase(&self, message_id: &MessageId, phase: StreamPhase) {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get_mut(message_id) {
            if session.phase.is_terminal() {
                return;
            }
            session.phase = phase;
            if phase.is_terminal() {
                session.finished_at = Some(Instant::now());
            }
        }
    }

    /// Append rendered text
    pub fn append(&self, message_id: &MessageId, text: &str) {
        if let Some(session) = self.sessions.lock().get_mut(message_id) {
            session.text.push_str(text);
        }
    }

    /// Snapshot of a session
    #[must_use]
    pub fn get(&self, message_id: &MessageId) -> Option<StreamSession> {
        self.sessions.lock().get(message_id).cloned()
    }

    /// Whether an active session exists for the message
    #[must_use]
    pub fn has_active(&self, message_id: &MessageId) -> bool {
        self.sessions
            .lock()
            .get(message_id)
            .is_some_and(StreamSession::is_active)
    }

    /// Number of active sessions
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sessions.lock().values().filter(|s| s.is_active()).count()
    }

    /// Number of tracked sessions, finished ones included
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether no sessions are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop finished sessions older than the retention window
    pub fn evict_finished(&self) -> usize {
        self.evict_finished_at(Instant::now())
    }

    /// [`Self::evict_finished`] against an explicit clock
    pub fn evict_finished_at(&self, now: Instant) -> usize {
        Self::evict(&mut self.sessions.lock(), self.retain_finished, now)
    }

    fn evict(
        sessions: &mut HashMap<MessageId, StreamSession>,
        retain: Duration,
        now: Instant,
    ) -> usize {
        let before = sessions.len();
        sessions.retain(|_, session| match session.finished_at {
            Some(finished) => now.saturating_duration_since(finished) < retain,
            None => true,
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            debug!(evicted, "Evicted finished stream sessions");
        }
        evicted
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(8, Duration::from_secs(300))
    }
}
