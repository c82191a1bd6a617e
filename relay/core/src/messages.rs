//! Conversation Records
//!
//! Messages, threads and the identifiers that tie them together. These are the
//! durable records the generation pipeline reads and writes through the
//! [`MessageStore`](crate::store::MessageStore) contract.
//!
//! # Status Lifecycle
//!
//! ```text
//!   pending ──► streaming ◄──► reasoning
//!                  │               │
//!                  └──────┬────────┘
//!                         ▼
//!                   done | error      (terminal, no further writes)
//! ```
//!
//! A thread mirrors the status of its active message so list views can show
//! progress without loading every message. `reasoning` is presented to the
//! thread as `streaming`.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Current Unix time in milliseconds
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Message identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// Generate a new unique message ID
    pub fn new() -> Self {
        Self(format!("msg_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MessageId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Thread (conversation) identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub String);

impl ThreadId {
    /// Generate a new unique thread ID
    pub fn new() -> Self {
        Self(format!("thr_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the string value
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ThreadId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ThreadId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Who authored a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// The human side of the conversation
    User,
    /// The model
    Assistant,
    /// Instructions injected ahead of the conversation
    System,
}

impl MessageRole {
    /// Wire name used by chat-style provider APIs
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// Persisted status of a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Placeholder created before generation starts
    Pending,
    /// Final content is being generated
    Streaming,
    /// The model is emitting chain-of-thought distinct from the final content
    Reasoning,
    /// Generation finished (completed or stopped by the user)
    Done,
    /// Generation failed
    Error,
}

impl MessageStatus {
    /// Whether no further writes are accepted
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Whether the message is still owned by (or waiting for) a generation
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether the store may move a record from `self` to `next`
    ///
    /// `pending → streaming|reasoning → done|error`, with `streaming` and
    /// `reasoning` free to alternate.
    #[must_use]
    pub fn can_transition_to(&self, next: MessageStatus) -> bool {
        use MessageStatus::{Done, Error, Pending, Reasoning, Streaming};
        match (self, next) {
            (Pending, Streaming | Reasoning) => true,
            (Streaming | Reasoning, Streaming | Reasoning | Done | Error) => true,
            _ => false,
        }
    }

    /// Human-readable label
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Streaming => "streaming",
            Self::Reasoning => "reasoning",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a generation ended; set only at finalization
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    /// The provider finished cleanly
    Completed,
    /// The user asked to stop
    Stopped,
    /// Provider, persistence or timeout failure
    Error,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Error => "error",
        })
    }
}

/// A persisted chat message
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique message ID
    pub id: MessageId,
    /// Thread this message belongs to
    pub thread_id: ThreadId,
    /// Who sent this message
    pub role: MessageRole,
    /// Final content (replaced wholesale on each flush while streaming)
    pub content: String,
    /// Chain-of-thought, kept apart from the content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    /// Lifecycle status
    pub status: MessageStatus,
    /// Set only when the message reaches a terminal status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    /// Model that produced (or will produce) this message
    pub model: String,
    /// Generation epoch; bumped each time a generation claims the message
    #[serde(default)]
    pub generation: u64,
    /// When the message was created (Unix timestamp ms)
    pub created_at: u64,
    /// When the message was last written (Unix timestamp ms)
    pub updated_at: u64,
}

impl Message {
    /// Create a finished user message
    pub fn user(thread_id: ThreadId, content: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: MessageId::new(),
            thread_id,
            role: MessageRole::User,
            content: content.into(),
            reasoning: None,
            status: MessageStatus::Done,
            stop_reason: Some(StopReason::Completed),
            model: String::new(),
            generation: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create an assistant placeholder awaiting generation
    pub fn placeholder(id: MessageId, thread_id: ThreadId, model: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id,
            thread_id,
            role: MessageRole::Assistant,
            content: String::new(),
            reasoning: None,
            status: MessageStatus::Pending,
            stop_reason: None,
            model: model.into(),
            generation: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Update the last-written timestamp
    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }
}

/// Status shown for a thread in list views
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    /// No generation has run yet
    Idle,
    /// A placeholder is waiting for its generation
    Pending,
    /// A generation is running (content or reasoning)
    Streaming,
    /// The last generation finished
    Done,
    /// The last generation failed
    Error,
}

impl From<MessageStatus> for ThreadStatus {
    fn from(status: MessageStatus) -> Self {
        match status {
            MessageStatus::Pending => Self::Pending,
            MessageStatus::Streaming | MessageStatus::Reasoning => Self::Streaming,
            MessageStatus::Done => Self::Done,
            MessageStatus::Error => Self::Error,
        }
    }
}

/// A conversation thread
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    /// Unique thread ID
    pub id: ThreadId,
    /// Mirror of the active message's status
    pub status: ThreadStatus,
    /// Coarse cancel switch: cleared to ask the active generation to stop
    pub is_streaming: bool,
    /// When the thread was last written (Unix timestamp ms)
    pub updated_at: u64,
}

impl Thread {
    /// Create an idle thread
    pub fn new(id: ThreadId) -> Self {
        Self {
            id,
            status: ThreadStatus::Idle,
            is_streaming: false,
            updated_at: now_ms(),
        }
    }
}
