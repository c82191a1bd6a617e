//! Message Store Contract
//!
//! The durable record of every message, with a single authoritative writer at
//! a time. All generation writes go through [`MessageStore::try_update`], a
//! conditional write that refuses to touch a terminal record.

use async_trait::async_trait;
use thiserror::Error;

use crate::messages::{Message, MessageId, MessageStatus, StopReason, Thread, ThreadId};

/// Errors from the message store
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// No record with this ID
    #[error("message not found: {0}")]
    MessageNotFound(MessageId),

    /// No thread with this ID
    #[error("thread not found: {0}")]
    ThreadNotFound(ThreadId),

    /// The backing store could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A partial update to a message
///
/// `None` fields are left untouched. `content` and `reasoning` replace the
/// stored values wholesale.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MessagePatch {
    /// Target message
    pub message_id: MessageId,
    /// Epoch the writer holds; a mismatch rejects the patch
    pub generation: Option<u64>,
    /// New content
    pub content: Option<String>,
    /// New reasoning
    pub reasoning: Option<String>,
    /// New status
    pub status: Option<MessageStatus>,
    /// Stop reason (only together with a terminal status)
    pub stop_reason: Option<StopReason>,
}

impl MessagePatch {
    /// Empty patch for `message_id`
    #[must_use]
    pub fn new(message_id: MessageId) -> Self {
        Self {
            message_id,
            ..Default::default()
        }
    }

    /// Writer epoch
    #[must_use]
    pub fn generation(mut self, generation: u64) -> Self {
        self.generation = Some(generation);
        self
    }

    /// Replace content
    #[must_use]
    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Replace reasoning
    #[must_use]
    pub fn reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }

    /// Change status
    #[must_use]
    pub fn status(mut self, status: MessageStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Terminal status plus stop reason
    #[must_use]
    pub fn finalize(mut self, status: MessageStatus, stop_reason: StopReason) -> Self {
        self.status = Some(status);
        self.stop_reason = Some(stop_reason);
        self
    }
}

/// Persistence contract consumed by the orchestrator and the HTTP layer
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Ordered history of a thread, oldest first
    async fn list_history(&self, thread_id: &ThreadId) -> Result<Vec<Message>, StoreError>;

    /// A single message
    async fn get_message(&self, message_id: &MessageId) -> Result<Option<Message>, StoreError>;

    /// A single thread
    async fn get_thread(&self, thread_id: &ThreadId) -> Result<Option<Thread>, StoreError>;

    /// Claim a pending message for a new generation
    ///
    /// Moves the message `pending → streaming`, bumps its epoch and sets the
    /// thread `is_streaming` flag. Returns the new epoch, or `None` when the
    /// message is not pending or another message in the thread is active.
    async fn claim(&self, message_id: &MessageId) -> Result<Option<u64>, StoreError>;

    /// Conditionally apply a patch
    ///
    /// Returns `false` (and changes nothing) when the record is terminal, the
    /// epoch is stale, or the status transition is invalid.
    async fn try_update(&self, patch: MessagePatch) -> Result<bool, StoreError>;

    /// Set the thread's coarse cancel switch
    async fn set_thread_streaming(
        &self,
        thread_id: &ThreadId,
        streaming: bool,
    ) -> Result<(), StoreError>;
}
