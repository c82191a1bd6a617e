//! Chunk Log
//!
//! Ephemeral, append-ordered record of the text fragments a generation has
//! produced, keyed by message id. A resuming client replays it from the start
//! and then follows new appends until the completion marker.
//!
//! Each record is stored JSON-encoded as a tagged [`ChunkEntry`], so a marker
//! can never be confused with literal text:
//!
//! ```text
//! {"type":"text","text":"Hel"}
//! {"type":"text","text":"lo"}
//! {"type":"completion","status":"done"}
//! ```
//!
//! Entries expire after a TTL that each append refreshes; marking a log
//! complete shortens it to the cleanup window.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::ChunkLogSettings;
use crate::messages::{MessageId, MessageStatus};

/// Errors from the chunk log
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ChunkLogError {
    /// A record could not be encoded or decoded
    #[error("corrupt chunk record for {message_id}: {reason}")]
    Corrupt {
        /// Log key
        message_id: MessageId,
        /// Decoder message
        reason: String,
    },

    /// Append after the completion marker
    #[error("chunk log for {0} is already complete")]
    Closed(MessageId),

    /// The backing store could not be reached
    #[error("chunk log unavailable: {0}")]
    Unavailable(String),
}

/// One record in a message's chunk log
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChunkEntry {
    /// A content fragment
    Text {
        /// Fragment text
        text: String,
    },
    /// Terminal marker; nothing follows it
    Completion {
        /// Final message status
        status: MessageStatus,
    },
}

impl ChunkEntry {
    /// Text record
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Whether this is the completion marker
    #[must_use]
    pub fn is_marker(&self) -> bool {
        matches!(self, Self::Completion { .. })
    }

    /// Fragment text, if this is a text record
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::Completion { .. } => None,
        }
    }

    /// Serialize for storage
    pub fn encode(&self, message_id: &MessageId) -> Result<String, ChunkLogError> {
        serde_json::to_string(self).map_err(|e| ChunkLogError::Corrupt {
            message_id: message_id.clone(),
            reason: e.to_string(),
        })
    }

    /// Parse a stored record
    pub fn decode(message_id: &MessageId, raw: &str) -> Result<Self, ChunkLogError> {
        serde_json::from_str(raw).map_err(|e| ChunkLogError::Corrupt {
            message_id: message_id.clone(),
            reason: e.to_string(),
        })
    }
}

/// Append-ordered per-message log
#[async_trait]
pub trait ChunkLog: Send + Sync {
    /// Append a text fragment, creating the log and refreshing its TTL
    async fn append(&self, message_id: &MessageId, text: &str) -> Result<(), ChunkLogError>;

    /// Every record so far, in order; `None` when no log exists (or it expired)
    async fn read_all(&self, message_id: &MessageId)
        -> Result<Option<Vec<ChunkEntry>>, ChunkLogError>;

    /// Records past the first `offset`
    async fn read_from(
        &self,
        message_id: &MessageId,
        offset: usize,
    ) -> Result<Option<Vec<ChunkEntry>>, ChunkLogError> {
        Ok(self
            .read_all(message_id)
            .await?
            .map(|entries| entries.into_iter().skip(offset).collect()))
    }

    /// Write the completion marker and shorten the TTL
    async fn mark_complete(
        &self,
        message_id: &MessageId,
        status: MessageStatus,
    ) -> Result<(), ChunkLogError>;

    /// Drop expired logs; returns how many were removed
    async fn purge_expired(&self) -> usize;
}

struct LogEntry {
    records: Vec<String>,
    expires_at: Instant,
    completed: bool,
}

/// Chunk log held in a `DashMap`
pub struct InMemoryChunkLog {
    entries: DashMap<MessageId, LogEntry>,
    ttl: Duration,
    completed_ttl: Duration,
}

impl InMemoryChunkLog {
    /// Create with explicit TTLs
    #[must_use]
    pub fn new(ttl: Duration, completed_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            completed_ttl,
        }
    }

    /// Create from configuration
    #[must_use]
    pub fn from_settings(settings: &ChunkLogSettings) -> Self {
        Self::new(settings.ttl(), settings.completed_ttl())
    }

    /// Number of live logs
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no logs are held
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for InMemoryChunkLog {
    fn default() -> Self {
        Self::from_settings(&ChunkLogSettings::default())
    }
}

#[async_trait]
impl ChunkLog for InMemoryChunkLog {
    async fn append(&self, message_id: &MessageId, text: &str) -> Result<(), ChunkLogError> {
        let record = ChunkEntry::text(text).encode(message_id)?;
        let now = Instant::now();

        let mut entry = self
            .entries
            .entry(message_id.clone())
            .or_insert_with(|| LogEntry {
                records: Vec::new(),
                expires_at: now + self.ttl,
                completed: false,
            });

        if entry.expires_at <= now {
            // Stale log that the sweeper has not reached yet
            entry.records.clear();
            entry.completed = false;
        }
        if entry.completed {
            return Err(ChunkLogError::Closed(message_id.clone()));
        }

        entry.records.push(record);
        entry.expires_at = now + self.ttl;
        Ok(())
    }

    async fn read_all(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<Vec<ChunkEntry>>, ChunkLogError> {
        // Copy out under the shard lock, decode outside it
        let records = match self.entries.get(message_id) {
            Some(entry) if entry.expires_at > Instant::now() => entry.records.clone(),
            _ => return Ok(None),
        };

        records
            .iter()
            .map(|raw| ChunkEntry::decode(message_id, raw))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    async fn mark_complete(
        &self,
        message_id: &MessageId,
        status: MessageStatus,
    ) -> Result<(), ChunkLogError> {
        let record = ChunkEntry::Completion { status }.encode(message_id)?;
        let now = Instant::now();

        let mut entry = self
            .entries
            .entry(message_id.clone())
            .or_insert_with(|| LogEntry {
                records: Vec::new(),
                expires_at: now,
                completed: false,
            });

        if entry.completed {
            return Ok(());
        }
        entry.records.push(record);
        entry.completed = true;
        entry.expires_at = now + self.completed_ttl;
        debug!(message_id = %message_id, status = %status, records = entry.records.len(), "Chunk log complete");
        Ok(())
    }

    async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }
}
