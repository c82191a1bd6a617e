//! Stop Signal
//!
//! Per-message "please stop" flag with an expiry. Any client may set it; the
//! generation owning the message polls it. An expired flag reads as absent.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::config::StopSignalSettings;
use crate::messages::MessageId;

/// Errors from the stop signal store
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StopSignalError {
    /// The backing store could not be reached
    #[error("stop signal store unavailable: {0}")]
    Unavailable(String),
}

/// Cross-client cancellation flag
#[async_trait]
pub trait StopSignal: Send + Sync {
    /// Ask the generation for `message_id` to stop
    async fn request_stop(&self, message_id: &MessageId) -> Result<(), StopSignalError>;

    /// Whether a live stop request exists
    async fn is_stop_requested(&self, message_id: &MessageId) -> Result<bool, StopSignalError>;

    /// Remove the flag
    async fn clear(&self, message_id: &MessageId) -> Result<(), StopSignalError>;

    /// Drop expired flags; returns how many were removed
    async fn purge_expired(&self) -> usize;
}

/// Stop flags held in a `DashMap`
pub struct InMemoryStopSignal {
    flags: DashMap<MessageId, Instant>,
    ttl: Duration,
}

impl InMemoryStopSignal {
    /// Create with a flag lifetime
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            flags: DashMap::new(),
            ttl,
        }
    }

    /// Create from configuration
    #[must_use]
    pub fn from_settings(settings: &StopSignalSettings) -> Self {
        Self::new(settings.ttl())
    }
}

impl Default for InMemoryStopSignal {
    fn default() -> Self {
        Self::from_settings(&StopSignalSettings::default())
    }
}

#[async_trait]
impl StopSignal for InMemoryStopSignal {
    async fn request_stop(&self, message_id: &MessageId) -> Result<(), StopSignalError> {
        self.flags
            .insert(message_id.clone(), Instant::now() + self.ttl);
        Ok(())
    }

    async fn is_stop_requested(&self, message_id: &MessageId) -> Result<bool, StopSignalError> {
        Ok(self
            .flags
            .get(message_id)
            .is_some_and(|expires_at| *expires_at > Instant::now()))
    }

    async fn clear(&self, message_id: &MessageId) -> Result<(), StopSignalError> {
        self.flags.remove(message_id);
        Ok(())
    }

    async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.flags.len();
        self.flags.retain(|_, expires_at| *expires_at > now);
        before.saturating_sub(self.flags.len())
    }
}
