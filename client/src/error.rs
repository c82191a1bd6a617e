//! Client errors

use thiserror::Error;

use relay_core::MessageId;

/// Errors raised by the stream controller and its transports
#[derive(Debug, Error)]
pub enum ClientError {
    /// The HTTP request could not be made or its body could not be read
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The daemon answered with a non-success status
    #[error("daemon returned {status}: {message}")]
    Status {
        /// HTTP status code
        status: u16,
        /// `error` field of the JSON body, or the raw body
        message: String,
    },

    /// An open stream broke before it closed normally
    #[error("stream interrupted: {0}")]
    Stream(String),

    /// A local session for this message is still running
    #[error("a stream session is already active for {0}")]
    SessionActive(MessageId),

    /// The active session cap was reached
    #[error("too many active stream sessions (limit {0})")]
    TooManySessions(usize),
}

impl ClientError {
    /// Whether the daemon refused because the message is already generating
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Status { status: 409, .. })
    }
}
