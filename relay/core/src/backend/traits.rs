//! LLM Backend Traits
//!
//! Trait definitions for LLM backends. The orchestrator talks to providers
//! only through [`LlmBackend`], so a provider swap never touches the
//! persistence or resume logic.
//!
//! # Design Philosophy
//!
//! The `LlmBackend` trait provides a common interface for:
//! - Sending a chat history and receiving a cancellable token stream
//! - Health checking the backend
//! - Querying available models
//!
//! Implementations handle provider-specific details (API formats, auth, etc.)

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::messages::MessageRole;

/// Token stream events from LLM backends
#[derive(Clone, Debug, PartialEq)]
pub enum StreamingToken {
    /// A fragment of the final answer
    Content(String),
    /// A fragment of chain-of-thought
    Reasoning(String),
    /// The provider finished; no further tokens follow
    Finish {
        /// Why the provider stopped
        reason: FinishReason,
    },
    /// Error occurred during streaming; no further tokens follow
    Error(String),
}

/// Why a provider ended its output
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural end of the answer
    Stop,
    /// Truncated at the output token limit
    Length,
    /// Blocked by a content filter
    ContentFilter,
    /// Aborted to emit a tool call
    ToolCalls,
    /// Anything else the provider reported
    Other(String),
}

impl FinishReason {
    /// Parse a provider finish reason string
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "stop" | "end_turn" | "stop_sequence" => Self::Stop,
            "length" | "max_tokens" => Self::Length,
            "content_filter" | "safety" => Self::ContentFilter,
            "tool_calls" | "tool_use" => Self::ToolCalls,
            other => Self::Other(other.to_string()),
        }
    }

    /// Whether the output may be treated as a completed answer
    ///
    /// Truncation at the length limit still yields usable content.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Stop | Self::Length)
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => f.write_str("stop"),
            Self::Length => f.write_str("length"),
            Self::ContentFilter => f.write_str("content_filter"),
            Self::ToolCalls => f.write_str("tool_calls"),
            Self::Other(other) => f.write_str(other),
        }
    }
}

/// One provider-agnostic conversation turn
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    /// Who said it
    pub role: MessageRole,
    /// What was said
    pub content: String,
}

impl ChatTurn {
    /// Create a turn
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Configuration for LLM requests
#[derive(Clone, Debug)]
pub struct LlmRequest {
    /// Model to use (backend-specific identifier)
    pub model: String,
    /// Ordered conversation history, oldest first
    pub messages: Vec<ChatTurn>,
    /// Maximum tokens in response (0 = default)
    pub max_tokens: u32,
    /// Temperature (0.0-1.0, higher = more creative)
    pub temperature: f32,
    /// System prompt (optional, prepended to conversation)
    pub system: Option<String>,
    /// Ask the provider to emit reasoning separately from content
    pub reasoning: bool,
}

impl Default for LlmRequest {
    fn default() -> Self {
        Self {
            model: String::new(),
            messages: Vec::new(),
            max_tokens: 0,
            temperature: 0.7,
            system: None,
            reasoning: false,
        }
    }
}

impl LlmRequest {
    /// Create a new request for a model
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    /// Set the conversation history
    #[must_use]
    pub fn with_messages(mut self, messages: Vec<ChatTurn>) -> Self {
        self.messages = messages;
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 1.0);
        self
    }

    /// Set system prompt
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Request separate reasoning output
    #[must_use]
    pub fn with_reasoning(mut self, reasoning: bool) -> Self {
        self.reasoning = reasoning;
        self
    }
}

/// Information about an available model
#[derive(Clone, Debug)]
pub struct ModelInfo {
    /// Model identifier
    pub name: String,
    /// Model size in bytes (if known)
    pub size: Option<u64>,
    /// Parameter count (if known)
    pub parameters: Option<String>,
}

/// LLM Backend trait
///
/// Implement this trait to add support for different LLM providers.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Get the backend name (e.g., "Ollama")
    fn name(&self) -> &str;

    /// Check if the backend is healthy and reachable
    async fn health_check(&self) -> bool;

    /// Send a request and get a streaming response
    ///
    /// Returns a channel receiver that will receive tokens as they arrive.
    /// The last token is always [`StreamingToken::Finish`] or
    /// [`StreamingToken::Error`] unless `cancel` fires first, in which case
    /// the provider call is abandoned and the channel simply closes.
    async fn send_streaming(
        &self,
        request: &LlmRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>>;

    /// List available models
    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>>;

    /// Check if a specific model is available
    async fn has_model(&self, model: &str) -> anyhow::Result<bool> {
        let models = self.list_models().await?;
        Ok(models.iter().any(|m| m.name == model))
    }
}
