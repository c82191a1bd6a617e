//! LLM Backend Integration
//!
//! This module provides abstracted access to LLM providers through a common
//! trait interface. Every call takes a [`CancellationToken`](tokio_util::sync::CancellationToken)
//! so a stop request reaches the provider connection.
//!
//! # Available Backends
//!
//! - **Ollama**: Local LLM server (default)
//! - **Scripted**: Replays fixed tokens (tests and demo mode)
//!
//! # Usage
//!
//! ```ignore
//! use relay_core::backend::{OllamaBackend, LlmBackend, LlmRequest};
//!
//! let backend = OllamaBackend::default();
//! let request = LlmRequest::new("llama3").with_messages(history);
//! let rx = backend.send_streaming(&request, cancel.child_token()).await?;
//! ```

mod ollama;
mod scripted;
mod traits;

pub use ollama::OllamaBackend;
pub use scripted::{ScriptController, ScriptStep, ScriptedBackend};
pub use traits::{ChatTurn, FinishReason, LlmBackend, LlmRequest, ModelInfo, StreamingToken};
