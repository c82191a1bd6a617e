//! Relay Core - Resumable LLM Generation Streams
//!
//! This crate owns the life of a single generated assistant message: it is
//! produced token by token, persisted in batches while it streams, can be
//! stopped from any client, and can be followed mid-stream by clients that
//! did not start it.
//!
//! # Architecture
//!
//! ```text
//!   requesting client                         resuming client
//!          ▲  raw bytes                              ▲  catch-up + live
//!          │                                         │
//! ┌────────┴──────────────────┐           ┌──────────┴─────────┐
//! │       Orchestrator        │  append   │    ResumeServer    │
//! │  (one task / generation)  ├──────────►│  (poll ChunkLog)   │
//! └──┬─────────┬──────────┬───┘ ChunkLog  └────────────────────┘
//!    │         │          │
//!    │ tokens  │ flushes  │ polls
//!    ▼         ▼          ▼
//! LlmBackend MessageStore StopSignal ◄── any client (cancel)
//! ```
//!
//! # Key Types
//!
//! - [`Orchestrator`]: claims a pending message and drives its generation
//! - [`MessageStore`]: durable records with a conditional, epoch-checked write
//! - [`ChunkLog`]: append-ordered fragments plus a completion marker
//! - [`StopSignal`]: cross-client cancellation flag
//! - [`ResumeServer`]: replays and follows a chunk log
//! - [`RelayConfig`]: layered configuration (defaults, TOML, environment)
//!
//! # Module Overview
//!
//! - [`backend`]: LLM provider abstraction (Ollama, scripted)
//! - [`capabilities`]: model capability profiles
//! - [`chunk_log`]: chunk log contract and in-memory implementation
//! - [`config`]: configuration loading
//! - [`messages`]: message and thread records
//! - [`resume`]: resume server
//! - [`stop_signal`]: stop flag contract and in-memory implementation
//! - [`store`]: message record store
//! - [`streaming`]: orchestrator and flush batching

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod capabilities;
pub mod chunk_log;
pub mod config;
pub mod messages;
pub mod resume;
pub mod stop_signal;
pub mod store;
pub mod streaming;

// Re-exports for convenience
pub use backend::{
    ChatTurn, FinishReason, LlmBackend, LlmRequest, OllamaBackend, ScriptStep, ScriptedBackend,
    StreamingToken,
};
pub use capabilities::{CapabilityProfile, ModelCapabilities, ModelCatalog, StaticModelCatalog};
pub use chunk_log::{ChunkEntry, ChunkLog, ChunkLogError, InMemoryChunkLog};
pub use config::{
    default_config_path, BackendSettings, ChunkLogSettings, ConfigError, GenerationSettings,
    RelayConfig, ResumeSettings, ServerSettings, StopSignalSettings,
};
pub use messages::{
    Message, MessageId, MessageRole, MessageStatus, StopReason, Thread, ThreadId, ThreadStatus,
};
pub use resume::{ResumeError, ResumeServer};
pub use stop_signal::{InMemoryStopSignal, StopSignal, StopSignalError};
pub use store::{InMemoryMessageStore, MessagePatch, MessageStore, StoreError};
pub use streaming::{
    FlushPolicy, GenerateRequest, GenerationError, GenerationHandle, GenerationOutcome,
    GenerationReport, Orchestrator,
};
