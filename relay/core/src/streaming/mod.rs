//! Generation Streaming
//!
//! The orchestrator that owns a generation from claim to finalization, and the
//! flush batching it uses to keep record-store writes infrequent.
//!
//! # Example
//!
//! ```ignore
//! use relay_core::streaming::{GenerateRequest, Orchestrator};
//!
//! let orchestrator = Orchestrator::new(backend, store, chunk_log, stop_signal, settings);
//! let handle = orchestrator
//!     .start(GenerateRequest::new(thread_id, message_id, "llama3"))
//!     .await?;
//! let (mut output, task) = handle.into_parts();
//! while let Some(bytes) = output.recv().await {
//!     print!("{bytes}");
//! }
//! let report = task.await?;
//! ```

mod flush;
mod orchestrator;

pub use flush::{Accumulator, FlushPolicy};
pub use orchestrator::{
    GenerateRequest, GenerationError, GenerationHandle, GenerationOutcome, GenerationReport,
    Orchestrator,
};
