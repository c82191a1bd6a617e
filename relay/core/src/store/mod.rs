//! Message Record Store
//!
//! The [`MessageStore`] contract and its in-memory implementation.

mod memory;
mod traits;

pub use memory::InMemoryMessageStore;
pub use traits::{MessagePatch, MessageStore, StoreError};
