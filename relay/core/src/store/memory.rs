//! In-Memory Message Store
//!
//! Single-process [`MessageStore`] backed by `HashMap`s behind one
//! `parking_lot::RwLock`. Every operation takes the lock once, so a status
//! change and the thread mirror update are one logical write.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::traits::{MessagePatch, MessageStore, StoreError};
use crate::messages::{
    now_ms, Message, MessageId, MessageStatus, Thread, ThreadId, ThreadStatus,
};

#[derive(Default)]
struct StoreState {
    messages: HashMap<MessageId, Message>,
    threads: HashMap<ThreadId, Thread>,
    /// Message order per thread, oldest first
    order: HashMap<ThreadId, Vec<MessageId>>,
}

impl StoreState {
    fn thread_mut(&mut self, thread_id: &ThreadId) -> &mut Thread {
        self.threads
            .entry(thread_id.clone())
            .or_insert_with(|| Thread::new(thread_id.clone()))
    }

    fn insert(&mut self, message: Message) {
        let thread_id = message.thread_id.clone();
        let status = message.status;

        let order = self.order.entry(thread_id.clone()).or_default();
        if !order.contains(&message.id) {
            order.push(message.id.clone());
        }
        self.messages.insert(message.id.clone(), message);

        let thread = self.thread_mut(&thread_id);
        thread.status = ThreadStatus::from(status);
        thread.updated_at = now_ms();
    }

    /// Pending placeholders count: each one is owed a generation
    fn has_active_sibling(&self, thread_id: &ThreadId, message_id: &MessageId) -> bool {
        self.order
            .get(thread_id)
            .into_iter()
            .flatten()
            .filter(|id| *id != message_id)
            .filter_map(|id| self.messages.get(id))
            .any(|m| m.status.is_active())
    }
}

/// Message store held entirely in memory
#[derive(Default)]
pub struct InMemoryMessageStore {
    state: RwLock<StoreState>,
}

impl InMemoryMessageStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a thread
    pub fn insert_thread(&self, thread: Thread) {
        let mut state = self.state.write();
        state.order.entry(thread.id.clone()).or_default();
        state.threads.insert(thread.id.clone(), thread);
    }

    /// Insert a message at the end of its thread, creating the thread if needed
    pub fn insert_message(&self, message: Message) {
        self.state.write().insert(message);
    }

    /// Insert a placeholder unless its thread already has a non-terminal message
    ///
    /// Returns false (and stores nothing) when the thread is busy.
    pub fn insert_placeholder(&self, message: Message) -> bool {
        let mut state = self.state.write();
        if state.has_active_sibling(&message.thread_id, &message.id) {
            return false;
        }
        state.insert(message);
        true
    }

    /// Remove a message and re-mirror its thread from the last remaining message
    pub fn remove_message(&self, message_id: &MessageId) -> Option<Message> {
        let mut state = self.state.write();
        let removed = state.messages.remove(message_id)?;
        let thread_id = removed.thread_id.clone();

        let order = state.order.entry(thread_id.clone()).or_default();
        order.retain(|id| id != message_id);
        let last = order.last().cloned();
        let status = last
            .and_then(|id| state.messages.get(&id))
            .map_or(ThreadStatus::Idle, |m| ThreadStatus::from(m.status));

        let thread = state.thread_mut(&thread_id);
        thread.status = status;
        thread.updated_at = now_ms();
        Some(removed)
    }

    /// Number of stored messages
    pub fn message_count(&self) -> usize {
        self.state.read().messages.len()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn list_history(&self, thread_id: &ThreadId) -> Result<Vec<Message>, StoreError> {
        let state = self.state.read();
        Ok(state
            .order
            .get(thread_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.messages.get(id).cloned())
            .collect())
    }

    async fn get_message(&self, message_id: &MessageId) -> Result<Option<Message>, StoreError> {
        Ok(self.state.read().messages.get(message_id).cloned())
    }

    async fn get_thread(&self, thread_id: &ThreadId) -> Result<Option<Thread>, StoreError> {
        Ok(self.state.read().threads.get(thread_id).cloned())
    }

    async fn claim(&self, message_id: &MessageId) -> Result<Option<u64>, StoreError> {
        let mut state = self.state.write();

        let message = state
            .messages
            .get(message_id)
            .ok_or_else(|| StoreError::MessageNotFound(message_id.clone()))?;

        if message.status != MessageStatus::Pending {
            debug!(message_id = %message_id, status = %message.status, "Claim rejected: not pending");
            return Ok(None);
        }
        if state.has_active_sibling(&message.thread_id, &message.id) {
            debug!(message_id = %message_id, "Claim rejected: thread has another active message");
            return Ok(None);
        }

        let thread_id = message.thread_id.clone();
        let Some(message) = state.messages.get_mut(message_id) else {
            return Err(StoreError::MessageNotFound(message_id.clone()));
        };
        message.status = MessageStatus::Streaming;
        message.generation += 1;
        message.touch();
        let generation = message.generation;

        let thread = state.thread_mut(&thread_id);
        thread.status = ThreadStatus::Streaming;
        thread.is_streaming = true;
        thread.updated_at = now_ms();

        Ok(Some(generation))
    }

    async fn try_update(&self, patch: MessagePatch) -> Result<bool, StoreError> {
        let mut state = self.state.write();

        let message = state
            .messages
            .get_mut(&patch.message_id)
            .ok_or_else(|| StoreError::MessageNotFound(patch.message_id.clone()))?;

        if message.status.is_terminal() {
            return Ok(false);
        }
        if patch
            .generation
            .is_some_and(|generation| generation != message.generation)
        {
            debug!(
                message_id = %patch.message_id,
                held = ?patch.generation,
                current = message.generation,
                "Stale generation epoch"
            );
            return Ok(false);
        }
        if let Some(next) = patch.status {
            if next != message.status && !message.status.can_transition_to(next) {
                return Ok(false);
            }
        }
        if patch.stop_reason.is_some() && !patch.status.is_some_and(|s| s.is_terminal()) {
            return Ok(false);
        }

        if let Some(content) = patch.content {
            message.content = content;
        }
        if let Some(reasoning) = patch.reasoning {
            message.reasoning = Some(reasoning);
        }
        if let Some(stop_reason) = patch.stop_reason {
            message.stop_reason = Some(stop_reason);
        }
        let changed_status = patch.status.filter(|next| *next != message.status);
        if let Some(next) = changed_status {
            message.status = next;
        }
        message.touch();

        if let Some(next) = changed_status {
            let thread_id = message.thread_id.clone();
            let thread = state.thread_mut(&thread_id);
            thread.status = ThreadStatus::from(next);
            if next.is_terminal() {
                thread.is_streaming = false;
            }
            thread.updated_at = now_ms();
        }

        Ok(true)
    }

    async fn set_thread_streaming(
        &self,
        thread_id: &ThreadId,
        streaming: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let thread = state
            .threads
            .get_mut(thread_id)
            .ok_or_else(|| StoreError::ThreadNotFound(thread_id.clone()))?;
        thread.is_streaming = streaming;
        thread.updated_at = now_ms();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::StopReason;
    use pretty_assertions::assert_eq;

    fn seeded() -> (InMemoryMessageStore, MessageId, ThreadId) {
        let store = InMemoryMessageStore::new();
        let thread_id = ThreadId::from("t1");
        store.insert_message(Message::user(thread_id.clone(), "hi"));
        let message_id = MessageId::from("m1");
        store.insert_message(Message::placeholder(
            message_id.clone(),
            thread_id.clone(),
            "llama3",
        ));
        (store, message_id, thread_id)
    }

    #[tokio::test]
    async fn test_claim_moves_pending_to_streaming() {
        let (store, message_id, thread_id) = seeded();

        assert_eq!(store.claim(&message_id).await.unwrap(), Some(1));

        let message = store.get_message(&message_id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Streaming);
        let thread = store.get_thread(&thread_id).await.unwrap().unwrap();
        assert!(thread.is_streaming);
        assert_eq!(thread.status, ThreadStatus::Streaming);

        // Second claim is rejected
        assert_eq!(store.claim(&message_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_claim_rejects_second_active_message_in_thread() {
        let (store, message_id, thread_id) = seeded();
        store.claim(&message_id).await.unwrap();

        let other = MessageId::from("m2");
        store.insert_message(Message::placeholder(other.clone(), thread_id, "llama3"));
        assert_eq!(store.claim(&other).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_pending_sibling_blocks_claim() {
        let (store, message_id, thread_id) = seeded();

        let other = MessageId::from("m2");
        store.insert_message(Message::placeholder(other.clone(), thread_id, "llama3"));
        assert_eq!(store.claim(&other).await.unwrap(), None);
        assert_eq!(store.claim(&message_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_insert_placeholder_refuses_busy_thread() {
        let (store, message_id, thread_id) = seeded();

        let other = MessageId::from("m2");
        let placeholder = Message::placeholder(other.clone(), thread_id.clone(), "llama3");
        assert!(!store.insert_placeholder(placeholder.clone()));
        assert!(store.get_message(&other).await.unwrap().is_none());

        let epoch = store.claim(&message_id).await.unwrap().unwrap();
        let finalize = MessagePatch::new(message_id)
            .generation(epoch)
            .finalize(MessageStatus::Done, StopReason::Completed);
        assert!(store.try_update(finalize).await.unwrap());

        assert!(store.insert_placeholder(placeholder));
        let thread = store.get_thread(&thread_id).await.unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::Pending);
    }

    #[tokio::test]
    async fn test_remove_message_restores_thread_mirror() {
        let (store, message_id, thread_id) = seeded();

        let removed = store.remove_message(&message_id).unwrap();
        assert_eq!(removed.id, message_id);
        assert!(store.remove_message(&message_id).is_none());

        let history = store.list_history(&thread_id).await.unwrap();
        assert_eq!(history.len(), 1);
        let thread = store.get_thread(&thread_id).await.unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::Done);
    }

    #[tokio::test]
    async fn test_claim_unknown_message() {
        let store = InMemoryMessageStore::new();
        let result = store.claim(&MessageId::from("nope")).await;
        assert_eq!(
            result,
            Err(StoreError::MessageNotFound(MessageId::from("nope")))
        );
    }

    #[tokio::test]
    async fn test_try_update_after_terminal_is_noop() {
        let (store, message_id, thread_id) = seeded();
        let epoch = store.claim(&message_id).await.unwrap().unwrap();

        let finalize = MessagePatch::new(message_id.clone())
            .generation(epoch)
            .content("done text")
            .finalize(MessageStatus::Done, StopReason::Completed);
        assert!(store.try_update(finalize.clone()).await.unwrap());
        assert!(!store.try_update(finalize).await.unwrap());

        let late = MessagePatch::new(message_id.clone()).content("late");
        assert!(!store.try_update(late).await.unwrap());

        let message = store.get_message(&message_id).await.unwrap().unwrap();
        assert_eq!(message.content, "done text");
        assert_eq!(message.stop_reason, Some(StopReason::Completed));

        let thread = store.get_thread(&thread_id).await.unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::Done);
        assert!(!thread.is_streaming);
    }

    #[tokio::test]
    async fn test_try_update_rejects_stale_epoch() {
        let (store, message_id, _) = seeded();
        let epoch = store.claim(&message_id).await.unwrap().unwrap();

        let stale = MessagePatch::new(message_id.clone())
            .generation(epoch + 1)
            .content("x");
        assert!(!store.try_update(stale).await.unwrap());

        let current = MessagePatch::new(message_id).generation(epoch).content("x");
        assert!(store.try_update(current).await.unwrap());
    }

    #[tokio::test]
    async fn test_try_update_rejects_invalid_transitions() {
        let (store, message_id, _) = seeded();

        // pending → done skips streaming
        let skip = MessagePatch::new(message_id.clone())
            .finalize(MessageStatus::Done, StopReason::Completed);
        assert!(!store.try_update(skip).await.unwrap());

        store.claim(&message_id).await.unwrap();

        // stop reason without a terminal status
        let mut bad = MessagePatch::new(message_id.clone());
        bad.stop_reason = Some(StopReason::Stopped);
        assert!(!store.try_update(bad).await.unwrap());

        let back = MessagePatch::new(message_id.clone()).status(MessageStatus::Pending);
        assert!(!store.try_update(back).await.unwrap());
    }

    #[tokio::test]
    async fn test_reasoning_status_mirrors_thread_as_streaming() {
        let (store, message_id, thread_id) = seeded();
        store.claim(&message_id).await.unwrap();

        let patch = MessagePatch::new(message_id.clone())
            .reasoning("thinking")
            .status(MessageStatus::Reasoning);
        assert!(store.try_update(patch).await.unwrap());

        let message = store.get_message(&message_id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Reasoning);
        assert_eq!(message.reasoning.as_deref(), Some("thinking"));
        let thread = store.get_thread(&thread_id).await.unwrap().unwrap();
        assert_eq!(thread.status, ThreadStatus::Streaming);
    }

    #[tokio::test]
    async fn test_history_is_ordered() {
        let (store, _, thread_id) = seeded();
        let history = store.list_history(&thread_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "hi");
        assert_eq!(history[1].status, MessageStatus::Pending);

        let empty = store.list_history(&ThreadId::from("other")).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_set_thread_streaming() {
        let (store, message_id, thread_id) = seeded();
        store.claim(&message_id).await.unwrap();

        store.set_thread_streaming(&thread_id, false).await.unwrap();
        let thread = store.get_thread(&thread_id).await.unwrap().unwrap();
        assert!(!thread.is_streaming);

        let missing = store
            .set_thread_streaming(&ThreadId::from("missing"), false)
            .await;
        assert!(matches!(missing, Err(StoreError::ThreadNotFound(_))));
    }
}
