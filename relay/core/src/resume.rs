//! Resume Server
//!
//! Streams a message's output to a client that did not start its generation.
//! The chunk log is replayed from the start (catch-up burst), then polled for
//! new records until the completion marker.
//!
//! Ending conditions, in order of precedence:
//!
//! - the client goes away (nothing else happens; the generation is untouched)
//! - the completion marker is read
//! - a log that was seen disappears (expired)
//! - a read fails (surfaced as an error item)
//! - nothing new arrives within the idle limit (surfaced as an error item)
//!
//! Reasoning never reaches the chunk log. When a record store is attached,
//! the idle limit is re-armed for as long as the record is still active, so a
//! long reasoning phase does not end the stream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info_span, warn, Instrument};

use crate::chunk_log::{ChunkEntry, ChunkLog, ChunkLogError};
use crate::config::ResumeSettings;
use crate::messages::MessageId;
use crate::store::MessageStore;

/// Errors delivered to a resuming client
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ResumeError {
    /// The chunk log could not be read
    #[error(transparent)]
    ChunkLog(#[from] ChunkLogError),

    /// No new records for too long
    #[error("no new output for {0:?}")]
    IdleTimeout(Duration),
}

/// Catch-up plus live-follow reader over the chunk log
#[derive(Clone)]
pub struct ResumeServer {
    chunk_log: Arc<dyn ChunkLog>,
    store: Option<Arc<dyn MessageStore>>,
    settings: ResumeSettings,
}

impl ResumeServer {
    /// Create a resume server
    pub fn new(chunk_log: Arc<dyn ChunkLog>, settings: ResumeSettings) -> Self {
        Self {
            chunk_log,
            store: None,
            settings,
        }
    }

    /// Consult `store` before giving up on an idle log
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Follow `message_id`'s output
    ///
    /// The receiver yields text fragments in log order and closes after the
    /// completion marker. Dropping it stops the poll loop.
    pub fn resume(&self, message_id: MessageId) -> mpsc::Receiver<Result<String, ResumeError>> {
        let (tx, rx) = mpsc::channel(64);
        let span = info_span!("resume", message_id = %message_id);
        tokio::spawn(
            follow(
                Arc::clone(&self.chunk_log),
                self.store.clone(),
                self.settings.clone(),
                message_id,
                tx,
            )
            .instrument(span),
        );
        rx
    }
}

async fn follow(
    chunk_log: Arc<dyn ChunkLog>,
    store: Option<Arc<dyn MessageStore>>,
    settings: ResumeSettings,
    message_id: MessageId,
    tx: mpsc::Sender<Result<String, ResumeError>>,
) {
    let idle_timeout = settings.idle_timeout();
    let mut ticker = tokio::time::interval(settings.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut delivered = 0usize;
    let mut seen = false;
    let mut last_progress = Instant::now();

    loop {
        tokio::select! {
            () = tx.closed() => {
                debug!(delivered, "Resume client disconnected");
                return;
            }
            _ = ticker.tick() => {}
        }

        match chunk_log.read_from(&message_id, delivered).await {
            Ok(Some(entries)) => {
                seen = true;
                if !entries.is_empty() {
                    last_progress = Instant::now();
                }
                for entry in entries {
                    delivered += 1;
                    match entry {
                        ChunkEntry::Text { text } => {
                            if tx.send(Ok(text)).await.is_err() {
                                return;
                            }
                        }
                        ChunkEntry::Completion { status } => {
                            debug!(delivered, %status, "Resume reached completion marker");
                            return;
                        }
                    }
                }
            }
            Ok(None) if seen => {
                debug!(delivered, "Chunk log expired while resuming");
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Chunk log read failed");
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        }

        if last_progress.elapsed() >= idle_timeout {
            if still_generating(store.as_deref(), &message_id).await {
                last_progress = Instant::now();
                continue;
            }
            warn!(delivered, "Resume idle limit reached");
            let _ = tx.send(Err(ResumeError::IdleTimeout(idle_timeout))).await;
            return;
        }
    }
}

async fn still_generating(store: Option<&dyn MessageStore>, message_id: &MessageId) -> bool {
    let Some(store) = store else {
        return false;
    };
    match store.get_message(message_id).await {
        Ok(Some(message)) => message.status.is_active(),
        Ok(None) => false,
        Err(e) => {
            warn!(error = %e, "Record lookup failed at idle limit");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_log::InMemoryChunkLog;
    use crate::messages::{Message, MessageStatus, ThreadId};
    use crate::store::{InMemoryMessageStore, MessagePatch};

    fn settings() -> ResumeSettings {
        ResumeSettings {
            poll_interval_ms: 10,
            idle_timeout_secs: 5,
        }
    }

    async fn drain(mut rx: mpsc::Receiver<Result<String, ResumeError>>) -> Vec<Result<String, ResumeError>> {
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn test_completed_log_replays_and_closes() {
        let log = Arc::new(InMemoryChunkLog::default());
        let id = MessageId::from("m1");
        log.append(&id, "A").await.unwrap();
        log.append(&id, "B").await.unwrap();
        log.mark_complete(&id, MessageStatus::Done).await.unwrap();

        let server = ResumeServer::new(log, settings());
        let items = drain(server.resume(id)).await;
        assert_eq!(items, vec![Ok("A".to_string()), Ok("B".to_string())]);
    }

    #[tokio::test]
    async fn test_idle_limit_ends_stream() {
        let log = Arc::new(InMemoryChunkLog::default());
        let server = ResumeServer::new(
            log,
            ResumeSettings {
                poll_interval_ms: 5,
                idle_timeout_secs: 0,
            },
        );

        let items = drain(server.resume(MessageId::from("never"))).await;
        assert_eq!(
            items,
            vec![Err(ResumeError::IdleTimeout(Duration::ZERO))]
        );
    }

    #[tokio::test]
    async fn test_active_record_rearms_idle_limit() {
        let log = Arc::new(InMemoryChunkLog::default());
        let store = Arc::new(InMemoryMessageStore::new());
        let id = MessageId::from("m1");
        store.insert_message(Message::placeholder(id.clone(), ThreadId::from("t1"), "llama3"));
        let epoch = store.claim(&id).await.unwrap().unwrap();
        let thinking = MessagePatch::new(id.clone())
            .generation(epoch)
            .status(MessageStatus::Reasoning)
            .reasoning("thinking");
        assert!(store.try_update(thinking).await.unwrap());

        let server = ResumeServer::new(
            log.clone(),
            ResumeSettings {
                poll_interval_ms: 5,
                idle_timeout_secs: 0,
            },
        )
        .with_store(store.clone());
        let mut rx = server.resume(id.clone());

        // Many idle windows pass with an empty log while the record reasons
        let quiet = tokio::time::timeout(Duration::from_millis(60), rx.recv()).await;
        assert!(quiet.is_err());

        log.append(&id, "answer").await.unwrap();
        log.mark_complete(&id, MessageStatus::Done).await.unwrap();
        assert_eq!(drain(rx).await, vec![Ok("answer".to_string())]);

        // A record the store does not know gets the plain idle limit
        let items = drain(server.resume(MessageId::from("gone"))).await;
        assert_eq!(items, vec![Err(ResumeError::IdleTimeout(Duration::ZERO))]);
    }
}
