//! Stream controller tests against an in-process fake transport

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio_test::assert_ok;

use relay_client::{
    ClientError, ControllerSettings, StartRequest, StreamController, StreamEvent, StreamPhase,
    StreamTransport, TerminalBadge, TextStream,
};
use relay_core::{Message, MessageId, MessageStatus, StopReason, ThreadId};

// ============================================================================
// Fake Transport
// ============================================================================

#[derive(Default)]
struct FakeTransport {
    streams: Mutex<VecDeque<Result<TextStream, ClientError>>>,
    records: Mutex<HashMap<MessageId, VecDeque<Message>>>,
    starts: Mutex<Vec<StartRequest>>,
    resumes: Mutex<Vec<(MessageId, String)>>,
    cancels: Mutex<Vec<MessageId>>,
}

impl FakeTransport {
    /// Queue a stream for the next start/resume; the sender drives it
    fn open_stream(&self) -> mpsc::Sender<Result<String, ClientError>> {
        let (tx, rx) = mpsc::channel(16);
        self.streams.lock().push_back(Ok(rx));
        tx
    }

    fn refuse(&self, error: ClientError) {
        self.streams.lock().push_back(Err(error));
    }

    /// Records returned by successive fetches; the last one repeats
    fn set_records(&self, message_id: &MessageId, records: Vec<Message>) {
        self.records
            .lock()
            .insert(message_id.clone(), records.into_iter().collect());
    }

    fn next_stream(&self) -> Result<TextStream, ClientError> {
        self.streams
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(ClientError::Stream("no stream queued".to_string())))
    }
}

#[async_trait]
impl StreamTransport for FakeTransport {
    async fn start(&self, request: &StartRequest) -> Result<TextStream, ClientError> {
        self.starts.lock().push(request.clone());
        self.next_stream()
    }

    async fn resume(
        &self,
        message_id: &MessageId,
        session_id: &str,
    ) -> Result<TextStream, ClientError> {
        self.resumes
            .lock()
            .push((message_id.clone(), session_id.to_string()));
        self.next_stream()
    }

    async fn cancel(
        &self,
        _thread_id: &ThreadId,
        message_id: &MessageId,
    ) -> Result<(), ClientError> {
        self.cancels.lock().push(message_id.clone());
        Ok(())
    }

    async fn fetch_message(&self, message_id: &MessageId) -> Result<Message, ClientError> {
        let mut records = self.records.lock();
        let queue = records.get_mut(message_id).ok_or(ClientError::Status {
            status: 404,
            message: "message not found".to_string(),
        })?;
        let record = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        record.ok_or(ClientError::Status {
            status: 404,
            message: "message not found".to_string(),
        })
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn thread() -> ThreadId {
    ThreadId::from("t1")
}

fn record(id: &str, status: MessageStatus, reason: Option<StopReason>, content: &str) -> Message {
    let mut message = Message::placeholder(MessageId::from(id), thread(), "llama3");
    message.status = status;
    message.stop_reason = reason;
    message.content = content.to_string();
    message
}

fn controller(fake: &Arc<FakeTransport>) -> StreamController<FakeTransport> {
    StreamController::new(
        Arc::clone(fake),
        ControllerSettings {
            fallback_poll: Duration::from_millis(10),
            fallback_attempts: 20,
            ..ControllerSettings::default()
        },
    )
}

fn start(id: &str) -> StartRequest {
    StartRequest::new(thread(), MessageId::from(id), "llama3")
}

/// Drain events; returns the rendered text and the final event
async fn collect(mut events: mpsc::Receiver<StreamEvent>) -> (String, StreamEvent) {
    let mut text = String::new();
    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Text(chunk) => text.push_str(&chunk),
            finished @ StreamEvent::Finished { .. } => return (text, finished),
        }
    }
    panic!("event stream ended without Finished");
}

fn finished_phase(event: &StreamEvent) -> (StreamPhase, TerminalBadge) {
    match event {
        StreamEvent::Finished { phase, badge, .. } => (*phase, *badge),
        StreamEvent::Text(_) => panic!("not a Finished event"),
    }
}

// ============================================================================
// Generate
// ============================================================================

#[tokio::test]
async fn test_generate_renders_and_completes() {
    let fake = Arc::new(FakeTransport::default());
    let controller = controller(&fake);
    let id = MessageId::from("m1");

    let tx = fake.open_stream();
    fake.set_records(
        &id,
        vec![record("m1", MessageStatus::Done, Some(StopReason::Completed), "Hello, world")],
    );

    let events = assert_ok!(controller.generate(start("m1")).await);
    for chunk in ["Hel", "lo, ", "world"] {
        tx.send(Ok(chunk.to_string())).await.unwrap();
    }
    drop(tx);

    let (text, finished) = collect(events).await;
    assert_eq!(text, "Hello, world");
    assert_eq!(
        finished_phase(&finished),
        (StreamPhase::Completed, TerminalBadge::None)
    );

    let session = controller.session(&id).unwrap();
    assert_eq!(session.text, "Hello, world");
    assert!(!session.resumed);
    assert_eq!(controller.phase(&id), StreamPhase::Completed);
    assert_eq!(fake.starts.lock().len(), 1);
}

#[tokio::test]
async fn test_cancel_keeps_local_stream_open() {
    let fake = Arc::new(FakeTransport::default());
    let controller = controller(&fake);
    let id = MessageId::from("m1");

    let tx = fake.open_stream();
    let mut events = controller.generate(start("m1")).await.unwrap();

    tx.send(Ok("Hel".to_string())).await.unwrap();
    assert_eq!(events.recv().await, Some(StreamEvent::Text("Hel".to_string())));

    controller.cancel(&thread(), &id).await.unwrap();
    assert_eq!(*fake.cancels.lock(), vec![id.clone()]);
    assert_eq!(controller.phase(&id), StreamPhase::Receiving);

    // Bytes already in flight still render
    tx.send(Ok("lo".to_string())).await.unwrap();
    assert_eq!(events.recv().await, Some(StreamEvent::Text("lo".to_string())));

    fake.set_records(
        &id,
        vec![record("m1", MessageStatus::Done, Some(StopReason::Stopped), "Hel")],
    );
    drop(tx);

    let (_, finished) = collect(events).await;
    let (phase, badge) = finished_phase(&finished);
    assert_eq!(phase, StreamPhase::Stopped);
    assert_eq!(badge.label(), Some("Stopped by user"));
}

#[tokio::test]
async fn test_provider_error_shows_error_badge() {
    let fake = Arc::new(FakeTransport::default());
    let controller = controller(&fake);
    let id = MessageId::from("m1");

    let tx = fake.open_stream();
    fake.set_records(
        &id,
        vec![record("m1", MessageStatus::Error, Some(StopReason::Error), "par")],
    );
    let events = controller.generate(start("m1")).await.unwrap();
    tx.send(Ok("par".to_string())).await.unwrap();
    drop(tx);

    let (text, finished) = collect(events).await;
    assert_eq!(text, "par");
    let (phase, badge) = finished_phase(&finished);
    assert_eq!(phase, StreamPhase::Errored);
    assert_eq!(badge.label(), Some("An error occurred"));
}

#[tokio::test]
async fn test_refused_start_marks_session_errored() {
    let fake = Arc::new(FakeTransport::default());
    let controller = controller(&fake);
    let id = MessageId::from("m1");

    fake.refuse(ClientError::Status {
        status: 409,
        message: "generation already active for m1".to_string(),
    });
    let err = controller.generate(start("m1")).await.unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(controller.phase(&id), StreamPhase::Errored);
}

#[tokio::test]
async fn test_duplicate_generate_rejected_locally() {
    let fake = Arc::new(FakeTransport::default());
    let controller = controller(&fake);

    let _tx = fake.open_stream();
    let _events = controller.generate(start("m1")).await.unwrap();

    let err = controller.generate(start("m1")).await.unwrap_err();
    assert!(matches!(err, ClientError::SessionActive(_)));
    assert_eq!(fake.starts.lock().len(), 1);
}

// ============================================================================
// Resume
// ============================================================================

#[tokio::test]
async fn test_resume_falls_back_to_polling_after_stream_error() {
    let fake = Arc::new(FakeTransport::default());
    let controller = controller(&fake);
    let id = MessageId::from("m1");

    let tx = fake.open_stream();
    tx.send(Ok("AB".to_string())).await.unwrap();
    tx.send(Err(ClientError::Stream("log unavailable".to_string())))
        .await
        .unwrap();
    fake.set_records(
        &id,
        vec![
            record("m1", MessageStatus::Streaming, None, "AB"),
            record("m1", MessageStatus::Streaming, None, "ABC"),
            record("m1", MessageStatus::Done, Some(StopReason::Completed), "ABCD"),
        ],
    );

    let events = controller.resume(thread(), id.clone()).unwrap();
    let (text, finished) = collect(events).await;
    assert_eq!(text, "AB");

    let StreamEvent::Finished { phase, message, .. } = finished else {
        panic!("expected Finished");
    };
    assert_eq!(phase, StreamPhase::Completed);
    assert_eq!(message.unwrap().content, "ABCD");

    let session = controller.session(&id).unwrap();
    assert!(session.resumed);
    let resumes = fake.resumes.lock().clone();
    assert_eq!(resumes, vec![(id, session.session_id)]);
}

#[tokio::test]
async fn test_resume_that_cannot_open_polls_the_record() {
    let fake = Arc::new(FakeTransport::default());
    let controller = controller(&fake);
    let id = MessageId::from("m1");

    fake.refuse(ClientError::Stream("connection refused".to_string()));
    fake.set_records(
        &id,
        vec![record("m1", MessageStatus::Done, Some(StopReason::Stopped), "x")],
    );

    let (text, finished) = collect(controller.resume(thread(), id).unwrap()).await;
    assert_eq!(text, "");
    assert_eq!(
        finished_phase(&finished),
        (StreamPhase::Stopped, TerminalBadge::StoppedByUser)
    );
}

#[tokio::test]
async fn test_record_that_never_finishes_ends_errored() {
    let fake = Arc::new(FakeTransport::default());
    let controller = StreamController::new(
        Arc::clone(&fake),
        ControllerSettings {
            fallback_poll: Duration::from_millis(5),
            fallback_attempts: 3,
            ..ControllerSettings::default()
        },
    );
    let id = MessageId::from("m1");

    drop(fake.open_stream());
    fake.set_records(&id, vec![record("m1", MessageStatus::Streaming, None, "A")]);

    let (_, finished) = collect(controller.resume(thread(), id).unwrap()).await;
    let StreamEvent::Finished { phase, message, .. } = finished else {
        panic!("expected Finished");
    };
    assert_eq!(phase, StreamPhase::Errored);
    assert_eq!(message.unwrap().status, MessageStatus::Streaming);
}

#[tokio::test]
async fn test_reconcile_resumes_only_orphaned_generations() {
    let fake = Arc::new(FakeTransport::default());
    let controller = controller(&fake);

    // m3 already has a local session
    let _tx3 = fake.open_stream();
    let _events3 = controller.generate(start("m3")).await.unwrap();

    let _tx1 = fake.open_stream();
    let mut user = Message::user(thread(), "hi");
    user.id = MessageId::from("u1");
    let messages = vec![
        user,
        record("m1", MessageStatus::Streaming, None, "AB"),
        record("m2", MessageStatus::Done, Some(StopReason::Completed), "done"),
        record("m3", MessageStatus::Reasoning, None, ""),
    ];

    let resumed = controller.reconcile(&messages);
    let ids: Vec<MessageId> = resumed.iter().map(|(id, _)| id.clone()).collect();
    assert_eq!(ids, vec![MessageId::from("m1")]);
    assert!(controller.session(&MessageId::from("m1")).unwrap().resumed);

    // Resumed now, so a second pass does nothing
    assert!(controller.reconcile(&messages).is_empty());
}

#[test]
fn test_badges_from_persisted_records() {
    let completed = record("m", MessageStatus::Done, Some(StopReason::Completed), "");
    let stopped = record("m", MessageStatus::Done, Some(StopReason::Stopped), "");
    let failed = record("m", MessageStatus::Error, Some(StopReason::Error), "");
    let running = record("m", MessageStatus::Streaming, None, "");

    assert_eq!(TerminalBadge::from_message(&completed), TerminalBadge::None);
    assert_eq!(TerminalBadge::from_message(&stopped), TerminalBadge::StoppedByUser);
    assert_eq!(TerminalBadge::from_message(&failed), TerminalBadge::ErrorOccurred);
    assert_eq!(TerminalBadge::from_message(&running), TerminalBadge::None);
    assert_eq!(StreamPhase::from_message(&running), None);
}
