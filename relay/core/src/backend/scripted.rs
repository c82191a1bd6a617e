//! Scripted Backend
//!
//! A provider that replays a fixed script of tokens, or forwards tokens pushed
//! by a [`ScriptController`]. Used by tests and by the daemon's `--scripted`
//! demo mode; it honours cancellation exactly like a network provider.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::traits::{FinishReason, LlmBackend, LlmRequest, ModelInfo, StreamingToken};

/// One step of a scripted provider response
#[derive(Clone, Debug)]
pub enum ScriptStep {
    /// Emit a content fragment
    Content(String),
    /// Emit a reasoning fragment
    Reasoning(String),
    /// Wait before the next step (cut short by cancellation)
    Pause(Duration),
    /// Emit a finish marker and end
    Finish(FinishReason),
    /// Emit an error and end
    Fail(String),
    /// Emit nothing until cancelled
    Hang,
}

impl ScriptStep {
    /// Content step
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content(text.into())
    }

    /// Reasoning step
    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::Reasoning(text.into())
    }

    /// Pause step in milliseconds
    #[must_use]
    pub fn pause_ms(ms: u64) -> Self {
        Self::Pause(Duration::from_millis(ms))
    }

    /// Clean finish
    #[must_use]
    pub fn finish() -> Self {
        Self::Finish(FinishReason::Stop)
    }
}

/// Pushes tokens into a [`ScriptedBackend`] created with
/// [`ScriptedBackend::controlled`]
#[derive(Clone)]
pub struct ScriptController {
    tx: mpsc::UnboundedSender<StreamingToken>,
}

impl ScriptController {
    /// Push a content fragment; false once the generation is gone
    pub fn content(&self, text: impl Into<String>) -> bool {
        self.tx.send(StreamingToken::Content(text.into())).is_ok()
    }

    /// Push a reasoning fragment
    pub fn reasoning(&self, text: impl Into<String>) -> bool {
        self.tx.send(StreamingToken::Reasoning(text.into())).is_ok()
    }

    /// Finish with the given reason
    pub fn finish(&self, reason: FinishReason) -> bool {
        self.tx.send(StreamingToken::Finish { reason }).is_ok()
    }

    /// Fail the stream
    pub fn fail(&self, error: impl Into<String>) -> bool {
        self.tx.send(StreamingToken::Error(error.into())).is_ok()
    }
}

/// Provider that replays scripted tokens
pub struct ScriptedBackend {
    steps: Vec<ScriptStep>,
    live: Mutex<Option<mpsc::UnboundedReceiver<StreamingToken>>>,
    start_error: Option<String>,
    models: Vec<String>,
    requests: Mutex<Vec<LlmRequest>>,
    tokens: Mutex<Vec<CancellationToken>>,
}

impl ScriptedBackend {
    /// Replay `steps` for every request
    #[must_use]
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps,
            live: Mutex::new(None),
            start_error: None,
            models: vec!["scripted".to_string()],
            requests: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
        }
    }

    /// Stream `text` one word at a time, then finish
    #[must_use]
    pub fn words(text: &str) -> Self {
        let mut steps: Vec<ScriptStep> = text
            .split_inclusive(' ')
            .map(ScriptStep::content)
            .collect();
        steps.push(ScriptStep::finish());
        Self::new(steps)
    }

    /// A backend whose single stream is driven by the returned controller
    #[must_use]
    pub fn controlled() -> (Self, ScriptController) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut backend = Self::new(Vec::new());
        backend.live = Mutex::new(Some(rx));
        (backend, ScriptController { tx })
    }

    /// A backend whose calls fail before any token is produced
    pub fn failing(error: impl Into<String>) -> Self {
        let mut backend = Self::new(Vec::new());
        backend.start_error = Some(error.into());
        backend
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().clone()
    }

    /// Whether any call's cancellation token has fired
    pub fn was_cancelled(&self) -> bool {
        self.tokens.lock().iter().any(CancellationToken::is_cancelled)
    }

    async fn replay(
        steps: Vec<ScriptStep>,
        tx: mpsc::Sender<StreamingToken>,
        cancel: CancellationToken,
    ) {
        for step in steps {
            if cancel.is_cancelled() {
                return;
            }
            let token = match step {
                ScriptStep::Content(text) => StreamingToken::Content(text),
                ScriptStep::Reasoning(text) => StreamingToken::Reasoning(text),
                ScriptStep::Finish(reason) => StreamingToken::Finish { reason },
                ScriptStep::Fail(error) => StreamingToken::Error(error),
                ScriptStep::Pause(duration) => {
                    if tokio::time::timeout(duration, cancel.cancelled())
                        .await
                        .is_ok()
                    {
                        return;
                    }
                    continue;
                }
                ScriptStep::Hang => {
                    cancel.cancelled().await;
                    return;
                }
            };
            let terminal = matches!(
                token,
                StreamingToken::Finish { .. } | StreamingToken::Error(_)
            );
            if tx.send(token).await.is_err() || terminal {
                return;
            }
        }
    }

    async fn relay(
        mut source: mpsc::UnboundedReceiver<StreamingToken>,
        tx: mpsc::Sender<StreamingToken>,
        cancel: CancellationToken,
    ) {
        loop {
            let token = tokio::select! {
                () = cancel.cancelled() => return,
                token = source.recv() => token,
            };
            let Some(token) = token else { return };
            let terminal = matches!(
                token,
                StreamingToken::Finish { .. } | StreamingToken::Error(_)
            );
            if tx.send(token).await.is_err() || terminal {
                return;
            }
        }
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "Scripted"
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn send_streaming(
        &self,
        request: &LlmRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>> {
        self.requests.lock().push(request.clone());

        if let Some(ref error) = self.start_error {
            anyhow::bail!("{error}");
        }

        let (tx, rx) = mpsc::channel(100);
        self.tokens.lock().push(cancel.clone());

        let live = self.live.lock().take();
        if let Some(source) = live {
            tokio::spawn(Self::relay(source, tx, cancel));
        } else {
            tokio::spawn(Self::replay(self.steps.clone(), tx, cancel));
        }

        Ok(rx)
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        Ok(self
            .models
            .iter()
            .map(|name| ModelInfo {
                name: name.clone(),
                size: None,
                parameters: None,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut rx: mpsc::Receiver<StreamingToken>) -> Vec<StreamingToken> {
        let mut tokens = Vec::new();
        while let Some(token) = rx.recv().await {
            tokens.push(token);
        }
        tokens
    }

    #[tokio::test]
    async fn test_replays_words_then_finishes() {
        let backend = ScriptedBackend::words("one two");
        let rx = backend
            .send_streaming(&LlmRequest::new("scripted"), CancellationToken::new())
            .await
            .unwrap();

        let tokens = collect(rx).await;
        assert_eq!(
            tokens,
            vec![
                StreamingToken::Content("one ".to_string()),
                StreamingToken::Content("two".to_string()),
                StreamingToken::Finish {
                    reason: FinishReason::Stop
                },
            ]
        );
        assert_eq!(backend.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_hang_ends_on_cancel() {
        let backend = ScriptedBackend::new(vec![ScriptStep::content("a"), ScriptStep::Hang]);
        let cancel = CancellationToken::new();
        let mut rx = backend
            .send_streaming(&LlmRequest::new("scripted"), cancel.clone())
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(StreamingToken::Content("a".to_string())));
        cancel.cancel();
        assert_eq!(rx.recv().await, None);
        assert!(backend.was_cancelled());
    }

    #[tokio::test]
    async fn test_controller_drives_stream() {
        let (backend, controller) = ScriptedBackend::controlled();
        let rx = backend
            .send_streaming(&LlmRequest::new("scripted"), CancellationToken::new())
            .await
            .unwrap();

        assert!(controller.reasoning("think"));
        assert!(controller.content("answer"));
        assert!(controller.finish(FinishReason::Stop));

        let tokens = collect(rx).await;
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0], StreamingToken::Reasoning("think".to_string()));
    }

    #[tokio::test]
    async fn test_failing_backend() {
        let backend = ScriptedBackend::failing("connection refused");
        let result = backend
            .send_streaming(&LlmRequest::new("scripted"), CancellationToken::new())
            .await;
        assert!(result.is_err());
    }
}
