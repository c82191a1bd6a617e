//! Stream Transport
//!
//! The controller talks to the daemon through [`StreamTransport`], so tests
//! can drive it with an in-process fake. [`HttpTransport`] is the `reqwest`
//! implementation.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use relay_core::{ChatTurn, Message, MessageId, ThreadId};

use crate::error::ClientError;

/// Decoded text fragments of an open stream; a stream error ends it
pub type TextStream = mpsc::Receiver<Result<String, ClientError>>;

/// Parameters of a fresh generation
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    /// Thread of the placeholder
    pub thread_id: ThreadId,
    /// Placeholder to fill
    pub message_id: MessageId,
    /// Provider model id
    pub model: String,
    /// Explicit history (seeds an unknown placeholder on the daemon)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<ChatTurn>>,
}

impl StartRequest {
    /// Request that lets the daemon load history itself
    pub fn new(thread_id: ThreadId, message_id: MessageId, model: impl Into<String>) -> Self {
        Self {
            thread_id,
            message_id,
            model: model.into(),
            history: None,
        }
    }

    /// Supply the history explicitly
    #[must_use]
    pub fn with_history(mut self, history: Vec<ChatTurn>) -> Self {
        self.history = Some(history);
        self
    }
}

/// Calls the controller makes against the daemon
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Start a generation and open its byte stream
    async fn start(&self, request: &StartRequest) -> Result<TextStream, ClientError>;

    /// Follow a generation started elsewhere
    async fn resume(
        &self,
        message_id: &MessageId,
        session_id: &str,
    ) -> Result<TextStream, ClientError>;

    /// Ask the running generation to stop
    async fn cancel(&self, thread_id: &ThreadId, message_id: &MessageId)
        -> Result<(), ClientError>;

    /// Fetch the persisted record
    async fn fetch_message(&self, message_id: &MessageId) -> Result<Message, ClientError>;
}

// ============================================================================
// UTF-8 Decoding
// ============================================================================

/// Decodes a byte stream whose chunks may split multi-byte characters
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as much of `bytes` (plus any carried tail) as forms whole
    /// characters; an incomplete trailing sequence is carried over
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Incomplete sequence at the end: wait for more bytes
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is left at end of stream
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

// ============================================================================
// HTTP Transport
// ============================================================================

/// `reqwest` transport against the relay daemon
#[derive(Clone)]
pub struct HttpTransport {
    base_url: String,
    token: Option<String>,
    http_client: reqwest::Client,
}

impl HttpTransport {
    /// Create a transport for `base_url` (e.g. `http://127.0.0.1:8787`)
    pub fn new(base_url: impl Into<String>) -> Self {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            http_client,
        }
    }

    /// Send `Authorization: Bearer <token>` on every call
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token {
            Some(ref token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
            .unwrap_or(body);
        Err(ClientError::Status {
            status: status.as_u16(),
            message,
        })
    }

    fn pump(response: reqwest::Response) -> TextStream {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut decoder = Utf8Decoder::new();
            let mut bytes = response.bytes_stream();
            while let Some(chunk) = bytes.next().await {
                let item = match chunk {
                    Ok(chunk) => {
                        let text = decoder.push(&chunk);
                        if text.is_empty() {
                            continue;
                        }
                        Ok(text)
                    }
                    Err(e) => {
                        warn!(error = %e, "Stream read failed");
                        let _ = tx.send(Err(ClientError::Stream(e.to_string()))).await;
                        return;
                    }
                };
                if tx.send(item).await.is_err() {
                    debug!("Stream reader dropped");
                    return;
                }
            }
            let rest = decoder.finish();
            if !rest.is_empty() {
                let _ = tx.send(Ok(rest)).await;
            }
        });
        rx
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelBody<'a> {
    thread_id: &'a ThreadId,
    message_id: &'a MessageId,
}

#[async_trait]
impl StreamTransport for HttpTransport {
    async fn start(&self, request: &StartRequest) -> Result<TextStream, ClientError> {
        let response = self
            .authorize(self.http_client.post(self.url("/stream")))
            .json(request)
            .send()
            .await?;
        Ok(Self::pump(Self::check(response).await?))
    }

    async fn resume(
        &self,
        message_id: &MessageId,
        session_id: &str,
    ) -> Result<TextStream, ClientError> {
        let response = self
            .authorize(self.http_client.get(self.url("/stream/resume")))
            .query(&[("messageId", message_id.as_str()), ("sessionId", session_id)])
            .send()
            .await?;
        Ok(Self::pump(Self::check(response).await?))
    }

    async fn cancel(
        &self,
        thread_id: &ThreadId,
        message_id: &MessageId,
    ) -> Result<(), ClientError> {
        let response = self
            .authorize(self.http_client.post(self.url("/stream/cancel")))
            .json(&CancelBody {
                thread_id,
                message_id,
            })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn fetch_message(&self, message_id: &MessageId) -> Result<Message, ClientError> {
        let path = format!("/messages/{message_id}");
        let response = self
            .authorize(self.http_client.get(self.url(&path)))
            .send()
            .await?;
        Ok(Self::check(response).await?.json::<Message>().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decoder_carries_split_characters() {
        let mut decoder = Utf8Decoder::new();
        let bytes = "héllo ✓".as_bytes();

        // Split inside 'é' (2 bytes) and inside '✓' (3 bytes)
        let first = decoder.push(&bytes[..2]);
        let second = decoder.push(&bytes[2..8]);
        let third = decoder.push(&bytes[8..]);

        assert_eq!(first, "h");
        assert_eq!(second, "éllo ");
        assert_eq!(third, "✓");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.push(b"a\xffb"), "a\u{fffd}b");

        // Dangling lead byte at end of stream
        assert_eq!(decoder.push(b"c\xe2"), "c");
        assert_eq!(decoder.finish(), "\u{fffd}");
    }

    #[test]
    fn test_urls_and_body() {
        let transport = HttpTransport::new("http://localhost:8787/").with_token("t");
        assert_eq!(transport.url("/stream"), "http://localhost:8787/stream");

        let request = StartRequest::new(ThreadId::from("t1"), MessageId::from("m1"), "llama3");
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"threadId": "t1", "messageId": "m1", "model": "llama3"})
        );
    }
}
