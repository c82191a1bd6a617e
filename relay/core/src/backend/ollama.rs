//! Ollama Backend Implementation
//!
//! LLM backend for Ollama (local LLM server).
//!
//! # Ollama API
//!
//! - `/api/chat` - Chat completions with message history (streamed as NDJSON)
//! - `/api/tags` - List available models
//! - `/api/show` - Model details, including its capability list
//!
//! Reasoning models emit chain-of-thought in `message.thinking` when the
//! request sets `"think": true`; the final line carries `done_reason`.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::traits::{FinishReason, LlmBackend, LlmRequest, ModelInfo, StreamingToken};
use crate::capabilities::{ModelCapabilities, ModelCatalog};
use crate::config::BackendSettings;

/// Ollama backend client
#[derive(Clone)]
pub struct OllamaBackend {
    /// Host address
    host: String,
    /// Port number
    port: u16,
    /// HTTP client
    http_client: reqwest::Client,
}

impl OllamaBackend {
    /// Create a new Ollama backend
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        // No total timeout: generations are bounded by the orchestrator's
        // hard ceiling, not by the HTTP client.
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            host: host.into(),
            port,
            http_client,
        }
    }

    /// Create from backend settings
    #[must_use]
    pub fn from_settings(settings: &BackendSettings) -> Self {
        Self::new(settings.host.clone(), settings.port)
    }

    /// Get the base URL
    fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// Get chat endpoint URL
    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url())
    }

    /// Get tags endpoint URL
    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url())
    }

    /// Get show endpoint URL
    fn show_url(&self) -> String {
        format!("{}/api/show", self.base_url())
    }

    /// Build the JSON body for a streaming chat request
    fn build_body(request: &LlmRequest) -> serde_json::Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(ref system) = request.system {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        for turn in &request.messages {
            messages.push(serde_json::json!({
                "role": turn.role.as_str(),
                "content": turn.content,
            }));
        }

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": messages,
            "stream": true,
        });

        if request.reasoning {
            body["think"] = serde_json::json!(true);
        }

        let mut options = serde_json::Map::new();
        if (request.temperature - 0.7).abs() > f32::EPSILON {
            options.insert(
                "temperature".to_string(),
                serde_json::json!(request.temperature),
            );
        }
        if request.max_tokens > 0 {
            options.insert(
                "num_predict".to_string(),
                serde_json::json!(request.max_tokens),
            );
        }
        if !options.is_empty() {
            body["options"] = serde_json::Value::Object(options);
        }

        body
    }
}

impl Default for OllamaBackend {
    fn default() -> Self {
        Self::new("localhost", 11434)
    }
}

/// Translate one NDJSON line from `/api/chat` into tokens
fn parse_chat_line(line: &str) -> Vec<StreamingToken> {
    let Ok(data) = serde_json::from_str::<serde_json::Value>(line) else {
        debug!(line, "Skipping unparseable line");
        return Vec::new();
    };

    if let Some(error) = data.get("error").and_then(|e| e.as_str()) {
        return vec![StreamingToken::Error(error.to_string())];
    }

    let mut tokens = Vec::new();
    if let Some(message) = data.get("message") {
        if let Some(thinking) = message
            .get("thinking")
            .and_then(|t| t.as_str())
            .filter(|t| !t.is_empty())
        {
            tokens.push(StreamingToken::Reasoning(thinking.to_string()));
        }
        if let Some(content) = message
            .get("content")
            .and_then(|c| c.as_str())
            .filter(|c| !c.is_empty())
        {
            tokens.push(StreamingToken::Content(content.to_string()));
        }
    }

    if data
        .get("done")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false)
    {
        let reason = data
            .get("done_reason")
            .and_then(|r| r.as_str())
            .map_or(FinishReason::Stop, FinishReason::parse);
        tokens.push(StreamingToken::Finish { reason });
    }

    tokens
}

/// Forward parsed tokens; returns false once the stream is over
async fn forward(tx: &mpsc::Sender<StreamingToken>, line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return true;
    }
    for token in parse_chat_line(line) {
        let terminal = matches!(
            token,
            StreamingToken::Finish { .. } | StreamingToken::Error(_)
        );
        if tx.send(token).await.is_err() {
            // Receiver dropped, stop streaming
            return false;
        }
        if terminal {
            return false;
        }
    }
    true
}

#[async_trait]
impl LlmBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "Ollama"
    }

    async fn health_check(&self) -> bool {
        self.http_client
            .get(self.tags_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .is_ok()
    }

    async fn send_streaming(
        &self,
        request: &LlmRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<mpsc::Receiver<StreamingToken>> {
        let (tx, rx) = mpsc::channel(100);

        let body = Self::build_body(request);
        let send = self.http_client.post(self.chat_url()).json(&body).send();
        let response = tokio::select! {
            () = cancel.cancelled() => anyhow::bail!("Ollama request cancelled before response"),
            response = send => response?,
        };

        // Check for HTTP errors
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama returned {status}: {body}");
        }

        let mut stream = response.bytes_stream();

        // Spawn task to process stream
        tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::new();

            loop {
                let chunk = tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("Provider call cancelled");
                        return;
                    }
                    chunk = stream.next() => chunk,
                };

                match chunk {
                    Some(Ok(bytes)) => {
                        buffer.extend_from_slice(&bytes);

                        // Parse newline-delimited JSON; split on raw bytes so a
                        // multi-byte character spanning two chunks stays intact
                        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                            let line: Vec<u8> = buffer.drain(..=pos).collect();
                            if !forward(&tx, &String::from_utf8_lossy(&line)).await {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(StreamingToken::Error(e.to_string())).await;
                        return;
                    }
                    None => {
                        if !buffer.is_empty() && !forward(&tx, &String::from_utf8_lossy(&buffer)).await
                        {
                            return;
                        }
                        let _ = tx
                            .send(StreamingToken::Error(
                                "Ollama stream ended without a done marker".to_string(),
                            ))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn list_models(&self) -> anyhow::Result<Vec<ModelInfo>> {
        let response = self
            .http_client
            .get(self.tags_url())
            .timeout(Duration::from_secs(10))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama returned {status}: {body}");
        }

        let data: serde_json::Value = response.json().await?;

        let models = data
            .get("models")
            .and_then(|m| m.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| {
                        let name = m.get("name")?.as_str()?.to_string();
                        let size = m.get("size").and_then(serde_json::Value::as_u64);
                        let parameters = m
                            .get("details")
                            .and_then(|d| d.get("parameter_size"))
                            .and_then(|p| p.as_str())
                            .map(String::from);

                        Some(ModelInfo {
                            name,
                            size,
                            parameters,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(models)
    }
}

#[async_trait]
impl ModelCatalog for OllamaBackend {
    async fn capabilities(&self, model: &str) -> anyhow::Result<Option<ModelCapabilities>> {
        let response = self
            .http_client
            .post(self.show_url())
            .json(&serde_json::json!({ "model": model }))
            .timeout(Duration::from_secs(10))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama returned {status}: {body}");
        }

        let data: serde_json::Value = response.json().await?;
        let names: Vec<&str> = data
            .get("capabilities")
            .and_then(|c| c.as_array())
            .map(|arr| arr.iter().filter_map(|c| c.as_str()).collect())
            .unwrap_or_default();

        Ok(Some(ModelCapabilities::from_names(&names)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ChatTurn;
    use crate::messages::MessageRole;

    #[test]
    fn test_ollama_backend_creation() {
        let backend = OllamaBackend::new("localhost", 11434);
        assert_eq!(backend.base_url(), "http://localhost:11434");
        assert_eq!(backend.chat_url(), "http://localhost:11434/api/chat");
    }

    #[test]
    fn test_build_body() {
        let request = LlmRequest::new("qwen3")
            .with_system("Be brief")
            .with_messages(vec![
                ChatTurn::new(MessageRole::User, "Hi"),
                ChatTurn::new(MessageRole::Assistant, "Hello!"),
                ChatTurn::new(MessageRole::User, "Again"),
            ])
            .with_reasoning(true)
            .with_max_tokens(64);

        let body = OllamaBackend::build_body(&request);
        assert_eq!(body["model"], "qwen3");
        assert_eq!(body["stream"], true);
        assert_eq!(body["think"], true);
        assert_eq!(body["options"]["num_predict"], 64);
        assert!(body["options"].get("temperature").is_none());

        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[3]["content"], "Again");
    }

    #[test]
    fn test_build_body_without_extras() {
        let body = OllamaBackend::build_body(&LlmRequest::new("llama3"));
        assert!(body.get("think").is_none());
        assert!(body.get("options").is_none());
    }

    #[test]
    fn test_parse_chat_lines() {
        assert_eq!(
            parse_chat_line(r#"{"message":{"role":"assistant","content":"Hel"},"done":false}"#),
            vec![StreamingToken::Content("Hel".to_string())]
        );
        assert_eq!(
            parse_chat_line(
                r#"{"message":{"role":"assistant","content":"","thinking":"hmm"},"done":false}"#
            ),
            vec![StreamingToken::Reasoning("hmm".to_string())]
        );
        assert_eq!(
            parse_chat_line(
                r#"{"message":{"role":"assistant","content":""},"done":true,"done_reason":"length"}"#
            ),
            vec![StreamingToken::Finish {
                reason: FinishReason::Length
            }]
        );
        assert_eq!(
            parse_chat_line(r#"{"error":"model not found"}"#),
            vec![StreamingToken::Error("model not found".to_string())]
        );
        assert!(parse_chat_line("not json").is_empty());
    }
}
