//! Daemon Server Implementation
//!
//! HTTP surface over the relay core:
//!
//! | route | purpose |
//! |---|---|
//! | `POST /stream` | claim a message and stream its generation (`text/plain`) |
//! | `GET /stream/resume` | catch up on and follow a running generation |
//! | `POST /stream/cancel` | ask the running generation to stop |
//! | `GET /messages/{id}` | persisted message snapshot |
//! | `GET /health` | liveness (no auth) |
//!
//! A background sweeper purges expired chunk logs and stop flags.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use relay_core::{
    ChatTurn, ChunkLog, GenerateRequest, InMemoryMessageStore, LlmBackend, Message, MessageId,
    MessageStore, Orchestrator, ResumeServer, StopSignal, ThreadId,
};

use crate::auth::{require_bearer, AuthTokens};
use crate::error::ApiError;

/// Shared handler state
pub struct AppState<B: LlmBackend> {
    /// Generation orchestrator
    pub orchestrator: Orchestrator<B>,
    /// Resume server
    pub resume: ResumeServer,
    /// Message records (seedable)
    pub store: Arc<InMemoryMessageStore>,
    /// Chunk log
    pub chunk_log: Arc<dyn ChunkLog>,
    /// Stop flags
    pub stop_signal: Arc<dyn StopSignal>,
    /// Accepted bearer tokens
    pub auth_tokens: AuthTokens,
    /// Provider name reported by `/health`
    pub backend_name: String,
}

impl<B: LlmBackend> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: self.orchestrator.clone(),
            resume: self.resume.clone(),
            store: Arc::clone(&self.store),
            chunk_log: Arc::clone(&self.chunk_log),
            stop_signal: Arc::clone(&self.stop_signal),
            auth_tokens: Arc::clone(&self.auth_tokens),
            backend_name: self.backend_name.clone(),
        }
    }
}

// ============================================================================
// Request Bodies
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartStreamBody {
    thread_id: ThreadId,
    message_id: MessageId,
    model: String,
    #[serde(default)]
    history: Option<Vec<ChatTurn>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResumeQuery {
    message_id: MessageId,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelBody {
    #[serde(default)]
    thread_id: Option<ThreadId>,
    message_id: MessageId,
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    backend: String,
}

// ============================================================================
// Router
// ============================================================================

/// Build the HTTP router
pub fn router<B: LlmBackend + 'static>(state: AppState<B>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/stream", post(start_stream::<B>))
        .route("/stream/resume", get(resume_stream::<B>))
        .route("/stream/cancel", post(cancel_stream::<B>))
        .route("/messages/{id}", get(get_message::<B>))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.auth_tokens),
            require_bearer,
        ))
        .route("/health", get(health::<B>))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

fn text_stream(body: Body, message_id: &MessageId) -> Result<Response, ApiError> {
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if let Ok(value) = HeaderValue::from_str(message_id.as_str()) {
        response.headers_mut().insert("x-message-id", value);
    }
    Ok(response)
}

// ============================================================================
// Handlers
// ============================================================================

async fn start_stream<B: LlmBackend + 'static>(
    State(state): State<AppState<B>>,
    Json(body): Json<StartStreamBody>,
) -> Result<Response, ApiError> {
    let mut seeded = false;
    if state.store.get_message(&body.message_id).await?.is_none() {
        if body.history.is_none() {
            return Err(ApiError::NotFound(format!(
                "message not found: {}",
                body.message_id
            )));
        }
        debug!(message_id = %body.message_id, "Seeding placeholder from request");
        let placeholder = Message::placeholder(
            body.message_id.clone(),
            body.thread_id.clone(),
            body.model.clone(),
        );
        if !state.store.insert_placeholder(placeholder) {
            return Err(ApiError::Conflict(format!(
                "thread {} already has an active message",
                body.thread_id
            )));
        }
        seeded = true;
    }

    let message_id = body.message_id.clone();
    let request = GenerateRequest {
        thread_id: body.thread_id,
        message_id: body.message_id,
        model: body.model,
        history: body.history,
    };
    let handle = match state.orchestrator.start(request).await {
        Ok(handle) => handle,
        Err(e) => {
            if seeded {
                debug!(message_id = %message_id, "Removing seeded placeholder after failed start");
                state.store.remove_message(&message_id);
            }
            return Err(e.into());
        }
    };
    let message_id = handle.message_id.clone();
    info!(message_id = %message_id, "Generation started");

    let (output, task) = handle.into_parts();
    tokio::spawn(async move {
        if let Err(e) = task.await {
            error!(error = %e, "Generation task failed");
        }
    });

    let stream = ReceiverStream::new(output).map(|chunk| Ok::<_, Infallible>(Bytes::from(chunk)));
    text_stream(Body::from_stream(stream), &message_id)
}

async fn resume_stream<B: LlmBackend + 'static>(
    State(state): State<AppState<B>>,
    Query(query): Query<ResumeQuery>,
) -> Result<Response, ApiError> {
    info!(
        message_id = %query.message_id,
        session_id = query.session_id.as_deref().unwrap_or("-"),
        "Resume requested"
    );

    let message = state
        .store
        .get_message(&query.message_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("message not found: {}", query.message_id)))?;

    // Finished and already swept: nothing left to replay
    let log_missing = state
        .chunk_log
        .read_all(&query.message_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .is_none();
    if message.status.is_terminal() && log_missing {
        return text_stream(Body::empty(), &query.message_id);
    }

    let items = state.resume.resume(query.message_id.clone());
    let stream = ReceiverStream::new(items).map(|item| item.map(Bytes::from));
    text_stream(Body::from_stream(stream), &query.message_id)
}

async fn cancel_stream<B: LlmBackend + 'static>(
    State(state): State<AppState<B>>,
    Json(body): Json<CancelBody>,
) -> Result<impl IntoResponse, ApiError> {
    state.stop_signal.request_stop(&body.message_id).await?;

    let thread_id = match body.thread_id {
        Some(thread_id) => Some(thread_id),
        None => state
            .store
            .get_message(&body.message_id)
            .await?
            .map(|m| m.thread_id),
    };
    if let Some(ref thread_id) = thread_id {
        if let Err(e) = state.store.set_thread_streaming(thread_id, false).await {
            debug!(error = %e, "Could not clear thread streaming flag");
        }
    }

    info!(message_id = %body.message_id, "Stop requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "messageId": body.message_id, "status": "stopping" })),
    ))
}

async fn get_message<B: LlmBackend + 'static>(
    State(state): State<AppState<B>>,
    Path(id): Path<String>,
) -> Result<Json<Message>, ApiError> {
    let message_id = MessageId::from(id);
    state
        .store
        .get_message(&message_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("message not found: {message_id}")))
}

async fn health<B: LlmBackend + 'static>(State(state): State<AppState<B>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        backend: state.backend_name.clone(),
    })
}

// ============================================================================
// Background Work
// ============================================================================

/// Periodically purge expired chunk logs and stop flags
pub fn spawn_sweeper(
    chunk_log: Arc<dyn ChunkLog>,
    stop_signal: Arc<dyn StopSignal>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let logs = chunk_log.purge_expired().await;
            let flags = stop_signal.purge_expired().await;
            if logs > 0 || flags > 0 {
                debug!(logs, flags, "Purged expired entries");
            }
        }
    })
}

/// Bind and serve until `shutdown` resolves
pub async fn serve<B, F>(state: AppState<B>, bind: &str, shutdown: F) -> anyhow::Result<()>
where
    B: LlmBackend + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(addr = %listener.local_addr()?, "Listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")
}
