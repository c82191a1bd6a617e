//! Relay Daemon - Resumable Generation Server
//!
//! Serves generation streams over HTTP. A client starts a generation with
//! `POST /stream` and reads raw text; any other client (another tab, a
//! reload) can follow the same generation through `GET /stream/resume` or
//! stop it with `POST /stream/cancel`.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (Ollama on localhost:11434)
//! relay-daemon
//!
//! # Custom bind address
//! relay-daemon --bind 0.0.0.0:8787
//!
//! # With config file
//! relay-daemon --config /etc/relay/relay.toml
//!
//! # Without a model server, replying with a canned answer
//! relay-daemon --scripted
//!
//! # Verbose logging
//! RUST_LOG=debug relay-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod auth;
mod error;
mod server;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use relay_core::{
    ChunkLog, InMemoryChunkLog, InMemoryMessageStore, InMemoryStopSignal, LlmBackend,
    ModelCatalog, OllamaBackend, Orchestrator, RelayConfig, ResumeServer, ScriptStep,
    ScriptedBackend, StopSignal,
};

use server::AppState;

const DEMO_REPLY: &str = "This is a scripted reply from the relay daemon. Each word arrives \
     as its own fragment so you can watch batching, stopping and resuming without a model \
     server.";

/// Relay Daemon - resumable LLM generation streams
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address (overrides the config file)
    #[arg(short = 'b', long, value_name = "ADDR")]
    bind: Option<String>,

    /// Use the scripted demo provider instead of Ollama
    #[arg(long)]
    scripted: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_daemon={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Resolves on SIGTERM or SIGINT
fn shutdown_signal() -> Result<impl Future<Output = ()> + Send + 'static> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
    })
}

fn build_state<B: LlmBackend + 'static>(
    backend: Arc<B>,
    catalog: Option<Arc<dyn ModelCatalog>>,
    config: &RelayConfig,
    store: Arc<InMemoryMessageStore>,
    chunk_log: Arc<dyn ChunkLog>,
    stop_signal: Arc<dyn StopSignal>,
) -> AppState<B> {
    let backend_name = backend.name().to_string();
    let mut orchestrator = Orchestrator::new(
        backend,
        store.clone(),
        Arc::clone(&chunk_log),
        Arc::clone(&stop_signal),
        config.generation.clone(),
    );
    if let Some(catalog) = catalog {
        orchestrator = orchestrator.with_catalog(catalog);
    }

    AppState {
        orchestrator,
        resume: ResumeServer::new(Arc::clone(&chunk_log), config.resume.clone())
            .with_store(store.clone()),
        store,
        chunk_log,
        stop_signal,
        auth_tokens: Arc::new(config.server.auth_tokens.clone()),
        backend_name,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Relay Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config =
        RelayConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if config.server.auth_tokens.is_empty() {
        warn!("No auth tokens configured, every request is accepted");
    }

    let store = Arc::new(InMemoryMessageStore::new());
    let chunk_log: Arc<dyn ChunkLog> = Arc::new(InMemoryChunkLog::from_settings(&config.chunk_log));
    let stop_signal: Arc<dyn StopSignal> =
        Arc::new(InMemoryStopSignal::from_settings(&config.stop_signal));

    let sweeper = server::spawn_sweeper(
        Arc::clone(&chunk_log),
        Arc::clone(&stop_signal),
        config.server.sweep_interval(),
    );
    let shutdown = shutdown_signal()?;
    let bind = config.server.bind.clone();

    let result = if args.scripted {
        info!("Using scripted demo provider");
        let mut steps: Vec<ScriptStep> = DEMO_REPLY
            .split_inclusive(' ')
            .flat_map(|word| [ScriptStep::content(word), ScriptStep::pause_ms(80)])
            .collect();
        steps.push(ScriptStep::finish());
        let backend = Arc::new(ScriptedBackend::new(steps));
        let state = build_state(backend, None, &config, store, chunk_log, stop_signal);
        server::serve(state, &bind, shutdown).await
    } else {
        let backend = OllamaBackend::from_settings(&config.backend);
        if !backend.health_check().await {
            warn!(
                host = %config.backend.host,
                port = config.backend.port,
                "Ollama is not reachable yet, generations will fail until it is"
            );
        }
        let catalog: Arc<dyn ModelCatalog> = Arc::new(backend.clone());
        let state = build_state(
            Arc::new(backend),
            Some(catalog),
            &config,
            store,
            chunk_log,
            stop_signal,
        );
        server::serve(state, &bind, shutdown).await
    };

    sweeper.abort();
    info!("Shutting down...");

    match result {
        Ok(()) => {
            info!("Relay daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
