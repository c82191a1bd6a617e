//! Relay Configuration
//!
//! Settings for every component, layered lowest to highest:
//!
//! 1. Built-in defaults
//! 2. TOML file (`--config`, `RELAY_CONFIG`, or `~/.config/relay/relay.toml`)
//! 3. `RELAY_*` / `OLLAMA_*` environment variables
//!
//! ```toml
//! [generation]
//! flush_chars = 250
//! flush_interval_ms = 500
//! stop_poll_ms = 250
//!
//! [server]
//! bind = "0.0.0.0:8787"
//! auth_tokens = ["secret"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::streaming::FlushPolicy;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment override could not be parsed
    #[error("invalid value {value:?} for {key}")]
    InvalidValue {
        /// Variable name
        key: String,
        /// Raw value
        value: String,
    },

    /// A setting is out of range
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Sections
// ============================================================================

/// Generation orchestrator settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    /// Flush once this many characters are unflushed
    pub flush_chars: usize,
    /// Flush at least this often while output arrives (ms)
    pub flush_interval_ms: u64,
    /// Stop-signal poll tick while the provider is silent (ms)
    pub stop_poll_ms: u64,
    /// Hard ceiling on a single generation (seconds)
    pub max_duration_secs: u64,
    /// Most recent history messages sent to the provider
    pub max_history_messages: usize,
    /// System prompt prepended to every request
    pub system_prompt: Option<String>,
    /// Chunk channel capacity towards the requesting client; a client this far
    /// behind is detached
    pub output_buffer: usize,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            flush_chars: 250,
            flush_interval_ms: 500,
            stop_poll_ms: 250,
            max_duration_secs: 300,
            max_history_messages: 50,
            system_prompt: None,
            output_buffer: 256,
        }
    }
}

impl GenerationSettings {
    /// Flush policy derived from these settings
    #[must_use]
    pub fn flush_policy(&self) -> FlushPolicy {
        FlushPolicy {
            max_pending_chars: self.flush_chars,
            max_interval: Duration::from_millis(self.flush_interval_ms),
        }
    }

    /// Stop poll interval
    #[must_use]
    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_ms)
    }

    /// Hard ceiling
    #[must_use]
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }
}

/// Resume server settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumeSettings {
    /// Chunk log poll interval (ms)
    pub poll_interval_ms: u64,
    /// Give up after this long without new records (seconds)
    pub idle_timeout_secs: u64,
}

impl Default for ResumeSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            idle_timeout_secs: 60,
        }
    }
}

impl ResumeSettings {
    /// Poll interval
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Idle limit
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Chunk log retention
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkLogSettings {
    /// Lifetime of an active log, refreshed on each append (seconds)
    pub ttl_secs: u64,
    /// Cleanup window after the completion marker (seconds)
    pub completed_ttl_secs: u64,
}

impl Default for ChunkLogSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            completed_ttl_secs: 300,
        }
    }
}

impl ChunkLogSettings {
    /// Active lifetime
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Post-completion lifetime
    #[must_use]
    pub fn completed_ttl(&self) -> Duration {
        Duration::from_secs(self.completed_ttl_secs)
    }
}

/// Stop signal retention
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopSignalSettings {
    /// Flag lifetime (seconds)
    pub ttl_secs: u64,
}

impl Default for StopSignalSettings {
    fn default() -> Self {
        Self { ttl_secs: 300 }
    }
}

impl StopSignalSettings {
    /// Flag lifetime
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// HTTP server settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Listen address
    pub bind: String,
    /// Accepted bearer tokens; empty disables auth
    pub auth_tokens: Vec<String>,
    /// Interval of the TTL sweeper (seconds)
    pub sweep_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
            auth_tokens: Vec::new(),
            sweep_interval_secs: 30,
        }
    }
}

impl ServerSettings {
    /// Sweeper interval
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// LLM provider settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Ollama host
    pub host: String,
    /// Ollama port
    pub port: u16,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 11434,
        }
    }
}

// ============================================================================
// Root
// ============================================================================

/// Complete relay configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Orchestrator
    pub generation: GenerationSettings,
    /// Resume server
    pub resume: ResumeSettings,
    /// Chunk log
    pub chunk_log: ChunkLogSettings,
    /// Stop signal
    pub stop_signal: StopSignalSettings,
    /// HTTP server
    pub server: ServerSettings,
    /// LLM provider
    pub backend: BackendSettings,
}

/// Default config file location (`~/.config/relay/relay.toml`)
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("relay").join("relay.toml"))
}

fn parse_var<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value,
        })
}

impl RelayConfig {
    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Read a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Load with full precedence from the process environment
    ///
    /// An explicit `path` must exist. Otherwise `RELAY_CONFIG` is used if set,
    /// then the default path if a file is there.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os("RELAY_CONFIG").map(PathBuf::from))
            .or_else(|| default_config_path().filter(|p| p.exists()));

        let mut config = match file {
            Some(ref file) => Self::from_file(file)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment-style overrides from `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("RELAY_FLUSH_CHARS") {
            self.generation.flush_chars = parse_var("RELAY_FLUSH_CHARS", v)?;
        }
        if let Some(v) = get("RELAY_FLUSH_INTERVAL_MS") {
            self.generation.flush_interval_ms = parse_var("RELAY_FLUSH_INTERVAL_MS", v)?;
        }
        if let Some(v) = get("RELAY_STOP_POLL_MS") {
            self.generation.stop_poll_ms = parse_var("RELAY_STOP_POLL_MS", v)?;
        }
        if let Some(v) = get("RELAY_MAX_GENERATION_SECS") {
            self.generation.max_duration_secs = parse_var("RELAY_MAX_GENERATION_SECS", v)?;
        }
        if let Some(v) = get("RELAY_MAX_HISTORY") {
            self.generation.max_history_messages = parse_var("RELAY_MAX_HISTORY", v)?;
        }
        if let Some(v) = get("RELAY_SYSTEM_PROMPT") {
            self.generation.system_prompt = Some(v);
        }
        if let Some(v) = get("RELAY_RESUME_POLL_MS") {
            self.resume.poll_interval_ms = parse_var("RELAY_RESUME_POLL_MS", v)?;
        }
        if let Some(v) = get("RELAY_RESUME_IDLE_SECS") {
            self.resume.idle_timeout_secs = parse_var("RELAY_RESUME_IDLE_SECS", v)?;
        }
        if let Some(v) = get("RELAY_CHUNK_TTL_SECS") {
            self.chunk_log.ttl_secs = parse_var("RELAY_CHUNK_TTL_SECS", v)?;
        }
        if let Some(v) = get("RELAY_CHUNK_COMPLETED_TTL_SECS") {
            self.chunk_log.completed_ttl_secs = parse_var("RELAY_CHUNK_COMPLETED_TTL_SECS", v)?;
        }
        if let Some(v) = get("RELAY_STOP_TTL_SECS") {
            self.stop_signal.ttl_secs = parse_var("RELAY_STOP_TTL_SECS", v)?;
        }
        if let Some(v) = get("RELAY_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = get("RELAY_AUTH_TOKENS") {
            self.server.auth_tokens = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = get("OLLAMA_HOST") {
            self.backend.host = v;
        }
        if let Some(v) = get("OLLAMA_PORT") {
            self.backend.port = parse_var("OLLAMA_PORT", v)?;
        }
        Ok(())
    }

    /// Reject settings that would stall or spin the pipeline
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.generation.flush_chars == 0 {
            return Err(ConfigError::Invalid("generation.flush_chars must be > 0".into()));
        }
        if self.generation.stop_poll_ms == 0 {
            return Err(ConfigError::Invalid("generation.stop_poll_ms must be > 0".into()));
        }
        if self.generation.max_duration_secs == 0 {
            return Err(ConfigError::Invalid(
                "generation.max_duration_secs must be > 0".into(),
            ));
        }
        if self.generation.output_buffer == 0 {
            return Err(ConfigError::Invalid("generation.output_buffer must be > 0".into()));
        }
        if self.resume.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("resume.poll_interval_ms must be > 0".into()));
        }
        if self.server.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "server.sweep_interval_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}
