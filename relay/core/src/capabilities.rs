//! Model Capability Profiles
//!
//! Each model is dispatched through a closed [`CapabilityProfile`], resolved
//! once per request from a [`ModelCatalog`]. The profile decides how the
//! provider request is shaped (for now: whether reasoning is requested as a
//! separate channel).

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::LlmRequest;

/// What a model can do
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    /// Emits chain-of-thought separately from content
    pub reasoning: bool,
    /// Supports tool/function calling
    pub tools: bool,
    /// Accepts image input
    pub vision: bool,
}

impl ModelCapabilities {
    /// Build from provider capability names (`"thinking"`, `"tools"`, ...)
    #[must_use]
    pub fn from_names(names: &[&str]) -> Self {
        let mut caps = Self::default();
        for name in names {
            match name.to_lowercase().as_str() {
                "thinking" | "reasoning" => caps.reasoning = true,
                "tools" => caps.tools = true,
                "vision" => caps.vision = true,
                _ => {}
            }
        }
        caps
    }
}

/// Looks up capabilities by model id
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    /// `Ok(None)` when the model is unknown
    async fn capabilities(&self, model: &str) -> anyhow::Result<Option<ModelCapabilities>>;
}

/// Fixed catalog, used when no provider lookup is wanted
#[derive(Clone, Debug, Default)]
pub struct StaticModelCatalog {
    models: HashMap<String, ModelCapabilities>,
}

impl StaticModelCatalog {
    /// Empty catalog (every model resolves to [`CapabilityProfile::Standard`])
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>, caps: ModelCapabilities) -> Self {
        self.models.insert(model.into(), caps);
        self
    }
}

#[async_trait]
impl ModelCatalog for StaticModelCatalog {
    async fn capabilities(&self, model: &str) -> anyhow::Result<Option<ModelCapabilities>> {
        Ok(self.models.get(model).copied())
    }
}

/// How a generation talks to its model
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapabilityProfile {
    /// Plain content stream
    Standard,
    /// Content plus a separate reasoning stream
    Reasoning,
}

impl CapabilityProfile {
    /// Map catalog data to a profile
    #[must_use]
    pub fn from_capabilities(caps: Option<ModelCapabilities>) -> Self {
        match caps {
            Some(caps) if caps.reasoning => Self::Reasoning,
            _ => Self::Standard,
        }
    }

    /// Resolve the profile for `model`
    ///
    /// A catalog failure degrades to [`CapabilityProfile::Standard`]; it never
    /// fails the generation.
    pub async fn resolve(catalog: &dyn ModelCatalog, model: &str) -> Self {
        match catalog.capabilities(model).await {
            Ok(caps) => Self::from_capabilities(caps),
            Err(e) => {
                warn!(model, error = %e, "Capability lookup failed, using standard profile");
                Self::Standard
            }
        }
    }

    /// Whether reasoning output is requested from the provider
    #[must_use]
    pub fn requests_reasoning(&self) -> bool {
        matches!(self, Self::Reasoning)
    }

    /// Shape a provider request for this profile
    #[must_use]
    pub fn prepare(&self, request: LlmRequest) -> LlmRequest {
        request.with_reasoning(self.requests_reasoning())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenCatalog;

    #[async_trait]
    impl ModelCatalog for BrokenCatalog {
        async fn capabilities(&self, _model: &str) -> anyhow::Result<Option<ModelCapabilities>> {
            anyhow::bail!("catalog offline")
        }
    }

    #[test]
    fn test_capabilities_from_names() {
        let caps = ModelCapabilities::from_names(&["completion", "thinking", "tools"]);
        assert!(caps.reasoning);
        assert!(caps.tools);
        assert!(!caps.vision);
    }

    #[tokio::test]
    async fn test_resolve_profiles() {
        let catalog = StaticModelCatalog::new()
            .with_model(
                "qwen3",
                ModelCapabilities {
                    reasoning: true,
                    ..Default::default()
                },
            )
            .with_model("llama3", ModelCapabilities::default());

        assert_eq!(
            CapabilityProfile::resolve(&catalog, "qwen3").await,
            CapabilityProfile::Reasoning
        );
        assert_eq!(
            CapabilityProfile::resolve(&catalog, "llama3").await,
            CapabilityProfile::Standard
        );
        assert_eq!(
            CapabilityProfile::resolve(&catalog, "unknown").await,
            CapabilityProfile::Standard
        );
    }

    #[tokio::test]
    async fn test_catalog_failure_degrades() {
        let profile = CapabilityProfile::resolve(&BrokenCatalog, "qwen3").await;
        assert_eq!(profile, CapabilityProfile::Standard);
        assert!(!profile.prepare(LlmRequest::new("qwen3")).reasoning);
    }
}
