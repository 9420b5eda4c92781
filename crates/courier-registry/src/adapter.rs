//! Adapter contract and resolution.
//!
//! An adapter implements one external system's side of the action contract.
//! Adapters resolve by identifier at execution time; a missing adapter is a
//! fail-fast error, never a silent fallback. The deliberate exception is the
//! mock registry used when credentials are absent, wired explicitly at
//! composition time.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::info;

use crate::mock::MockAdapter;

/// Errors produced by adapter resolution and invocation.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// No adapter registered under the requested identifier
    #[error("adapter `{0}` is not available")]
    Unavailable(String),
    /// The downstream system rejected or failed the request
    #[error("adapter failure: {message}")]
    Downstream {
        /// What went wrong
        message: String,
        /// Whether the engine may retry the invocation
        retryable: bool,
    },
}

impl AdapterError {
    /// True if the engine's retry policy applies.
    pub fn is_retryable(&self) -> bool {
        match self {
            AdapterError::Unavailable(_) => false,
            AdapterError::Downstream { retryable, .. } => *retryable,
        }
    }
}

/// One external system integration.
#[async_trait]
pub trait ActionAdapter: Send + Sync {
    /// Identifier actions reference in their definitions.
    fn id(&self) -> &str;

    /// Execute `action_name` with validated, sanitized `input`.
    ///
    /// The engine wraps this call in the action's timeout; implementations
    /// should not install their own outer deadline.
    async fn execute(&self, action_name: &str, input: &Value) -> Result<Value, AdapterError>;
}

impl std::fmt::Debug for dyn ActionAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionAdapter").field("id", &self.id()).finish()
    }
}

/// Resolves adapters by identifier.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: DashMap<String, Arc<dyn ActionAdapter>>,
}

impl AdapterRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a deterministic mock behind every given identifier,
    /// for development and tests.
    pub fn with_mocks(ids: &[&str]) -> Self {
        let registry = Self::new();
        for id in ids {
            registry.register(Arc::new(MockAdapter::new(*id)));
        }
        registry
    }

    /// Register an adapter under its identifier, replacing any previous one.
    pub fn register(&self, adapter: Arc<dyn ActionAdapter>) {
        info!(adapter = adapter.id(), "registered adapter");
        self.adapters.insert(adapter.id().to_string(), adapter);
    }

    /// Resolve an adapter, failing fast when absent.
    pub fn resolve(&self, id: &str) -> Result<Arc<dyn ActionAdapter>, AdapterError> {
        self.adapters
            .get(id)
            .map(|entry| entry.clone())
            .ok_or_else(|| AdapterError::Unavailable(id.to_string()))
    }

    /// Identifiers currently registered.
    pub fn ids(&self) -> Vec<String> {
        self.adapters.iter().map(|entry| entry.key().clone()).collect()
    }
}
