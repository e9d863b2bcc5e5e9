// Step handler capability and the registry mapping type tags to handlers

use super::context::ContextView;
use crate::types::{StepId, StepKind};
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a handler gets for one invocation
pub struct StepInput {
    pub step_id: StepId,
    pub kind: StepKind,
    /// Step configuration with `${...}` placeholders already substituted
    pub config: Value,
    pub context: ContextView,
    /// Set when the run is cancelled. Handlers that watch it should stop early
    /// and return [`crate::error::StepError::Cancelled`].
    pub cancel: CancellationToken,
}

/// Performs the work of one step type
#[async_trait::async_trait]
pub trait StepHandler: Send + Sync {
    /// Return a structured output on success or an error on failure
    async fn execute(&self, input: StepInput) -> Result<Value>;
}

/// Adapter turning an async closure into a [`StepHandler`]
pub struct FnHandler<F>(F);

#[async_trait::async_trait]
impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(StepInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn execute(&self, input: StepInput) -> Result<Value> {
        (self.0)(input).await
    }
}

/// Wrap an async closure as a shareable handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn StepHandler>
where
    F: Fn(StepInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Lookup from step type tag to handler
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<StepKind, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler, replacing any previous handler for the same tag
    pub fn register(
        &mut self,
        kind: impl Into<StepKind>,
        handler: Arc<dyn StepHandler>,
    ) -> Option<Arc<dyn StepHandler>> {
        let kind = kind.into();
        tracing::debug!("Registering handler for step type {}", kind);
        self.handlers.insert(kind, handler)
    }

    pub fn with_handler(mut self, kind: impl Into<StepKind>, handler: Arc<dyn StepHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    /// Get the handler for a type tag
    pub fn get(&self, kind: &StepKind) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &StepKind) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered type tags, sorted
    pub fn kinds(&self) -> Vec<StepKind> {
        let mut kinds: Vec<StepKind> = self.handlers.keys().cloned().collect();
        kinds.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        kinds
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
