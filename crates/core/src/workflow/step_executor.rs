use super::context::ContextView;
use super::registry::{HandlerRegistry, StepInput};
use crate::error::StepError;
use crate::types::{StepResult, StepSpec};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Dispatches one step to its registered handler, with optional timeout
pub struct StepExecutor {
    registry: Arc<HandlerRegistry>,
    timeout: Option<Duration>,
}

impl StepExecutor {
    pub fn new(registry: Arc<HandlerRegistry>, timeout: Option<Duration>) -> Self {
        Self { registry, timeout }
    }

    /// Execute a step and turn the outcome into a terminal result.
    /// Never fails: every failure is recorded in the returned [`StepResult`].
    pub async fn execute(
        &self,
        step: &StepSpec,
        context: ContextView,
        cancel: CancellationToken,
    ) -> StepResult {
        let started_at = Utc::now();

        let Some(handler) = self.registry.get(&step.kind) else {
            if step.kind.is_builtin() {
                tracing::warn!("No handler registered for step {} (type {})", step.id, step.kind);
            } else {
                tracing::warn!("Step {} has unknown type {}", step.id, step.kind);
            }
            return StepResult::failed(
                StepError::UnknownStepType {
                    step_type: step.kind.to_string(),
                },
                Some(started_at),
                Utc::now(),
            );
        };

        tracing::info!("Executing step {} (type {})", step.id, step.kind);

        let input = StepInput {
            step_id: step.id.clone(),
            kind: step.kind.clone(),
            config: context.interpolate_value(&step.config),
            context,
            cancel: cancel.clone(),
        };

        // Execute with timeout if configured
        let outcome = if let Some(limit) = self.timeout {
            match timeout(limit, handler.execute(input)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!("Step {} timed out", step.id);
                    return StepResult::failed(
                        StepError::TimedOut {
                            seconds: limit.as_secs(),
                        },
                        Some(started_at),
                        Utc::now(),
                    );
                }
            }
        } else {
            handler.execute(input).await
        };

        let completed_at = Utc::now();

        match outcome {
            Ok(output) => {
                tracing::info!(
                    "Step {} completed in {}ms",
                    step.id,
                    (completed_at - started_at).num_milliseconds()
                );
                StepResult::completed(output, started_at, completed_at)
            }
            Err(e) => {
                let error = classify_failure(e, &cancel);
                tracing::warn!("Step {} failed: {}", step.id, error);
                StepResult::failed(error, Some(started_at), completed_at)
            }
        }
    }
}

/// Map a handler error onto the step error taxonomy.
/// Any failure observed after cancellation counts as a cancellation.
fn classify_failure(error: anyhow::Error, cancel: &CancellationToken) -> StepError {
    if cancel.is_cancelled() {
        return StepError::Cancelled;
    }

    match error.downcast::<StepError>() {
        Ok(step_error) => step_error,
        Err(other) => StepError::Handler {
            message: format!("{:#}", other),
        },
    }
}
