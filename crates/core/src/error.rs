// Error taxonomy for the execution engine

use crate::types::{RunId, StepId};
use serde::{Deserialize, Serialize};

/// Malformed workflow input, rejected before any step is scheduled
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("duplicate step id: {0}")]
    DuplicateStep(StepId),

    #[error("step id must not be empty")]
    EmptyStepId,

    #[error("workflow contains circular dependencies between steps: {}", join_ids(.steps))]
    Cycle { steps: Vec<StepId> },
}

fn join_ids(ids: &[StepId]) -> String {
    ids.iter().map(|id| id.as_str()).collect::<Vec<_>>().join(", ")
}

/// Failure recorded on a single step. Never aborts the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepError {
    #[error("UnknownStepType: no handler registered for step type '{step_type}'")]
    UnknownStepType { step_type: String },

    #[error("{message}")]
    Handler { message: String },

    #[error("step timed out after {seconds} seconds")]
    TimedOut { seconds: u64 },

    #[error("step cancelled")]
    Cancelled,

    #[error("{message}")]
    DependencyFailed { message: String },
}

impl StepError {
    /// Short machine-readable name of the failure class
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::UnknownStepType { .. } => "UnknownStepType",
            StepError::Handler { .. } => "HandlerFailure",
            StepError::TimedOut { .. } => "TimedOut",
            StepError::Cancelled => "CancellationFailure",
            StepError::DependencyFailed { .. } => "DependencyFailed",
        }
    }
}

/// Rejected write to an execution context slot
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("step {0} is not part of this run")]
    UnknownStep(StepId),

    #[error("step {0} already reached a terminal state")]
    AlreadyFinalized(StepId),

    #[error("result for step {0} is not terminal")]
    NotTerminal(StepId),
}

/// Errors from the run management surface
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("run {0} not found")]
    NotFound(RunId),

    #[error("run {0} is not active")]
    NotActive(RunId),

    #[error(transparent)]
    Graph(#[from] GraphError),
}
