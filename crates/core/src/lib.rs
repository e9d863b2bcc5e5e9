// Core types and execution engine for Taskloom step graphs

pub mod config;
pub mod error;
pub mod events;
pub mod handlers;
pub mod runs;
pub mod types;
pub mod workflow;

pub use config::{CyclePolicy, DependencyFailurePolicy, ExecutorConfig, RunOptions};
pub use error::{ContextError, GraphError, RunError, StepError};
pub use events::{ProgressEvent, ProgressHub, ProgressSink};
pub use runs::RunManager;
pub use types::*;
