pub mod context;
pub mod dag;
pub mod executor;
pub mod registry;
pub mod step_executor;

pub use context::{ContextView, ExecutionContext};
pub use dag::{Level, WorkflowDag};
pub use executor::{overall_status, PreparedRun, WorkflowExecutor};
pub use registry::{handler_fn, HandlerRegistry, StepHandler, StepInput};
pub use step_executor::StepExecutor;
