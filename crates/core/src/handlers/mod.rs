//! Built-in handlers for step types that need no external service.
//!
//! `code`, `prompt` and `document-extract` have no built-in handler; hosts
//! register their own. Tool-backed types live in `taskloom-tools`.

mod file_export;
mod transform;

pub use file_export::FileExportHandler;
pub use transform::TransformHandler;

use crate::types::StepKind;
use crate::workflow::HandlerRegistry;
use std::path::PathBuf;
use std::sync::Arc;

/// Register the built-in handlers on a registry
pub fn register_builtin(registry: &mut HandlerRegistry, export_dir: impl Into<PathBuf>) {
    registry.register(StepKind::Transform, Arc::new(TransformHandler));
    registry.register(StepKind::FileExport, Arc::new(FileExportHandler::new(export_dir)));
}
