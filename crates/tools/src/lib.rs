//! External tool integration for Taskloom.
//!
//! A [`ToolProvider`] exposes named tools; [`ToolRegistry`] is the in-process
//! provider. The `api-call` and `web-scrape` step types run through it.

pub mod handlers;
pub mod registry;
pub mod web;

pub use handlers::{register_tool_handlers, ApiCallHandler, WebScrapeHandler, WEB_FETCH_TOOL};
pub use registry::{Tool, ToolContent, ToolError, ToolOutput, ToolProvider, ToolRegistry, ToolSchema};
pub use web::WebFetchTool;
