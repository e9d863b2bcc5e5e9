// Step handlers backed by a tool provider

use crate::registry::ToolProvider;
use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use taskloom_core::workflow::{HandlerRegistry, StepHandler, StepInput};
use taskloom_core::{StepError, StepKind};
use tokio_util::sync::CancellationToken;

/// Name of the tool `web-scrape` steps go through
pub const WEB_FETCH_TOOL: &str = "web_fetch";

#[derive(Debug, Deserialize)]
struct ApiCallConfig {
    tool: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct WebScrapeConfig {
    url: String,
    #[serde(default)]
    include_headers: bool,
}

async fn invoke_cancellable(
    tools: &dyn ToolProvider,
    name: &str,
    arguments: Value,
    cancel: &CancellationToken,
) -> Result<Value> {
    tokio::select! {
        _ = cancel.cancelled() => Err(StepError::Cancelled.into()),
        result = tools.invoke(name, arguments) => Ok(result?),
    }
}

/// Handler for `api-call` steps.
///
/// Config: `{ "tool": "<name>", "arguments": { .. } }`. The tool's value is the
/// step output.
pub struct ApiCallHandler {
    tools: Arc<dyn ToolProvider>,
}

impl ApiCallHandler {
    pub fn new(tools: Arc<dyn ToolProvider>) -> Self {
        Self { tools }
    }
}

#[async_trait::async_trait]
impl StepHandler for ApiCallHandler {
    async fn execute(&self, input: StepInput) -> Result<Value> {
        let config: ApiCallConfig =
            serde_json::from_value(input.config).context("Invalid api-call configuration")?;

        tracing::debug!("Step {} calling tool {}", input.step_id, config.tool);
        invoke_cancellable(
            self.tools.as_ref(),
            &config.tool,
            config.arguments,
            &input.cancel,
        )
        .await
    }
}

/// Handler for `web-scrape` steps, fetching `url` through the `web_fetch` tool
pub struct WebScrapeHandler {
    tools: Arc<dyn ToolProvider>,
}

impl WebScrapeHandler {
    pub fn new(tools: Arc<dyn ToolProvider>) -> Self {
        Self { tools }
    }
}

#[async_trait::async_trait]
impl StepHandler for WebScrapeHandler {
    async fn execute(&self, input: StepInput) -> Result<Value> {
        let config: WebScrapeConfig =
            serde_json::from_value(input.config).context("Invalid web-scrape configuration")?;

        invoke_cancellable(
            self.tools.as_ref(),
            WEB_FETCH_TOOL,
            serde_json::json!({
                "url": config.url,
                "include_headers": config.include_headers,
            }),
            &input.cancel,
        )
        .await
    }
}

/// Register the tool-backed handlers on a registry
pub fn register_tool_handlers(registry: &mut HandlerRegistry, tools: Arc<dyn ToolProvider>) {
    registry.register(StepKind::ApiCall, Arc::new(ApiCallHandler::new(tools.clone())));
    registry.register(StepKind::WebScrape, Arc::new(WebScrapeHandler::new(tools)));
}
