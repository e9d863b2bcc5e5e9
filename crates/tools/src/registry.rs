// External tool capability interface and the in-process registry implementing it

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Description of a tool, as listed to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// One piece of tool output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContent {
    Text { text: String },
    Json { value: Value },
}

/// Result of a tool call. Tool-level failures are reported with `is_error`
/// rather than as `Err`, so the caller sees the tool's own explanation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: Vec<ToolContent>,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    pub fn json(value: Value) -> Self {
        Self {
            content: vec![ToolContent::Json { value }],
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text {
                text: message.into(),
            }],
            is_error: true,
        }
    }

    /// Collapse the content into one JSON value: a single item stands for
    /// itself, several become an array
    pub fn into_value(self) -> Value {
        let mut values: Vec<Value> = self
            .content
            .into_iter()
            .map(|c| match c {
                ToolContent::Text { text } => Value::String(text),
                ToolContent::Json { value } => value,
            })
            .collect();

        match values.len() {
            0 => Value::Null,
            1 => values.remove(0),
            _ => Value::Array(values),
        }
    }

    fn message(&self) -> String {
        self.content
            .iter()
            .map(|c| match c {
                ToolContent::Text { text } => text.clone(),
                ToolContent::Json { value } => value.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("tool {tool} reported an error: {message}")]
    Failed { tool: String, message: String },

    #[error("tool {tool} failed")]
    Execution {
        tool: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Connection to a set of external tools
#[async_trait::async_trait]
pub trait ToolProvider: Send + Sync {
    /// Schemas of every tool that can be invoked
    fn list_capabilities(&self) -> Vec<ToolSchema>;

    /// Call a tool by name
    async fn invoke(&self, name: &str, arguments: Value) -> Result<Value, ToolError>;
}

/// Tool executor trait
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool schema
    fn schema(&self) -> ToolSchema;

    /// Execute the tool with given arguments
    async fn execute(&self, arguments: Value) -> Result<ToolOutput>;
}

/// Tool registry for managing available tools
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let schema = tool.schema();
        tracing::debug!("Registering tool {}", schema.name);
        self.tools.insert(schema.name, tool);
    }

    /// Get a tool by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Check if a tool exists
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait::async_trait]
impl ToolProvider for ToolRegistry {
    fn list_capabilities(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.values().map(|t| t.schema()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    async fn invoke(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        tracing::info!("Invoking tool {}", name);

        let output = tool
            .execute(arguments)
            .await
            .map_err(|source| ToolError::Execution {
                tool: name.to_string(),
                source,
            })?;

        if output.is_error {
            return Err(ToolError::Failed {
                tool: name.to_string(),
                message: output.message(),
            });
        }

        Ok(output.into_value())
    }
}

// Helper functions for creating tool schemas

pub fn json_schema_object(properties: Value, required: Vec<&str>) -> Value {
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

pub fn json_schema_string(description: &str) -> Value {
    serde_json::json!({
        "type": "string",
        "description": description
    })
}

pub fn json_schema_boolean(description: &str) -> Value {
    serde_json::json!({
        "type": "boolean",
        "description": description
    })
}
