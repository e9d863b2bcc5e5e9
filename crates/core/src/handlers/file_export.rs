use crate::error::StepError;
use crate::workflow::{StepHandler, StepInput};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ExportFormat {
    Json,
    Text,
}

#[derive(Debug, Deserialize)]
struct FileExportConfig {
    path: String,
    #[serde(default)]
    content: Value,
    #[serde(default = "default_format")]
    format: ExportFormat,
}

fn default_format() -> ExportFormat {
    ExportFormat::Json
}

/// Handler for `file-export` steps: writes content below a fixed output directory.
///
/// Config: `{ "path": "reports/q1.json", "content": .., "format"?: "json" | "text" }`.
/// Output: `{ "path": <written path>, "bytes": <size> }`.
pub struct FileExportHandler {
    output_dir: PathBuf,
}

impl FileExportHandler {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// Resolve a step-supplied relative path inside the output directory
    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let path = Path::new(relative);
        if relative.is_empty() {
            bail!("export path is empty");
        }
        for component in path.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => bail!("export path must stay inside the output directory: {}", relative),
            }
        }
        Ok(self.output_dir.join(path))
    }
}

fn render(content: &Value, format: &ExportFormat) -> Result<Vec<u8>> {
    match format {
        ExportFormat::Json => {
            serde_json::to_vec_pretty(content).context("Failed to serialize export content")
        }
        ExportFormat::Text => Ok(match content {
            Value::String(text) => text.clone().into_bytes(),
            Value::Null => Vec::new(),
            other => other.to_string().into_bytes(),
        }),
    }
}

#[async_trait::async_trait]
impl StepHandler for FileExportHandler {
    async fn execute(&self, input: StepInput) -> Result<Value> {
        let config: FileExportConfig = serde_json::from_value(input.config)
            .context("Invalid file-export configuration")?;

        let target = self.resolve(&config.path)?;
        let bytes = render(&config.content, &config.format)?;

        if input.cancel.is_cancelled() {
            return Err(StepError::Cancelled.into());
        }

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        tokio::fs::write(&target, &bytes)
            .await
            .with_context(|| format!("Failed to write {}", target.display()))?;

        tracing::info!("Exported {} bytes to {}", bytes.len(), target.display());

        Ok(serde_json::json!({
            "path": target.display().to_string(),
            "bytes": bytes.len(),
        }))
    }
}
