use crate::error::StepError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Unique identifier for a workflow step
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Type tag of a step, resolved to a handler through the registry.
///
/// Tags outside the known set are kept as [`StepKind::Custom`] so that a graph
/// naming them still loads; such steps fail at dispatch time unless a host
/// registered a handler for the tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepKind {
    Code,
    Prompt,
    WebScrape,
    Transform,
    FileExport,
    DocumentExtract,
    ApiCall,
    Custom(String),
}

impl StepKind {
    pub fn as_str(&self) -> &str {
        match self {
            StepKind::Code => "code",
            StepKind::Prompt => "prompt",
            StepKind::WebScrape => "web-scrape",
            StepKind::Transform => "transform",
            StepKind::FileExport => "file-export",
            StepKind::DocumentExtract => "document-extract",
            StepKind::ApiCall => "api-call",
            StepKind::Custom(tag) => tag,
        }
    }

    /// Whether this tag belongs to the closed set of built-in kinds
    pub fn is_builtin(&self) -> bool {
        !matches!(self, StepKind::Custom(_))
    }
}

impl From<String> for StepKind {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "code" => StepKind::Code,
            "prompt" => StepKind::Prompt,
            "web-scrape" => StepKind::WebScrape,
            "transform" => StepKind::Transform,
            "file-export" => StepKind::FileExport,
            "document-extract" => StepKind::DocumentExtract,
            "api-call" => StepKind::ApiCall,
            _ => StepKind::Custom(tag),
        }
    }
}

impl From<&str> for StepKind {
    fn from(tag: &str) -> Self {
        Self::from(tag.to_string())
    }
}

impl From<StepKind> for String {
    fn from(kind: StepKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Specification for a single workflow step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub id: StepId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type", alias = "kind")]
    pub kind: StepKind,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl StepSpec {
    pub fn new(id: impl Into<String>, kind: impl Into<StepKind>, config: serde_json::Value) -> Self {
        Self {
            id: StepId::new(id),
            name: None,
            kind: kind.into(),
            config,
        }
    }
}

/// Declared dependency: `target` may start only after `source` has settled
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Link {
    pub source: StepId,
    pub target: StepId,
}

impl Link {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: StepId::new(source),
            target: StepId::new(target),
        }
    }
}

/// A submitted workflow: steps plus the links between them.
/// Also accepts the `nodes` / `edges` spelling used by graph editors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    #[serde(alias = "nodes")]
    pub steps: Vec<StepSpec>,
    #[serde(default, alias = "edges")]
    pub links: Vec<Link>,
}

impl WorkflowGraph {
    pub fn new(steps: Vec<StepSpec>, links: Vec<Link>) -> Self {
        Self { steps, links }
    }
}

/// Status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Status of a workflow step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Cancelled => "cancelled",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Outcome record of one step within a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepResult {
    pub fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            output: None,
            error: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn completed(
        output: serde_json::Value,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: StepStatus::Completed,
            output: Some(output),
            error: None,
            started_at: Some(started_at),
            completed_at: Some(completed_at),
        }
    }

    /// Terminal record for a step that did not produce output.
    /// Cancellation failures get their own status.
    pub fn failed(
        error: StepError,
        started_at: Option<DateTime<Utc>>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        let status = if matches!(error, StepError::Cancelled) {
            StepStatus::Cancelled
        } else {
            StepStatus::Failed
        };

        Self {
            status,
            output: None,
            error: Some(error),
            started_at,
            completed_at: Some(completed_at),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Skipped,
            output: None,
            error: Some(StepError::DependencyFailed {
                message: reason.into(),
            }),
            started_at: None,
            completed_at: Some(Utc::now()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

impl Default for StepResult {
    fn default() -> Self {
        Self::pending()
    }
}

/// One execution of a workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Execution levels as scheduled
    pub levels: Vec<Vec<StepId>>,
    pub steps: HashMap<StepId, StepResult>,
}

impl Run {
    /// Count steps currently in the given status
    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.values().filter(|r| r.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_kind_round_trips_known_and_custom_tags() {
        assert_eq!(StepKind::from("web-scrape"), StepKind::WebScrape);
        assert_eq!(StepKind::from("api-call").as_str(), "api-call");

        let custom = StepKind::from("frobnicate");
        assert_eq!(custom, StepKind::Custom("frobnicate".to_string()));
        assert!(!custom.is_builtin());
        assert_eq!(custom.to_string(), "frobnicate");
    }

    #[test]
    fn test_graph_accepts_nodes_and_edges_aliases() {
        let json = serde_json::json!({
            "nodes": [
                { "id": "fetch", "type": "web-scrape", "config": { "url": "https://example.com" } },
                { "id": "shape", "type": "transform" }
            ],
            "edges": [ { "source": "fetch", "target": "shape" } ]
        });

        let graph: WorkflowGraph = serde_json::from_value(json).unwrap();
        assert_eq!(graph.steps.len(), 2);
        assert_eq!(graph.steps[0].kind, StepKind::WebScrape);
        assert_eq!(graph.steps[1].config, serde_json::Value::Null);
        assert_eq!(graph.links, vec![Link::new("fetch", "shape")]);
    }

    #[test]
    fn test_cancelled_error_gets_cancelled_status() {
        let now = Utc::now();
        let result = StepResult::failed(StepError::Cancelled, Some(now), now);
        assert_eq!(result.status, StepStatus::Cancelled);

        let result = StepResult::failed(
            StepError::Handler {
                message: "boom".to_string(),
            },
            Some(now),
            now,
        );
        assert_eq!(result.status, StepStatus::Failed);
        assert!(result.status.is_terminal());
    }

    #[test]
    fn test_run_id_parses_from_string() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<RunId>().is_err());
    }
}
