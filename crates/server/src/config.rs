use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use taskloom_core::handlers::register_builtin;
use taskloom_core::workflow::{HandlerRegistry, WorkflowExecutor};
use taskloom_core::{ExecutorConfig, ProgressHub, RunManager};
use taskloom_tools::{register_tool_handlers, ToolProvider, ToolRegistry, WebFetchTool};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ListenConfig,

    #[serde(default)]
    pub engine: ExecutorConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub export: ExportConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Progress events buffered per run before slow subscribers lag
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Finished runs kept in memory; the oldest are dropped beyond this
    #[serde(default = "default_max_retained_runs")]
    pub max_retained_runs: usize,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_event_capacity() -> usize {
    256
}

fn default_max_retained_runs() -> usize {
    1000
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            event_capacity: default_event_capacity(),
            max_retained_runs: default_max_retained_runs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Hosts `web_fetch` may reach. Empty allows every host.
    #[serde(default)]
    pub allowed_domains: Vec<String>,

    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_max_response_bytes() -> usize {
    1_000_000
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            allowed_domains: Vec::new(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            max_response_bytes: default_max_response_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./exports")
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

impl ServerConfig {
    /// Load the config file, or fall back to defaults when it does not exist
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            tracing::info!("Configuration file not found, using defaults");
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(config_path).context("Failed to read configuration file")?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse configuration file")
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Application state shared across handlers
pub struct AppState {
    pub runs: Arc<RunManager>,
    pub tools: Arc<ToolRegistry>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.export.output_dir)
            .context("Failed to create export directory")?;

        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(WebFetchTool::with_limits(
            config.tools.allowed_domains.clone(),
            config.tools.max_response_bytes,
            Duration::from_secs(config.tools.fetch_timeout_secs),
        )?));
        let tools = Arc::new(tools);

        let mut handlers = HandlerRegistry::new();
        register_builtin(&mut handlers, &config.export.output_dir);
        let provider: Arc<dyn ToolProvider> = tools.clone();
        register_tool_handlers(&mut handlers, provider);

        Ok(Self::from_parts(handlers, tools, config))
    }

    /// Assemble state around an already populated handler registry
    pub fn from_parts(
        handlers: HandlerRegistry,
        tools: Arc<ToolRegistry>,
        config: &ServerConfig,
    ) -> Self {
        tracing::info!(
            "Registered step types: {}",
            handlers
                .kinds()
                .iter()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let executor = Arc::new(WorkflowExecutor::new(
            Arc::new(handlers),
            config.engine.clone(),
        ));
        let hub = Arc::new(ProgressHub::new(config.server.event_capacity));

        Self {
            runs: Arc::new(
                RunManager::new(executor, hub).with_retention(config.server.max_retained_runs),
            ),
            tools,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskloom_core::{CyclePolicy, DependencyFailurePolicy};

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = ServerConfig::parse("").unwrap();
        assert_eq!(config.addr(), "127.0.0.1:8080");
        assert_eq!(config.engine, ExecutorConfig::default());
        assert!(config.tools.allowed_domains.is_empty());
    }

    #[test]
    fn test_parses_all_sections() {
        let config = ServerConfig::parse(
            r#"
            [server]
            port = 9000

            [engine]
            max_concurrency = 4
            step_timeout_secs = 60
            cycle_policy = "reject"
            dependency_failure = "skip"

            [tools]
            allowed_domains = ["data.gov.hk"]

            [export]
            output_dir = "/var/lib/taskloom/out"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.max_retained_runs, 1000);
        assert_eq!(config.engine.max_concurrency, Some(4));
        assert_eq!(config.engine.step_timeout_secs, Some(60));
        assert_eq!(config.engine.cycle_policy, CyclePolicy::Reject);
        assert_eq!(config.engine.dependency_failure, DependencyFailurePolicy::Skip);
        assert_eq!(config.tools.allowed_domains, vec!["data.gov.hk".to_string()]);
        assert_eq!(config.export.output_dir, PathBuf::from("/var/lib/taskloom/out"));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_rejects_malformed_file() {
        assert!(ServerConfig::parse("[engine]\ncycle_policy = \"sometimes\"").is_err());
    }

    #[test]
    fn test_state_registers_builtin_and_tool_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::default();
        config.export.output_dir = dir.path().join("exports");

        let state = AppState::new(&config).unwrap();
        let kinds: Vec<String> = state
            .runs
            .executor()
            .registry()
            .kinds()
            .iter()
            .map(|k| k.to_string())
            .collect();

        assert_eq!(kinds, vec!["api-call", "file-export", "transform", "web-scrape"]);
        assert!(state.tools.contains("web_fetch"));
        assert!(config.export.output_dir.is_dir());
    }
}
