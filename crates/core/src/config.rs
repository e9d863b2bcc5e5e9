use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What the graph builder does when leveling stalls on a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePolicy {
    /// Place every step still unresolved into one final level
    #[default]
    CoSchedule,
    /// Fail the submission with `GraphError::Cycle`
    Reject,
}

/// What happens to steps whose upstream step did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyFailurePolicy {
    /// Dependents still run and read an absent upstream output
    #[default]
    Continue,
    /// Dependents are marked skipped without being dispatched
    Skip,
}

/// Engine settings, read from the `[engine]` table of the server config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Upper bound on steps in flight within a level. `None` runs the whole level at once.
    #[serde(default)]
    pub max_concurrency: Option<usize>,

    /// Per-step deadline
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,

    #[serde(default)]
    pub cycle_policy: CyclePolicy,

    #[serde(default)]
    pub dependency_failure: DependencyFailurePolicy,
}

impl ExecutorConfig {
    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_secs.map(Duration::from_secs)
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    pub fn with_step_timeout_secs(mut self, secs: u64) -> Self {
        self.step_timeout_secs = Some(secs);
        self
    }

    pub fn with_cycle_policy(mut self, policy: CyclePolicy) -> Self {
        self.cycle_policy = policy;
        self
    }

    pub fn with_dependency_failure(mut self, policy: DependencyFailurePolicy) -> Self {
        self.dependency_failure = policy;
        self
    }
}

/// Per-run overrides supplied at submission time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Run deadline. On expiry the run is cancelled cooperatively.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub max_concurrency: Option<usize>,

    #[serde(default)]
    pub step_timeout_secs: Option<u64>,
}

impl RunOptions {
    /// Layer these options over the engine defaults
    pub fn apply(&self, base: &ExecutorConfig) -> ExecutorConfig {
        ExecutorConfig {
            max_concurrency: self.max_concurrency.or(base.max_concurrency),
            step_timeout_secs: self.step_timeout_secs.or(base.step_timeout_secs),
            ..base.clone()
        }
    }
}
