// Run submission, status tracking and cancellation by run id

use crate::config::RunOptions;
use crate::error::{GraphError, RunError};
use crate::events::{ProgressEvent, ProgressHub, ProgressSink};
use crate::types::{Run, RunId, RunStatus, StepId, WorkflowGraph};
use crate::workflow::executor::{overall_status, WorkflowExecutor};
use crate::workflow::ExecutionContext;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, RwLock};
use tokio_util::sync::CancellationToken;

struct RunEntry {
    status: RunStatus,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    levels: Vec<Vec<StepId>>,
    context: Arc<ExecutionContext>,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl RunEntry {
    fn to_run(&self, id: RunId) -> Run {
        Run {
            id,
            status: self.status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            levels: self.levels.clone(),
            steps: self.context.snapshot(),
        }
    }
}

/// Tracks runs executing in the background
pub struct RunManager {
    executor: Arc<WorkflowExecutor>,
    hub: Arc<ProgressHub>,
    runs: Arc<RwLock<HashMap<RunId, RunEntry>>>,
    retain_finished: Option<usize>,
}

impl RunManager {
    pub fn new(executor: Arc<WorkflowExecutor>, hub: Arc<ProgressHub>) -> Self {
        Self {
            executor,
            hub,
            runs: Arc::new(RwLock::new(HashMap::new())),
            retain_finished: None,
        }
    }

    /// Keep at most `limit` finished runs; older finished runs are dropped as
    /// new ones finish. Active runs are never dropped.
    pub fn with_retention(mut self, limit: usize) -> Self {
        self.retain_finished = Some(limit);
        self
    }

    pub fn executor(&self) -> &Arc<WorkflowExecutor> {
        &self.executor
    }

    pub fn hub(&self) -> &Arc<ProgressHub> {
        &self.hub
    }

    /// Validate a graph and start running it in the background.
    ///
    /// Graph errors are returned here, before anything is scheduled. Otherwise
    /// the run id is returned immediately and the run completes asynchronously.
    pub async fn submit(
        &self,
        workflow: WorkflowGraph,
        options: RunOptions,
    ) -> Result<RunId, GraphError> {
        let config = options.apply(self.executor.config());
        let prepared = self.executor.prepare_with(&workflow, config)?;
        let run_id = prepared.run_id();

        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);

        self.runs.write().await.insert(
            run_id,
            RunEntry {
                status: RunStatus::Running,
                started_at: Utc::now(),
                completed_at: None,
                levels: prepared.levels().to_vec(),
                context: prepared.context(),
                cancel: cancel.clone(),
                done: done_rx.clone(),
            },
        );

        tracing::info!(
            "Submitted run {} with {} steps",
            run_id,
            workflow.steps.len()
        );

        if let Some(secs) = options.timeout_secs {
            spawn_deadline(run_id, Duration::from_secs(secs), cancel.clone(), done_rx);
        }

        let executor = self.executor.clone();
        let hub = self.hub.clone();
        let runs = self.runs.clone();
        let retain_finished = self.retain_finished;

        tokio::spawn(async move {
            let sink: Arc<dyn ProgressSink> = hub.clone();
            let results = executor.execute(prepared, cancel.clone(), Some(sink)).await;
            let status = overall_status(&results, cancel.is_cancelled());

            {
                let mut runs = runs.write().await;
                if let Some(entry) = runs.get_mut(&run_id) {
                    entry.status = status;
                    entry.completed_at = Some(Utc::now());
                }
                if let Some(limit) = retain_finished {
                    evict_finished(&mut runs, limit);
                }
            }

            hub.close(run_id);
            let _ = done_tx.send(true);
            tracing::info!("Run {} finished with status {:?}", run_id, status);
        });

        Ok(run_id)
    }

    /// Current state of a run, including live step results
    pub async fn get(&self, run_id: RunId) -> Option<Run> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .map(|entry| entry.to_run(run_id))
    }

    /// All known runs, oldest first
    pub async fn list(&self) -> Vec<Run> {
        let runs = self.runs.read().await;
        let mut list: Vec<Run> = runs.iter().map(|(id, entry)| entry.to_run(*id)).collect();
        list.sort_by_key(|run| run.started_at);
        list
    }

    /// Request cancellation of an active run.
    ///
    /// No further level starts after this; steps already running are awaited.
    pub async fn cancel(&self, run_id: RunId) -> Result<(), RunError> {
        let runs = self.runs.read().await;
        let entry = runs.get(&run_id).ok_or(RunError::NotFound(run_id))?;

        if entry.status.is_terminal() {
            return Err(RunError::NotActive(run_id));
        }

        entry.cancel.cancel();
        tracing::info!("Cancellation signal sent for run {}", run_id);
        Ok(())
    }

    /// Wait for a run to finish and return its final state
    pub async fn wait(&self, run_id: RunId) -> Option<Run> {
        let mut done = self.runs.read().await.get(&run_id)?.done.clone();
        // Err means the run task is gone, which only happens after it finished
        let _ = done.wait_for(|finished| *finished).await;
        self.get(run_id).await
    }

    /// Subscribe to the progress events of an active run.
    /// Returns `None` for unknown or already finished runs.
    pub async fn subscribe(&self, run_id: RunId) -> Option<broadcast::Receiver<ProgressEvent>> {
        let runs = self.runs.read().await;
        let entry = runs.get(&run_id)?;
        if entry.status.is_terminal() {
            return None;
        }
        Some(self.hub.subscribe(run_id))
    }

    /// Drop a finished run from memory
    pub async fn forget(&self, run_id: RunId) -> Result<Run, RunError> {
        let mut runs = self.runs.write().await;
        match runs.get(&run_id) {
            None => Err(RunError::NotFound(run_id)),
            Some(entry) if !entry.status.is_terminal() => Err(RunError::NotActive(run_id)),
            Some(_) => {
                let entry = runs.remove(&run_id).ok_or(RunError::NotFound(run_id))?;
                Ok(entry.to_run(run_id))
            }
        }
    }
}

/// Drop the oldest finished runs until at most `limit` remain
fn evict_finished(runs: &mut HashMap<RunId, RunEntry>, limit: usize) {
    let mut finished: Vec<(DateTime<Utc>, RunId)> = runs
        .iter()
        .filter(|(_, entry)| entry.status.is_terminal())
        .map(|(id, entry)| (entry.completed_at.unwrap_or(entry.started_at), *id))
        .collect();

    if finished.len() <= limit {
        return;
    }

    finished.sort();
    let excess = finished.len() - limit;
    for (_, run_id) in finished.into_iter().take(excess) {
        runs.remove(&run_id);
        tracing::debug!("Evicted finished run {}", run_id);
    }
}

/// Cancel the run cooperatively once its deadline passes
fn spawn_deadline(
    run_id: RunId,
    limit: Duration,
    cancel: CancellationToken,
    mut done: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(limit) => {
                tracing::warn!("Run {} exceeded its {}s deadline, cancelling", run_id, limit.as_secs());
                cancel.cancel();
            }
            _ = done.wait_for(|finished| *finished) => {}
        }
    });
}
