use super::context::ExecutionContext;
use super::dag::{Level, WorkflowDag};
use super::registry::HandlerRegistry;
use super::step_executor::StepExecutor;
use crate::config::{DependencyFailurePolicy, ExecutorConfig};
use crate::error::{GraphError, StepError};
use crate::events::{ProgressEvent, ProgressSink};
use crate::types::{RunId, RunStatus, StepId, StepResult, StepStatus, WorkflowGraph};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A validated, leveled run that has not started yet
pub struct PreparedRun {
    run_id: RunId,
    dag: WorkflowDag,
    levels: Vec<Level>,
    context: Arc<ExecutionContext>,
    config: ExecutorConfig,
}

impl PreparedRun {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    /// Steps with no dependencies, in submission order
    pub fn entry_steps(&self) -> Vec<StepId> {
        self.dag
            .entry_steps()
            .into_iter()
            .map(|step| step.id.clone())
            .collect()
    }

    /// Shared handle on the run's context, for observing progress while it executes
    pub fn context(&self) -> Arc<ExecutionContext> {
        Arc::clone(&self.context)
    }
}

/// Workflow executor that drives level-by-level execution
pub struct WorkflowExecutor {
    registry: Arc<HandlerRegistry>,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    pub fn new(registry: Arc<HandlerRegistry>, config: ExecutorConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Validate and level a graph using the executor's own settings
    pub fn prepare(&self, workflow: &WorkflowGraph) -> Result<PreparedRun, GraphError> {
        self.prepare_with(workflow, self.config.clone())
    }

    /// Validate and level a graph with per-run settings
    pub fn prepare_with(
        &self,
        workflow: &WorkflowGraph,
        config: ExecutorConfig,
    ) -> Result<PreparedRun, GraphError> {
        let dag = WorkflowDag::from_graph(workflow)?;
        let levels = dag.levels(config.cycle_policy)?;
        let context = Arc::new(ExecutionContext::new(
            workflow.steps.iter().map(|s| s.id.clone()),
        ));

        Ok(PreparedRun {
            run_id: RunId::new(),
            dag,
            levels,
            context,
            config,
        })
    }

    /// Execute a workflow to completion and return every step's result
    pub async fn run(
        &self,
        workflow: &WorkflowGraph,
        sink: Option<Arc<dyn ProgressSink>>,
    ) -> Result<HashMap<StepId, StepResult>, GraphError> {
        self.run_with_cancel(workflow, CancellationToken::new(), sink)
            .await
    }

    /// Execute a workflow that can be stopped through `cancel`
    pub async fn run_with_cancel(
        &self,
        workflow: &WorkflowGraph,
        cancel: CancellationToken,
        sink: Option<Arc<dyn ProgressSink>>,
    ) -> Result<HashMap<StepId, StepResult>, GraphError> {
        let prepared = self.prepare(workflow)?;
        Ok(self.execute(prepared, cancel, sink).await)
    }

    /// Run the levels of a prepared workflow.
    ///
    /// Every step of a level is spawned before any is awaited, and the whole
    /// level settles before the next one starts. The cancellation token is
    /// checked before each dispatch; once it is set no further step starts,
    /// while steps already in flight are still awaited. Steps never dispatched
    /// stay pending in the returned map.
    pub async fn execute(
        &self,
        prepared: PreparedRun,
        cancel: CancellationToken,
        sink: Option<Arc<dyn ProgressSink>>,
    ) -> HashMap<StepId, StepResult> {
        let PreparedRun {
            run_id,
            dag,
            levels,
            context,
            config,
        } = prepared;

        tracing::info!(
            "Starting workflow execution: run_id={}, steps={}, levels={}",
            run_id,
            dag.len(),
            levels.len()
        );

        let step_executor = Arc::new(StepExecutor::new(
            self.registry.clone(),
            config.step_timeout(),
        ));
        let limiter = config
            .max_concurrency
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));

        'levels: for (index, level) in levels.iter().enumerate() {
            tracing::debug!("Dispatching level {} of run {}: {:?}", index, run_id, level);

            let mut join_set = JoinSet::new();
            let mut in_flight: HashMap<tokio::task::Id, StepId> = HashMap::new();
            let mut stopped = false;

            for step_id in level {
                // Check for cancellation
                if cancel.is_cancelled() {
                    tracing::warn!(
                        "Workflow execution cancelled: run_id={}, stopping at level {}",
                        run_id,
                        index
                    );
                    stopped = true;
                    break;
                }

                if config.dependency_failure == DependencyFailurePolicy::Skip {
                    if let Some(failed) = failed_dependency(&dag, &context, step_id) {
                        tracing::info!(
                            "Skipping step {} due to failed dependency {}",
                            step_id,
                            failed
                        );
                        let result =
                            StepResult::skipped(format!("dependency {} did not complete", failed));
                        settle(&context, &sink, run_id, step_id, result);
                        continue;
                    }
                }

                let Some(step) = dag.step(step_id).cloned() else {
                    continue;
                };

                if let Err(e) = context.mark_running(step_id) {
                    tracing::warn!("Not dispatching step {}: {}", step_id, e);
                    continue;
                }
                emit(
                    &sink,
                    ProgressEvent::new(run_id, step_id.clone(), StepStatus::Running),
                );

                let executor = step_executor.clone();
                let view = context.view();
                let token = cancel.child_token();
                let limiter = limiter.clone();

                let handle = join_set.spawn(async move {
                    let _permit = match limiter {
                        Some(semaphore) => semaphore.acquire_owned().await.ok(),
                        None => None,
                    };
                    // The permit may arrive after the run was cancelled
                    if token.is_cancelled() {
                        return StepResult::failed(StepError::Cancelled, None, Utc::now());
                    }
                    executor.execute(&step, view, token).await
                });
                in_flight.insert(handle.id(), step_id.clone());
            }

            // Wait for the whole level to settle
            while let Some(joined) = join_set.join_next_with_id().await {
                let (task_id, result) = match joined {
                    Ok((task_id, result)) => (task_id, result),
                    Err(join_error) => {
                        let message = if join_error.is_panic() {
                            "step handler panicked".to_string()
                        } else {
                            "step task was aborted".to_string()
                        };
                        tracing::error!("Step task failed in run {}: {}", run_id, join_error);
                        (
                            join_error.id(),
                            StepResult::failed(StepError::Handler { message }, None, Utc::now()),
                        )
                    }
                };

                if let Some(step_id) = in_flight.remove(&task_id) {
                    settle(&context, &sink, run_id, &step_id, result);
                }
            }

            if stopped {
                break 'levels;
            }
        }

        let results = context.snapshot();
        tracing::info!(
            "Workflow execution finished: run_id={}, status={:?}",
            run_id,
            overall_status(&results, cancel.is_cancelled())
        );
        results
    }
}

/// Derive a run's status from its step results.
///
/// A cancelled run that left work undone is `Cancelled`; otherwise any step
/// that did not complete makes the run `Failed`.
pub fn overall_status(results: &HashMap<StepId, StepResult>, cancelled: bool) -> RunStatus {
    let unfinished = results
        .values()
        .any(|r| matches!(r.status, StepStatus::Pending | StepStatus::Cancelled));

    if cancelled && unfinished {
        RunStatus::Cancelled
    } else if results.values().all(StepResult::is_success) {
        RunStatus::Completed
    } else {
        RunStatus::Failed
    }
}

fn failed_dependency(
    dag: &WorkflowDag,
    context: &ExecutionContext,
    step_id: &StepId,
) -> Option<StepId> {
    dag.dependencies(step_id)?.into_iter().find(|dep| {
        matches!(
            context.status(dep),
            Some(StepStatus::Failed | StepStatus::Cancelled | StepStatus::Skipped)
        )
    })
}

fn settle(
    context: &ExecutionContext,
    sink: &Option<Arc<dyn ProgressSink>>,
    run_id: RunId,
    step_id: &StepId,
    result: StepResult,
) {
    let event = ProgressEvent::settled(run_id, step_id.clone(), &result);
    match context.set_result(step_id, result) {
        Ok(()) => emit(sink, event),
        Err(e) => tracing::error!("Dropping result for step {}: {}", step_id, e),
    }
}

fn emit(sink: &Option<Arc<dyn ProgressSink>>, event: ProgressEvent) {
    if let Some(sink) = sink {
        sink.on_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CyclePolicy;
    use crate::types::{Link, StepSpec};
    use crate::workflow::registry::handler_fn;
    use anyhow::anyhow;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn step(id: &str, kind: &str) -> StepSpec {
        StepSpec::new(id, kind, json!({}))
    }

    fn executor(registry: HandlerRegistry) -> WorkflowExecutor {
        WorkflowExecutor::new(Arc::new(registry), ExecutorConfig::default())
    }

    fn recording_sink() -> (Arc<dyn ProgressSink>, Arc<Mutex<Vec<ProgressEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let events = events.clone();
            move |event: ProgressEvent| events.lock().unwrap().push(event)
        };
        (Arc::new(sink), events)
    }

    #[tokio::test]
    async fn test_fetch_transform_export_pipeline() {
        let exported = Arc::new(Mutex::new(None));
        let registry = HandlerRegistry::new()
            .with_handler("web-scrape", handler_fn(|_| async { Ok(json!({ "rows": 3 })) }))
            .with_handler(
                "transform",
                handler_fn(|input| async move {
                    let rows = input.config["input"]["rows"].as_i64().unwrap_or(0);
                    Ok(json!({ "rows": rows * 2 }))
                }),
            )
            .with_handler("file-export", {
                let exported = exported.clone();
                handler_fn(move |input| {
                    let exported = exported.clone();
                    async move {
                        *exported.lock().unwrap() = Some(input.config["content"].clone());
                        Ok(json!({ "written": true }))
                    }
                })
            });

        let workflow = WorkflowGraph::new(
            vec![
                step("fetch", "web-scrape"),
                StepSpec::new("transform", "transform", json!({ "input": "${fetch}" })),
                StepSpec::new("export", "file-export", json!({ "content": "${transform}" })),
            ],
            vec![Link::new("fetch", "transform"), Link::new("transform", "export")],
        );

        let executor = executor(registry);
        let prepared = executor.prepare(&workflow).unwrap();
        assert_eq!(
            prepared.levels(),
            &[
                vec![StepId::new("fetch")],
                vec![StepId::new("transform")],
                vec![StepId::new("export")]
            ]
        );

        let results = executor
            .execute(prepared, CancellationToken::new(), None)
            .await;
        assert!(results.values().all(StepResult::is_success));
        assert_eq!(*exported.lock().unwrap(), Some(json!({ "rows": 6 })));
        assert_eq!(overall_status(&results, false), RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_independent_steps_run_concurrently() {
        // Each handler waits until both have started, so this only finishes if
        // the two steps are in flight at the same time.
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let registry = HandlerRegistry::new().with_handler("code", {
            let barrier = barrier.clone();
            handler_fn(move |input| {
                let barrier = barrier.clone();
                async move {
                    barrier.wait().await;
                    Ok(json!(input.step_id.as_str()))
                }
            })
        });

        let workflow = WorkflowGraph::new(vec![step("a", "code"), step("b", "code")], vec![]);
        let results = tokio::time::timeout(
            Duration::from_secs(5),
            executor(registry).run(&workflow, None),
        )
        .await
        .expect("level did not run concurrently")
        .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[&StepId::new("a")].status, StepStatus::Completed);
        assert_eq!(results[&StepId::new("b")].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_dependency_does_not_block_dependent() {
        let seen_upstream = Arc::new(Mutex::new(None));
        let registry = HandlerRegistry::new()
            .with_handler("api-call", handler_fn(|_| async { Err(anyhow!("connection refused")) }))
            .with_handler("transform", {
                let seen = seen_upstream.clone();
                handler_fn(move |input| {
                    let seen = seen.clone();
                    async move {
                        *seen.lock().unwrap() = Some(input.config["input"].clone());
                        Ok(json!("ran"))
                    }
                })
            });

        let workflow = WorkflowGraph::new(
            vec![
                step("x", "api-call"),
                StepSpec::new("y", "transform", json!({ "input": "${x}" })),
            ],
            vec![Link::new("x", "y")],
        );

        let results = executor(registry).run(&workflow, None).await.unwrap();
        assert_eq!(results[&StepId::new("x")].status, StepStatus::Failed);
        assert!(results[&StepId::new("x")].output.is_none());
        assert_eq!(results[&StepId::new("y")].status, StepStatus::Completed);
        assert_eq!(*seen_upstream.lock().unwrap(), Some(Value::Null));
        assert_eq!(overall_status(&results, false), RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_skip_policy_marks_dependents_skipped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistry::new()
            .with_handler("api-call", handler_fn(|_| async { Err(anyhow!("boom")) }))
            .with_handler("transform", {
                let calls = calls.clone();
                handler_fn(move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(json!(null)) }
                })
            });

        let workflow = WorkflowGraph::new(
            vec![step("x", "api-call"), step("y", "transform"), step("z", "transform")],
            vec![Link::new("x", "y"), Link::new("y", "z")],
        );
        let config = ExecutorConfig::default().with_dependency_failure(DependencyFailurePolicy::Skip);
        let executor = WorkflowExecutor::new(Arc::new(registry), config);

        let results = executor.run(&workflow, None).await.unwrap();
        assert_eq!(results[&StepId::new("y")].status, StepStatus::Skipped);
        assert_eq!(results[&StepId::new("z")].status, StepStatus::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_step_type_fails_step_not_run() {
        let registry = HandlerRegistry::new()
            .with_handler("transform", handler_fn(|_| async { Ok(json!("ok")) }));
        let workflow = WorkflowGraph::new(
            vec![step("weird", "frobnicate"), step("after", "transform")],
            vec![Link::new("weird", "after")],
        );

        let results = executor(registry).run(&workflow, None).await.unwrap();
        let weird = &results[&StepId::new("weird")];
        assert_eq!(weird.status, StepStatus::Failed);
        assert_eq!(weird.error.as_ref().map(|e| e.kind()), Some("UnknownStepType"));
        assert_eq!(results[&StepId::new("after")].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_before_level_two_leaves_rest_pending() {
        let cancel = CancellationToken::new();
        let dispatched = Arc::new(Mutex::new(Vec::new()));
        let registry = HandlerRegistry::new().with_handler("code", {
            let cancel = cancel.clone();
            let dispatched = dispatched.clone();
            handler_fn(move |input| {
                let cancel = cancel.clone();
                let dispatched = dispatched.clone();
                async move {
                    dispatched.lock().unwrap().push(input.step_id.clone());
                    // The level-1 step requests cancellation of the whole run
                    if input.step_id.as_str() == "l1" {
                        cancel.cancel();
                    }
                    Ok(json!(null))
                }
            })
        });

        let workflow = WorkflowGraph::new(
            vec![step("l0", "code"), step("l1", "code"), step("l2", "code"), step("l3", "code")],
            vec![Link::new("l0", "l1"), Link::new("l1", "l2"), Link::new("l2", "l3")],
        );

        let results = executor(registry)
            .run_with_cancel(&workflow, cancel.clone(), None)
            .await
            .unwrap();

        assert!(results[&StepId::new("l0")].status.is_terminal());
        assert!(results[&StepId::new("l1")].status.is_terminal());
        assert_eq!(results[&StepId::new("l2")].status, StepStatus::Pending);
        assert_eq!(results[&StepId::new("l3")].status, StepStatus::Pending);
        assert_eq!(dispatched.lock().unwrap().len(), 2);
        assert_eq!(overall_status(&results, true), RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cooperative_handler_reports_cancellation() {
        let registry = HandlerRegistry::new().with_handler(
            "code",
            handler_fn(|input| async move {
                input.cancel.cancelled().await;
                Err(StepError::Cancelled.into())
            }),
        );
        let workflow = WorkflowGraph::new(vec![step("slow", "code")], vec![]);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let results = executor(registry)
            .run_with_cancel(&workflow, cancel, None)
            .await
            .unwrap();
        let slow = &results[&StepId::new("slow")];
        assert_eq!(slow.status, StepStatus::Cancelled);
        assert_eq!(slow.error, Some(StepError::Cancelled));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_recorded_as_failure() {
        let registry = HandlerRegistry::new()
            .with_handler(
                "code",
                handler_fn(|_| async {
                    let rows: Vec<i64> = Vec::new();
                    Ok(json!(rows[3]))
                }),
            )
            .with_handler("transform", handler_fn(|_| async { Ok(json!(1)) }));
        let workflow = WorkflowGraph::new(
            vec![step("bad", "code"), step("good", "transform")],
            vec![],
        );

        let results = executor(registry).run(&workflow, None).await.unwrap();
        assert_eq!(results[&StepId::new("bad")].status, StepStatus::Failed);
        assert_eq!(results[&StepId::new("good")].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_progress_events_follow_lifecycle() {
        let registry = HandlerRegistry::new()
            .with_handler("transform", handler_fn(|_| async { Ok(json!({ "ok": true })) }));
        let workflow = WorkflowGraph::new(
            vec![step("a", "transform"), step("b", "transform")],
            vec![Link::new("a", "b")],
        );
        let (sink, events) = recording_sink();

        executor(registry).run(&workflow, Some(sink)).await.unwrap();

        let events = events.lock().unwrap();
        let lifecycle: Vec<(String, StepStatus)> = events
            .iter()
            .map(|e| (e.step_id.to_string(), e.status))
            .collect();
        assert_eq!(
            lifecycle,
            vec![
                ("a".to_string(), StepStatus::Running),
                ("a".to_string(), StepStatus::Completed),
                ("b".to_string(), StepStatus::Running),
                ("b".to_string(), StepStatus::Completed),
            ]
        );
        assert_eq!(events[1].output, Some(json!({ "ok": true })));
    }

    #[tokio::test]
    async fn test_max_concurrency_bounds_in_flight_steps() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistry::new().with_handler("code", {
            let active = active.clone();
            let peak = peak.clone();
            handler_fn(move |_| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!(null))
                }
            })
        });

        let steps = (0..6).map(|i| step(&format!("s{i}"), "code")).collect();
        let workflow = WorkflowGraph::new(steps, vec![]);
        let executor = WorkflowExecutor::new(
            Arc::new(registry),
            ExecutorConfig::default().with_max_concurrency(2),
        );

        let results = executor.run(&workflow, None).await.unwrap();
        assert!(results.values().all(StepResult::is_success));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_queued_steps_do_not_start_after_cancel() {
        let cancel = CancellationToken::new();
        let invoked = Arc::new(Mutex::new(Vec::new()));
        let registry = HandlerRegistry::new().with_handler("code", {
            let cancel = cancel.clone();
            let invoked = invoked.clone();
            handler_fn(move |input| {
                let cancel = cancel.clone();
                let invoked = invoked.clone();
                async move {
                    invoked.lock().unwrap().push(input.step_id.clone());
                    cancel.cancel();
                    Ok(json!(null))
                }
            })
        });

        let steps = (0..3).map(|i| step(&format!("s{i}"), "code")).collect();
        let workflow = WorkflowGraph::new(steps, vec![]);
        let executor = WorkflowExecutor::new(
            Arc::new(registry),
            ExecutorConfig::default().with_max_concurrency(1),
        );

        let results = executor
            .run_with_cancel(&workflow, cancel.clone(), None)
            .await
            .unwrap();

        assert_eq!(invoked.lock().unwrap().len(), 1);
        assert_eq!(results.values().filter(|r| r.is_success()).count(), 1);
        assert_eq!(
            results
                .values()
                .filter(|r| r.status == StepStatus::Cancelled)
                .count(),
            2
        );
        assert_eq!(overall_status(&results, cancel.is_cancelled()), RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cycle_runs_co_scheduled_or_is_rejected() {
        let registry = HandlerRegistry::new()
            .with_handler("transform", handler_fn(|_| async { Ok(json!(null)) }));
        let workflow = WorkflowGraph::new(
            vec![step("a", "transform"), step("b", "transform")],
            vec![Link::new("a", "b"), Link::new("b", "a")],
        );

        let results = executor(registry.clone()).run(&workflow, None).await.unwrap();
        assert!(results.values().all(StepResult::is_success));

        let strict = WorkflowExecutor::new(
            Arc::new(registry),
            ExecutorConfig::default().with_cycle_policy(CyclePolicy::Reject),
        );
        assert!(matches!(
            strict.run(&workflow, None).await,
            Err(GraphError::Cycle { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_ids_rejected_before_scheduling() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = HandlerRegistry::new().with_handler("code", {
            let calls = calls.clone();
            handler_fn(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!(null)) }
            })
        });
        let workflow = WorkflowGraph::new(vec![step("a", "code"), step("a", "code")], vec![]);

        let result = executor(registry).run(&workflow, None).await;
        assert_eq!(result.err(), Some(GraphError::DuplicateStep(StepId::new("a"))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
