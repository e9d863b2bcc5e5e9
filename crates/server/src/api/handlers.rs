use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use taskloom_core::{Run, RunError, RunId, RunOptions, StepId, WorkflowGraph};
use taskloom_tools::{ToolProvider, ToolSchema};

fn parse_run_id(raw: &str) -> ApiResult<RunId> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid run ID: {}", raw)))
}

/// Registered step type tags
pub async fn list_step_kinds(State(state): State<Arc<AppState>>) -> Json<StepKindsResponse> {
    let kinds = state
        .runs
        .executor()
        .registry()
        .kinds()
        .into_iter()
        .map(String::from)
        .collect();
    Json(StepKindsResponse { kinds })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StepKindsResponse {
    pub kinds: Vec<String>,
}

/// Capabilities of the connected tools
pub async fn list_tools(State(state): State<Arc<AppState>>) -> Json<ToolsResponse> {
    Json(ToolsResponse {
        tools: state.tools.list_capabilities(),
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolsResponse {
    pub tools: Vec<ToolSchema>,
}

/// Submit a graph for background execution
pub async fn submit_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitRunRequest>,
) -> ApiResult<(StatusCode, Json<SubmitRunResponse>)> {
    let run_id = state.runs.submit(req.graph, req.options).await?;
    Ok((StatusCode::ACCEPTED, Json(SubmitRunResponse { run_id })))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitRunRequest {
    pub graph: WorkflowGraph,
    #[serde(default)]
    pub options: RunOptions,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitRunResponse {
    pub run_id: RunId,
}

/// Validate and level a graph without running it
pub async fn plan_run(
    State(state): State<Arc<AppState>>,
    Json(graph): Json<WorkflowGraph>,
) -> ApiResult<Json<PlanResponse>> {
    let prepared = state.runs.executor().prepare(&graph)?;
    Ok(Json(PlanResponse {
        entry_steps: prepared.entry_steps(),
        levels: prepared.levels().to_vec(),
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PlanResponse {
    pub entry_steps: Vec<StepId>,
    pub levels: Vec<Vec<StepId>>,
}

/// List all runs
pub async fn list_runs(State(state): State<Arc<AppState>>) -> Json<ListRunsResponse> {
    Json(ListRunsResponse {
        runs: state.runs.list().await,
    })
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListRunsResponse {
    pub runs: Vec<Run>,
}

/// Get a specific run
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<Run>> {
    let run_id = parse_run_id(&run_id)?;
    let run = state
        .runs
        .get(run_id)
        .await
        .ok_or(RunError::NotFound(run_id))?;
    Ok(Json(run))
}

/// Drop a finished run and return its final state
pub async fn delete_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<Run>> {
    let run_id = parse_run_id(&run_id)?;
    let run = state.runs.forget(run_id).await?;
    Ok(Json(run))
}

/// Request cancellation of an active run
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> ApiResult<(StatusCode, Json<CancelRunResponse>)> {
    let run_id = parse_run_id(&run_id)?;
    state.runs.cancel(run_id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CancelRunResponse {
            run_id,
            message: "Cancellation requested".to_string(),
        }),
    ))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelRunResponse {
    pub run_id: RunId,
    pub message: String,
}
