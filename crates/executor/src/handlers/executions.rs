//! Execution API handlers.
//!
//! Submission, lookup and the mutation operations: restart, replay, state
//! override, kill, pause, resume, unqueue, labels, delete and purge, plus
//! their by-ids bulk forms. Workers report task run outcomes through the
//! task run endpoint.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::db::ExecutionFilter;
use crate::engine::{Execution, Label, StateType, TaskRunUpdate};
use crate::error::{AppError, AppResult};
use crate::queue::next_within;
use crate::services::{BulkOperation, BulkOutcome, Submission};
use crate::state::AppState;

/// Body of a submission.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub tenant_id: Option<String>,

    #[serde(default)]
    pub inputs: Map<String, Value>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitQuery {
    /// Wait up to this many seconds for a final state.
    pub wait_secs: Option<u64>,
}

/// Query parameters for listing executions.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListExecutionsQuery {
    pub namespace: Option<String>,
    pub flow_id: Option<String>,
    /// Comma separated state types
    pub state: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RevisionQuery {
    pub revision: Option<i32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplayQuery {
    pub task_run_id: Option<String>,
    pub revision: Option<i32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeStateRequest {
    pub task_run_id: String,
    pub state: StateType,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KillQuery {
    pub state: Option<StateType>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResumeRequest {
    /// RUNNING unless given
    #[serde(default)]
    pub state: Option<StateType>,

    #[serde(default)]
    pub payload: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UnqueueQuery {
    /// RUNNING unless given
    pub state: Option<StateType>,
}

/// Execution ids of a bulk operation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BulkRequest {
    pub ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PurgeRequest {
    pub namespace: Option<String>,
    pub flow_id: Option<String>,
    pub end_before: Option<DateTime<Utc>>,
    pub states: Option<Vec<StateType>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub purged: usize,
}

/// Worker report about one task run.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskRunReport {
    #[serde(default)]
    pub attempt: Option<usize>,
    pub state: StateType,
    #[serde(default)]
    pub outputs: Option<Map<String, Value>>,
}

fn parse_states(raw: &str) -> AppResult<Vec<StateType>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<StateType>())
        .collect()
}

/// Submit an execution of the latest flow revision.
///
/// POST /api/flows/{namespace}/{flow_id}/executions
pub async fn submit(
    State(state): State<AppState>,
    Path((namespace, flow_id)): Path<(String, String)>,
    Query(query): Query<SubmitQuery>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<Execution>), AppError> {
    let execution_id = Uuid::new_v4().to_string();
    let submission = Submission {
        execution_id: Some(execution_id.clone()),
        tenant_id: request.tenant_id,
        namespace,
        flow_id,
        inputs: request.inputs,
        labels: request
            .labels
            .into_iter()
            .map(|(key, value)| Label::new(key, value))
            .collect(),
        trigger: None,
    };

    let Some(wait_secs) = query.wait_secs else {
        let execution = state.executor.submit(submission).await?;
        return Ok((StatusCode::CREATED, Json(execution)));
    };

    // subscribe before submitting so the final state cannot be missed
    let id = execution_id.clone();
    let mut terminal = state
        .execution_queue
        .subscribe(Box::new(move |e: &Execution| e.id == id && e.is_terminal()))
        .await?;

    let execution = state.executor.submit(submission).await?;
    if execution.is_terminal() {
        return Ok((StatusCode::OK, Json(execution)));
    }

    match next_within(&mut terminal, Duration::from_secs(wait_secs)).await {
        Ok(done) => Ok((StatusCode::OK, Json(done))),
        Err(_) => {
            // still running: report the latest stored state
            let latest = state.executions.get(&execution_id).await?;
            Ok((StatusCode::ACCEPTED, Json(latest)))
        }
    }
}

/// List executions.
///
/// GET /api/executions
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListExecutionsQuery>,
) -> Result<Json<Vec<Execution>>, AppError> {
    let filter = ExecutionFilter {
        namespace: query.namespace,
        flow_id: query.flow_id,
        states: query.state.as_deref().map(parse_states).transpose()?,
        limit: query.limit,
        ..Default::default()
    };
    Ok(Json(state.executions.list(&filter).await?))
}

/// Get an execution.
///
/// GET /api/executions/{execution_id}
pub async fn get(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Result<Json<Execution>, AppError> {
    Ok(Json(state.executions.get(&execution_id).await?))
}

/// Soft delete a terminated execution.
///
/// DELETE /api/executions/{execution_id}
pub async fn delete(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.executions.delete(&execution_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Restart a terminated execution in place.
///
/// POST /api/executions/{execution_id}/restart
pub async fn restart(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
    Query(query): Query<RevisionQuery>,
) -> Result<Json<Execution>, AppError> {
    let execution = state
        .executions
        .restart_by_id(&execution_id, query.revision)
        .await?;
    Ok(Json(execution))
}

/// Replay a terminated execution into a new one.
///
/// POST /api/executions/{execution_id}/replay
pub async fn replay(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
    Query(query): Query<ReplayQuery>,
) -> Result<(StatusCode, Json<Execution>), AppError> {
    let execution = state
        .executions
        .replay_by_id(&execution_id, query.task_run_id.as_deref(), query.revision)
        .await?;
    Ok((StatusCode::CREATED, Json(execution)))
}

/// Force the state of one task run.
///
/// POST /api/executions/{execution_id}/state
pub async fn change_state(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
    Json(request): Json<ChangeStateRequest>,
) -> Result<Json<Execution>, AppError> {
    let execution = state
        .executions
        .mark_as_by_id(&execution_id, &request.task_run_id, request.state)
        .await?;
    Ok(Json(execution))
}

/// Kill an execution.
///
/// POST /api/executions/{execution_id}/kill
pub async fn kill(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
    Query(query): Query<KillQuery>,
) -> Result<Json<Execution>, AppError> {
    let execution = state
        .executions
        .kill_by_id(&execution_id, query.state)
        .await?;
    Ok(Json(execution))
}

/// Resume a paused execution.
///
/// POST /api/executions/{execution_id}/resume
pub async fn resume(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
    Json(request): Json<ResumeRequest>,
) -> Result<Json<Execution>, AppError> {
    let execution = state
        .executions
        .resume_by_id(
            &execution_id,
            request.state.unwrap_or(StateType::Running),
            request.payload,
        )
        .await?;
    Ok(Json(execution))
}

/// Pause a running execution.
///
/// POST /api/executions/{execution_id}/pause
pub async fn pause(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
) -> Result<Json<Execution>, AppError> {
    Ok(Json(state.executions.pause_by_id(&execution_id).await?))
}

/// Take a queued execution out of the queue, to RUNNING or a final state.
///
/// POST /api/executions/{execution_id}/unqueue
pub async fn unqueue(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
    Query(query): Query<UnqueueQuery>,
) -> Result<Json<Execution>, AppError> {
    let execution = state
        .executions
        .unqueue_by_id(&execution_id, query.state)
        .await?;
    Ok(Json(execution))
}

/// Replace the user labels of a terminated execution.
///
/// POST /api/executions/{execution_id}/labels
pub async fn set_labels(
    State(state): State<AppState>,
    Path(execution_id): Path<String>,
    Json(labels): Json<BTreeMap<String, String>>,
) -> Result<Json<Execution>, AppError> {
    let labels = labels
        .into_iter()
        .map(|(key, value)| Label::new(key, value))
        .collect();
    let execution = state
        .executions
        .set_labels_by_id(&execution_id, labels)
        .await?;
    Ok(Json(execution))
}

async fn bulk(
    state: &AppState,
    request: BulkRequest,
    operation: BulkOperation,
) -> AppResult<Json<BulkOutcome>> {
    if request.ids.is_empty() {
        return Err(AppError::BadRequest("No execution ids given".to_string()));
    }
    Ok(Json(state.executions.bulk(&request.ids, operation).await))
}

/// POST /api/executions/restart/by-ids
pub async fn restart_by_ids(
    State(state): State<AppState>,
    Json(request): Json<BulkRequest>,
) -> Result<Json<BulkOutcome>, AppError> {
    bulk(&state, request, BulkOperation::Restart).await
}

/// POST /api/executions/replay/by-ids
pub async fn replay_by_ids(
    State(state): State<AppState>,
    Json(request): Json<BulkRequest>,
) -> Result<Json<BulkOutcome>, AppError> {
    bulk(&state, request, BulkOperation::Replay).await
}

/// POST /api/executions/kill/by-ids
pub async fn kill_by_ids(
    State(state): State<AppState>,
    Json(request): Json<BulkRequest>,
) -> Result<Json<BulkOutcome>, AppError> {
    bulk(&state, request, BulkOperation::Kill).await
}

/// POST /api/executions/resume/by-ids
pub async fn resume_by_ids(
    State(state): State<AppState>,
    Json(request): Json<BulkRequest>,
) -> Result<Json<BulkOutcome>, AppError> {
    bulk(&state, request, BulkOperation::Resume).await
}

/// Hard delete terminated executions.
///
/// POST /api/executions/purge
pub async fn purge(
    State(state): State<AppState>,
    Json(request): Json<PurgeRequest>,
) -> Result<Json<PurgeResponse>, AppError> {
    let filter = ExecutionFilter {
        namespace: request.namespace,
        flow_id: request.flow_id,
        states: request.states,
        end_before: request.end_before,
        ..Default::default()
    };
    let purged = state.executions.purge(&filter).await?;
    Ok(Json(PurgeResponse { purged }))
}

/// Worker report about a task run.
///
/// POST /api/executions/{execution_id}/taskruns/{task_run_id}
pub async fn report_task_run(
    State(state): State<AppState>,
    Path((execution_id, task_run_id)): Path<(String, String)>,
    Json(report): Json<TaskRunReport>,
) -> Result<Json<Execution>, AppError> {
    let update = TaskRunUpdate {
        task_run_id,
        attempt: report.attempt,
        state: report.state,
        outputs: report.outputs,
    };
    Ok(Json(state.executor.report(&execution_id, update).await?))
}
