//! Flow definition API handlers.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::error::AppError;
use crate::flow::Flow;
use crate::state::AppState;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlowQuery {
    pub tenant_id: Option<String>,
    pub revision: Option<i32>,
}

/// List the latest revision of every flow.
///
/// GET /api/flows
pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Flow>>, AppError> {
    let flows = state.flows.find_all()?;
    Ok(Json(flows.iter().map(|flow| flow.as_ref().clone()).collect()))
}

/// Store a YAML flow definition. An unchanged definition keeps its revision.
///
/// POST /api/flows
pub async fn create(
    State(state): State<AppState>,
    body: String,
) -> Result<(StatusCode, Json<Flow>), AppError> {
    if body.trim().is_empty() {
        return Err(AppError::BadRequest("Empty flow definition".to_string()));
    }
    let flow = state.flows.create_from_yaml(&body)?;
    Ok((StatusCode::CREATED, Json(flow.as_ref().clone())))
}

/// Get a flow revision, the latest by default.
///
/// GET /api/flows/{namespace}/{flow_id}
pub async fn get(
    State(state): State<AppState>,
    Path((namespace, flow_id)): Path<(String, String)>,
    Query(query): Query<FlowQuery>,
) -> Result<Json<Flow>, AppError> {
    let flow = state.flows.find(
        query.tenant_id.as_deref(),
        &namespace,
        &flow_id,
        query.revision,
    )?;
    Ok(Json(flow.as_ref().clone()))
}
