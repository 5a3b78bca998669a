//! Injection and dry runs.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use kestrel_chain::NodeRpc;
use kestrel_core::{OperationContent, OperationEnvelope, OperationHash};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::{api_error, ApiError};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct InjectionQuery {
    pub chain: Option<String>,
}

/// Operation as submitted to `run_operation`.
#[derive(Debug, Deserialize)]
pub struct RunOperation {
    pub branch: String,
    pub contents: Vec<OperationContent>,
    pub signature: String,
}

#[derive(Debug, Deserialize)]
pub struct RunOperationRequest {
    pub operation: RunOperation,
}

/// Inject hex-encoded signed bytes. The body is a JSON string.
pub async fn inject_operation(
    State(state): State<AppState>,
    Query(query): Query<InjectionQuery>,
    Json(signed_hex): Json<String>,
) -> Result<Json<OperationHash>, ApiError> {
    let hash = state.node.inject(&signed_hex).await.map_err(api_error)?;
    info!(%hash, chain = query.chain.as_deref().unwrap_or("main"), "injected");
    Ok(Json(hash))
}

/// Check an operation against the head without injecting it.
pub async fn run_operation(
    State(state): State<AppState>,
    Path((_chain, _block)): Path<(String, String)>,
    Json(req): Json<RunOperationRequest>,
) -> Result<Json<Value>, ApiError> {
    let envelope = OperationEnvelope::new(req.operation.branch, req.operation.contents);
    let result = state
        .node
        .run_operation(&envelope, &req.operation.signature)
        .await
        .map_err(api_error)?;
    Ok(Json(result))
}
