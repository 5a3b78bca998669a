//! Sandbox-only controls: funding, baking, reorgs.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use kestrel_chain::{AccountInfo, BlockHeader};
use kestrel_core::Mutez;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{api_error, ApiError};
use crate::state::AppState;

/// Request to bake blocks.
#[derive(Debug, Default, Deserialize)]
pub struct BakeRequest {
    /// Number of blocks, at least one.
    #[serde(default)]
    pub count: Option<u64>,
}

/// Request to credit an account.
#[derive(Debug, Deserialize)]
pub struct FundRequest {
    pub address: String,
    /// Tez decimal text.
    pub amount: String,
}

#[derive(Debug, Deserialize)]
pub struct ReorgRequest {
    pub level: u64,
}

#[derive(Debug, Serialize)]
pub struct MempoolResponse {
    pub pending: usize,
}

/// Bake one or more blocks.
pub async fn bake(
    State(state): State<AppState>,
    body: Option<Json<BakeRequest>>,
) -> Json<BlockHeader> {
    let count = body.and_then(|Json(req)| req.count).unwrap_or(1).max(1);
    Json(state.node.bake_n(count).await)
}

/// Credit tez to an implicit account.
pub async fn fund(
    State(state): State<AppState>,
    Json(req): Json<FundRequest>,
) -> Result<Json<AccountInfo>, ApiError> {
    let amount = Mutez::from_tez(&req.amount).map_err(api_error)?;
    state.node.fund(&req.address, amount).await.map_err(api_error)?;
    info!(address = %req.address, %amount, "funded account");
    let account = state.node.account(&req.address).await.ok_or_else(|| {
        (StatusCode::INTERNAL_SERVER_ERROR, "funded account vanished".to_string())
    })?;
    Ok(Json(account))
}

/// Replace blocks from a level with empty ones.
pub async fn reorg(
    State(state): State<AppState>,
    Json(req): Json<ReorgRequest>,
) -> Result<Json<BlockHeader>, ApiError> {
    let header = state.node.reorg(req.level).await.map_err(api_error)?;
    Ok(Json(header))
}

pub async fn get_account(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<AccountInfo>, ApiError> {
    state
        .node
        .account(&address)
        .await
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Account {} not found", address)))
}

pub async fn get_mempool(State(state): State<AppState>) -> Json<MempoolResponse> {
    Json(MempoolResponse {
        pending: state.node.mempool_len().await,
    })
}
