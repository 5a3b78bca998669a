//! Block and protocol reads.

use axum::{
    extract::{Path, State},
    Json,
};
use kestrel_chain::{BlockHeader, NodeRpc, ProtocolConstants};
use serde_json::{json, Value};

use super::{api_error, block_id, ApiError};
use crate::state::AppState;

/// Header of a block.
pub async fn get_header(
    State(state): State<AppState>,
    Path((_chain, block)): Path<(String, String)>,
) -> Result<Json<BlockHeader>, ApiError> {
    let block = state.node.block(block_id(&block)).await.map_err(api_error)?;
    Ok(Json(block.header))
}

/// A block with its operations, in the node's nesting (one validation pass).
pub async fn get_block(
    State(state): State<AppState>,
    Path((_chain, block)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let block = state.node.block(block_id(&block)).await.map_err(api_error)?;
    let operations: Vec<Value> = block
        .operation_hashes
        .iter()
        .map(|hash| json!({ "hash": hash }))
        .collect();
    Ok(Json(json!({
        "hash": block.header.hash,
        "header": {
            "level": block.header.level,
            "predecessor": block.header.predecessor,
            "timestamp": block.header.timestamp,
        },
        "operations": [operations],
    })))
}

/// Protocol constants.
pub async fn get_constants(
    State(state): State<AppState>,
    Path((_chain, _block)): Path<(String, String)>,
) -> Result<Json<ProtocolConstants>, ApiError> {
    let constants = state.node.constants().await.map_err(api_error)?;
    Ok(Json(constants))
}
