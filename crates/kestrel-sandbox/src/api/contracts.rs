//! Contract and account context reads.
//!
//! The sandbox keeps no historical context, so every block selector reads
//! the state at the head.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use kestrel_chain::NodeRpc;
use kestrel_core::{ContractScript, Mutez};
use serde::Deserialize;
use serde_json::Value;

use super::{api_error, ApiError};
use crate::state::AppState;

type ContractPath = Path<(String, String, String)>;

/// Request body for big map lookups.
#[derive(Debug, Deserialize)]
pub struct BigMapGetRequest {
    pub key: Value,
    #[serde(rename = "type")]
    pub key_type: Value,
}

/// Counter of an implicit account, as a decimal string.
pub async fn get_counter(
    State(state): State<AppState>,
    Path((_chain, _block, address)): ContractPath,
) -> Result<Json<String>, ApiError> {
    let counter = state.node.counter(&address).await.map_err(api_error)?;
    Ok(Json(counter.to_string()))
}

/// Revealed key, or `null`.
pub async fn get_manager_key(
    State(state): State<AppState>,
    Path((_chain, _block, address)): ContractPath,
) -> Result<Json<Option<String>>, ApiError> {
    let key = state.node.manager_key(&address).await.map_err(api_error)?;
    Ok(Json(key))
}

/// Balance of an account or contract.
pub async fn get_balance(
    State(state): State<AppState>,
    Path((_chain, _block, address)): ContractPath,
) -> Result<Json<Mutez>, ApiError> {
    let account = state.node.account(&address).await.ok_or_else(|| {
        (StatusCode::NOT_FOUND, format!("Account {} not found", address))
    })?;
    Ok(Json(account.balance))
}

pub async fn get_script(
    State(state): State<AppState>,
    Path((_chain, _block, address)): ContractPath,
) -> Result<Json<ContractScript>, ApiError> {
    let script = state.node.script(&address).await.map_err(api_error)?;
    Ok(Json(script))
}

pub async fn get_storage(
    State(state): State<AppState>,
    Path((_chain, _block, address)): ContractPath,
) -> Result<Json<Value>, ApiError> {
    let storage = state.node.storage(&address).await.map_err(api_error)?;
    Ok(Json(storage))
}

/// Value under an encoded key. Absent keys are 404, as on a node.
pub async fn big_map_get(
    State(state): State<AppState>,
    Path((_chain, _block, address)): ContractPath,
    Json(req): Json<BigMapGetRequest>,
) -> Result<Json<Value>, ApiError> {
    let value = state
        .node
        .big_map_get(&address, &req.key, &req.key_type)
        .await
        .map_err(api_error)?;
    value
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("No value for key {}", req.key)))
}
