//! HTTP handlers, grouped by RPC area.

pub mod admin;
pub mod blocks;
pub mod contracts;
pub mod health;
pub mod injection;

use axum::http::StatusCode;
use kestrel_chain::BlockId;
use kestrel_core::KestrelError;
use serde_json::json;

/// Error response for handlers.
pub type ApiError = (StatusCode, String);

/// Map a chain error to a status and body. Node errors keep their JSON array
/// payload so clients can read the error ids.
pub fn api_error(error: KestrelError) -> ApiError {
    match error {
        KestrelError::InjectionRejected { errors, .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, errors.to_string())
        }
        KestrelError::NotFound { .. } => (StatusCode::NOT_FOUND, error.to_string()),
        KestrelError::Validation(msg) => {
            let body = json!([{ "kind": "permanent", "id": "invalid_argument", "msg": msg }]);
            (StatusCode::BAD_REQUEST, body.to_string())
        }
        KestrelError::Rpc(_) => (StatusCode::SERVICE_UNAVAILABLE, error.to_string()),
        other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

/// Parse a block path segment: `head`, a level, or a block hash.
pub fn block_id(segment: &str) -> BlockId {
    match segment {
        "head" => BlockId::Head,
        _ => segment
            .parse()
            .map(BlockId::Level)
            .unwrap_or_else(|_| BlockId::Hash(segment.to_string())),
    }
}
