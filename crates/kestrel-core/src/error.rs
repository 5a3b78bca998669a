//! Error types for Kestrel.

use thiserror::Error;

/// Main error type for Kestrel operations.
#[derive(Error, Debug, Clone)]
pub enum KestrelError {
    /// Caller input is malformed. Raised before any network call.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The signer is unreachable, locked, or refused to sign.
    #[error("Signer error: {0}")]
    Signer(String),

    /// The envelope could not be forged to wire bytes.
    #[error("Forging failed: {0}")]
    Forge(String),

    /// The node rejected the signed operation.
    #[error("Injection rejected: {reason}")]
    InjectionRejected {
        reason: String,
        /// Error payload as returned by the node.
        errors: serde_json::Value,
    },

    /// The operation did not reach the required depth within the timeout:
    /// never seen in a block, or included and then the chain stalled.
    #[error("{}", timeout_message(.hash, .waited_ms, .included_at))]
    ConfirmationTimeout {
        hash: String,
        waited_ms: u64,
        included_at: Option<u64>,
    },

    /// The operation was included, then disappeared from the chain.
    #[error("Operation {hash} dropped after inclusion at level {level}")]
    OperationDropped { hash: String, level: u64 },

    /// Transport or node availability error.
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Resource not found on the node.
    #[error("Resource not found: {resource_type} {id}")]
    NotFound { resource_type: String, id: String },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The caller stopped waiting.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Internal error (should not happen).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KestrelError {
    /// Returns true if retrying the same read may succeed.
    ///
    /// Injection failures are never recoverable in this sense: resubmitting
    /// identical signed bytes is rejected again.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, KestrelError::Rpc(_))
    }

    /// Returns true if the caller should rebuild the operation with a fresh
    /// branch and counter before resubmitting.
    pub fn needs_rebuild(&self) -> bool {
        match self {
            KestrelError::InjectionRejected { reason, .. } => {
                let reason = reason.to_ascii_lowercase();
                reason.contains("counter") || reason.contains("branch")
            }
            KestrelError::OperationDropped { .. } => true,
            _ => false,
        }
    }

    /// Build an injection rejection from a node error payload.
    ///
    /// The reason is the `id` of the first error when the payload has the
    /// node's `[{"kind": ..., "id": ...}]` shape, otherwise the payload text.
    pub fn rejected(errors: serde_json::Value) -> Self {
        let reason = errors
            .as_array()
            .and_then(|errs| errs.first())
            .and_then(|err| err.get("id"))
            .and_then(|id| id.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| match &errors {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        KestrelError::InjectionRejected { reason, errors }
    }
}

fn timeout_message(hash: &str, waited_ms: &u64, included_at: &Option<u64>) -> String {
    match included_at {
        Some(level) => format!(
            "Operation {hash} included at level {level} but not confirmed after {waited_ms}ms"
        ),
        None => format!("Operation {hash} not included after {waited_ms}ms"),
    }
}

/// Convenience Result type for Kestrel operations.
pub type Result<T> = std::result::Result<T, KestrelError>;

impl From<serde_json::Error> for KestrelError {
    fn from(err: serde_json::Error) -> Self {
        KestrelError::Serialization(err.to_string())
    }
}
