//! Application state.

use chrono::{DateTime, Utc};
use kestrel_chain::InMemoryNode;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// The chain served by this sandbox.
    pub node: InMemoryNode,

    /// When the sandbox started.
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(node: InMemoryNode) -> Self {
        Self {
            node,
            started_at: Utc::now(),
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(InMemoryNode::new())
    }
}
