//! # Kestrel SDK
//!
//! Emit operations to a node and track them to confirmation.
//!
//! ```no_run
//! use std::sync::Arc;
//! use kestrel_sdk::prelude::*;
//!
//! # async fn run() -> Result<()> {
//! let signer = Arc::new(Ed25519Signer::generate());
//! let client = Client::connect(ClientConfig::new("http://127.0.0.1:8732"), signer).await?;
//! let handle = client.transfer(&TransferParams::new("tz1...", "1.5")).await?;
//! handle.confirmation(1).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod contract;
pub mod http;

pub use client::Client;
pub use contract::Contract;
pub use http::RpcClient;

/// Prelude module for common imports.
pub mod prelude {
    pub use crate::client::Client;
    pub use crate::contract::Contract;
    pub use crate::http::RpcClient;
    pub use kestrel_chain::{Ed25519Signer, NodeRpc, Signer};
    pub use kestrel_confirm::{ConfirmationState, FailureReason, OperationHandle};
    pub use kestrel_core::prelude::*;
    pub use kestrel_emit::{
        DelegationParams, Michelson, OperationParams, OriginateParams, TransferParams,
    };
}
