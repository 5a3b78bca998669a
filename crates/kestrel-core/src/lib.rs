//! # Kestrel Core
//!
//! Core types for emitting operations to a Tezos-style node.
//!
//! This crate provides the fundamental building blocks:
//! - [`OperationContent`] / [`OperationEnvelope`] - what gets forged and signed
//! - [`Mutez`] - lossless tez amounts
//! - [`FeePolicy`] - default fee and limits per operation kind
//! - [`KestrelError`] - error taxonomy shared by every crate

pub mod amount;
pub mod config;
pub mod error;
pub mod fees;
pub mod operation;
pub mod types;

// Re-exports for convenience
pub use amount::{Mutez, MUTEZ_PER_TEZ};
pub use config::ClientConfig;
pub use error::{KestrelError, Result};
pub use fees::{FeePolicy, LimitOverrides, Limits};
pub use operation::{
    Activation, ContractScript, Delegation, OperationContent, OperationEnvelope, Origination,
    Reveal, SignedOperation, Transaction,
};
pub use types::*;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::amount::Mutez;
    pub use crate::config::ClientConfig;
    pub use crate::error::{KestrelError, Result};
    pub use crate::fees::{FeePolicy, LimitOverrides, Limits};
    pub use crate::operation::{OperationContent, OperationEnvelope, SignedOperation};
    pub use crate::types::{Address, BlockHash, OperationHash, OperationKind};
}
