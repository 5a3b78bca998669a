//! # Kestrel Emit
//!
//! Turns operation parameters into signed bytes accepted by a node.
//!
//! ## Stages
//!
//! 1. [`CounterResolver`] reads the branch and reserves counters, serialized
//!    per account through an [`AccountLock`].
//! 2. [`RevealInjector`] prepends a reveal for unrevealed accounts.
//! 3. [`OperationBuilder`] assembles and validates the envelope.
//! 4. [`Emitter`] forges, signs and injects it.
//!
//! [`Pipeline`] runs all of them for one call.

pub mod builder;
pub mod emitter;
pub mod lock;
pub mod pipeline;
pub mod resolver;
pub mod reveal;

pub use builder::{
    Built, DelegationParams, Draft, Michelson, OperationBuilder, OperationParams,
    OriginateParams, TransferParams,
};
pub use emitter::Emitter;
pub use lock::{AccountGuard, AccountLock, PerAccountLock, Unserialized};
pub use pipeline::{Injected, Pipeline};
pub use resolver::{CounterResolver, Resolution};
pub use reveal::RevealInjector;
