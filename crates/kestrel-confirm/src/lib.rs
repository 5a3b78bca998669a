//! # Kestrel Confirm
//!
//! Tracks injected operations until they are buried under enough blocks.
//!
//! - [`ConfirmationTracker`] - tick-driven state machine, no timers
//! - [`OperationHandle`] - what callers hold; waits inline or in the background
//! - [`ConfirmationWatch`] - background poller publishing state changes
//! - [`FailureListener`] - told once when tracking of a handle fails

pub mod handle;
pub mod tracker;

pub use handle::{ConfirmationWatch, FailureListener, OperationHandle};
pub use tracker::{ConfirmationState, ConfirmationTracker, FailureReason, TrackerSettings};
