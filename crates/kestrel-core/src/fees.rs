//! Default fee, gas and storage limits per operation kind.

use serde::{Deserialize, Serialize};

use crate::amount::Mutez;
use crate::types::OperationKind;

/// Fee and limits attached to a manager operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    pub fee: Mutez,
    pub gas_limit: u64,
    pub storage_limit: u64,
}

impl Limits {
    pub const fn new(fee: u64, gas_limit: u64, storage_limit: u64) -> Self {
        Self {
            fee: Mutez(fee),
            gas_limit,
            storage_limit,
        }
    }
}

/// Caller-supplied overrides. Unset fields fall back to the policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverrides {
    pub fee: Option<Mutez>,
    pub gas_limit: Option<u64>,
    pub storage_limit: Option<u64>,
}

impl LimitOverrides {
    pub fn fee(mut self, fee: impl Into<Mutez>) -> Self {
        self.fee = Some(fee.into());
        self
    }

    pub fn gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = Some(gas_limit);
        self
    }

    pub fn storage_limit(mut self, storage_limit: u64) -> Self {
        self.storage_limit = Some(storage_limit);
        self
    }
}

/// Per-kind default limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePolicy {
    pub reveal: Limits,
    pub transaction: Limits,
    pub origination: Limits,
    pub delegation: Limits,
    pub activation: Limits,
}

impl Default for FeePolicy {
    fn default() -> Self {
        Self {
            reveal: Limits::new(1269, 10_000, 0),
            transaction: Limits::new(1420, 10_600, 300),
            origination: Limits::new(1400, 10_600, 257),
            delegation: Limits::new(1420, 10_600, 0),
            activation: Limits::new(0, 0, 0),
        }
    }
}

impl FeePolicy {
    /// Default limits for `kind`.
    pub fn defaults(&self, kind: OperationKind) -> Limits {
        match kind {
            OperationKind::Reveal => self.reveal,
            OperationKind::Transaction => self.transaction,
            OperationKind::Origination => self.origination,
            OperationKind::Delegation => self.delegation,
            OperationKind::Activation => self.activation,
        }
    }

    /// Defaults for `kind` with any overridden field replaced.
    pub fn limits(&self, kind: OperationKind, overrides: &LimitOverrides) -> Limits {
        let defaults = self.defaults(kind);
        Limits {
            fee: overrides.fee.unwrap_or(defaults.fee),
            gas_limit: overrides.gas_limit.unwrap_or(defaults.gas_limit),
            storage_limit: overrides.storage_limit.unwrap_or(defaults.storage_limit),
        }
    }
}
