//! Operation content records and the envelope they are emitted in.
//!
//! The JSON shape matches what the node accepts for `run_operation` and what
//! the codec forges: content records are tagged by `kind`, integers are
//! decimal strings.

use serde::{Deserialize, Serialize};

use crate::amount::Mutez;
use crate::error::{KestrelError, Result};
use crate::fees::Limits;
use crate::types::{u64_string, Address, BlockHash, OperationHash, OperationKind};

/// Publishes the source's public key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reveal {
    pub source: Address,
    pub fee: Mutez,
    #[serde(with = "u64_string")]
    pub counter: u64,
    #[serde(with = "u64_string")]
    pub gas_limit: u64,
    #[serde(with = "u64_string")]
    pub storage_limit: u64,
    pub public_key: String,
}

/// Transfers `amount` to `destination`, optionally calling it with `parameters`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub source: Address,
    pub fee: Mutez,
    #[serde(with = "u64_string")]
    pub counter: u64,
    #[serde(with = "u64_string")]
    pub gas_limit: u64,
    #[serde(with = "u64_string")]
    pub storage_limit: u64,
    pub amount: Mutez,
    pub destination: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

/// Code and initial storage of an originated contract, in wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractScript {
    pub code: serde_json::Value,
    pub storage: serde_json::Value,
}

/// Originates a new contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Origination {
    pub source: Address,
    pub fee: Mutez,
    #[serde(with = "u64_string")]
    pub counter: u64,
    #[serde(with = "u64_string")]
    pub gas_limit: u64,
    #[serde(with = "u64_string")]
    pub storage_limit: u64,
    pub manager_pubkey: Address,
    pub balance: Mutez,
    pub spendable: bool,
    pub delegatable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate: Option<Address>,
    pub script: ContractScript,
}

/// Sets or withdraws the source's delegate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delegation {
    pub source: Address,
    pub fee: Mutez,
    #[serde(with = "u64_string")]
    pub counter: u64,
    #[serde(with = "u64_string")]
    pub gas_limit: u64,
    #[serde(with = "u64_string")]
    pub storage_limit: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegate: Option<Address>,
}

/// Activates a fundraiser account. Carries no counter or fee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activation {
    pub pkh: Address,
    pub secret: String,
}

/// One content record of an operation envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationContent {
    Reveal(Reveal),
    Transaction(Transaction),
    Origination(Origination),
    Delegation(Delegation),
    #[serde(rename = "activate_account")]
    Activation(Activation),
}

impl OperationContent {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationContent::Reveal(_) => OperationKind::Reveal,
            OperationContent::Transaction(_) => OperationKind::Transaction,
            OperationContent::Origination(_) => OperationKind::Origination,
            OperationContent::Delegation(_) => OperationKind::Delegation,
            OperationContent::Activation(_) => OperationKind::Activation,
        }
    }

    /// Counter of a manager operation, `None` for activations.
    pub fn counter(&self) -> Option<u64> {
        match self {
            OperationContent::Reveal(op) => Some(op.counter),
            OperationContent::Transaction(op) => Some(op.counter),
            OperationContent::Origination(op) => Some(op.counter),
            OperationContent::Delegation(op) => Some(op.counter),
            OperationContent::Activation(_) => None,
        }
    }

    /// Assign the counter of a manager operation. No-op for activations.
    pub fn set_counter(&mut self, counter: u64) {
        match self {
            OperationContent::Reveal(op) => op.counter = counter,
            OperationContent::Transaction(op) => op.counter = counter,
            OperationContent::Origination(op) => op.counter = counter,
            OperationContent::Delegation(op) => op.counter = counter,
            OperationContent::Activation(_) => {}
        }
    }

    /// The account the operation is emitted from.
    pub fn source(&self) -> &str {
        match self {
            OperationContent::Reveal(op) => &op.source,
            OperationContent::Transaction(op) => &op.source,
            OperationContent::Origination(op) => &op.source,
            OperationContent::Delegation(op) => &op.source,
            OperationContent::Activation(op) => &op.pkh,
        }
    }

    /// Fee and limits, `None` for activations.
    pub fn limits(&self) -> Option<Limits> {
        let (fee, gas_limit, storage_limit) = match self {
            OperationContent::Reveal(op) => (op.fee, op.gas_limit, op.storage_limit),
            OperationContent::Transaction(op) => (op.fee, op.gas_limit, op.storage_limit),
            OperationContent::Origination(op) => (op.fee, op.gas_limit, op.storage_limit),
            OperationContent::Delegation(op) => (op.fee, op.gas_limit, op.storage_limit),
            OperationContent::Activation(_) => return None,
        };
        Some(Limits {
            fee,
            gas_limit,
            storage_limit,
        })
    }

    pub fn is_reveal(&self) -> bool {
        matches!(self, OperationContent::Reveal(_))
    }
}

/// Ordered contents bound to a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationEnvelope {
    pub branch: BlockHash,
    pub contents: Vec<OperationContent>,
}

impl OperationEnvelope {
    pub fn new(branch: impl Into<BlockHash>, contents: Vec<OperationContent>) -> Self {
        Self {
            branch: branch.into(),
            contents,
        }
    }

    /// Source of the first content record.
    pub fn source(&self) -> Option<&str> {
        self.contents.first().map(OperationContent::source)
    }

    /// Counters of manager contents, in envelope order.
    pub fn counters(&self) -> Vec<u64> {
        self.contents.iter().filter_map(OperationContent::counter).collect()
    }

    /// Check ordering invariants: non-empty, a single source, at most one
    /// reveal and only in first position, and manager counters contiguous and
    /// strictly increasing.
    pub fn validate(&self) -> Result<()> {
        if self.branch.is_empty() {
            return Err(KestrelError::Validation("envelope has no branch".to_string()));
        }
        let source = self
            .source()
            .ok_or_else(|| KestrelError::Validation("envelope has no contents".to_string()))?;

        if self.contents.iter().any(|c| c.source() != source) {
            return Err(KestrelError::Validation(
                "envelope contents have different sources".to_string(),
            ));
        }

        let reveals = self.contents.iter().filter(|c| c.is_reveal()).count();
        if reveals > 1 || (reveals == 1 && !self.contents[0].is_reveal()) {
            return Err(KestrelError::Validation(
                "reveal must appear once, before all other contents".to_string(),
            ));
        }

        let counters = self.counters();
        if counters.windows(2).any(|w| w[0].checked_add(1) != Some(w[1])) {
            return Err(KestrelError::Validation(format!(
                "counters are not contiguous: {counters:?}"
            )));
        }

        Ok(())
    }
}

/// A forged and signed envelope, ready for injection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedOperation {
    pub bytes: Vec<u8>,
    pub signature: Vec<u8>,
    pub op_hash: OperationHash,
}

impl SignedOperation {
    /// Signed bytes as the node expects them for injection.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes.len() + self.signature.len());
        out.extend_from_slice(&self.bytes);
        out.extend_from_slice(&self.signature);
        out
    }
}
