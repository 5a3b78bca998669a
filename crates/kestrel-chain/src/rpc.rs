//! Node RPC interface.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kestrel_core::{
    Address, BlockHash, ContractScript, Mutez, OperationEnvelope, OperationHash, Result,
};
use serde::{Deserialize, Serialize};

/// Header of a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub hash: BlockHash,
    pub level: u64,
    pub predecessor: BlockHash,
    pub timestamp: DateTime<Utc>,
}

/// A block reduced to what inclusion search needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub operation_hashes: Vec<OperationHash>,
}

impl Block {
    pub fn hash(&self) -> &str {
        &self.header.hash
    }

    pub fn level(&self) -> u64 {
        self.header.level
    }

    pub fn contains(&self, operation: &str) -> bool {
        self.operation_hashes.iter().any(|h| h == operation)
    }
}

/// Block selector for lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockId {
    Head,
    Level(u64),
    Hash(BlockHash),
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockId::Head => f.write_str("head"),
            BlockId::Level(level) => write!(f, "{level}"),
            BlockId::Hash(hash) => f.write_str(hash),
        }
    }
}

/// Protocol constants the client cares about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConstants {
    #[serde(with = "kestrel_core::u64_string")]
    pub hard_gas_limit_per_operation: u64,
    #[serde(with = "kestrel_core::u64_string")]
    pub hard_storage_limit_per_operation: u64,
    pub cost_per_byte: Mutez,
    pub time_between_blocks: Vec<String>,
}

/// Levels a branch stays valid for. An operation whose branch is older than
/// this can no longer be included.
pub const MAX_BRANCH_AGE: u64 = 60;

/// Chain reads and writes against a node.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// Header of the current head. Its hash is the branch for new envelopes.
    async fn head(&self) -> Result<BlockHeader>;

    /// Look up a block by level or hash.
    async fn block(&self, id: BlockId) -> Result<Block>;

    /// Current on-chain counter of `address`.
    async fn counter(&self, address: &str) -> Result<u64>;

    /// Revealed public key of `address`, `None` when unrevealed.
    async fn manager_key(&self, address: &str) -> Result<Option<String>>;

    /// Code and current storage of a contract.
    async fn script(&self, address: &str) -> Result<ContractScript>;

    /// Current storage of a contract.
    async fn storage(&self, address: &str) -> Result<serde_json::Value>;

    /// Value stored under `key` in the contract's big map, `None` if absent.
    async fn big_map_get(
        &self,
        address: &str,
        key: &serde_json::Value,
        key_type: &serde_json::Value,
    ) -> Result<Option<serde_json::Value>>;

    async fn constants(&self) -> Result<ProtocolConstants>;

    /// Inject hex-encoded signed bytes, returning the operation hash.
    async fn inject(&self, signed_hex: &str) -> Result<OperationHash>;

    /// Simulate an envelope without injecting it.
    async fn run_operation(
        &self,
        envelope: &OperationEnvelope,
        signature: &str,
    ) -> Result<serde_json::Value>;
}

/// Balance-bearing account view, as exposed by the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub address: Address,
    pub balance: Mutez,
    #[serde(with = "kestrel_core::u64_string")]
    pub counter: u64,
    pub manager_key: Option<String>,
    pub delegate: Option<Address>,
}
