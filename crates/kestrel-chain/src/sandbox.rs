//! In-memory chain implementing [`NodeRpc`].
//!
//! The sandbox keeps accounts, contracts, a mempool and a block list. It
//! validates injected operations the way a node would for the parts the
//! client depends on (branch age, counters, reveal, signature, balance) and
//! includes pending operations when a block is baked. Contract code is stored
//! but never executed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use kestrel_core::{
    Address, BlockHash, ContractScript, KestrelError, Mutez, OperationContent,
    OperationEnvelope, OperationHash, Result,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::codec::{Codec, JsonCodec};
use crate::rpc::{AccountInfo, Block, BlockHeader, BlockId, NodeRpc, ProtocolConstants};
use crate::signer::{
    public_key_hash_of, verify_signature, ED25519_SIGNATURE_LEN, GENERIC_OPERATION_WATERMARK,
};

/// Amount credited to an activated account.
pub const ACTIVATION_AMOUNT: Mutez = Mutez(1_000_000_000);

pub use crate::rpc::MAX_BRANCH_AGE;

#[derive(Debug, Clone, Default)]
struct Account {
    balance: Mutez,
    counter: u64,
    manager_key: Option<String>,
    delegate: Option<Address>,
}

#[derive(Debug, Clone)]
struct Contract {
    script: ContractScript,
    balance: Mutez,
    big_map: HashMap<String, Value>,
}

#[derive(Debug, Clone)]
struct Pending {
    hash: OperationHash,
    envelope: OperationEnvelope,
}

#[derive(Debug)]
struct ChainState {
    blocks: Vec<Block>,
    accounts: HashMap<Address, Account>,
    contracts: HashMap<Address, Contract>,
    mempool: Vec<Pending>,
    forks: u64,
}

impl ChainState {
    fn genesis() -> Self {
        let header = BlockHeader {
            hash: block_hash(0, "", 0, &[]),
            level: 0,
            predecessor: String::new(),
            timestamp: Utc::now(),
        };
        Self {
            blocks: vec![Block {
                header,
                operation_hashes: Vec::new(),
            }],
            accounts: HashMap::new(),
            contracts: HashMap::new(),
            mempool: Vec::new(),
            forks: 0,
        }
    }

    fn head(&self) -> &Block {
        // The genesis block is never removed.
        &self.blocks[self.blocks.len() - 1]
    }

    fn push_block(&mut self, operation_hashes: Vec<OperationHash>) -> BlockHeader {
        let head = self.head().header.clone();
        let level = head.level + 1;
        let header = BlockHeader {
            hash: block_hash(level, &head.hash, self.forks, &operation_hashes),
            level,
            predecessor: head.hash,
            timestamp: Utc::now(),
        };
        self.blocks.push(Block {
            header: header.clone(),
            operation_hashes,
        });
        header
    }

    fn branch_is_live(&self, branch: &str) -> bool {
        let head_level = self.head().level();
        self.blocks
            .iter()
            .rev()
            .take_while(|b| head_level - b.level() <= MAX_BRANCH_AGE)
            .any(|b| b.hash() == branch)
    }

    fn pending_for<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a OperationContent> {
        self.mempool
            .iter()
            .flat_map(|p| p.envelope.contents.iter())
            .filter(move |c| c.source() == source)
    }

    /// Node-style error payload when the envelope cannot be applied on top
    /// of the current head and mempool.
    fn check_contents(&self, envelope: &OperationEnvelope) -> std::result::Result<(), Value> {
        if !self.branch_is_live(&envelope.branch) {
            return Err(node_error("branch_refused", &envelope.branch));
        }
        let Some(source) = envelope.source() else {
            return Err(node_error("empty_operation", "no contents"));
        };
        if let Err(e) = envelope.validate() {
            return Err(node_error("invalid_operation", &e.to_string()));
        }

        if envelope.contents.iter().all(|c| !c.kind().is_manager()) {
            for content in &envelope.contents {
                if let OperationContent::Activation(activation) = content {
                    if activation.secret.is_empty() || self.accounts.contains_key(&activation.pkh) {
                        return Err(node_error("invalid_activation", &activation.pkh));
                    }
                }
            }
            return Ok(());
        }

        let account = self.accounts.get(source).cloned().unwrap_or_default();
        let pending_counter = self.pending_for(source).filter_map(|c| c.counter()).max();
        let mut expected = account.counter.max(pending_counter.unwrap_or(0)).checked_add(1);
        for counter in envelope.counters() {
            let Some(next) = expected else {
                return Err(node_error("counter_overflow", source));
            };
            if counter < next {
                return Err(node_error("counter_in_the_past", &format!("expected {next}, got {counter}")));
            }
            if counter > next {
                return Err(node_error("counter_in_the_future", &format!("expected {next}, got {counter}")));
            }
            expected = next.checked_add(1);
        }

        let revealed = account.manager_key.is_some() || self.pending_for(source).any(|c| c.is_reveal());
        let has_reveal = envelope.contents.iter().any(|c| c.is_reveal());
        if revealed && has_reveal {
            return Err(node_error("previously_revealed_key", source));
        }
        if !revealed && !has_reveal {
            return Err(node_error("unrevealed_key", source));
        }

        let spent = envelope.contents.iter().fold(0u64, |acc, c| {
            let fee = c.limits().map(|l| l.fee.as_u64()).unwrap_or(0);
            let moved = match c {
                OperationContent::Transaction(tx) => tx.amount.as_u64(),
                OperationContent::Origination(orig) => orig.balance.as_u64(),
                _ => 0,
            };
            acc.saturating_add(fee).saturating_add(moved)
        });
        if spent > account.balance.as_u64() {
            return Err(node_error(
                "balance_too_low",
                &format!("balance {}, required {spent}", account.balance),
            ));
        }

        for content in &envelope.contents {
            if let OperationContent::Transaction(tx) = content {
                if credit(self.balance_of(&tx.destination), tx.amount).is_none() {
                    return Err(node_error("balance_overflow", &tx.destination));
                }
            }
        }

        Ok(())
    }

    fn balance_of(&self, address: &str) -> Mutez {
        self.contracts
            .get(address)
            .map(|c| c.balance)
            .or_else(|| self.accounts.get(address).map(|a| a.balance))
            .unwrap_or(Mutez::ZERO)
    }

    /// Key that must have signed the envelope.
    fn signing_key(&self, envelope: &OperationEnvelope) -> Option<String> {
        let source = envelope.source()?;
        self.accounts
            .get(source)
            .and_then(|a| a.manager_key.clone())
            .or_else(|| {
                envelope.contents.iter().find_map(|c| match c {
                    OperationContent::Reveal(reveal) => Some(reveal.public_key.clone()),
                    _ => None,
                })
            })
    }

    fn apply(&mut self, pending: &Pending) {
        for (index, content) in pending.envelope.contents.iter().enumerate() {
            if let (Some(counter), Some(limits)) = (content.counter(), content.limits()) {
                let account = self.accounts.entry(content.source().to_string()).or_default();
                account.counter = counter;
                account.balance = Mutez(account.balance.as_u64().saturating_sub(limits.fee.as_u64()));
            }

            match content {
                OperationContent::Reveal(reveal) => {
                    let account = self.accounts.entry(reveal.source.clone()).or_default();
                    account.manager_key = Some(reveal.public_key.clone());
                }
                OperationContent::Transaction(tx) => {
                    self.debit(&tx.source, tx.amount);
                    // Checked at injection; later mempool entries can still
                    // push a balance past the limit, which saturates.
                    match self.contracts.get_mut(&tx.destination) {
                        Some(contract) => {
                            contract.balance = credit(contract.balance, tx.amount).unwrap_or(Mutez(u64::MAX));
                        }
                        None => {
                            let dest = self.accounts.entry(tx.destination.clone()).or_default();
                            dest.balance = credit(dest.balance, tx.amount).unwrap_or(Mutez(u64::MAX));
                        }
                    }
                }
                OperationContent::Origination(orig) => {
                    self.debit(&orig.source, orig.balance);
                    let address = originated_address(&pending.hash, index);
                    self.contracts.insert(
                        address,
                        Contract {
                            script: orig.script.clone(),
                            balance: orig.balance,
                            big_map: HashMap::new(),
                        },
                    );
                }
                OperationContent::Delegation(delegation) => {
                    let account = self.accounts.entry(delegation.source.clone()).or_default();
                    account.delegate = delegation.delegate.clone();
                }
                OperationContent::Activation(activation) => {
                    let account = self.accounts.entry(activation.pkh.clone()).or_default();
                    account.balance = credit(account.balance, ACTIVATION_AMOUNT).unwrap_or(Mutez(u64::MAX));
                }
            }
        }
    }

    fn debit(&mut self, address: &str, amount: Mutez) {
        if let Some(account) = self.accounts.get_mut(address) {
            account.balance = Mutez(account.balance.as_u64().saturating_sub(amount.as_u64()));
        }
    }
}

fn credit(balance: Mutez, amount: Mutez) -> Option<Mutez> {
    balance.as_u64().checked_add(amount.as_u64()).map(Mutez)
}

fn node_error(id: &str, detail: &str) -> Value {
    json!([{ "kind": "temporary", "id": id, "msg": detail }])
}

fn block_hash(level: u64, predecessor: &str, forks: u64, operations: &[OperationHash]) -> BlockHash {
    let mut hasher = Sha256::new();
    hasher.update(level.to_be_bytes());
    hasher.update(predecessor.as_bytes());
    hasher.update(forks.to_be_bytes());
    for op in operations {
        hasher.update(op.as_bytes());
    }
    format!("BL{}", hex::encode(hasher.finalize()))
}

/// Address of the contract originated by content `index` of operation `hash`.
pub fn originated_address(hash: &str, index: usize) -> Address {
    let mut hasher = Sha256::new();
    hasher.update(hash.as_bytes());
    hasher.update((index as u64).to_be_bytes());
    format!("KT1{}", hex::encode(&hasher.finalize()[..20]))
}

/// In-memory node. Clones share the same chain.
#[derive(Clone)]
pub struct InMemoryNode {
    state: Arc<RwLock<ChainState>>,
    codec: JsonCodec,
    failing_reads: Arc<AtomicU32>,
    lost_injections: Arc<AtomicU32>,
}

impl InMemoryNode {
    /// Create a chain holding only the genesis block.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(ChainState::genesis())),
            codec: JsonCodec::new(),
            failing_reads: Arc::new(AtomicU32::new(0)),
            lost_injections: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Credit `amount` to an implicit account, creating it if needed.
    pub async fn fund(&self, address: &str, amount: Mutez) -> Result<()> {
        let mut state = self.state.write().await;
        let account = state.accounts.entry(address.to_string()).or_default();
        account.balance = credit(account.balance, amount).ok_or_else(|| {
            KestrelError::Validation(format!("balance of {address} would exceed {} mutez", u64::MAX))
        })?;
        Ok(())
    }

    pub async fn set_counter(&self, address: &str, counter: u64) {
        let mut state = self.state.write().await;
        state.accounts.entry(address.to_string()).or_default().counter = counter;
    }

    /// Mark `public_key` as revealed for the account it hashes to.
    pub async fn reveal_key(&self, public_key: &str) -> Result<Address> {
        let address = public_key_hash_of(public_key)?;
        let mut state = self.state.write().await;
        state.accounts.entry(address.clone()).or_default().manager_key = Some(public_key.to_string());
        Ok(address)
    }

    /// Register a contract directly, without an origination.
    pub async fn add_contract(&self, address: &str, script: ContractScript, balance: Mutez) {
        let mut state = self.state.write().await;
        state.contracts.insert(
            address.to_string(),
            Contract {
                script,
                balance,
                big_map: HashMap::new(),
            },
        );
    }

    /// Store `value` under an encoded big map `key` of a contract.
    pub async fn set_big_map_value(&self, address: &str, key: &Value, value: Value) -> Result<()> {
        let mut state = self.state.write().await;
        let contract = state.contracts.get_mut(address).ok_or_else(|| KestrelError::NotFound {
            resource_type: "Contract".to_string(),
            id: address.to_string(),
        })?;
        contract.big_map.insert(key.to_string(), value);
        Ok(())
    }

    pub async fn account(&self, address: &str) -> Option<AccountInfo> {
        let state = self.state.read().await;
        state.accounts.get(address).map(|a| AccountInfo {
            address: address.to_string(),
            balance: a.balance,
            counter: a.counter,
            manager_key: a.manager_key.clone(),
            delegate: a.delegate.clone(),
        })
    }

    /// Addresses of all contracts, originated or added.
    pub async fn contracts(&self) -> Vec<Address> {
        let state = self.state.read().await;
        state.contracts.keys().cloned().collect()
    }

    pub async fn mempool_len(&self) -> usize {
        self.state.read().await.mempool.len()
    }

    pub async fn head_level(&self) -> u64 {
        self.state.read().await.head().level()
    }

    /// Include every pending operation in a new block.
    pub async fn bake(&self) -> BlockHeader {
        let mut state = self.state.write().await;
        let pending: Vec<Pending> = state.mempool.drain(..).collect();
        for op in &pending {
            state.apply(op);
        }
        let header = state.push_block(pending.into_iter().map(|p| p.hash).collect());
        tracing::debug!(level = header.level, hash = %header.hash, "baked block");
        header
    }

    /// Bake `n` blocks, returning the last header.
    pub async fn bake_n(&self, n: u64) -> BlockHeader {
        let mut header = self.bake().await;
        for _ in 1..n {
            header = self.bake().await;
        }
        header
    }

    /// Replace every block from `level` up to the head with empty blocks on a
    /// new fork. Operations in the replaced blocks are dropped; account state
    /// is not rewound.
    pub async fn reorg(&self, level: u64) -> Result<BlockHeader> {
        let mut state = self.state.write().await;
        let height = state.head().level();
        if level == 0 || level > height {
            return Err(KestrelError::Validation(format!(
                "cannot reorg from level {level} with head at {height}"
            )));
        }
        state.blocks.truncate(level as usize);
        state.forks += 1;
        let mut header = state.head().header.clone();
        for _ in level..=height {
            header = state.push_block(Vec::new());
        }
        tracing::info!(from = level, head = header.level, "simulated reorg");
        Ok(header)
    }

    /// Fail the next `n` reads with a transport error.
    pub fn fail_next_reads(&self, n: u32) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Accept the next `n` valid injections, then discard them as a node
    /// evicting operations from its mempool would.
    pub fn lose_next_injections(&self, n: u32) {
        self.lost_injections.store(n, Ordering::SeqCst);
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn read(&self) -> Result<()> {
        if Self::take(&self.failing_reads) {
            return Err(KestrelError::Rpc("simulated outage".to_string()));
        }
        Ok(())
    }

    fn contract_not_found(address: &str) -> KestrelError {
        KestrelError::NotFound {
            resource_type: "Contract".to_string(),
            id: address.to_string(),
        }
    }
}

impl Default for InMemoryNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeRpc for InMemoryNode {
    async fn head(&self) -> Result<BlockHeader> {
        self.read()?;
        Ok(self.state.read().await.head().header.clone())
    }

    async fn block(&self, id: BlockId) -> Result<Block> {
        self.read()?;
        let state = self.state.read().await;
        let block = match &id {
            BlockId::Head => Some(state.head()),
            BlockId::Level(level) => state.blocks.get(*level as usize),
            BlockId::Hash(hash) => state.blocks.iter().find(|b| b.hash() == hash),
        };
        block.cloned().ok_or_else(|| KestrelError::NotFound {
            resource_type: "Block".to_string(),
            id: id.to_string(),
        })
    }

    async fn counter(&self, address: &str) -> Result<u64> {
        self.read()?;
        let state = self.state.read().await;
        Ok(state.accounts.get(address).map(|a| a.counter).unwrap_or(0))
    }

    async fn manager_key(&self, address: &str) -> Result<Option<String>> {
        self.read()?;
        let state = self.state.read().await;
        Ok(state.accounts.get(address).and_then(|a| a.manager_key.clone()))
    }

    async fn script(&self, address: &str) -> Result<ContractScript> {
        self.read()?;
        let state = self.state.read().await;
        state
            .contracts
            .get(address)
            .map(|c| c.script.clone())
            .ok_or_else(|| Self::contract_not_found(address))
    }

    async fn storage(&self, address: &str) -> Result<Value> {
        self.read()?;
        let state = self.state.read().await;
        state
            .contracts
            .get(address)
            .map(|c| c.script.storage.clone())
            .ok_or_else(|| Self::contract_not_found(address))
    }

    async fn big_map_get(&self, address: &str, key: &Value, _key_type: &Value) -> Result<Option<Value>> {
        self.read()?;
        let state = self.state.read().await;
        let contract = state
            .contracts
            .get(address)
            .ok_or_else(|| Self::contract_not_found(address))?;
        Ok(contract.big_map.get(&key.to_string()).cloned())
    }

    async fn constants(&self) -> Result<ProtocolConstants> {
        self.read()?;
        Ok(ProtocolConstants {
            hard_gas_limit_per_operation: 800_000,
            hard_storage_limit_per_operation: 60_000,
            cost_per_byte: Mutez(1_000),
            time_between_blocks: vec!["60".to_string(), "40".to_string()],
        })
    }

    async fn inject(&self, signed_hex: &str) -> Result<OperationHash> {
        let bytes = hex::decode(signed_hex.trim())
            .map_err(|e| KestrelError::rejected(node_error("invalid_hex", &e.to_string())))?;
        // Only ed25519 accounts exist here.
        if bytes.len() <= ED25519_SIGNATURE_LEN {
            return Err(KestrelError::rejected(node_error("invalid_operation", "too short")));
        }
        let (forged, signature) = bytes.split_at(bytes.len() - ED25519_SIGNATURE_LEN);
        let envelope = self
            .codec
            .parse(forged)
            .map_err(|e| KestrelError::rejected(node_error("parse_error", &e.to_string())))?;

        let mut state = self.state.write().await;
        state.check_contents(&envelope).map_err(KestrelError::rejected)?;

        if envelope.contents.iter().any(|c| c.kind().is_manager()) {
            let source = envelope.source().unwrap_or_default().to_string();
            let key = state
                .signing_key(&envelope)
                .ok_or_else(|| KestrelError::rejected(node_error("unrevealed_key", &source)))?;
            let key_matches = public_key_hash_of(&key).map(|pkh| pkh == source).unwrap_or(false);
            let mut payload = Vec::with_capacity(forged.len() + 1);
            payload.push(GENERIC_OPERATION_WATERMARK);
            payload.extend_from_slice(forged);
            let valid = verify_signature(&key, &payload, signature).unwrap_or(false);
            if !key_matches || !valid {
                return Err(KestrelError::rejected(node_error("invalid_signature", &source)));
            }
        }

        let hash = self.codec.operation_hash(&bytes);
        if Self::take(&self.lost_injections) {
            tracing::debug!(%hash, "operation accepted and discarded");
            return Ok(hash);
        }
        tracing::debug!(%hash, contents = envelope.contents.len(), "operation added to mempool");
        state.mempool.push(Pending {
            hash: hash.clone(),
            envelope,
        });
        Ok(hash)
    }

    async fn run_operation(&self, envelope: &OperationEnvelope, _signature: &str) -> Result<Value> {
        self.read()?;
        let state = self.state.read().await;
        let result = match state.check_contents(envelope) {
            Ok(()) => json!({ "status": "applied" }),
            Err(errors) => json!({ "status": "failed", "errors": errors }),
        };
        let contents = envelope
            .contents
            .iter()
            .map(|content| {
                let mut value = serde_json::to_value(content)?;
                value["metadata"] = json!({ "operation_result": result.clone() });
                Ok(value)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(json!({ "contents": contents }))
    }
}
