//! Kestrel client.

use std::sync::Arc;

use async_trait::async_trait;
use kestrel_chain::{Codec, JsonCodec, NodeRpc, Signer};
use kestrel_confirm::{FailureListener, OperationHandle, TrackerSettings};
use kestrel_core::{Address, ClientConfig, KestrelError, LimitOverrides, Result};
use kestrel_emit::{
    AccountLock, DelegationParams, Injected, OperationParams, OriginateParams, PerAccountLock,
    Pipeline, TransferParams,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::contract::Contract;
use crate::http::RpcClient;

/// Frees the counters of an operation whose tracking failed, so the next
/// envelope is built from the on-chain counter.
struct AbandonOnFailure {
    pipeline: Arc<Pipeline>,
    injected: Injected,
}

#[async_trait]
impl FailureListener for AbandonOnFailure {
    async fn tracking_failed(&self, hash: &str, error: &KestrelError) {
        warn!(%hash, %error, "tracking failed, abandoning its counters");
        self.pipeline.abandon(&self.injected).await;
    }
}

/// Emits operations for one signer and hands back handles to track them.
#[derive(Clone)]
pub struct Client {
    config: ClientConfig,
    rpc: Arc<dyn NodeRpc>,
    signer: Arc<dyn Signer>,
    codec: Arc<dyn Codec>,
    lock: Arc<dyn AccountLock>,
    pipeline: Arc<Pipeline>,
}

impl Client {
    /// Client over explicit collaborators, with the JSON codec and per-account
    /// serialization.
    pub fn new(config: ClientConfig, rpc: Arc<dyn NodeRpc>, signer: Arc<dyn Signer>) -> Self {
        let codec: Arc<dyn Codec> = Arc::new(JsonCodec::new());
        let lock: Arc<dyn AccountLock> = Arc::new(PerAccountLock::new());
        let pipeline = Self::pipeline(&config, &rpc, &signer, &codec, &lock);
        Self {
            config,
            rpc,
            signer,
            codec,
            lock,
            pipeline,
        }
    }

    /// Connect to the node at `config.rpc_url`, checking that it answers.
    pub async fn connect(config: ClientConfig, signer: Arc<dyn Signer>) -> Result<Self> {
        let rpc = RpcClient::from_config(&config)?;
        let head = rpc.head().await?;
        info!(url = %config.rpc_url, level = head.level, "connected to node");
        Ok(Self::new(config, Arc::new(rpc), signer))
    }

    fn pipeline(
        config: &ClientConfig,
        rpc: &Arc<dyn NodeRpc>,
        signer: &Arc<dyn Signer>,
        codec: &Arc<dyn Codec>,
        lock: &Arc<dyn AccountLock>,
    ) -> Arc<Pipeline> {
        Arc::new(Pipeline::new(
            rpc.clone(),
            signer.clone(),
            codec.clone(),
            lock.clone(),
            config.fee_policy.clone(),
        ))
    }

    fn rebuild(mut self) -> Self {
        self.pipeline = Self::pipeline(&self.config, &self.rpc, &self.signer, &self.codec, &self.lock);
        self
    }

    /// Replace the encoding layer.
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self.rebuild()
    }

    /// Replace the per-account serialization of counter resolution.
    pub fn with_account_lock(mut self, lock: Arc<dyn AccountLock>) -> Self {
        self.lock = lock;
        self.rebuild()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn rpc(&self) -> &Arc<dyn NodeRpc> {
        &self.rpc
    }

    /// Address of the signer.
    pub async fn address(&self) -> Result<Address> {
        self.signer.public_key_hash().await
    }

    fn handle(&self, injected: Injected) -> OperationHandle {
        OperationHandle::new(
            injected.hash.clone(),
            injected.head_level,
            self.rpc.clone(),
            TrackerSettings::from(&self.config),
        )
        .with_listener(Arc::new(AbandonOnFailure {
            pipeline: self.pipeline.clone(),
            injected,
        }))
    }

    /// Forget every counter reserved for the signer. The next operation is
    /// built from the on-chain counter.
    pub async fn reset_counters(&self) -> Result<()> {
        let address = self.address().await?;
        self.pipeline.reset_counters(&address).await;
        Ok(())
    }

    /// Handle on an operation injected elsewhere.
    pub fn track(&self, hash: impl Into<String>, from_level: u64) -> OperationHandle {
        OperationHandle::new(hash, from_level, self.rpc.clone(), TrackerSettings::from(&self.config))
    }

    pub async fn transfer(&self, params: &TransferParams) -> Result<OperationHandle> {
        let injected = self.pipeline.transfer(params).await?;
        Ok(self.handle(injected))
    }

    pub async fn originate(&self, params: &OriginateParams) -> Result<OperationHandle> {
        let injected = self.pipeline.originate(params).await?;
        Ok(self.handle(injected))
    }

    pub async fn set_delegate(&self, params: &DelegationParams) -> Result<OperationHandle> {
        let injected = self.pipeline.set_delegate(params).await?;
        Ok(self.handle(injected))
    }

    /// Delegate the signer's account to itself.
    pub async fn register_delegate(&self, limits: LimitOverrides) -> Result<OperationHandle> {
        let injected = self.pipeline.register_delegate(limits).await?;
        Ok(self.handle(injected))
    }

    pub async fn activate_account(&self, pkh: &str, secret: &str) -> Result<OperationHandle> {
        let injected = self.pipeline.activate_account(pkh, secret).await?;
        Ok(self.handle(injected))
    }

    /// Several manager operations in one envelope.
    pub async fn batch(&self, operations: &[OperationParams]) -> Result<OperationHandle> {
        let injected = self.pipeline.batch(operations).await?;
        Ok(self.handle(injected))
    }

    /// Node's dry-run result for the operations. Nothing is injected.
    pub async fn simulate(&self, operations: &[OperationParams]) -> Result<Value> {
        self.pipeline.simulate(operations).await
    }

    /// Read accessors for the contract at `address`.
    pub fn at(&self, address: impl Into<Address>) -> Contract {
        Contract::new(address, self.rpc.clone(), self.codec.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_chain::{Ed25519Signer, InMemoryNode};
    use kestrel_confirm::ConfirmationState;
    use kestrel_core::{KestrelError, Mutez};
    use futures::StreamExt;
    use kestrel_emit::Unserialized;
    use std::time::Duration;

    fn fast_config() -> ClientConfig {
        ClientConfig::default()
            .with_poll_interval(Duration::from_millis(5))
            .with_confirmation_timeout(Duration::from_millis(500))
    }

    fn baker(node: InMemoryNode) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(4)).await;
                node.bake().await;
            }
        })
    }

    #[tokio::test]
    async fn test_transfer_is_confirmed_in_memory() {
        let node = InMemoryNode::new();
        let signer = Arc::new(Ed25519Signer::from_seed([30; 32]));
        node.fund(&signer.address(), Mutez::from_tez("10").unwrap()).await.unwrap();
        node.set_counter(&signer.address(), 41).await;
        let client = Client::new(fast_config(), Arc::new(node.clone()), signer.clone());

        let handle = client.transfer(&TransferParams::new("addr1", "1.5")).await.unwrap();
        let bake = baker(node.clone());
        let state = tokio::time::timeout(Duration::from_secs(5), handle.confirmation(2))
            .await
            .unwrap()
            .unwrap();
        bake.abort();

        assert!(matches!(state, ConfirmationState::Confirmed { confirmations, .. } if confirmations >= 2));
        assert_eq!(handle.state().await, state);
        assert_eq!(node.account("addr1").await.unwrap().balance, Mutez(1_500_000));
    }

    fn status(state: &ConfirmationState) -> &'static str {
        match state {
            ConfirmationState::Injected => "injected",
            ConfirmationState::Included { .. } => "included",
            ConfirmationState::Confirmed { .. } => "confirmed",
            ConfirmationState::Failed(_) => "failed",
        }
    }

    #[tokio::test]
    async fn test_reveal_and_transfer_watched_to_confirmation() {
        let node = InMemoryNode::new();
        let signer = Arc::new(Ed25519Signer::from_seed([33; 32]));
        let address = signer.address();
        node.fund(&address, Mutez::from_tez("10").unwrap()).await.unwrap();
        node.set_counter(&address, 41).await;
        let client = Client::new(fast_config(), Arc::new(node.clone()), signer.clone());
        let transfer = TransferParams::new("addr1", "1.5");

        // Reveal at 42, then the transfer at 43, in one envelope.
        let planned = client
            .simulate(&[OperationParams::Transfer(transfer.clone())])
            .await
            .unwrap();
        let contents = planned["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0]["kind"], "reveal");
        assert_eq!(contents[0]["counter"], "42");
        assert_eq!(contents[1]["kind"], "transaction");
        assert_eq!(contents[1]["counter"], "43");
        assert_eq!(contents[1]["destination"], "addr1");

        let handle = client.transfer(&transfer).await.unwrap();
        let watch = handle.watch(2);
        let mut states = watch.stream();
        let mut seen = vec![states.next().await.unwrap()];

        // One block includes the envelope; the stream must report it before
        // more blocks confirm it.
        node.bake().await;
        let included = tokio::time::timeout(Duration::from_secs(2), states.next())
            .await
            .unwrap()
            .unwrap();
        let block = node
            .block(kestrel_chain::BlockId::Level(included.level().unwrap()))
            .await
            .unwrap();
        assert!(block.operation_hashes.iter().any(|h| h == handle.hash()));
        seen.push(included);

        node.bake_n(2).await;
        while !seen.last().unwrap().is_terminal() {
            let next = tokio::time::timeout(Duration::from_secs(2), states.next())
                .await
                .unwrap()
                .unwrap();
            seen.push(next);
        }

        let statuses: Vec<_> = seen.iter().map(status).collect();
        assert_eq!(statuses, ["injected", "included", "confirmed"]);
        assert_eq!(handle.state().await, *seen.last().unwrap());

        let account = node.account(&address).await.unwrap();
        assert_eq!(account.counter, 43);
        assert!(account.manager_key.is_some());
        assert_eq!(node.account("addr1").await.unwrap().balance, Mutez(1_500_000));
    }

    #[tokio::test]
    async fn test_failed_tracking_frees_counters() {
        let node = InMemoryNode::new();
        let signer = Arc::new(Ed25519Signer::from_seed([34; 32]));
        node.fund(&signer.address(), Mutez::from_tez("10").unwrap()).await.unwrap();
        let config = fast_config().with_confirmation_timeout(Duration::from_millis(50));
        let client = Client::new(config, Arc::new(node.clone()), signer.clone());

        node.lose_next_injections(1);
        let lost = client.transfer(&TransferParams::new("addr1", "1")).await.unwrap();
        let err = lost.confirmation(1).await.unwrap_err();
        assert!(matches!(err, KestrelError::ConfirmationTimeout { included_at: None, .. }));

        let handle = client.transfer(&TransferParams::new("addr1", "2")).await.unwrap();
        node.bake().await;
        handle.confirmation(0).await.unwrap();
        assert_eq!(node.account("addr1").await.unwrap().balance, Mutez(2_000_000));
        assert_eq!(node.account(&signer.address()).await.unwrap().counter, 2);
    }

    #[tokio::test]
    async fn test_reset_counters_after_lost_injection() {
        let node = InMemoryNode::new();
        let signer = Arc::new(Ed25519Signer::from_seed([35; 32]));
        node.fund(&signer.address(), Mutez::from_tez("10").unwrap()).await.unwrap();
        let client = Client::new(fast_config(), Arc::new(node.clone()), signer);

        node.lose_next_injections(1);
        client.transfer(&TransferParams::new("addr1", "1")).await.unwrap();
        assert!(client.transfer(&TransferParams::new("addr1", "1")).await.is_err());

        client.reset_counters().await.unwrap();
        client.transfer(&TransferParams::new("addr1", "1")).await.unwrap();
        assert_eq!(node.mempool_len().await, 1);
    }

    #[tokio::test]
    async fn test_at_reads_originated_storage() {
        let node = InMemoryNode::new();
        let signer = Arc::new(Ed25519Signer::from_seed([31; 32]));
        node.fund(&signer.address(), Mutez::from_tez("10").unwrap()).await.unwrap();
        let client = Client::new(fast_config(), Arc::new(node.clone()), signer);

        let code = serde_json::json!([
            {"prim": "parameter", "args": [{"prim": "unit"}]},
            {"prim": "storage", "args": [{"prim": "nat"}]},
            {"prim": "code", "args": [[]]}
        ]);
        let handle = client
            .originate(&OriginateParams::new(code, r#"{"int": "42"}"#))
            .await
            .unwrap();
        node.bake().await;
        handle.confirmation(0).await.unwrap();

        let address = kestrel_chain::sandbox::originated_address(handle.hash(), 1);
        let stored: String = client.at(address).storage(None).await.unwrap();
        assert_eq!(stored, "42");
    }

    #[tokio::test]
    async fn test_validation_error_reaches_caller() {
        let node = InMemoryNode::new();
        let client = Client::new(fast_config(), Arc::new(node), Arc::new(Ed25519Signer::generate()))
            .with_account_lock(Arc::new(Unserialized));
        let err = client
            .transfer(&TransferParams::new("addr1", "-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, KestrelError::Validation(_)));
    }

    #[tokio::test]
    async fn test_batch_then_simulate() {
        let node = InMemoryNode::new();
        let signer = Arc::new(Ed25519Signer::from_seed([32; 32]));
        node.fund(&signer.address(), Mutez::from_tez("10").unwrap()).await.unwrap();
        let client = Client::new(fast_config(), Arc::new(node.clone()), signer);

        let ops = [
            OperationParams::Transfer(TransferParams::new("tz1a", "1")),
            OperationParams::Delegation(DelegationParams::new("tz1baker")),
        ];
        let simulated = client.simulate(&ops).await.unwrap();
        let contents = simulated["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["kind"], "reveal");

        let handle = client.batch(&ops).await.unwrap();
        node.bake().await;
        assert!(matches!(
            handle.confirmation(0).await.unwrap(),
            ConfirmationState::Confirmed { .. }
        ));
    }
}
