//! Build, sign and inject in one call.

use std::sync::Arc;

use kestrel_chain::{Codec, NodeRpc, Signer};
use kestrel_core::{
    Address, FeePolicy, KestrelError, LimitOverrides, OperationEnvelope, OperationHash, Result,
};
use serde_json::Value;
use tracing::warn;

use crate::builder::{
    Built, DelegationParams, OperationBuilder, OperationParams, OriginateParams, TransferParams,
};
use crate::emitter::Emitter;
use crate::lock::AccountLock;
use crate::resolver::{CounterResolver, Resolution};

/// An operation accepted by the node.
#[derive(Debug, Clone)]
pub struct Injected {
    pub hash: OperationHash,
    pub envelope: OperationEnvelope,
    /// Head level when the envelope was built. Inclusion is searched from here.
    pub head_level: u64,
    /// Counters the envelope holds, `None` without manager contents.
    pub resolution: Option<Resolution>,
}

impl Injected {
    pub fn source(&self) -> Option<&str> {
        self.envelope.source()
    }
}

/// Composes an [`OperationBuilder`] and an [`Emitter`] over shared collaborators.
pub struct Pipeline {
    builder: OperationBuilder,
    emitter: Emitter,
    signer: Arc<dyn Signer>,
}

impl Pipeline {
    pub fn new(
        rpc: Arc<dyn NodeRpc>,
        signer: Arc<dyn Signer>,
        codec: Arc<dyn Codec>,
        lock: Arc<dyn AccountLock>,
        policy: FeePolicy,
    ) -> Self {
        let resolver = Arc::new(CounterResolver::new(rpc.clone(), lock));
        Self {
            builder: OperationBuilder::new(resolver, signer.clone(), codec.clone(), policy),
            emitter: Emitter::new(rpc, signer.clone(), codec),
            signer,
        }
    }

    pub fn builder(&self) -> &OperationBuilder {
        &self.builder
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    /// Address of the signer.
    pub async fn address(&self) -> Result<Address> {
        self.signer.public_key_hash().await
    }

    /// Sign and inject a built envelope.
    ///
    /// When emission fails before the node could have accepted the operation,
    /// its counters are released. A transport failure during injection leaves
    /// them reserved since the node may have accepted it; they are freed by
    /// [`Pipeline::abandon`] or once the branch expires.
    pub async fn send(&self, built: Built) -> Result<Injected> {
        match self.emitter.emit(&built.envelope).await {
            Ok(hash) => Ok(Injected {
                hash,
                envelope: built.envelope,
                head_level: built.head_level,
                resolution: built.resolution,
            }),
            Err(err) => {
                if !matches!(err, KestrelError::Rpc(_)) {
                    self.builder.release(&built).await;
                }
                warn!(error = %err, source = ?built.envelope.source(), "emission failed");
                Err(err)
            }
        }
    }

    /// Forget the counters of an injected operation that will never land, so
    /// the next build starts from the on-chain counter again.
    pub async fn abandon(&self, injected: &Injected) {
        if let Some(resolution) = &injected.resolution {
            self.builder.resolver().abandon(resolution).await;
        }
    }

    /// Forget every counter reserved for `source`.
    pub async fn reset_counters(&self, source: &str) {
        self.builder.resolver().reset(source).await;
    }

    pub async fn transfer(&self, params: &TransferParams) -> Result<Injected> {
        let built = self.builder.transfer(params).await?;
        self.send(built).await
    }

    pub async fn originate(&self, params: &OriginateParams) -> Result<Injected> {
        let built = self.builder.originate(params).await?;
        self.send(built).await
    }

    pub async fn set_delegate(&self, params: &DelegationParams) -> Result<Injected> {
        let built = self.builder.set_delegate(params).await?;
        self.send(built).await
    }

    pub async fn register_delegate(&self, limits: LimitOverrides) -> Result<Injected> {
        let built = self.builder.register_delegate(limits).await?;
        self.send(built).await
    }

    pub async fn activate_account(&self, pkh: &str, secret: &str) -> Result<Injected> {
        let built = self.builder.activate_account(pkh, secret).await?;
        self.send(built).await
    }

    pub async fn batch(&self, operations: &[OperationParams]) -> Result<Injected> {
        let built = self.builder.batch(operations).await?;
        self.send(built).await
    }

    /// Build the operations and dry-run them without injecting. The reserved
    /// counters are released afterwards.
    pub async fn simulate(&self, operations: &[OperationParams]) -> Result<Value> {
        let built = self.builder.batch(operations).await?;
        let result = self.emitter.simulate(&built.envelope).await;
        self.builder.release(&built).await;
        result
    }
}
