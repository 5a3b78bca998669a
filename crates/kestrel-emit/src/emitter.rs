//! Forge, sign and inject.

use std::sync::Arc;

use kestrel_chain::{Codec, NodeRpc, Signer, ED25519_SIGNATURE_LEN, GENERIC_OPERATION_WATERMARK};
use kestrel_core::{KestrelError, OperationEnvelope, OperationHash, Result, SignedOperation};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Turns validated envelopes into injected operations.
pub struct Emitter {
    rpc: Arc<dyn NodeRpc>,
    signer: Arc<dyn Signer>,
    codec: Arc<dyn Codec>,
}

impl Emitter {
    pub fn new(rpc: Arc<dyn NodeRpc>, signer: Arc<dyn Signer>, codec: Arc<dyn Codec>) -> Self {
        Self { rpc, signer, codec }
    }

    /// Forge the envelope and sign the watermarked bytes.
    pub async fn sign(&self, envelope: &OperationEnvelope) -> Result<SignedOperation> {
        let bytes = self.codec.forge(envelope)?;

        let mut payload = Vec::with_capacity(bytes.len() + 1);
        payload.push(GENERIC_OPERATION_WATERMARK);
        payload.extend_from_slice(&bytes);

        let output = self.signer.sign(&payload).await.map_err(|e| match e {
            KestrelError::Signer(_) => e,
            other => KestrelError::Signer(other.to_string()),
        })?;
        if output.signature.is_empty() {
            return Err(KestrelError::Signer("signer returned an empty signature".to_string()));
        }
        if let Some(expected) = self.signer.signature_len() {
            if output.signature.len() != expected {
                return Err(KestrelError::Signer(format!(
                    "expected a {expected}-byte signature, got {} bytes",
                    output.signature.len()
                )));
            }
        }

        let mut signed = SignedOperation {
            bytes,
            signature: output.signature,
            op_hash: String::new(),
        };
        signed.op_hash = self.codec.operation_hash(&signed.signed_bytes());
        Ok(signed)
    }

    /// Submit signed bytes. The node's hash is authoritative.
    pub async fn inject(&self, signed: &SignedOperation) -> Result<OperationHash> {
        let hash = self.rpc.inject(&hex::encode(signed.signed_bytes())).await?;
        if hash != signed.op_hash {
            warn!(node = %hash, local = %signed.op_hash, "node returned a different operation hash");
        }
        Ok(hash)
    }

    /// Sign and inject.
    pub async fn emit(&self, envelope: &OperationEnvelope) -> Result<OperationHash> {
        let signed = self.sign(envelope).await?;
        debug!(hash = %signed.op_hash, bytes = signed.bytes.len(), "signed envelope");
        let hash = self.inject(&signed).await?;
        info!(%hash, branch = %envelope.branch, "operation injected");
        Ok(hash)
    }

    /// Dry-run the envelope on the node. The signature is not checked there,
    /// so a zeroed one is sent and the signer is never asked.
    pub async fn simulate(&self, envelope: &OperationEnvelope) -> Result<Value> {
        self.codec.forge(envelope)?;
        let len = self.signer.signature_len().unwrap_or(ED25519_SIGNATURE_LEN);
        let signature = hex::encode(vec![0u8; len]);
        self.rpc.run_operation(envelope, &signature).await
    }
}
