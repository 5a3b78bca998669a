//! Signer interface and an in-process ed25519 signer.

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use kestrel_core::{Address, KestrelError, Result};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Watermark prepended to forged bytes before signing a manager operation.
pub const GENERIC_OPERATION_WATERMARK: u8 = 0x03;

/// Length of an ed25519 signature in bytes.
pub const ED25519_SIGNATURE_LEN: usize = ed25519_dalek::SIGNATURE_LENGTH;

const PUBLIC_KEY_PREFIX: &str = "edpk";
const PUBLIC_KEY_HASH_PREFIX: &str = "tz1";

/// Result of a signing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureOutput {
    pub signature: Vec<u8>,
    pub public_key: String,
}

/// Holds the account key. Implementations may be remote or hardware backed.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Address of the signing account.
    async fn public_key_hash(&self) -> Result<Address>;

    /// Encoded public key, as published by a reveal.
    async fn public_key(&self) -> Result<String>;

    /// Sign `payload` (watermark included).
    async fn sign(&self, payload: &[u8]) -> Result<SignatureOutput>;

    /// Byte length of every signature this signer produces, if fixed.
    fn signature_len(&self) -> Option<usize> {
        None
    }
}

/// Ed25519 key held in memory.
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    /// Generate a fresh key.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    /// Deterministic key from a 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    /// Key from a hex-encoded 32-byte seed.
    pub fn from_hex(seed: &str) -> Result<Self> {
        let bytes = hex::decode(seed)
            .map_err(|e| KestrelError::Signer(format!("invalid secret key: {e}")))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KestrelError::Signer("secret key must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(seed))
    }

    pub fn encoded_public_key(&self) -> String {
        encode_public_key(&self.key.verifying_key())
    }

    pub fn address(&self) -> Address {
        address_of(&self.key.verifying_key())
    }
}

#[async_trait]
impl Signer for Ed25519Signer {
    async fn public_key_hash(&self) -> Result<Address> {
        Ok(self.address())
    }

    async fn public_key(&self) -> Result<String> {
        Ok(self.encoded_public_key())
    }

    async fn sign(&self, payload: &[u8]) -> Result<SignatureOutput> {
        let signature = self.key.sign(payload);
        Ok(SignatureOutput {
            signature: signature.to_bytes().to_vec(),
            public_key: self.encoded_public_key(),
        })
    }

    fn signature_len(&self) -> Option<usize> {
        Some(ED25519_SIGNATURE_LEN)
    }
}

fn encode_public_key(key: &VerifyingKey) -> String {
    format!("{PUBLIC_KEY_PREFIX}{}", hex::encode(key.as_bytes()))
}

fn address_of(key: &VerifyingKey) -> Address {
    let digest = Sha256::digest(key.as_bytes());
    format!("{PUBLIC_KEY_HASH_PREFIX}{}", hex::encode(&digest[..20]))
}

fn decode_public_key(public_key: &str) -> Result<VerifyingKey> {
    let raw = public_key
        .strip_prefix(PUBLIC_KEY_PREFIX)
        .ok_or_else(|| KestrelError::Validation(format!("not an ed25519 public key: {public_key}")))?;
    let bytes: [u8; 32] = hex::decode(raw)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| KestrelError::Validation(format!("malformed public key: {public_key}")))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| KestrelError::Validation(format!("invalid public key: {e}")))
}

/// Address derived from an encoded public key.
pub fn public_key_hash_of(public_key: &str) -> Result<Address> {
    Ok(address_of(&decode_public_key(public_key)?))
}

/// Check a signature produced by [`Signer::sign`].
pub fn verify_signature(public_key: &str, payload: &[u8], signature: &[u8]) -> Result<bool> {
    let key = decode_public_key(public_key)?;
    let signature = Signature::from_slice(signature)
        .map_err(|e| KestrelError::Validation(format!("malformed signature: {e}")))?;
    Ok(key.verify(payload, &signature).is_ok())
}
