//! # Kestrel Chain
//!
//! The collaborators an emission pipeline talks to, and implementations that
//! run without a real node.

pub mod codec;
pub mod micheline;
pub mod rpc;
pub mod sandbox;
pub mod signer;

pub use codec::{Codec, JsonCodec};
pub use rpc::{AccountInfo, Block, BlockHeader, BlockId, NodeRpc, ProtocolConstants, MAX_BRANCH_AGE};
pub use sandbox::InMemoryNode;
pub use signer::{
    Ed25519Signer, SignatureOutput, Signer, ED25519_SIGNATURE_LEN, GENERIC_OPERATION_WATERMARK,
};
