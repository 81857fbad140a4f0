//! # tessera-crypto: Cryptographic primitives for `Tessera`
//!
//! - [`sha256`] / [`merkle_root`]: the single collision-resistant hash used
//!   for request digests, state-value keys and state roots.
//! - [`SignatureService`]: the signing/verification seam consumed by the
//!   replication core, with [`KeyRing`] as the Ed25519 implementation.
//!
//! One hash function is used everywhere so that a digest computed when a
//! request is submitted is the same digest replicas agree on and the same
//! key the state synchronizer stores it under.

mod error;
mod hash;
mod signature;

pub use error::CryptoError;
pub use hash::{merkle_root, sha256, sha256_str};
pub use signature::{KeyRing, PublicKey, Signature, SignatureService};

/// Result type for cryptographic operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
