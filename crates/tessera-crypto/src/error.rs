//! Error types for cryptographic operations.

use tessera_types::ReplicaId;
use thiserror::Error;

/// Cryptographic errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Signature was not of the form `hex(R):hex(S)`.
    #[error("malformed signature encoding: {0}")]
    MalformedSignature(String),

    /// Public key bytes were not a valid Ed25519 point.
    #[error("malformed public key: {0}")]
    MalformedPublicKey(String),

    /// No signing key is available for the replica.
    #[error("no signing key for replica {0}")]
    NoSigningKey(ReplicaId),
}
