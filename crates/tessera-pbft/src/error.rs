//! Error types for the replication core.

use tessera_crypto::CryptoError;
use tessera_types::ReplicaId;
use thiserror::Error;

/// Replication core errors.
///
/// Only construction and configuration errors are returned to callers of
/// the router. Malformed input, authentication failures and protocol
/// violations are logged and dropped at the receive boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Wire input that does not parse as a message or message content.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A deployment or programming mistake rejected at entry.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Signature missing for a kind that requires one, or not matching the sender.
    #[error("authentication failed for message from replica {sender}: {reason}")]
    Authentication { sender: ReplicaId, reason: String },

    /// A message that is well-formed but not acceptable in the current state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Timers were requested outside a tokio runtime.
    #[error("no tokio runtime available for timers")]
    NoRuntime,

    /// Signing failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl Error {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedMessage(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

impl From<tessera_config::ConfigError> for Error {
    fn from(err: tessera_config::ConfigError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

/// Result type for replication core operations.
pub type Result<T> = std::result::Result<T, Error>;
