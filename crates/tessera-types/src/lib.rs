//! # tessera-types: Core types for `Tessera`
//!
//! This crate contains shared types used across the `Tessera` system:
//! - Replica and protocol identifiers ([`ReplicaId`], [`ViewNumber`],
//!   [`SequenceNumber`], [`RequestId`])
//! - Content fingerprints ([`struct@Digest`])
//!
//! All identifiers are `Copy` newtypes so they cannot be mixed up at call
//! sites (a view number is never accepted where a replica id is expected).

use std::{
    fmt::{Debug, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Protocol Identifiers - All Copy (cheap 4/8-byte values)
// ============================================================================

/// Identifier of a replica, unique within a deployment.
///
/// Replica ids are dense (`0..total_replicas`): the primary for view `v`
/// is the replica whose id equals `v mod N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(u32);

impl ReplicaId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns the id as a `usize`, for indexing into replica tables.
    pub fn as_index(&self) -> usize {
        self.0 as usize
    }
}

impl Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ReplicaId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u32>().map(Self)
    }
}

impl From<u32> for ReplicaId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<ReplicaId> for u32 {
    fn from(id: ReplicaId) -> Self {
        id.0
    }
}

/// A numbered epoch identifying which replica is primary.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ViewNumber(u64);

impl ViewNumber {
    /// The initial view; replica 0 is primary.
    pub const ZERO: ViewNumber = ViewNumber(0);

    pub fn new(view: u64) -> Self {
        Self(view)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the replica that is primary for this view in a cluster of
    /// `total_replicas` replicas.
    ///
    /// Callers must ensure `total_replicas > 0`.
    pub fn primary(&self, total_replicas: u32) -> ReplicaId {
        debug_assert!(total_replicas > 0, "cluster must have at least one replica");
        ReplicaId((self.0 % u64::from(total_replicas)) as u32)
    }
}

impl Display for ViewNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ViewNumber {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(Self)
    }
}

impl From<u64> for ViewNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<ViewNumber> for u64 {
    fn from(view: ViewNumber) -> Self {
        view.0
    }
}

/// Sequence number of a checkpoint.
///
/// Valid checkpoints start at 1; [`SequenceNumber::ZERO`] means "no stable
/// checkpoint yet".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn new(seq: u64) -> Self {
        Self(seq)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SequenceNumber {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(Self)
    }
}

impl From<u64> for SequenceNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<SequenceNumber> for u64 {
    fn from(seq: SequenceNumber) -> Self {
        seq.0
    }
}

/// Identifier of a client request, monotonically increasing per manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    /// The first id handed out by a fresh client request manager.
    pub const FIRST: RequestId = RequestId(1);

    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<RequestId> for u64 {
    fn from(id: RequestId) -> Self {
        id.0
    }
}

// ============================================================================
// Digest - Copy (fixed 32-byte value)
// ============================================================================

/// Length of digests in bytes (SHA-256).
pub const DIGEST_LENGTH: usize = 32;

/// A 32-byte content fingerprint.
///
/// Digests identify client requests (the unit of agreement) and state
/// values. Two requests with the same digest are the same consensus
/// instance. This type only stores the bytes; hashing lives in
/// `tessera-crypto`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest([u8; DIGEST_LENGTH]);

impl Digest {
    /// All-zero digest, used where a message carries no meaningful digest.
    pub const ZERO: Digest = Digest([0u8; DIGEST_LENGTH]);

    pub fn from_bytes(bytes: [u8; DIGEST_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LENGTH] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; DIGEST_LENGTH]
    }

    /// Full lowercase hex representation (64 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, DigestParseError> {
        if s.len() != DIGEST_LENGTH * 2 {
            return Err(DigestParseError::Length(s.len()));
        }
        if !is_lower_hex(s) {
            return Err(DigestParseError::NotHex);
        }
        let mut bytes = [0u8; DIGEST_LENGTH];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| DigestParseError::NotHex)?;
        Ok(Self(bytes))
    }
}

impl Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // First 8 bytes are enough to tell digests apart in logs
        write!(f, "Digest({}...)", hex::encode(&self.0[..8]))
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Digest {
    type Err = DigestParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Default for Digest {
    fn default() -> Self {
        Self::ZERO
    }
}

impl From<[u8; DIGEST_LENGTH]> for Digest {
    fn from(bytes: [u8; DIGEST_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl From<Digest> for [u8; DIGEST_LENGTH] {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// True if `s` only holds `0-9a-f`, the form every encoder here produces.
pub fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Error parsing a [`struct@Digest`] from its hex form.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DigestParseError {
    #[error("digest must be {expected} hex characters, got {0}", expected = DIGEST_LENGTH * 2)]
    Length(usize),

    #[error("digest contains characters other than lowercase hex")]
    NotHex,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test_case(0, 4, 0; "view zero")]
    #[test_case(1, 4, 1; "view one")]
    #[test_case(5, 4, 1; "wraps around")]
    #[test_case(7, 7, 0; "exact multiple")]
    fn primary_is_view_mod_n(view: u64, total: u32, expected: u32) {
        assert_eq!(ViewNumber::new(view).primary(total), ReplicaId::new(expected));
    }

    #[test]
    fn digest_hex_round_trip() {
        let digest = Digest::from_bytes([0xab; DIGEST_LENGTH]);
        let hex = digest.to_string();
        assert_eq!(hex.len(), 64);
        assert_eq!(hex, digest.to_hex());
        assert_eq!(hex.parse::<Digest>().unwrap(), digest);
    }

    #[test]
    fn digest_rejects_short_and_non_hex() {
        assert_eq!(Digest::from_hex("deadbeef"), Err(DigestParseError::Length(8)));
        let bad = "zz".repeat(DIGEST_LENGTH);
        assert_eq!(Digest::from_hex(&bad), Err(DigestParseError::NotHex));
    }

    #[test]
    fn digest_rejects_uppercase_hex() {
        let digest = Digest::from_bytes([0xab; DIGEST_LENGTH]);
        let upper = digest.to_hex().to_uppercase();
        assert_eq!(Digest::from_hex(&upper), Err(DigestParseError::NotHex));
        assert_eq!(
            DigestParseError::Length(8).to_string(),
            "digest must be 64 hex characters, got 8"
        );
    }

    #[test]
    fn digest_debug_is_truncated() {
        let digest = Digest::from_bytes([0x11; DIGEST_LENGTH]);
        assert_eq!(format!("{digest:?}"), "Digest(1111111111111111...)");
    }

    #[test]
    fn replica_id_parses_trimmed() {
        assert_eq!(" 3 ".parse::<ReplicaId>().unwrap(), ReplicaId::new(3));
        assert!("-1".parse::<ReplicaId>().is_err());
    }

    #[test]
    fn sequence_number_next_saturates() {
        assert_eq!(SequenceNumber::ZERO.next(), SequenceNumber::new(1));
        assert_eq!(SequenceNumber::new(u64::MAX).next(), SequenceNumber::new(u64::MAX));
    }

    #[test]
    fn ids_serialize_transparently_enough() {
        let json = serde_json::to_string(&ReplicaId::new(2)).unwrap();
        assert_eq!(json, "2");
        let back: ReplicaId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ReplicaId::new(2));
    }

    proptest! {
        #[test]
        fn prop_digest_display_parse(bytes in any::<[u8; 32]>()) {
            let digest = Digest::from_bytes(bytes);
            prop_assert_eq!(digest.to_string().parse::<Digest>().unwrap(), digest);
        }
    }
}
