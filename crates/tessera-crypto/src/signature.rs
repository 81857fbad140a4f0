//! Ed25519 signatures and the signature-service seam.
//!
//! Signatures travel on the wire as `hex(R):hex(S)`, the two 32-byte halves
//! of an Ed25519 signature. Verification is strict (RFC 8032 §5.1.7) so a
//! non-canonical encoding of a valid signature is rejected.

use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::str::FromStr;
use std::sync::{PoisonError, RwLock};

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use tessera_types::{ReplicaId, is_lower_hex};

use crate::{CryptoError, Result};

// ============================================================================
// Signature
// ============================================================================

/// An Ed25519 signature.
#[derive(Clone, PartialEq, Eq)]
pub struct Signature {
    inner: ed25519_dalek::Signature,
}

impl Signature {
    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        Self {
            inner: ed25519_dalek::Signature::from_bytes(bytes),
        }
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        self.inner.to_bytes()
    }

    /// Encodes as `hex(R):hex(S)`.
    pub fn to_wire(&self) -> String {
        let bytes = self.to_bytes();
        format!("{}:{}", hex::encode(&bytes[..32]), hex::encode(&bytes[32..]))
    }

    /// Parses the `hex(R):hex(S)` wire form.
    pub fn from_wire(s: &str) -> Result<Self> {
        let (r, s_part) = s
            .split_once(':')
            .ok_or_else(|| CryptoError::MalformedSignature("missing ':' separator".to_string()))?;

        if !is_lower_hex(r) || !is_lower_hex(s_part) {
            return Err(CryptoError::MalformedSignature(
                "components must be lowercase hex".to_string(),
            ));
        }

        let mut bytes = [0u8; 64];
        hex::decode_to_slice(r, &mut bytes[..32])
            .map_err(|e| CryptoError::MalformedSignature(format!("R component: {e}")))?;
        hex::decode_to_slice(s_part, &mut bytes[32..])
            .map_err(|e| CryptoError::MalformedSignature(format!("S component: {e}")))?;

        Ok(Self::from_bytes(&bytes))
    }
}

impl Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bytes = self.to_bytes();
        write!(f, "Signature({}...)", hex::encode(&bytes[..8]))
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_wire())
    }
}

impl FromStr for Signature {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_wire(s)
    }
}

// ============================================================================
// PublicKey
// ============================================================================

/// An Ed25519 verifying key identifying a replica.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    inner: VerifyingKey,
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let inner = VerifyingKey::from_bytes(bytes)
            .map_err(|e| CryptoError::MalformedPublicKey(e.to_string()))?;
        Ok(Self { inner })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        if !is_lower_hex(s) {
            return Err(CryptoError::MalformedPublicKey("key must be lowercase hex".to_string()));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| CryptoError::MalformedPublicKey(e.to_string()))?;
        Self::from_bytes(&bytes)
    }

    /// Strictly verifies `signature` over `data`.
    pub fn verify(&self, data: &[u8], signature: &Signature) -> bool {
        self.inner.verify_strict(data, &signature.inner).is_ok()
    }
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// ============================================================================
// Signature Service
// ============================================================================

/// Signing and verification on behalf of replica identities.
///
/// The replication core only ever talks to this trait, so deployments can
/// back it with an HSM, a remote signer, or the in-process [`KeyRing`].
pub trait SignatureService: Send + Sync {
    /// Signs `data` as `signer`.
    fn sign(&self, signer: ReplicaId, data: &[u8]) -> Result<Signature>;

    /// Returns true if `signature` over `data` was produced by
    /// `claimed_signer`. Unknown signers never verify.
    fn verify(&self, signature: &Signature, data: &[u8], claimed_signer: ReplicaId) -> bool;

    /// Returns the public key of `replica`, if known.
    fn public_key_of(&self, replica: ReplicaId) -> Option<PublicKey>;

    /// Records the public key announced for `replica`.
    fn register_public_key(&self, replica: ReplicaId, key: PublicKey);
}

// ============================================================================
// KeyRing
// ============================================================================

#[derive(Default)]
struct KeyRingInner {
    signing: HashMap<ReplicaId, SigningKey>,
    verifying: HashMap<ReplicaId, VerifyingKey>,
}

/// Thread-safe Ed25519 [`SignatureService`].
///
/// Two modes:
/// - [`KeyRing::shared`]: generates a key pair the first time an id is
///   used. Every replica of an in-process cluster shares one ring, so every
///   replica can verify every other.
/// - [`KeyRing::for_replica`]: holds exactly one signing key; peers' keys
///   must be registered before their messages verify.
pub struct KeyRing {
    inner: RwLock<KeyRingInner>,
    generate_missing: bool,
}

// Key material never appears in logs
impl Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("KeyRing")
            .field("signing_keys", &"<redacted>")
            .field("local_ids", &inner.signing.keys().collect::<Vec<_>>())
            .field("known_peers", &inner.verifying.len())
            .field("generate_missing", &self.generate_missing)
            .finish()
    }
}

impl KeyRing {
    /// Creates a ring that lazily generates keys for any replica id.
    pub fn shared() -> Self {
        Self {
            inner: RwLock::new(KeyRingInner::default()),
            generate_missing: true,
        }
    }

    /// Creates a ring holding the signing key of a single replica.
    pub fn for_replica(replica: ReplicaId, seed: &[u8; 32]) -> Self {
        let mut inner = KeyRingInner::default();
        inner.signing.insert(replica, SigningKey::from_bytes(seed));
        Self {
            inner: RwLock::new(inner),
            generate_missing: false,
        }
    }

    fn signing_key(&self, replica: ReplicaId) -> Option<SigningKey> {
        {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(key) = inner.signing.get(&replica) {
                return Some(key.clone());
            }
        }

        if !self.generate_missing {
            return None;
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        // Another thread may have generated it between the two locks
        let key = inner
            .signing
            .entry(replica)
            .or_insert_with(|| {
                tracing::debug!(replica = %replica, "generated signing key");
                SigningKey::generate(&mut OsRng)
            })
            .clone();
        Some(key)
    }

    fn verifying_key(&self, replica: ReplicaId) -> Option<VerifyingKey> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .verifying
            .get(&replica)
            .copied()
            .or_else(|| inner.signing.get(&replica).map(SigningKey::verifying_key))
    }
}

impl SignatureService for KeyRing {
    fn sign(&self, signer: ReplicaId, data: &[u8]) -> Result<Signature> {
        let key = self
            .signing_key(signer)
            .ok_or(CryptoError::NoSigningKey(signer))?;
        Ok(Signature {
            inner: key.sign(data),
        })
    }

    fn verify(&self, signature: &Signature, data: &[u8], claimed_signer: ReplicaId) -> bool {
        match self.verifying_key(claimed_signer) {
            Some(key) => key.verify_strict(data, &signature.inner).is_ok(),
            None => {
                tracing::debug!(replica = %claimed_signer, "no public key for claimed signer");
                false
            }
        }
    }

    fn public_key_of(&self, replica: ReplicaId) -> Option<PublicKey> {
        if let Some(inner) = self.verifying_key(replica) {
            return Some(PublicKey { inner });
        }
        self.signing_key(replica).map(|key| PublicKey {
            inner: key.verifying_key(),
        })
    }

    fn register_public_key(&self, replica: ReplicaId, key: PublicKey) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(local) = inner.signing.get(&replica) {
            if local.verifying_key() != key.inner {
                tracing::warn!(
                    replica = %replica,
                    "ignoring announced key that conflicts with local signing key"
                );
                return;
            }
        }

        inner.verifying.insert(replica, key.inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: [u8; 32] = [7u8; 32];

    #[test]
    fn shared_ring_signs_and_verifies() {
        let ring = KeyRing::shared();
        let signer = ReplicaId::new(2);

        let sig = ring.sign(signer, b"payload").unwrap();
        assert!(ring.verify(&sig, b"payload", signer));
        assert!(!ring.verify(&sig, b"tampered", signer));
        assert!(!ring.verify(&sig, b"payload", ReplicaId::new(3)));
    }

    #[test]
    fn single_replica_ring_cannot_sign_for_others() {
        let ring = KeyRing::for_replica(ReplicaId::new(0), &SEED);
        assert!(ring.sign(ReplicaId::new(0), b"x").is_ok());
        assert_eq!(
            ring.sign(ReplicaId::new(1), b"x"),
            Err(CryptoError::NoSigningKey(ReplicaId::new(1)))
        );
        assert!(ring.public_key_of(ReplicaId::new(1)).is_none());
    }

    #[test]
    fn registered_peer_key_verifies() {
        let peer = KeyRing::for_replica(ReplicaId::new(1), &[9u8; 32]);
        let local = KeyRing::for_replica(ReplicaId::new(0), &SEED);

        let sig = peer.sign(ReplicaId::new(1), b"hello").unwrap();
        assert!(!local.verify(&sig, b"hello", ReplicaId::new(1)));

        let key = peer.public_key_of(ReplicaId::new(1)).unwrap();
        local.register_public_key(ReplicaId::new(1), key);
        assert!(local.verify(&sig, b"hello", ReplicaId::new(1)));
    }

    #[test]
    fn conflicting_registration_for_local_id_is_ignored() {
        let ring = KeyRing::for_replica(ReplicaId::new(0), &SEED);
        let other = KeyRing::for_replica(ReplicaId::new(0), &[3u8; 32]);

        ring.register_public_key(
            ReplicaId::new(0),
            other.public_key_of(ReplicaId::new(0)).unwrap(),
        );

        let sig = ring.sign(ReplicaId::new(0), b"m").unwrap();
        assert!(ring.verify(&sig, b"m", ReplicaId::new(0)));
    }

    #[test]
    fn public_key_lookup_generates_lazily() {
        let ring = KeyRing::shared();
        let first = ring.public_key_of(ReplicaId::new(5)).unwrap();
        let second = ring.public_key_of(ReplicaId::new(5)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn signature_wire_round_trip() {
        let ring = KeyRing::for_replica(ReplicaId::new(0), &SEED);
        let sig = ring.sign(ReplicaId::new(0), b"wire").unwrap();

        let wire = sig.to_wire();
        let (r, s) = wire.split_once(':').unwrap();
        assert_eq!(r.len(), 64);
        assert_eq!(s.len(), 64);
        assert_eq!(Signature::from_wire(&wire).unwrap(), sig);
    }

    #[test]
    fn malformed_signature_wire_is_rejected() {
        assert!(Signature::from_wire("abcd").is_err());
        assert!(Signature::from_wire("zz:yy").is_err());
        assert!(Signature::from_wire(&format!("{}:{}", "00".repeat(32), "00".repeat(31))).is_err());
    }

    #[test]
    fn uppercase_hex_is_rejected() {
        let ring = KeyRing::for_replica(ReplicaId::new(0), &SEED);
        let sig = ring.sign(ReplicaId::new(0), b"wire").unwrap();
        let wire = sig.to_wire();
        assert!(Signature::from_wire(&wire.to_uppercase()).is_err());
        let (r, s) = wire.split_once(':').unwrap();
        assert!(Signature::from_wire(&format!("{r}:{}", s.to_uppercase())).is_err());

        let key = ring.public_key_of(ReplicaId::new(0)).unwrap();
        assert!(PublicKey::from_hex(&key.to_hex().to_uppercase()).is_err());
    }

    #[test]
    fn public_key_hex_round_trip() {
        let ring = KeyRing::for_replica(ReplicaId::new(0), &SEED);
        let key = ring.public_key_of(ReplicaId::new(0)).unwrap();
        assert_eq!(PublicKey::from_hex(&key.to_hex()).unwrap(), key);
    }

    #[test]
    fn debug_redacts_key_material() {
        let ring = KeyRing::for_replica(ReplicaId::new(0), &SEED);
        let debug = format!("{ring:?}");
        assert!(debug.contains("<redacted>"));
    }
}
