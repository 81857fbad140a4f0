//! SHA-256 hashing and Merkle roots.
//!
//! The Merkle construction is the one state synchronization relies on to
//! compare replica state without transferring it:
//!
//! ```text
//!   level 0:  h0   h1   h2   h3   h4
//!   level 1:  H(h0‖h1)  H(h2‖h3)  h4        <- odd node promoted unchanged
//!   level 2:  H(..‖..)  h4
//!   level 3:  root
//! ```
//!
//! An odd trailing node is carried up as-is rather than paired with a copy
//! of itself, so `[a, b, c]` and `[a, b, c, c]` have different roots.

use sha2::{Digest as _, Sha256};
use tessera_types::Digest;

/// Hashes `data` with SHA-256.
///
/// # Example
/// ```
/// use tessera_crypto::sha256;
///
/// let a = sha256(b"hello world");
/// let b = sha256(b"hello world");
/// assert_eq!(a, b);
/// ```
pub fn sha256(data: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result: [u8; 32] = hasher.finalize().into();
    Digest::from_bytes(result)
}

/// Hashes the UTF-8 bytes of `s`.
pub fn sha256_str(s: &str) -> Digest {
    sha256(s.as_bytes())
}

/// Hashes the concatenation of two nodes.
fn hash_pair(left: &Digest, right: &Digest) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    let result: [u8; 32] = hasher.finalize().into();
    Digest::from_bytes(result)
}

/// Computes the Merkle root over `leaves` in the given order.
///
/// - no leaves: `sha256("")`
/// - one leaf: the leaf itself
/// - otherwise: pairwise hashing level by level, odd node promoted
///
/// Callers that need an order-independent root must sort the leaves first.
pub fn merkle_root(leaves: &[Digest]) -> Digest {
    if leaves.is_empty() {
        return sha256(b"");
    }

    let mut level: Vec<Digest> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            match pair {
                [left, right] => next.push(hash_pair(left, right)),
                [odd] => next.push(*odd),
                _ => unreachable!("chunks(2) yields one or two elements"),
            }
        }
        level = next;
    }

    level[0]
}
