//! Sequence-indexed snapshots of replicated state.
//!
//! Checkpoints live in memory only. `latest_stable_sequence` is the highest
//! sequence ever checkpointed; everything below it may be pruned.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock};

use tessera_crypto::{merkle_root, sha256_str};
use tessera_types::{Digest, SequenceNumber};

use crate::{Error, Result};

/// An immutable copy of the replicated state: a set of values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateSnapshot {
    values: BTreeSet<String>,
}

impl StateSnapshot {
    pub fn new(values: impl IntoIterator<Item = String>) -> Self {
        Self {
            values: values.into_iter().collect(),
        }
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(String::as_str)
    }

    pub fn contains(&self, value: &str) -> bool {
        self.values.contains(value)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Merkle root over the sorted hashes of the values.
    pub fn root(&self) -> Digest {
        state_root(self.values())
    }
}

/// Merkle root of a set of state values: each value is hashed, the hashes
/// are sorted, and the root is taken over the sorted list. Independent of
/// the order the values are given in.
pub fn state_root<'a>(values: impl IntoIterator<Item = &'a str>) -> Digest {
    let mut leaves: Vec<Digest> = values.into_iter().map(sha256_str).collect();
    leaves.sort_unstable();
    merkle_root(&leaves)
}

#[derive(Debug, Default)]
struct StoreInner {
    checkpoints: BTreeMap<SequenceNumber, StateSnapshot>,
    latest_stable: SequenceNumber,
}

/// In-memory checkpoint store.
#[derive(Debug, Default)]
pub struct CheckpointStore {
    inner: RwLock<StoreInner>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `state` at `sequence`. Sequence zero is rejected.
    pub fn create(&self, sequence: SequenceNumber, state: StateSnapshot) -> Result<()> {
        if sequence.is_zero() {
            return Err(Error::invalid("checkpoint sequence must be positive"));
        }

        let root = state.root();
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.checkpoints.insert(sequence, state);
        inner.latest_stable = inner.latest_stable.max(sequence);
        tracing::info!(
            sequence = %sequence,
            root = %root,
            latest_stable = %inner.latest_stable,
            "checkpoint created"
        );
        Ok(())
    }

    pub fn get(&self, sequence: SequenceNumber) -> Option<StateSnapshot> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .checkpoints
            .get(&sequence)
            .cloned()
    }

    /// Returns true if the local checkpoint at `sequence` has root `remote_root`.
    pub fn verify(&self, sequence: SequenceNumber, remote_root: &Digest) -> bool {
        let Some(state) = self.get(sequence) else {
            tracing::warn!(sequence = %sequence, "no local checkpoint to verify against");
            return false;
        };
        let local = state.root();
        if local != *remote_root {
            tracing::warn!(
                sequence = %sequence,
                local = %local,
                remote = %remote_root,
                "checkpoint root mismatch"
            );
            return false;
        }
        true
    }

    /// Removes every checkpoint below the latest stable sequence.
    /// Returns the number removed.
    pub fn prune(&self) -> usize {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let stable = inner.latest_stable;
        let keep = inner.checkpoints.split_off(&stable);
        let removed = inner.checkpoints.len();
        inner.checkpoints = keep;
        if removed > 0 {
            tracing::debug!(removed, latest_stable = %inner.latest_stable, "pruned checkpoints");
        }
        removed
    }

    pub fn latest_stable_sequence(&self) -> SequenceNumber {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .latest_stable
    }

    /// The highest checkpoint, if any.
    pub fn latest(&self) -> Option<(SequenceNumber, StateSnapshot)> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .checkpoints
            .last_key_value()
            .map(|(seq, state)| (*seq, state.clone()))
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .checkpoints
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
