//! State reconciliation by Merkle root comparison.
//!
//! ```text
//! Lagging ──STATE-REQUEST(seq:root)──► All
//!                                        │ root differs from mine
//! Lagging ◄──CHECKPOINT-SYNC(root:v1,v2,..)─┘
//!   recompute root over values, reject on mismatch,
//!   merge (never overwrite), checkpoint at latest_stable+1
//! ```
//!
//! Replicated state is a set of values keyed by their own hash, so merging
//! is an idempotent union and roots only depend on the set, not on the order
//! values arrived in.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use tessera_crypto::{merkle_root, sha256_str};
use tessera_types::{Digest, SequenceNumber};

use crate::checkpoint::{CheckpointStore, StateSnapshot, state_root};
use crate::context::ReplicaContext;
use crate::message::{Message, MessageKind, StateRequest, StateUpdate};
use crate::{Error, Result};

/// Characters that would break the `root:v1,v2` framing.
const RESERVED: [char; 3] = [',', ':', '|'];

#[derive(Debug)]
pub struct StateSynchronizer {
    ctx: ReplicaContext,
    checkpoints: Arc<CheckpointStore>,
    state: RwLock<BTreeMap<Digest, String>>,
}

impl StateSynchronizer {
    pub fn new(ctx: ReplicaContext, checkpoints: Arc<CheckpointStore>) -> Self {
        Self {
            ctx,
            checkpoints,
            state: RwLock::new(BTreeMap::new()),
        }
    }

    fn validate_value(value: &str) -> Result<()> {
        if value.is_empty() {
            return Err(Error::invalid("state value must not be empty"));
        }
        if value.contains(RESERVED) {
            return Err(Error::invalid(format!(
                "state value {value:?} contains a reserved character"
            )));
        }
        Ok(())
    }

    /// Adds a local value. Returns false if it was already present.
    pub fn record(&self, value: impl Into<String>) -> Result<bool> {
        let value = value.into();
        Self::validate_value(&value)?;
        let key = sha256_str(&value);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.contains_key(&key) {
            return Ok(false);
        }
        state.insert(key, value);
        Ok(true)
    }

    pub fn contains(&self, value: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&sha256_str(value))
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::new(
            self.state
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .cloned(),
        )
    }

    /// Merkle root over the sorted value hashes.
    pub fn local_root(&self) -> Digest {
        // Keys are the value hashes, already sorted
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let leaves: Vec<Digest> = state.keys().copied().collect();
        merkle_root(&leaves)
    }

    /// Broadcasts a `STATE-REQUEST` carrying the local root at `sequence`.
    pub fn synchronize(&self, sequence: SequenceNumber) -> Result<()> {
        let request = StateRequest {
            sequence,
            root: self.local_root(),
        };
        tracing::debug!(
            replica = %self.ctx.id(),
            sequence = %sequence,
            root = %request.root,
            "requesting state synchronization"
        );
        let message = Message::control(MessageKind::StateRequest, self.ctx.id(), request.to_string())?;
        self.ctx.broadcast(message);
        Ok(())
    }

    /// Answers a peer's `STATE-REQUEST` when its root differs from ours.
    /// Returns true if an update was sent.
    pub fn on_state_request(&self, message: &Message) -> Result<bool> {
        let request: StateRequest = message.content_str().parse()?;

        let (root, values) = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            let leaves: Vec<Digest> = state.keys().copied().collect();
            (merkle_root(&leaves), state.values().cloned().collect::<Vec<_>>())
        };

        if values.is_empty() || root == request.root {
            tracing::trace!(
                from = %message.sender,
                sequence = %request.sequence,
                "state request needs no answer"
            );
            return Ok(false);
        }

        let update = StateUpdate { root, values };
        tracing::debug!(
            to = %message.sender,
            sequence = %request.sequence,
            values = update.values.len(),
            "answering state request"
        );
        let reply = Message::control(MessageKind::CheckpointSync, self.ctx.id(), update.to_string())?;
        self.ctx.send_direct(message.sender, reply);
        Ok(true)
    }

    /// Applies a peer's state update after verifying its root.
    ///
    /// Returns false, leaving local state untouched, if the content does not
    /// parse or the values do not hash to the claimed root.
    pub fn on_state_update(&self, message: &Message) -> bool {
        let update = match message.content_str().parse::<StateUpdate>() {
            Ok(update) => update,
            Err(e) => {
                tracing::warn!(from = %message.sender, error = %e, "unparsable state update");
                self.ctx.metrics().increment_state_updates_rejected();
                return false;
            }
        };

        if let Some(bad) = update.values.iter().find(|v| Self::validate_value(v).is_err()) {
            tracing::warn!(from = %message.sender, value = %bad, "state update carries invalid value");
            self.ctx.metrics().increment_state_updates_rejected();
            return false;
        }

        let computed = state_root(update.values.iter().map(String::as_str));
        if computed != update.root {
            tracing::warn!(
                from = %message.sender,
                claimed = %update.root,
                computed = %computed,
                "state update root mismatch"
            );
            self.ctx.metrics().increment_state_updates_rejected();
            return false;
        }

        let added = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let before = state.len();
            for value in update.values {
                state.entry(sha256_str(&value)).or_insert(value);
            }
            state.len() - before
        };

        let sequence = self.checkpoints.latest_stable_sequence().next();
        match self.checkpoints.create(sequence, self.snapshot()) {
            Ok(()) => self.ctx.metrics().increment_checkpoints(),
            Err(e) => tracing::error!(sequence = %sequence, error = %e, "checkpoint after sync failed"),
        }

        self.ctx.metrics().increment_state_updates_accepted();
        tracing::info!(
            replica = %self.ctx.id(),
            from = %message.sender,
            added,
            sequence = %sequence,
            "state update applied"
        );
        true
    }
}
