//! The identity and collaborators shared by every component of one replica.

use std::fmt::{self, Debug};
use std::sync::Arc;

use tessera_crypto::SignatureService;
use tessera_types::ReplicaId;

use crate::instrumentation::Metrics;
use crate::message::Message;
use crate::transport::Transport;
use crate::{Error, Result};

/// Explicit replica identity, passed to each component at construction.
///
/// Outbound messages always go through [`ReplicaContext::broadcast`] or
/// [`ReplicaContext::send_direct`], which sign as the local replica before
/// encoding, so no component can send an unsigned frame by accident.
#[derive(Clone)]
pub struct ReplicaContext {
    id: ReplicaId,
    total_replicas: u32,
    transport: Arc<dyn Transport>,
    signatures: Arc<dyn SignatureService>,
    metrics: Arc<Metrics>,
}

impl Debug for ReplicaContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaContext")
            .field("id", &self.id)
            .field("total_replicas", &self.total_replicas)
            .finish_non_exhaustive()
    }
}

impl ReplicaContext {
    pub fn new(
        id: ReplicaId,
        total_replicas: u32,
        transport: Arc<dyn Transport>,
        signatures: Arc<dyn SignatureService>,
    ) -> Result<Self> {
        if total_replicas == 0 {
            return Err(Error::invalid("total_replicas must be at least 1"));
        }
        if id.as_u32() >= total_replicas {
            return Err(Error::invalid(format!(
                "replica id {id} is outside 0..{total_replicas}"
            )));
        }
        Ok(Self {
            id,
            total_replicas,
            transport,
            signatures,
            metrics: Arc::new(Metrics::new()),
        })
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// The configured cluster size `N`.
    pub fn total_replicas(&self) -> u32 {
        self.total_replicas
    }

    /// `f = ⌊(N−1)/3⌋`.
    pub fn max_faulty(&self) -> u32 {
        max_faulty(self.total_replicas)
    }

    /// Agreement threshold `2f+1`.
    pub fn quorum(&self) -> usize {
        agreement_quorum(self.total_replicas)
    }

    pub fn signatures(&self) -> &Arc<dyn SignatureService> {
        &self.signatures
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    fn seal(&self, message: Message) -> Option<Vec<u8>> {
        debug_assert_eq!(message.sender, self.id, "replicas only send as themselves");
        match message.sign(self.signatures.as_ref()) {
            Ok(signed) => Some(signed.encode().into_bytes()),
            Err(e) => {
                tracing::error!(replica = %self.id, error = %e, "failed to sign outbound message");
                None
            }
        }
    }

    /// Signs and broadcasts to every other replica.
    pub fn broadcast(&self, message: Message) {
        let kind = message.kind;
        if let Some(frame) = self.seal(message) {
            tracing::trace!(replica = %self.id, kind = %kind, "broadcast");
            self.transport.broadcast(&frame);
        }
    }

    /// Signs and sends to a single replica.
    pub fn send_direct(&self, to: ReplicaId, message: Message) {
        let kind = message.kind;
        if let Some(frame) = self.seal(message) {
            tracing::trace!(replica = %self.id, to = %to, kind = %kind, "send direct");
            self.transport.send_direct(to, &frame);
        }
    }
}

/// `f = ⌊(N−1)/3⌋`, the number of Byzantine replicas `N` replicas tolerate.
pub fn max_faulty(total_replicas: u32) -> u32 {
    total_replicas.saturating_sub(1) / 3
}

/// `2f+1`, the vote count every agreement phase needs.
pub fn agreement_quorum(total_replicas: u32) -> usize {
    (2 * max_faulty(total_replicas) + 1) as usize
}
