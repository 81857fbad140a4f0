//! Inbound message validation and dispatch.
//!
//! Every frame a replica receives passes through [`Router::route_bytes`]:
//!
//! 1. Decode. Undecodable frames are counted and dropped.
//! 2. Authenticate. A signature must verify against the sender; an unsigned
//!    message passes only if its kind is in the configured allow-list.
//! 3. Refresh the sender's liveness and acknowledge `PRE-PREPARE` and
//!    `CLIENT-REQUEST` back to the sender.
//! 4. Dispatch to the owning component.
//!
//! Handler errors are logged here and never reach the transport.

use std::collections::BTreeSet;
use std::sync::Arc;

use tessera_types::ReplicaId;

use crate::client::ClientRequestManager;
use crate::consensus::ConsensusEngine;
use crate::context::ReplicaContext;
use crate::fault_detector::FaultDetector;
use crate::membership::MembershipManager;
use crate::message::{Message, MessageKind, decode_fault_report};
use crate::recovery::FaultRecovery;
use crate::state_sync::StateSynchronizer;
use crate::view_change::{ViewChangeCoordinator, ViewChangeOutcome};
use crate::{Error, Result};

/// Dispatches validated messages to the components of one replica.
#[derive(Debug)]
pub struct Router {
    pub(crate) ctx: ReplicaContext,
    pub(crate) unsigned_allowed: BTreeSet<MessageKind>,
    pub(crate) detector: Arc<FaultDetector>,
    pub(crate) view_change: Arc<ViewChangeCoordinator>,
    pub(crate) recovery: Arc<FaultRecovery>,
    pub(crate) membership: Arc<MembershipManager>,
    pub(crate) clients: Arc<ClientRequestManager>,
    pub(crate) consensus: Arc<ConsensusEngine>,
    pub(crate) synchronizer: Arc<StateSynchronizer>,
}

impl Router {
    /// Decodes and routes one inbound frame. Returns true if it was accepted.
    pub fn route_bytes(&self, frame: &[u8]) -> bool {
        match Message::decode_bytes(frame) {
            Ok(message) => self.route(&message),
            Err(e) => {
                self.ctx.metrics().increment_malformed();
                tracing::warn!(replica = %self.ctx.id(), error = %e, "dropping malformed frame");
                false
            }
        }
    }

    /// Validates and dispatches one message. Returns true if it was accepted.
    pub fn route(&self, message: &Message) -> bool {
        if let Err(e) = self.authenticate(message) {
            self.ctx.metrics().increment_signature_failures();
            tracing::warn!(replica = %self.ctx.id(), kind = %message.kind, error = %e, "dropping unauthenticated message");
            return false;
        }

        self.ctx.metrics().increment_received();
        self.detector.update_timestamp(message.sender);
        tracing::debug!(
            replica = %self.ctx.id(),
            from = %message.sender,
            kind = %message.kind,
            digest = %message.digest,
            "received"
        );

        if message.kind.requires_ack() {
            self.acknowledge(message);
        }

        match self.dispatch(message) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    replica = %self.ctx.id(),
                    from = %message.sender,
                    kind = %message.kind,
                    error = %e,
                    "message rejected"
                );
                false
            }
        }
    }

    fn authenticate(&self, message: &Message) -> Result<()> {
        let reason = match &message.signature {
            Some(_) if message.verify(self.ctx.signatures().as_ref()) => return Ok(()),
            Some(_) => "signature does not match sender".to_string(),
            None if self.unsigned_allowed.contains(&message.kind) => return Ok(()),
            None => format!("unsigned {} is not allowed", message.kind),
        };
        Err(Error::Authentication {
            sender: message.sender,
            reason,
        })
    }

    fn acknowledge(&self, message: &Message) {
        if message.sender == self.ctx.id() {
            // Our own request reached us; nothing travels back
            self.clients.on_ack(self.ctx.id(), &message.digest);
            return;
        }
        let ack = Message::new(MessageKind::Ack, self.ctx.id(), message.digest);
        self.ctx.send_direct(message.sender, ack);
    }

    fn dispatch(&self, message: &Message) -> Result<()> {
        match message.kind {
            MessageKind::PrePrepare => {
                self.require_member(message.sender)?;
                self.consensus.on_pre_prepare(message)
            }
            MessageKind::Prepare => {
                self.require_member(message.sender)?;
                self.consensus.on_prepare(message.sender, message.digest);
                Ok(())
            }
            MessageKind::Commit => {
                self.require_member(message.sender)?;
                self.consensus.on_commit(message.sender, message.digest);
                Ok(())
            }
            MessageKind::ClientRequest => self.consensus.process_client_request(message),
            MessageKind::ViewChange => {
                self.require_member(message.sender)?;
                if let ViewChangeOutcome::QuorumReached(view) = self.view_change.on_message(message)? {
                    tracing::info!(replica = %self.ctx.id(), view = %view, "now in view");
                }
                Ok(())
            }
            MessageKind::StateRequest => self.synchronizer.on_state_request(message).map(drop),
            MessageKind::CheckpointSync => {
                self.synchronizer.on_state_update(message);
                Ok(())
            }
            MessageKind::MembershipUpdate => self.membership.on_message(message).map(drop),
            MessageKind::Ack => {
                self.clients.on_ack(message.sender, &message.digest);
                Ok(())
            }
            MessageKind::FaultDetection => {
                self.require_member(message.sender)?;
                self.on_fault_report(message)
            }
        }
    }

    fn require_member(&self, sender: ReplicaId) -> Result<()> {
        if self.membership.contains(sender) {
            Ok(())
        } else {
            Err(Error::ProtocolViolation(format!("{sender} is not a member")))
        }
    }

    /// A peer's report is only acted on for replicas this replica also
    /// considers unresponsive.
    fn on_fault_report(&self, message: &Message) -> Result<()> {
        let reported = decode_fault_report(message.content_str())?;
        let local = self.detector.detect();
        let confirmed: Vec<ReplicaId> = reported.into_iter().filter(|id| local.contains(id)).collect();
        if confirmed.is_empty() {
            tracing::debug!(from = %message.sender, "fault report not confirmed locally");
            return Ok(());
        }
        tracing::warn!(replica = %self.ctx.id(), from = %message.sender, faulty = ?confirmed, "confirmed fault report");
        self.recovery.perform_system_recovery(&confirmed)
    }
}
