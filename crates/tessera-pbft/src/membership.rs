//! Dynamic replica membership.
//!
//! Membership maps replica ids to their announced public keys. A change is
//! proposed locally with [`MembershipManager::add_node`] or
//! [`MembershipManager::remove_node`] and broadcast as `MEMBERSHIP-UPDATE`.
//! Each announcement is one member's vote; a change takes effect once
//! [`MembershipManager::quorum_size`] distinct current members have voted
//! for it. Updates from non-members are rejected and duplicate votes are
//! ignored, so one replica alone can never add or remove a member.
//!
//! The quorum is derived from the configured replica count passed at
//! construction, not from the live membership size. This keeps the quorum
//! fixed while a change is in flight; it also means a shrunk membership
//! still needs the original quorum.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tessera_crypto::PublicKey;
use tessera_types::ReplicaId;

use crate::context::ReplicaContext;
use crate::fault_detector::FaultDetector;
use crate::message::{MembershipChange, Message, MessageKind};
use crate::{Error, Result};

/// A member and its public key, if one has been announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipEntry {
    pub id: ReplicaId,
    pub public_key: Option<PublicKey>,
}

/// Result of counting one vote for a membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipOutcome {
    /// The change is already in effect.
    Unchanged,
    /// Votes counted so far, below the quorum.
    Pending { votes: usize },
    Applied,
}

#[derive(Debug)]
pub struct MembershipManager {
    ctx: ReplicaContext,
    configured_total: u32,
    members: RwLock<BTreeMap<ReplicaId, Option<PublicKey>>>,
    /// Voters per proposed change, keyed by the change's wire form.
    proposals: Mutex<BTreeMap<String, BTreeSet<ReplicaId>>>,
    detector: Arc<FaultDetector>,
}

impl MembershipManager {
    /// Starts with every configured replica as a member, using whatever keys
    /// the signature service already knows.
    pub fn new(ctx: ReplicaContext, detector: Arc<FaultDetector>) -> Self {
        let configured_total = ctx.total_replicas();
        let members = (0..configured_total)
            .map(ReplicaId::new)
            .map(|id| (id, ctx.signatures().public_key_of(id)))
            .collect();
        Self {
            ctx,
            configured_total,
            members: RwLock::new(members),
            proposals: Mutex::new(BTreeMap::new()),
            detector,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<ReplicaId, Option<PublicKey>>> {
        self.members.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<ReplicaId, Option<PublicKey>>> {
        self.members.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn proposals(&self) -> MutexGuard<'_, BTreeMap<String, BTreeSet<ReplicaId>>> {
        self.proposals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `⌊2·configured_total/3⌋+1`.
    pub fn quorum_size(&self) -> usize {
        (2 * self.configured_total / 3 + 1) as usize
    }

    pub fn contains(&self, id: ReplicaId) -> bool {
        self.read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn members(&self) -> Vec<MembershipEntry> {
        self.read()
            .iter()
            .map(|(id, key)| MembershipEntry {
                id: *id,
                public_key: key.clone(),
            })
            .collect()
    }

    pub fn public_key(&self, id: ReplicaId) -> Option<PublicKey> {
        self.read().get(&id).cloned().flatten()
    }

    /// Changes that have votes but no quorum yet.
    pub fn pending_proposals(&self) -> usize {
        self.proposals().len()
    }

    /// Votes to add `id` and broadcasts the vote.
    pub fn add_node(&self, id: ReplicaId, public_key: PublicKey) -> Result<MembershipOutcome> {
        self.propose(MembershipChange::Add { id, key: public_key })
    }

    /// Votes to remove `id` and broadcasts the vote.
    ///
    /// Removing the last member is rejected once the vote reaches quorum.
    pub fn remove_node(&self, id: ReplicaId) -> Result<MembershipOutcome> {
        self.propose(MembershipChange::Remove { id })
    }

    /// Counts `sender`'s vote for a change announced by a peer.
    pub fn on_update(&self, sender: ReplicaId, change: &MembershipChange) -> Result<MembershipOutcome> {
        if !self.contains(sender) {
            return Err(Error::ProtocolViolation(format!(
                "membership update from non-member {sender}"
            )));
        }
        self.vote(sender, change).map(|(outcome, _)| outcome)
    }

    /// Handles an inbound `MEMBERSHIP-UPDATE`.
    pub fn on_message(&self, message: &Message) -> Result<MembershipOutcome> {
        let change: MembershipChange = message.content_str().parse()?;
        self.on_update(message.sender, &change)
    }

    fn propose(&self, change: MembershipChange) -> Result<MembershipOutcome> {
        let me = self.ctx.id();
        if !self.contains(me) {
            return Err(Error::ProtocolViolation(format!(
                "{me} is not a member and cannot propose changes"
            )));
        }
        let (outcome, fresh) = self.vote(me, &change)?;
        if fresh {
            self.announce(&change)?;
        }
        Ok(outcome)
    }

    /// Records one vote. The flag is false when the vote was already counted
    /// or the change is already in effect.
    fn vote(&self, voter: ReplicaId, change: &MembershipChange) -> Result<(MembershipOutcome, bool)> {
        let key = change.to_string();
        if self.in_effect(change) {
            self.proposals().remove(&key);
            tracing::debug!(node = %change.id(), change = %key, "membership change already in effect");
            return Ok((MembershipOutcome::Unchanged, false));
        }

        let quorum = self.quorum_size();
        let (votes, fresh) = {
            let mut proposals = self.proposals();
            let voters = proposals.entry(key.clone()).or_default();
            let fresh = voters.insert(voter);
            let members = self.read();
            voters.retain(|id| members.contains_key(id));
            let votes = voters.len();
            if votes >= quorum {
                proposals.remove(&key);
            }
            (votes, fresh)
        };
        tracing::debug!(voter = %voter, change = %key, votes, quorum, "membership vote");
        if votes < quorum {
            return Ok((MembershipOutcome::Pending { votes }, fresh));
        }

        self.apply(change)?;
        Ok((MembershipOutcome::Applied, fresh))
    }

    fn in_effect(&self, change: &MembershipChange) -> bool {
        match change {
            MembershipChange::Add { id, .. } => self.contains(*id),
            MembershipChange::Remove { id } => !self.contains(*id),
        }
    }

    fn apply(&self, change: &MembershipChange) -> Result<()> {
        match change {
            MembershipChange::Add { id, key } => {
                self.write().insert(*id, Some(key.clone()));
                self.ctx.signatures().register_public_key(*id, key.clone());
                self.detector.monitor(*id);
                tracing::info!(replica = %self.ctx.id(), node = %id, "member added");
            }
            MembershipChange::Remove { id } => {
                {
                    let mut members = self.write();
                    if members.len() == 1 && members.contains_key(id) {
                        return Err(Error::invalid(format!(
                            "cannot remove {id}, the last member"
                        )));
                    }
                    members.remove(id);
                }
                self.detector.unmonitor(*id);
                tracing::info!(replica = %self.ctx.id(), node = %id, "member removed");
            }
        }
        Ok(())
    }

    fn announce(&self, change: &MembershipChange) -> Result<()> {
        let message = Message::control(MessageKind::MembershipUpdate, self.ctx.id(), change.to_string())?;
        self.ctx.broadcast(message);
        Ok(())
    }
}
