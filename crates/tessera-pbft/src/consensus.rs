//! Three-phase PBFT agreement.
//!
//! Each digest moves through `Unseen → Prepared → Committed → Executed`:
//!
//! ```text
//! Primary ──PRE-PREPARE(d, payload)──► All
//! All ─────PREPARE(d)────────────────► All    2f+1 distinct votes + payload → prepared
//! All ─────COMMIT(d)─────────────────► All    2f+1 distinct votes → committed → execute
//! ```
//!
//! PREPARE votes are counted whenever they arrive, even before the
//! PRE-PREPARE, but a digest only becomes prepared once its payload is
//! known. COMMIT votes for a digest that is not yet prepared are buffered
//! and counted at the moment it prepares, so a commit can never be counted
//! ahead of its prepare.
//!
//! All state sits behind one mutex that is released before any message is
//! sent or the application runs.
//!
//! Per-request state is discarded when a checkpoint covers the request.
//! From then on the synchronized state set answers whether a digest already
//! executed, and late votes for it are dropped. A member may hold votes for
//! at most [`MAX_UNORDERED_VOTES`] digests that have no `PRE-PREPARE` yet;
//! further votes from it are dropped until some of those digests are ordered.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tessera_crypto::sha256_str;
use tessera_types::{Digest, ReplicaId, SequenceNumber, ViewNumber};

use crate::application::Application;
use crate::checkpoint::CheckpointStore;
use crate::client::ClientRequestManager;
use crate::context::ReplicaContext;
use crate::election::PrimaryElection;
use crate::message::{Message, MessageKind};
use crate::state_sync::StateSynchronizer;
use crate::{Error, Result};

/// Digests one member may vote for before their `PRE-PREPARE` arrives.
pub const MAX_UNORDERED_VOTES: usize = 256;

#[derive(Debug, Default)]
struct ConsensusState {
    /// Request payloads by digest, learned from PRE-PREPARE or a client.
    payloads: HashMap<Digest, String>,
    prepare_votes: HashMap<Digest, BTreeSet<ReplicaId>>,
    commit_votes: HashMap<Digest, BTreeSet<ReplicaId>>,
    /// COMMIT votes received before the digest prepared.
    buffered_commits: HashMap<Digest, BTreeSet<ReplicaId>>,
    /// Digests this replica already voted PREPARE / COMMIT for.
    prepare_sent: HashSet<Digest>,
    commit_sent: HashSet<Digest>,
    prepared: HashSet<Digest>,
    committed: HashSet<Digest>,
    executed: HashSet<Digest>,
    committed_count: u64,
    executed_count: u64,
    /// Executed digests not yet covered by a checkpoint.
    uncheckpointed: Vec<Digest>,
    /// Requests already forwarded to the primary of a view.
    forwarded: HashSet<(Digest, ViewNumber)>,
}

impl ConsensusState {
    /// Whether a vote from `from` for `digest` fits its unordered quota.
    fn admits_vote(&self, from: ReplicaId, digest: &Digest) -> bool {
        if self.payloads.contains_key(digest) {
            return true;
        }
        let voted = |votes: &HashMap<Digest, BTreeSet<ReplicaId>>| {
            votes
                .iter()
                .filter(|(d, voters)| !self.payloads.contains_key(*d) && voters.contains(&from))
                .count()
        };
        voted(&self.prepare_votes) + voted(&self.buffered_commits) < MAX_UNORDERED_VOTES
    }

    /// Drops everything held for digests a checkpoint now covers, along with
    /// forwarding marks from earlier views.
    fn discard_checkpointed(&mut self, view: ViewNumber) -> usize {
        let done: HashSet<Digest> = self.uncheckpointed.drain(..).collect();
        for digest in &done {
            self.payloads.remove(digest);
            self.prepare_votes.remove(digest);
            self.commit_votes.remove(digest);
            self.buffered_commits.remove(digest);
            self.prepare_sent.remove(digest);
            self.commit_sent.remove(digest);
            self.prepared.remove(digest);
            self.committed.remove(digest);
            self.executed.remove(digest);
        }
        self.forwarded
            .retain(|(digest, forwarded_in)| *forwarded_in == view && !done.contains(digest));
        done.len()
    }

    /// Marks `digest` prepared if it holds a quorum and a payload.
    /// Buffered commit votes become countable at that point.
    fn try_prepare(&mut self, digest: Digest, quorum: usize) -> bool {
        if self.prepared.contains(&digest) || !self.payloads.contains_key(&digest) {
            return false;
        }
        let votes = self.prepare_votes.get(&digest).map_or(0, BTreeSet::len);
        if votes < quorum {
            return false;
        }
        self.prepared.insert(digest);
        self.prepare_votes.remove(&digest);
        if let Some(buffered) = self.buffered_commits.remove(&digest) {
            self.commit_votes.entry(digest).or_default().extend(buffered);
        }
        true
    }

    fn try_commit(&mut self, digest: Digest, quorum: usize) -> bool {
        if self.committed.contains(&digest) || !self.prepared.contains(&digest) {
            return false;
        }
        let votes = self.commit_votes.get(&digest).map_or(0, BTreeSet::len);
        if votes < quorum {
            return false;
        }
        self.committed.insert(digest);
        self.committed_count += 1;
        self.commit_votes.remove(&digest);
        true
    }
}

/// The PBFT engine of one replica.
pub struct ConsensusEngine {
    ctx: ReplicaContext,
    election: Arc<PrimaryElection>,
    synchronizer: Arc<StateSynchronizer>,
    checkpoints: Arc<CheckpointStore>,
    clients: Arc<ClientRequestManager>,
    application: Arc<dyn Application>,
    checkpoint_interval: u64,
    state: Mutex<ConsensusState>,
}

impl std::fmt::Debug for ConsensusEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ConsensusEngine")
            .field("replica", &self.ctx.id())
            .field("prepared", &state.prepared.len())
            .field("committed", &state.committed_count)
            .field("executed", &state.executed_count)
            .finish_non_exhaustive()
    }
}

impl ConsensusEngine {
    pub fn new(
        ctx: ReplicaContext,
        election: Arc<PrimaryElection>,
        synchronizer: Arc<StateSynchronizer>,
        checkpoints: Arc<CheckpointStore>,
        clients: Arc<ClientRequestManager>,
        application: Arc<dyn Application>,
        checkpoint_interval: u64,
    ) -> Result<Self> {
        if checkpoint_interval == 0 {
            return Err(Error::invalid("checkpoint interval must be positive"));
        }
        Ok(Self {
            ctx,
            election,
            synchronizer,
            checkpoints,
            clients,
            application,
            checkpoint_interval,
            state: Mutex::new(ConsensusState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ConsensusState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn quorum(&self) -> usize {
        self.ctx.quorum()
    }

    /// Executed and covered by a checkpoint, or learned through state sync.
    fn is_settled(&self, digest: &Digest) -> bool {
        self.synchronizer.contains(&digest.to_hex())
    }

    // ========================================================================
    // Client requests
    // ========================================================================

    /// Handles a `CLIENT-REQUEST`.
    ///
    /// The primary starts agreement unless the digest already committed. A
    /// backup forwards the request to the current primary, once per view.
    pub fn process_client_request(&self, message: &Message) -> Result<()> {
        let payload = message.content_str();
        if sha256_str(payload) != message.digest {
            return Err(Error::ProtocolViolation(format!(
                "client request from {} does not hash to {}",
                message.sender, message.digest
            )));
        }

        let digest = message.digest;
        if self.election.is_primary(self.ctx.id()) {
            if self.is_committed(&digest) {
                tracing::debug!(digest = %digest, "client request already committed");
                return Ok(());
            }
            return self.pre_prepare(digest, payload);
        }

        let view = self.election.current_view();
        let primary = self.election.primary();
        if !self.lock().forwarded.insert((digest, view)) {
            tracing::trace!(digest = %digest, view = %view, "request already forwarded in this view");
            return Ok(());
        }
        tracing::debug!(replica = %self.ctx.id(), primary = %primary, digest = %digest, "forwarding client request");
        let forward = Message::new(MessageKind::ClientRequest, self.ctx.id(), digest).with_content(payload)?;
        self.ctx.send_direct(primary, forward);
        Ok(())
    }

    // ========================================================================
    // Pre-prepare
    // ========================================================================

    /// Orders `payload`: broadcasts the PRE-PREPARE when primary, then
    /// prepares locally in every case.
    pub fn pre_prepare(&self, digest: Digest, payload: &str) -> Result<()> {
        if sha256_str(payload) != digest {
            return Err(Error::invalid(format!("payload does not hash to {digest}")));
        }
        if self.is_settled(&digest) {
            tracing::debug!(digest = %digest, "request already executed");
            return Ok(());
        }
        {
            let mut state = self.lock();
            if state.committed.contains(&digest) {
                return Ok(());
            }
            state.payloads.entry(digest).or_insert_with(|| payload.to_string());
        }

        if self.election.is_primary(self.ctx.id()) {
            tracing::debug!(replica = %self.ctx.id(), digest = %digest, "pre-prepare");
            let message = Message::new(MessageKind::PrePrepare, self.ctx.id(), digest).with_content(payload)?;
            self.ctx.broadcast(message);
        }
        self.prepare(digest);
        Ok(())
    }

    /// Handles an inbound `PRE-PREPARE`. Only the current primary may send
    /// one, and its content must hash to the digest.
    pub fn on_pre_prepare(&self, message: &Message) -> Result<()> {
        let primary = self.election.primary();
        if message.sender != primary {
            return Err(Error::ProtocolViolation(format!(
                "pre-prepare from {} but the primary is {primary}",
                message.sender
            )));
        }
        let payload = message.content_str();
        if sha256_str(payload) != message.digest {
            return Err(Error::ProtocolViolation(format!(
                "pre-prepare content does not hash to {}",
                message.digest
            )));
        }
        self.pre_prepare(message.digest, payload)
    }

    // ========================================================================
    // Prepare
    // ========================================================================

    /// Votes PREPARE for `digest`. No-op once prepared.
    pub fn prepare(&self, digest: Digest) {
        let quorum = self.quorum();
        let (vote, prepared) = {
            let mut state = self.lock();
            if state.prepared.contains(&digest) {
                return;
            }
            let vote = state.prepare_sent.insert(digest);
            if vote {
                state.prepare_votes.entry(digest).or_default().insert(self.ctx.id());
            }
            (vote, state.try_prepare(digest, quorum))
        };

        if vote {
            self.ctx.metrics().increment_prepares_sent();
            self.ctx.broadcast(Message::new(MessageKind::Prepare, self.ctx.id(), digest));
        }
        if prepared {
            self.on_prepared(digest);
        }
    }

    /// Counts `from`'s PREPARE vote.
    pub fn on_prepare(&self, from: ReplicaId, digest: Digest) {
        if self.is_settled(&digest) {
            tracing::trace!(from = %from, digest = %digest, "prepare vote for executed request");
            return;
        }
        let quorum = self.quorum();
        let prepared = {
            let mut state = self.lock();
            if state.prepared.contains(&digest) {
                return;
            }
            if !state.admits_vote(from, &digest) {
                tracing::warn!(from = %from, digest = %digest, "too many unordered votes, prepare dropped");
                return;
            }
            let voters = state.prepare_votes.entry(digest).or_default();
            if !voters.insert(from) {
                tracing::trace!(from = %from, digest = %digest, "duplicate prepare vote");
                return;
            }
            tracing::debug!(from = %from, digest = %digest, votes = voters.len(), quorum, "prepare vote");
            state.try_prepare(digest, quorum)
        };
        if prepared {
            self.on_prepared(digest);
        }
    }

    fn on_prepared(&self, digest: Digest) {
        self.ctx.metrics().increment_prepared();
        tracing::info!(replica = %self.ctx.id(), digest = %digest, "prepared");
        self.commit(digest);
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Votes COMMIT for `digest`. Does nothing if already committed, and
    /// refuses (with a log line) if `digest` has not prepared.
    pub fn commit(&self, digest: Digest) {
        let quorum = self.quorum();
        let (vote, committed) = {
            let mut state = self.lock();
            if state.committed.contains(&digest) {
                return;
            }
            if !state.prepared.contains(&digest) {
                tracing::warn!(replica = %self.ctx.id(), digest = %digest, "commit before prepare ignored");
                return;
            }
            let vote = state.commit_sent.insert(digest);
            if vote {
                state.commit_votes.entry(digest).or_default().insert(self.ctx.id());
            }
            (vote, state.try_commit(digest, quorum))
        };

        if vote {
            self.ctx.metrics().increment_commits_sent();
            self.ctx.broadcast(Message::new(MessageKind::Commit, self.ctx.id(), digest));
        }
        if committed {
            self.on_committed(digest);
        }
    }

    /// Counts `from`'s COMMIT vote, buffering it if `digest` is unprepared.
    pub fn on_commit(&self, from: ReplicaId, digest: Digest) {
        if self.is_settled(&digest) {
            tracing::trace!(from = %from, digest = %digest, "commit vote for executed request");
            return;
        }
        let quorum = self.quorum();
        let committed = {
            let mut state = self.lock();
            if state.committed.contains(&digest) {
                return;
            }
            if !state.prepared.contains(&digest) {
                if !state.admits_vote(from, &digest) {
                    tracing::warn!(from = %from, digest = %digest, "too many unordered votes, commit dropped");
                    return;
                }
                tracing::debug!(from = %from, digest = %digest, "commit vote buffered until prepared");
                state.buffered_commits.entry(digest).or_default().insert(from);
                return;
            }
            let voters = state.commit_votes.entry(digest).or_default();
            if !voters.insert(from) {
                tracing::trace!(from = %from, digest = %digest, "duplicate commit vote");
                return;
            }
            tracing::debug!(from = %from, digest = %digest, votes = voters.len(), quorum, "commit vote");
            state.try_commit(digest, quorum)
        };
        if committed {
            self.on_committed(digest);
        }
    }

    fn on_committed(&self, digest: Digest) {
        self.ctx.metrics().increment_committed();
        tracing::info!(replica = %self.ctx.id(), digest = %digest, "committed");
        self.execute(digest);
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Runs the application for a committed digest. Returns true if it ran;
    /// a digest executes at most once.
    pub fn execute(&self, digest: Digest) -> bool {
        if self.is_settled(&digest) {
            tracing::debug!(digest = %digest, "already executed");
            return false;
        }
        let (payload, executed_count, committed_count) = {
            let mut state = self.lock();
            if !state.committed.contains(&digest) {
                tracing::warn!(digest = %digest, "execute before commit ignored");
                return false;
            }
            let Some(payload) = state.payloads.get(&digest).cloned() else {
                tracing::warn!(digest = %digest, "no payload to execute");
                return false;
            };
            if !state.executed.insert(digest) {
                tracing::debug!(digest = %digest, "already executed");
                return false;
            }
            state.executed_count += 1;
            state.uncheckpointed.push(digest);
            (payload, state.executed_count, state.committed_count)
        };

        let response = self.application.execute(&digest, &payload);
        self.ctx.metrics().increment_executions();
        tracing::info!(replica = %self.ctx.id(), digest = %digest, executed = executed_count, "executed");

        if let Err(e) = self.synchronizer.record(digest.to_hex()) {
            tracing::error!(digest = %digest, error = %e, "failed to record executed digest");
        }
        if executed_count % self.checkpoint_interval == 0 {
            self.take_checkpoint(SequenceNumber::new(committed_count));
        }
        self.clients.complete_digest(&digest, &response);
        true
    }

    fn take_checkpoint(&self, sequence: SequenceNumber) {
        match self.checkpoints.create(sequence, self.synchronizer.snapshot()) {
            Ok(()) => {
                self.ctx.metrics().increment_checkpoints();
                self.checkpoints.prune();
                let view = self.election.current_view();
                let discarded = self.lock().discard_checkpointed(view);
                tracing::debug!(sequence = %sequence, discarded, "per-request state discarded");
            }
            Err(e) => tracing::error!(sequence = %sequence, error = %e, "checkpoint failed"),
        }
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn is_prepared(&self, digest: &Digest) -> bool {
        self.lock().prepared.contains(digest) || self.is_settled(digest)
    }

    pub fn is_committed(&self, digest: &Digest) -> bool {
        self.lock().committed.contains(digest) || self.is_settled(digest)
    }

    pub fn is_executed(&self, digest: &Digest) -> bool {
        self.lock().executed.contains(digest) || self.is_settled(digest)
    }

    /// Uncounted prepare votes; zero once prepared.
    pub fn prepare_vote_count(&self, digest: &Digest) -> usize {
        self.lock().prepare_votes.get(digest).map_or(0, BTreeSet::len)
    }

    /// Counted commit votes; buffered votes are not included.
    pub fn commit_vote_count(&self, digest: &Digest) -> usize {
        self.lock().commit_votes.get(digest).map_or(0, BTreeSet::len)
    }

    pub fn payload(&self, digest: &Digest) -> Option<String> {
        self.lock().payloads.get(digest).cloned()
    }

    pub fn executed_count(&self) -> u64 {
        self.lock().executed_count
    }

    /// Digests with any per-request state still held.
    pub fn tracked_digests(&self) -> usize {
        let state = self.lock();
        let mut digests: HashSet<&Digest> = state.payloads.keys().collect();
        digests.extend(state.prepare_votes.keys());
        digests.extend(state.commit_votes.keys());
        digests.extend(state.buffered_commits.keys());
        digests.extend(&state.prepare_sent);
        digests.extend(&state.commit_sent);
        digests.extend(&state.prepared);
        digests.extend(&state.committed);
        digests.extend(&state.executed);
        digests.extend(state.forwarded.iter().map(|(digest, _)| digest));
        digests.len()
    }
}
