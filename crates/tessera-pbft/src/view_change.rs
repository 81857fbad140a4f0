//! View-change vote collection.
//!
//! ```text
//! Replica ──VIEW-CHANGE(v)──► All        (initiator adopts v immediately)
//!             │
//!             ▼ votes[v] ≥ ⌊2(N−1)/3⌋+1
//! Receiver adopts v, drops vote sets for the views it moved past
//! ```
//!
//! First quorum wins: competing proposals are not adjudicated beyond which
//! one reaches quorum first. The quorum is computed from the configured
//! replica count, not the live membership.
//!
//! Views wrap modulo `N`, so "moved past" is measured along the cycle from
//! the view the replica was in. Vote sets for views further along the cycle
//! survive an adoption, which lets a lagging replica catch up on a later
//! quorum. At most `N` vote sets of at most `N` voters exist at any time.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tessera_types::{ReplicaId, ViewNumber};

use crate::context::ReplicaContext;
use crate::election::PrimaryElection;
use crate::message::{Message, MessageKind, decode_view, encode_view};
use crate::Result;

/// Result of counting one view-change vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewChangeOutcome {
    Pending,
    QuorumReached(ViewNumber),
}

#[derive(Debug, Default)]
struct VoteState {
    votes: HashMap<ViewNumber, HashSet<ReplicaId>>,
    /// The view the last quorum settled on; late votes for it are ignored.
    settled: Option<ViewNumber>,
}

#[derive(Debug)]
pub struct ViewChangeCoordinator {
    ctx: ReplicaContext,
    election: Arc<PrimaryElection>,
    state: Mutex<VoteState>,
}

impl ViewChangeCoordinator {
    pub fn new(ctx: ReplicaContext, election: Arc<PrimaryElection>) -> Self {
        Self {
            ctx,
            election,
            state: Mutex::new(VoteState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `⌊2(N−1)/3⌋+1` over the configured `N`.
    pub fn quorum_size(&self) -> usize {
        view_change_quorum(self.ctx.total_replicas())
    }

    /// Proposes the next view after `failed_primary` stopped responding.
    ///
    /// Elects and adopts the next view locally, counts the local vote and
    /// broadcasts the proposal. Returns the proposed view, or `None` when
    /// `failed_primary` no longer leads the current view (another replica's
    /// view change already replaced it).
    pub fn initiate(&self, failed_primary: ReplicaId) -> Result<Option<ViewNumber>> {
        if !self.election.is_primary(failed_primary) {
            tracing::debug!(
                replica = %self.ctx.id(),
                failed_primary = %failed_primary,
                view = %self.election.current_view(),
                "reported replica is not the current primary, no view change"
            );
            return Ok(None);
        }

        let previous = self.election.current_view();
        let proposed = self.election.elect_next(self.ctx.total_replicas())?;
        tracing::warn!(
            replica = %self.ctx.id(),
            failed_primary = %failed_primary,
            view = %proposed,
            "initiating view change"
        );
        self.ctx.metrics().increment_view_changes();

        let quorum = self.quorum_size();
        {
            let mut state = self.lock();
            state.settled = None;
            let voters = state.votes.entry(proposed).or_default();
            voters.insert(self.ctx.id());
            if voters.len() >= quorum {
                self.settle(&mut state, previous, proposed);
            } else {
                self.drop_passed(&mut state, previous, proposed, false);
            }
        }

        let message = Message::control(MessageKind::ViewChange, self.ctx.id(), encode_view(proposed))?;
        self.ctx.broadcast(message);
        Ok(Some(proposed))
    }

    /// Counts `sender`'s vote for `view`.
    pub fn on_vote(&self, sender: ReplicaId, view: ViewNumber) -> ViewChangeOutcome {
        let quorum = self.quorum_size();
        let current = self.election.current_view();
        {
            let mut state = self.lock();
            if state.settled == Some(view) && current == view {
                tracing::trace!(sender = %sender, view = %view, "vote for settled view ignored");
                return ViewChangeOutcome::Pending;
            }

            let voters = state.votes.entry(view).or_default();
            if !voters.insert(sender) {
                tracing::debug!(sender = %sender, view = %view, "duplicate view-change vote");
                return ViewChangeOutcome::Pending;
            }
            let count = voters.len();
            tracing::debug!(sender = %sender, view = %view, votes = count, quorum, "view-change vote");
            if count < quorum {
                return ViewChangeOutcome::Pending;
            }

            self.settle(&mut state, current, view);
        }

        self.election.update_view(view);
        tracing::info!(
            replica = %self.ctx.id(),
            view = %view,
            primary = %view.primary(self.ctx.total_replicas()),
            "view-change quorum reached, view adopted"
        );
        ViewChangeOutcome::QuorumReached(view)
    }

    fn settle(&self, state: &mut VoteState, from: ViewNumber, to: ViewNumber) {
        self.drop_passed(state, from, to, true);
        state.settled = Some(to);
    }

    /// Drops vote sets for views on the cycle from `from` up to `to`
    /// (inclusive only when `inclusive`).
    fn drop_passed(&self, state: &mut VoteState, from: ViewNumber, to: ViewNumber, inclusive: bool) {
        let n = u64::from(self.ctx.total_replicas().max(1));
        let distance = |view: ViewNumber| (view.as_u64() + n - from.as_u64() % n) % n;
        let reach = distance(to);
        state.votes.retain(|view, _| {
            let d = distance(*view);
            if inclusive { d > reach } else { d >= reach && d != 0 }
        });
    }

    /// Handles an inbound `VIEW-CHANGE`.
    pub fn on_message(&self, message: &Message) -> Result<ViewChangeOutcome> {
        let view = decode_view(message.content_str())?;
        Ok(self.on_vote(message.sender, view))
    }

    pub fn vote_count(&self, view: ViewNumber) -> usize {
        self.lock().votes.get(&view).map_or(0, HashSet::len)
    }

    /// Views with at least one uncounted vote.
    pub fn pending_views(&self) -> Vec<ViewNumber> {
        let mut views: Vec<ViewNumber> = self.lock().votes.keys().copied().collect();
        views.sort();
        views
    }
}

/// `⌊2(N−1)/3⌋+1`.
pub fn view_change_quorum(total_replicas: u32) -> usize {
    (2 * total_replicas.saturating_sub(1) / 3 + 1) as usize
}
