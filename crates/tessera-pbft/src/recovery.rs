//! Response to detected faults.
//!
//! Composes election, view change and state synchronization into the two
//! recovery paths:
//!
//! - **Primary failure**: propose the next view (adopted locally at once),
//!   then resynchronize at the latest stable checkpoint.
//! - **Stuck round**: cancel outstanding recovery timers and arm a single
//!   consensus-phase backstop whose action resynchronizes once.
//!
//! Every entry point is idempotent: detection may report the same replica
//! many times, and each report simply re-runs the same steps. The backstop
//! is a scheduled task, never a recursive call.

use std::sync::Arc;
use std::time::Duration;

use tessera_types::{ReplicaId, ViewNumber};

use crate::checkpoint::CheckpointStore;
use crate::context::ReplicaContext;
use crate::election::PrimaryElection;
use crate::state_sync::StateSynchronizer;
use crate::timeout::TimeoutScheduler;
use crate::view_change::ViewChangeCoordinator;
use crate::{Error, Result};

/// Operation id of the consensus-phase backstop timer.
pub const CONSENSUS_PHASE_TIMEOUT: &str = "consensus-phase";

#[derive(Debug)]
pub struct FaultRecovery {
    ctx: ReplicaContext,
    election: Arc<PrimaryElection>,
    view_change: Arc<ViewChangeCoordinator>,
    synchronizer: Arc<StateSynchronizer>,
    checkpoints: Arc<CheckpointStore>,
    /// Recovery's own timers; cancel-all here never touches client retries.
    timeouts: TimeoutScheduler,
    phase_timeout: Duration,
}

impl FaultRecovery {
    pub fn new(
        ctx: ReplicaContext,
        election: Arc<PrimaryElection>,
        view_change: Arc<ViewChangeCoordinator>,
        synchronizer: Arc<StateSynchronizer>,
        checkpoints: Arc<CheckpointStore>,
        timeouts: TimeoutScheduler,
        phase_timeout: Duration,
    ) -> Result<Self> {
        if phase_timeout.is_zero() {
            return Err(Error::invalid("consensus phase timeout must be positive"));
        }
        Ok(Self {
            ctx,
            election,
            view_change,
            synchronizer,
            checkpoints,
            timeouts,
            phase_timeout,
        })
    }

    /// Elects and proposes the view after `failed_primary`, then
    /// resynchronizes at the latest stable checkpoint.
    ///
    /// Returns `None` without resynchronizing when `failed_primary` no
    /// longer leads the current view.
    pub fn recover_from_primary_failure(&self, failed_primary: ReplicaId) -> Result<Option<ViewNumber>> {
        let Some(view) = self.view_change.initiate(failed_primary)? else {
            return Ok(None);
        };
        let sequence = self.checkpoints.latest_stable_sequence();
        self.synchronizer.synchronize(sequence)?;
        tracing::info!(
            replica = %self.ctx.id(),
            failed_primary = %failed_primary,
            view = %view,
            sequence = %sequence,
            "recovered from primary failure"
        );
        Ok(Some(view))
    }

    /// Replaces every outstanding recovery timer with one consensus-phase
    /// backstop that resynchronizes state when it fires.
    ///
    /// The cancellation covers only the scheduler handed to
    /// [`FaultRecovery::new`]. The replica gives recovery a scheduler of its
    /// own, so in practice the only timer replaced is a previous backstop;
    /// client retry and acknowledgement timers live elsewhere and survive.
    pub fn resolve_deadlock(&self) -> Result<()> {
        self.timeouts.cancel_all();

        let synchronizer = Arc::clone(&self.synchronizer);
        let checkpoints = Arc::clone(&self.checkpoints);
        let replica = self.ctx.id();
        self.timeouts.start(CONSENSUS_PHASE_TIMEOUT, self.phase_timeout, move || {
            let sequence = checkpoints.latest_stable_sequence();
            tracing::warn!(replica = %replica, sequence = %sequence, "consensus phase timed out, resynchronizing");
            if let Err(e) = synchronizer.synchronize(sequence) {
                tracing::error!(replica = %replica, error = %e, "resynchronization failed");
            }
        })
    }

    /// Full recovery for a fault report. Safe to call repeatedly.
    pub fn perform_system_recovery(&self, faulty: &[ReplicaId]) -> Result<()> {
        let primary = self.election.primary();
        if faulty.contains(&primary) {
            self.recover_from_primary_failure(primary)?;
        }
        self.synchronizer
            .synchronize(self.checkpoints.latest_stable_sequence())?;
        self.resolve_deadlock()
    }

    pub fn is_backstop_armed(&self) -> bool {
        self.timeouts.is_active(CONSENSUS_PHASE_TIMEOUT)
    }
}
