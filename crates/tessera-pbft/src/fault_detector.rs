//! Heartbeat-style failure detection.
//!
//! Any valid inbound message counts as contact. A monitored peer silent for
//! longer than the fault-detection interval is reported faulty. This is a
//! soft detector: false positives under network delay are expected, and the
//! recovery paths they trigger are idempotent.
//!
//! Every detection round broadcasts a signed `FAULT-DETECTION`, empty when
//! nothing is faulty, so an idle but healthy replica keeps refreshing its
//! peers' timestamps. Rounds run at half the detection interval.
//!
//! Time comes from [`tokio::time::Instant`] so tests can pause and advance
//! the clock.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tessera_types::ReplicaId;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::context::ReplicaContext;
use crate::message::{Message, MessageKind, encode_fault_report};
use crate::{Error, Result};

/// Replicas reported faulty by one detection round, ascending.
pub type FaultReport = Vec<ReplicaId>;

#[derive(Debug)]
struct Liveness {
    monitored: BTreeSet<ReplicaId>,
    last_seen: HashMap<ReplicaId, Instant>,
}

#[derive(Debug)]
pub struct FaultDetector {
    ctx: ReplicaContext,
    timeout: Duration,
    liveness: Mutex<Liveness>,
    reports: mpsc::UnboundedSender<FaultReport>,
}

impl FaultDetector {
    /// Creates a detector monitoring every configured replica except the
    /// local one. Each peer's grace period starts now.
    ///
    /// Reports from [`FaultDetector::start_periodic`] are delivered on the
    /// returned channel.
    pub fn new(
        ctx: ReplicaContext,
        timeout: Duration,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<FaultReport>)> {
        if timeout.is_zero() {
            return Err(Error::invalid("fault detection interval must be positive"));
        }

        let now = Instant::now();
        let monitored: BTreeSet<ReplicaId> = (0..ctx.total_replicas())
            .map(ReplicaId::new)
            .filter(|id| *id != ctx.id())
            .collect();
        let last_seen = monitored.iter().map(|id| (*id, now)).collect();

        let (reports, receiver) = mpsc::unbounded_channel();
        let detector = Arc::new(Self {
            ctx,
            timeout,
            liveness: Mutex::new(Liveness {
                monitored,
                last_seen,
            }),
            reports,
        });
        Ok((detector, receiver))
    }

    fn lock(&self) -> MutexGuard<'_, Liveness> {
        self.liveness.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records contact with `replica` now.
    pub fn update_timestamp(&self, replica: ReplicaId) {
        let mut liveness = self.lock();
        if liveness.monitored.contains(&replica) {
            liveness.last_seen.insert(replica, Instant::now());
        }
    }

    /// Returns every monitored replica not heard from within the interval.
    pub fn detect(&self) -> FaultReport {
        let now = Instant::now();
        let liveness = self.lock();
        liveness
            .monitored
            .iter()
            .copied()
            .filter(|id| {
                liveness
                    .last_seen
                    .get(id)
                    .is_none_or(|seen| now.duration_since(*seen) > self.timeout)
            })
            .collect()
    }

    /// Marks `replica` live again, restarting its grace period.
    pub fn clear(&self, replica: ReplicaId) {
        let mut liveness = self.lock();
        if liveness.monitored.contains(&replica) {
            liveness.last_seen.insert(replica, Instant::now());
            tracing::debug!(replica = %replica, "cleared fault state");
        }
    }

    /// Starts monitoring a replica that joined the membership.
    pub fn monitor(&self, replica: ReplicaId) {
        if replica == self.ctx.id() {
            return;
        }
        let mut liveness = self.lock();
        if liveness.monitored.insert(replica) {
            liveness.last_seen.insert(replica, Instant::now());
        }
    }

    /// Stops monitoring a replica that left the membership.
    pub fn unmonitor(&self, replica: ReplicaId) {
        let mut liveness = self.lock();
        liveness.monitored.remove(&replica);
        liveness.last_seen.remove(&replica);
    }

    pub fn monitored(&self) -> Vec<ReplicaId> {
        self.lock().monitored.iter().copied().collect()
    }

    /// Runs one detection round: broadcasts the result (an empty report is
    /// the heartbeat) and forwards a non-empty one to the report channel.
    pub fn run_detection(&self) -> FaultReport {
        let faulty = self.detect();
        match Message::control(MessageKind::FaultDetection, self.ctx.id(), encode_fault_report(&faulty)) {
            Ok(message) => self.ctx.broadcast(message),
            Err(e) => tracing::error!(error = %e, "failed to build fault report"),
        }
        if faulty.is_empty() {
            return faulty;
        }

        tracing::warn!(replica = %self.ctx.id(), faulty = ?faulty, "unresponsive replicas detected");
        self.ctx.metrics().increment_faults_reported();
        if self.reports.send(faulty.clone()).is_err() {
            tracing::debug!("fault report receiver dropped");
        }
        faulty
    }

    /// Runs [`FaultDetector::run_detection`] every `interval` on the current
    /// runtime. The first round happens one interval from now.
    ///
    /// `interval` is the round period, not the silence threshold; it should
    /// be shorter than the threshold so heartbeats arrive in time.
    ///
    /// The task stops once the detector is dropped.
    pub fn start_periodic(self: &Arc<Self>, interval: Duration) -> Result<JoinHandle<()>> {
        if interval.is_zero() {
            return Err(Error::invalid("detection period must be positive"));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let detector: Weak<Self> = Arc::downgrade(self);

        Ok(runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(detector) = detector.upgrade() else {
                    break;
                };
                detector.run_detection();
            }
        }))
    }
}
