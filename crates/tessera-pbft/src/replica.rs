//! Replica assembly.
//!
//! A [`Replica`] wires every component of one PBFT participant around a
//! shared [`ReplicaContext`] and implements [`FrameHandler`] so a transport
//! can deliver inbound frames to it.
//!
//! ```text
//!              transport ──frame──► Router ─┬─► ConsensusEngine ──► Application
//!                                           ├─► ViewChangeCoordinator ──► PrimaryElection
//!                                           ├─► StateSynchronizer ──► CheckpointStore
//!                                           ├─► MembershipManager ──► FaultDetector
//!                                           ├─► ClientRequestManager
//!                                           └─► FaultRecovery
//! ```

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tessera_config::TesseraConfig;
use tessera_crypto::SignatureService;
use tessera_types::{ReplicaId, RequestId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::application::Application;
use crate::checkpoint::CheckpointStore;
use crate::client::{ClientOptions, ClientRequestManager};
use crate::consensus::ConsensusEngine;
use crate::context::ReplicaContext;
use crate::election::PrimaryElection;
use crate::fault_detector::{FaultDetector, FaultReport};
use crate::instrumentation::MetricsSnapshot;
use crate::membership::MembershipManager;
use crate::message::MessageKind;
use crate::recovery::FaultRecovery;
use crate::router::Router;
use crate::state_sync::StateSynchronizer;
use crate::timeout::TimeoutScheduler;
use crate::transport::{FrameHandler, Transport};
use crate::view_change::ViewChangeCoordinator;
use crate::{Error, Result};

/// Runtime settings of one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaOptions {
    pub id: ReplicaId,
    pub total_replicas: u32,
    pub retry_interval: Duration,
    pub retry_limit: u32,
    pub ack_timeout: Duration,
    pub fault_detection_interval: Duration,
    pub consensus_phase_timeout: Duration,
    pub checkpoint_interval: u64,
    /// Kinds accepted without a signature.
    pub unsigned_allowed: BTreeSet<MessageKind>,
    /// Peer addresses handed to [`Transport::connect`].
    pub peers: Vec<(ReplicaId, String)>,
}

impl ReplicaOptions {
    /// Default settings for replica `id` of `total_replicas`.
    pub fn new(id: ReplicaId, total_replicas: u32) -> Self {
        let mut config = TesseraConfig::default();
        config.replica.id = id.as_u32();
        config.replica.total_replicas = total_replicas;
        Self::from_parts(&config, BTreeSet::from([MessageKind::Ack]))
    }

    /// Builds options from a configuration, validating it first.
    pub fn from_config(config: &TesseraConfig) -> Result<Self> {
        config.validate()?;
        let unsigned_allowed = config
            .consensus
            .unsigned_allowed
            .iter()
            .map(|kind| kind.parse::<MessageKind>())
            .collect::<Result<BTreeSet<_>>>()?;
        Ok(Self::from_parts(config, unsigned_allowed))
    }

    fn from_parts(config: &TesseraConfig, unsigned_allowed: BTreeSet<MessageKind>) -> Self {
        Self {
            id: ReplicaId::new(config.replica.id),
            total_replicas: config.replica.total_replicas,
            retry_interval: config.timeouts.retry_interval(),
            retry_limit: config.timeouts.retry_limit,
            ack_timeout: config.timeouts.ack_timeout(),
            fault_detection_interval: config.timeouts.fault_detection_interval(),
            consensus_phase_timeout: config.timeouts.consensus_phase_timeout(),
            checkpoint_interval: config.consensus.checkpoint_interval,
            unsigned_allowed,
            peers: config
                .peers
                .iter()
                .map(|peer| (ReplicaId::new(peer.id), peer.address.clone()))
                .collect(),
        }
    }
}

/// One PBFT replica.
///
/// Must be created inside a tokio runtime; timers and fault detection run
/// as tasks on it. Dropping the replica stops its background tasks.
#[derive(Debug)]
pub struct Replica {
    ctx: ReplicaContext,
    options: ReplicaOptions,
    election: Arc<PrimaryElection>,
    checkpoints: Arc<CheckpointStore>,
    synchronizer: Arc<StateSynchronizer>,
    view_change: Arc<ViewChangeCoordinator>,
    detector: Arc<FaultDetector>,
    recovery: Arc<FaultRecovery>,
    membership: Arc<MembershipManager>,
    clients: Arc<ClientRequestManager>,
    consensus: Arc<ConsensusEngine>,
    router: Router,
    fault_reports: Mutex<Option<mpsc::UnboundedReceiver<FaultReport>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Replica {
    pub fn new(
        options: ReplicaOptions,
        transport: Arc<dyn Transport>,
        signatures: Arc<dyn SignatureService>,
        application: Arc<dyn Application>,
    ) -> Result<Arc<Self>> {
        let ctx = ReplicaContext::new(options.id, options.total_replicas, transport, signatures)?;

        let election = Arc::new(PrimaryElection::new(options.total_replicas)?);
        let checkpoints = Arc::new(CheckpointStore::new());
        let synchronizer = Arc::new(StateSynchronizer::new(ctx.clone(), checkpoints.clone()));
        let view_change = Arc::new(ViewChangeCoordinator::new(ctx.clone(), election.clone()));
        let (detector, fault_reports) = FaultDetector::new(ctx.clone(), options.fault_detection_interval)?;
        let recovery = Arc::new(FaultRecovery::new(
            ctx.clone(),
            election.clone(),
            view_change.clone(),
            synchronizer.clone(),
            checkpoints.clone(),
            TimeoutScheduler::current()?,
            options.consensus_phase_timeout,
        )?);
        let membership = Arc::new(MembershipManager::new(ctx.clone(), detector.clone()));
        let clients = ClientRequestManager::new(
            ctx.clone(),
            election.clone(),
            membership.clone(),
            TimeoutScheduler::current()?,
            ClientOptions {
                retry_interval: options.retry_interval,
                retry_limit: options.retry_limit,
                ack_timeout: options.ack_timeout,
            },
        )?;
        let consensus = Arc::new(ConsensusEngine::new(
            ctx.clone(),
            election.clone(),
            synchronizer.clone(),
            checkpoints.clone(),
            clients.clone(),
            application,
            options.checkpoint_interval,
        )?);

        let router = Router {
            ctx: ctx.clone(),
            unsigned_allowed: options.unsigned_allowed.clone(),
            detector: detector.clone(),
            view_change: view_change.clone(),
            recovery: recovery.clone(),
            membership: membership.clone(),
            clients: clients.clone(),
            consensus: consensus.clone(),
            synchronizer: synchronizer.clone(),
        };

        tracing::info!(
            replica = %options.id,
            total_replicas = options.total_replicas,
            quorum = ctx.quorum(),
            "replica started"
        );

        Ok(Arc::new(Self {
            ctx,
            options,
            election,
            checkpoints,
            synchronizer,
            view_change,
            detector,
            recovery,
            membership,
            clients,
            consensus,
            router,
            fault_reports: Mutex::new(Some(fault_reports)),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Connects the transport to every configured peer.
    pub fn connect_peers(&self) -> Result<()> {
        for (id, address) in &self.options.peers {
            tracing::debug!(replica = %self.ctx.id(), peer = %id, address = %address, "connecting");
            self.ctx.transport().connect(address)?;
        }
        Ok(())
    }

    /// Submits a client request through this replica.
    pub fn submit(&self, payload: impl Into<String>) -> Result<RequestId> {
        self.clients.submit(payload)
    }

    /// Decodes and routes one inbound frame.
    pub fn route_bytes(&self, frame: &[u8]) -> bool {
        self.router.route_bytes(frame)
    }

    /// Starts periodic fault detection and the task that turns its reports
    /// into recovery. Can only be started once.
    ///
    /// Rounds run at half the detection interval; each one doubles as this
    /// replica's heartbeat.
    pub fn start_fault_detection(self: &Arc<Self>) -> Result<()> {
        let Some(mut reports) = self
            .fault_reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Err(Error::invalid("fault detection already started"));
        };

        let round = (self.options.fault_detection_interval / 2).max(Duration::from_millis(1));
        let detection = self.detector.start_periodic(round)?;
        let replica: Weak<Self> = Arc::downgrade(self);
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let recovery = runtime.spawn(async move {
            while let Some(report) = reports.recv().await {
                let Some(replica) = replica.upgrade() else {
                    break;
                };
                if let Err(e) = replica.recovery.perform_system_recovery(&report) {
                    tracing::error!(replica = %replica.ctx.id(), error = %e, "recovery failed");
                }
            }
        });

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([detection, recovery]);
        tracing::info!(
            replica = %self.ctx.id(),
            interval = ?self.options.fault_detection_interval,
            "fault detection started"
        );
        Ok(())
    }

    pub fn id(&self) -> ReplicaId {
        self.ctx.id()
    }

    pub fn options(&self) -> &ReplicaOptions {
        &self.options
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics().snapshot()
    }

    pub fn election(&self) -> &Arc<PrimaryElection> {
        &self.election
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.checkpoints
    }

    pub fn synchronizer(&self) -> &Arc<StateSynchronizer> {
        &self.synchronizer
    }

    pub fn view_change(&self) -> &Arc<ViewChangeCoordinator> {
        &self.view_change
    }

    pub fn detector(&self) -> &Arc<FaultDetector> {
        &self.detector
    }

    pub fn recovery(&self) -> &Arc<FaultRecovery> {
        &self.recovery
    }

    pub fn membership(&self) -> &Arc<MembershipManager> {
        &self.membership
    }

    pub fn clients(&self) -> &Arc<ClientRequestManager> {
        &self.clients
    }

    pub fn consensus(&self) -> &Arc<ConsensusEngine> {
        &self.consensus
    }

    pub fn router(&self) -> &Router {
        &self.router
    }
}

impl FrameHandler for Replica {
    fn on_frame(&self, frame: &[u8]) {
        self.router.route_bytes(frame);
    }
}

impl Drop for Replica {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::RecordingApplication;
    use crate::transport::MemoryNetwork;
    use tessera_crypto::KeyRing;

    #[test]
    fn options_follow_config() {
        let mut config = TesseraConfig::local_cluster(2, 7);
        config.timeouts.retry_limit = 5;
        config.consensus.unsigned_allowed = vec!["ACK".to_string(), "FAULT-DETECTION".to_string()];

        let options = ReplicaOptions::from_config(&config).unwrap();
        assert_eq!(options.id, ReplicaId::new(2));
        assert_eq!(options.total_replicas, 7);
        assert_eq!(options.retry_limit, 5);
        assert_eq!(options.retry_interval, Duration::from_millis(2_000));
        assert_eq!(
            options.unsigned_allowed,
            BTreeSet::from([MessageKind::Ack, MessageKind::FaultDetection])
        );
        assert_eq!(options.peers.len(), 6);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = TesseraConfig::local_cluster(0, 4);
        config.timeouts.fault_detection_interval_ms = 0;
        assert!(matches!(
            ReplicaOptions::from_config(&config),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn default_options_allow_unsigned_ack_only() {
        let options = ReplicaOptions::new(ReplicaId::new(1), 4);
        assert_eq!(options.unsigned_allowed, BTreeSet::from([MessageKind::Ack]));
        assert_eq!(options.retry_limit, 3);
        assert_eq!(options.fault_detection_interval, Duration::from_secs(10));
    }

    #[test]
    fn requires_runtime() {
        let network = MemoryNetwork::new();
        let result = Replica::new(
            ReplicaOptions::new(ReplicaId::new(0), 4),
            network.transport(ReplicaId::new(0)),
            Arc::new(KeyRing::shared()),
            Arc::new(RecordingApplication::new()),
        );
        assert!(matches!(result, Err(Error::NoRuntime)));
    }

    #[tokio::test(start_paused = true)]
    async fn fault_detection_starts_once() {
        let network = MemoryNetwork::new();
        let replica = Replica::new(
            ReplicaOptions::new(ReplicaId::new(0), 4),
            network.transport(ReplicaId::new(0)),
            Arc::new(KeyRing::shared()),
            Arc::new(RecordingApplication::new()),
        )
        .unwrap();
        replica.start_fault_detection().unwrap();
        assert!(replica.start_fault_detection().is_err());
    }
}
