//! # tessera-pbft: Practical Byzantine Fault Tolerance
//!
//! The replication core of Tessera. A cluster of `N` replicas tolerates
//! `f = ⌊(N−1)/3⌋` Byzantine replicas; every agreement phase needs `2f+1`
//! distinct votes.
//!
//! ## Protocol Overview
//!
//! ```text
//! Client ──CLIENT-REQUEST──► Primary
//! Primary ──PRE-PREPARE────► All
//! All ─────PREPARE─────────► All    (2f+1 → prepared)
//! All ─────COMMIT──────────► All    (2f+1 → committed → execute)
//! ```
//!
//! The primary of view `v` is replica `v mod N`. When the primary goes
//! silent, the fault detector reports it, recovery proposes view `v+1`, and
//! a quorum of `VIEW-CHANGE` votes makes every replica adopt it. Replicas
//! that fell behind reconcile by comparing Merkle roots of their state.
//!
//! ## Modules
//!
//! - [`message`]: wire format and content codecs
//! - [`consensus`]: the three-phase engine
//! - [`election`], [`view_change`]: primary rotation
//! - [`checkpoint`], [`state_sync`]: snapshots and reconciliation
//! - [`fault_detector`], [`recovery`]: liveness
//! - [`membership`], [`client`]: cluster and request bookkeeping
//! - [`router`], [`replica`]: inbound dispatch and assembly
//! - [`transport`], [`application`]: the seams to the outside
//!
//! ## Example
//!
//! ```ignore
//! let network = MemoryNetwork::new();
//! let keys = Arc::new(KeyRing::shared());
//! let replica = Replica::new(
//!     ReplicaOptions::new(ReplicaId::new(0), 4),
//!     network.transport(ReplicaId::new(0)),
//!     keys,
//!     Arc::new(RecordingApplication::new()),
//! )?;
//! network.attach(ReplicaId::new(0), Arc::downgrade(&replica) as _);
//! replica.submit("SET x = 1")?;
//! network.run_until_idle();
//! ```

pub mod application;
pub mod checkpoint;
pub mod client;
pub mod consensus;
pub mod context;
mod error;
pub mod election;
pub mod fault_detector;
pub mod instrumentation;
pub mod membership;
pub mod message;
pub mod recovery;
pub mod replica;
pub mod router;
pub mod state_sync;
pub mod timeout;
pub mod transport;
pub mod view_change;

#[cfg(test)]
mod tests;

pub use application::{Application, RecordingApplication};
pub use checkpoint::{CheckpointStore, StateSnapshot};
pub use client::{ClientOptions, ClientRequestManager, ClientRequestRecord, RETRY_EXHAUSTED_RESPONSE};
pub use consensus::ConsensusEngine;
pub use context::{ReplicaContext, agreement_quorum, max_faulty};
pub use election::PrimaryElection;
pub use error::{Error, Result};
pub use fault_detector::{FaultDetector, FaultReport};
pub use instrumentation::{Metrics, MetricsSnapshot};
pub use membership::{MembershipEntry, MembershipManager, MembershipOutcome};
pub use message::{MembershipChange, Message, MessageKind, StateRequest, StateUpdate};
pub use recovery::FaultRecovery;
pub use replica::{Replica, ReplicaOptions};
pub use router::Router;
pub use state_sync::StateSynchronizer;
pub use timeout::TimeoutScheduler;
pub use transport::{FrameHandler, MemoryNetwork, MemoryTransport, Transport};
pub use view_change::{ViewChangeCoordinator, ViewChangeOutcome, view_change_quorum};
