//! Integration tests for tessera-pbft.
//!
//! These tests run whole clusters of replicas over a [`MemoryNetwork`] and
//! exercise the components together: agreement, view change, recovery,
//! state synchronization and membership.

use std::sync::Arc;
use std::time::Duration;

use tessera_crypto::{KeyRing, SignatureService, sha256_str};
use tessera_types::{Digest, ReplicaId, SequenceNumber, ViewNumber};

use crate::{
    FrameHandler, MembershipOutcome, MemoryNetwork, Message, MessageKind, RETRY_EXHAUSTED_RESPONSE,
    RecordingApplication, Replica, ReplicaOptions,
};

// ============================================================================
// Cluster Harness
// ============================================================================

struct Cluster {
    network: MemoryNetwork,
    keys: Arc<KeyRing>,
    replicas: Vec<Arc<Replica>>,
    apps: Vec<Arc<RecordingApplication>>,
}

impl Cluster {
    fn new(n: u32) -> Self {
        let network = MemoryNetwork::new();
        let keys = Arc::new(KeyRing::shared());
        let mut replicas = Vec::new();
        let mut apps = Vec::new();

        for id in 0..n {
            let id = ReplicaId::new(id);
            let app = Arc::new(RecordingApplication::new());
            let replica = Replica::new(
                ReplicaOptions::new(id, n),
                network.transport(id),
                keys.clone(),
                app.clone(),
            )
            .unwrap();
            let handler: Arc<dyn FrameHandler> = replica.clone();
            network.attach(id, Arc::downgrade(&handler));
            replicas.push(replica);
            apps.push(app);
        }

        Self {
            network,
            keys,
            replicas,
            apps,
        }
    }

    fn replica(&self, id: u32) -> &Arc<Replica> {
        &self.replicas[id as usize]
    }

    fn run(&self) {
        self.network.run_until_idle();
    }

    fn invocations(&self, digest: &Digest) -> Vec<usize> {
        self.apps.iter().map(|app| app.invocations(digest)).collect()
    }

    fn views(&self) -> Vec<ViewNumber> {
        self.replicas
            .iter()
            .map(|replica| replica.election().current_view())
            .collect()
    }

    /// Every other member votes to remove `id`, which reaches the quorum.
    fn remove_everywhere(&self, id: ReplicaId) {
        for replica in self.replicas.iter().filter(|replica| replica.id() != id) {
            replica.membership().remove_node(id).unwrap();
        }
        self.run();
    }

    fn signed(&self, message: Message) -> Vec<u8> {
        message.sign(self.keys.as_ref()).unwrap().encode().into_bytes()
    }
}

fn r(id: u32) -> ReplicaId {
    ReplicaId::new(id)
}

// ============================================================================
// Agreement
// ============================================================================

#[tokio::test(start_paused = true)]
async fn four_replica_happy_path() {
    let cluster = Cluster::new(4);
    let id = cluster.replica(0).submit("X").unwrap();
    cluster.run();

    let digest = sha256_str("X");
    assert_eq!(cluster.invocations(&digest), vec![1, 1, 1, 1]);
    for replica in &cluster.replicas {
        assert!(replica.consensus().is_committed(&digest));
        assert_eq!(replica.consensus().payload(&digest).as_deref(), Some("X"));
        assert!(replica.synchronizer().contains(&digest.to_hex()));
    }

    let record = cluster.replica(0).clients().record(id).unwrap();
    assert!(record.completed);
    assert_eq!(record.response.as_deref(), Some("OK: X"));
    assert!(!cluster.replica(0).clients().is_retry_armed(id));
}

#[tokio::test(start_paused = true)]
async fn backup_submission_is_forwarded_to_primary() {
    let cluster = Cluster::new(4);
    let id = cluster.replica(2).submit("Y").unwrap();
    cluster.run();

    assert_eq!(cluster.invocations(&sha256_str("Y")), vec![1, 1, 1, 1]);
    let record = cluster.replica(2).clients().record(id).unwrap();
    assert!(record.completed);
    // The primary acknowledged the forwarded request
    assert!(record.acked_by.contains(&r(0)));
}

#[tokio::test(start_paused = true)]
async fn requests_execute_in_submission_order() {
    let cluster = Cluster::new(4);
    for payload in ["a", "b", "c"] {
        cluster.replica(0).submit(payload).unwrap();
        cluster.run();
    }
    for app in &cluster.apps {
        assert_eq!(app.executed(), vec!["a", "b", "c"]);
    }
}

#[tokio::test(start_paused = true)]
async fn one_silent_replica_does_not_block_agreement() {
    let cluster = Cluster::new(4);
    cluster.network.partition(r(3));
    cluster.replica(0).submit("X").unwrap();
    cluster.run();

    assert_eq!(cluster.invocations(&sha256_str("X")), vec![1, 1, 1, 0]);
}

#[tokio::test(start_paused = true)]
async fn duplicate_commit_delivery_executes_once() {
    let cluster = Cluster::new(4);
    cluster.replica(0).submit("X").unwrap();
    cluster.run();

    let digest = sha256_str("X");
    let replica = cluster.replica(1);
    replica.route_bytes(&cluster.signed(Message::new(MessageKind::Commit, r(2), digest)));
    assert!(!replica.consensus().execute(digest));
    assert_eq!(cluster.apps[1].invocations(&digest), 1);
    assert_eq!(replica.metrics().executions, 1);
}

#[tokio::test(start_paused = true)]
async fn commit_for_unprepared_digest_is_not_counted() {
    let cluster = Cluster::new(4);
    let digest = sha256_str("never proposed");
    let replica = cluster.replica(1);
    for sender in [0, 2, 3] {
        assert!(replica.route_bytes(&cluster.signed(Message::new(MessageKind::Commit, r(sender), digest))));
    }

    assert_eq!(replica.consensus().commit_vote_count(&digest), 0);
    assert!(!replica.consensus().is_committed(&digest));
}

#[tokio::test(start_paused = true)]
async fn committed_payloads_agree_across_replicas() {
    let cluster = Cluster::new(7);
    for i in 0..5 {
        cluster.replica(i % 7).submit(format!("op-{i}")).unwrap();
    }
    cluster.run();

    for i in 0..5 {
        let digest = sha256_str(&format!("op-{i}"));
        let payloads: Vec<Option<String>> = cluster
            .replicas
            .iter()
            .map(|replica| replica.consensus().payload(&digest))
            .collect();
        assert!(payloads.iter().all(|p| p.as_deref() == Some(format!("op-{i}").as_str())));
        assert_eq!(cluster.invocations(&digest), vec![1; 7]);
    }
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test(start_paused = true)]
async fn malformed_and_unauthenticated_frames_are_dropped() {
    let cluster = Cluster::new(4);
    let replica = cluster.replica(1);

    assert!(!replica.route_bytes(b"not a message"));
    assert!(!replica.route_bytes(&[0xff, 0xfe]));

    let unsigned = Message::new(MessageKind::Prepare, r(2), sha256_str("X"));
    assert!(!replica.route_bytes(unsigned.encode().as_bytes()));

    // Signed by replica 2 but claiming to come from replica 3
    let mut forged = Message::new(MessageKind::Prepare, r(2), sha256_str("X"))
        .sign(cluster.keys.as_ref())
        .unwrap();
    forged.sender = r(3);
    assert!(!replica.route_bytes(forged.encode().as_bytes()));

    // ACK is allowed unsigned by default
    let ack = Message::new(MessageKind::Ack, r(2), sha256_str("X"));
    assert!(replica.route_bytes(ack.encode().as_bytes()));

    let metrics = replica.metrics();
    assert_eq!(metrics.messages_malformed, 2);
    assert_eq!(metrics.signature_failures, 2);
    assert_eq!(metrics.messages_received, 1);
    assert_eq!(replica.consensus().prepare_vote_count(&sha256_str("X")), 0);
}

#[tokio::test(start_paused = true)]
async fn votes_from_non_members_are_ignored() {
    let cluster = Cluster::new(4);
    let digest = sha256_str("X");
    let replica = cluster.replica(1);

    // The shared key ring knows replica 9, but it is not a member
    let vote = Message::new(MessageKind::Prepare, r(9), digest);
    assert!(!replica.route_bytes(&cluster.signed(vote)));
    assert_eq!(replica.consensus().prepare_vote_count(&digest), 0);
}

// ============================================================================
// Faults and Recovery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn silent_primary_triggers_view_change() {
    let cluster = Cluster::new(4);
    cluster.network.partition(r(0));
    tokio::time::advance(Duration::from_secs(11)).await;

    for id in 1..4 {
        let replica = cluster.replica(id);
        let faulty = replica.detector().detect();
        assert!(faulty.contains(&r(0)));
        replica.recovery().perform_system_recovery(&faulty).unwrap();

        // Adopted locally at once, still waiting for peers' votes
        assert_eq!(replica.election().current_view(), ViewNumber::new(1));
        assert_eq!(replica.view_change().vote_count(ViewNumber::new(1)), 1);
    }

    cluster.run();
    for id in 1..4 {
        let replica = cluster.replica(id);
        assert!(replica.election().is_primary(r(1)));
        assert!(replica.view_change().pending_views().is_empty());
        assert!(replica.recovery().is_backstop_armed());
    }
    assert_eq!(cluster.views()[0], ViewNumber::ZERO);

    // The new primary orders requests without replica 0
    let id = cluster.replica(2).submit("after").unwrap();
    cluster.run();
    assert_eq!(cluster.invocations(&sha256_str("after")), vec![0, 1, 1, 1]);
    assert!(cluster.replica(2).clients().record(id).unwrap().completed);
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_fault_report_is_ignored() {
    let cluster = Cluster::new(4);
    let report = Message::control(MessageKind::FaultDetection, r(2), "0").unwrap();
    assert!(cluster.replica(1).route_bytes(&cluster.signed(report)));

    assert_eq!(cluster.replica(1).election().current_view(), ViewNumber::ZERO);
    assert!(!cluster.replica(1).recovery().is_backstop_armed());
}

#[tokio::test(start_paused = true)]
async fn confirmed_fault_report_drives_recovery() {
    let cluster = Cluster::new(4);
    cluster.network.partition(r(0));
    tokio::time::advance(Duration::from_secs(11)).await;

    let reported = cluster.replica(2).detector().run_detection();
    assert!(reported.contains(&r(0)));
    cluster.run();

    // Replicas 1 and 3 confirmed the report and proposed view 1
    assert_eq!(cluster.replica(1).election().current_view(), ViewNumber::new(1));
    assert_eq!(cluster.replica(3).election().current_view(), ViewNumber::new(1));
    assert_eq!(cluster.replica(2).metrics().faults_reported, 1);

    // The reporter has their two votes; its own recovery completes the quorum
    let reporter = cluster.replica(2);
    assert_eq!(reporter.election().current_view(), ViewNumber::ZERO);
    assert_eq!(reporter.view_change().vote_count(ViewNumber::new(1)), 2);
    reporter.recovery().perform_system_recovery(&reported).unwrap();
    cluster.run();

    for id in 1..4 {
        assert_eq!(cluster.replica(id).election().current_view(), ViewNumber::new(1));
        assert!(cluster.replica(id).view_change().pending_views().is_empty());
    }
}

/// Lets `seconds` of paused time pass, delivering queued frames after
/// every second.
async fn run_for(cluster: &Cluster, seconds: u64) {
    for _ in 0..seconds {
        tokio::time::sleep(Duration::from_secs(1)).await;
        cluster.run();
    }
}

#[tokio::test(start_paused = true)]
async fn idle_healthy_cluster_keeps_its_view() {
    let cluster = Cluster::new(4);
    for replica in &cluster.replicas {
        replica.start_fault_detection().unwrap();
    }

    run_for(&cluster, 60).await;

    assert_eq!(cluster.views(), vec![ViewNumber::ZERO; 4]);
    for replica in &cluster.replicas {
        let metrics = replica.metrics();
        assert_eq!(metrics.view_changes, 0);
        assert_eq!(metrics.faults_reported, 0);
        assert!(replica.detector().detect().is_empty());
    }
}

#[tokio::test(start_paused = true)]
async fn periodic_detection_recovers_without_intervention() {
    let cluster = Cluster::new(4);
    for replica in &cluster.replicas {
        replica.start_fault_detection().unwrap();
    }
    cluster.network.partition(r(0));

    // Rounds every 5s; replica 0 passes the 10s threshold at the 15s round
    run_for(&cluster, 60).await;

    for id in 1..4 {
        let replica = cluster.replica(id);
        assert!(replica.metrics().faults_reported >= 1);
        assert_eq!(replica.metrics().view_changes, 1);
        assert_eq!(replica.election().current_view(), ViewNumber::new(1));
        assert!(replica.view_change().pending_views().is_empty());
    }
    // Replica 0 only sees silent backups, never a silent primary
    assert_eq!(cluster.replica(0).election().current_view(), ViewNumber::ZERO);
    assert_eq!(cluster.replica(0).metrics().view_changes, 0);

    let id = cluster.replica(3).submit("later").unwrap();
    cluster.run();
    assert_eq!(cluster.invocations(&sha256_str("later")), vec![0, 1, 1, 1]);
    assert!(cluster.replica(3).clients().record(id).unwrap().completed);
}

#[tokio::test(start_paused = true)]
async fn retries_exhaust_against_unreachable_primary() {
    let cluster = Cluster::new(4);
    cluster.network.partition(r(0));

    let id = cluster.replica(1).submit("Z").unwrap();
    cluster.run();

    // Retries at 2s, 4s and 6s
    tokio::time::sleep(Duration::from_secs(7)).await;

    let record = cluster.replica(1).clients().record(id).unwrap();
    assert!(record.completed);
    assert_eq!(record.retry_count, 3);
    assert_eq!(record.response.as_deref(), Some(RETRY_EXHAUSTED_RESPONSE));
    assert!(!cluster.replica(1).clients().is_retry_armed(id));

    let metrics = cluster.replica(1).metrics();
    assert_eq!(metrics.client_retries, 3);
    assert_eq!(metrics.client_failures, 1);
}

// ============================================================================
// State Synchronization
// ============================================================================

#[tokio::test(start_paused = true)]
async fn lagging_replica_catches_up_by_state_sync() {
    let cluster = Cluster::new(4);
    cluster.network.partition(r(3));
    cluster.replica(0).submit("A").unwrap();
    cluster.run();
    assert!(cluster.replica(3).synchronizer().is_empty());

    cluster.network.heal(r(3));
    cluster.replica(3).synchronizer().synchronize(SequenceNumber::ZERO).unwrap();
    cluster.run();

    let lagging = cluster.replica(3);
    assert!(lagging.synchronizer().contains(&sha256_str("A").to_hex()));
    assert_eq!(
        lagging.synchronizer().local_root(),
        cluster.replica(0).synchronizer().local_root()
    );
    assert!(lagging.checkpoints().latest_stable_sequence() >= SequenceNumber::new(1));
    assert!(lagging.metrics().state_updates_accepted >= 1);
    // State sync restores state; it does not replay execution
    assert_eq!(cluster.apps[3].total_invocations(), 0);
}

#[tokio::test(start_paused = true)]
async fn forged_state_update_is_rejected() {
    let cluster = Cluster::new(4);
    let update = Message::control(MessageKind::CheckpointSync, r(2), format!("{}:injected", Digest::ZERO)).unwrap();
    let replica = cluster.replica(1);
    replica.route_bytes(&cluster.signed(update));

    assert!(replica.synchronizer().is_empty());
    assert_eq!(replica.metrics().state_updates_rejected, 1);
    assert!(replica.checkpoints().is_empty());
}

// ============================================================================
// Membership
// ============================================================================

#[tokio::test(start_paused = true)]
async fn membership_changes_propagate() {
    let cluster = Cluster::new(4);
    let key = cluster.keys.public_key_of(r(4)).unwrap();

    assert_eq!(
        cluster.replica(0).membership().add_node(r(4), key.clone()).unwrap(),
        MembershipOutcome::Pending { votes: 1 }
    );
    cluster.run();
    // One announcement is a single vote everywhere
    for replica in &cluster.replicas {
        assert_eq!(replica.membership().len(), 4);
    }

    for id in [1, 2] {
        cluster.replica(id).membership().add_node(r(4), key.clone()).unwrap();
    }
    cluster.run();
    for replica in &cluster.replicas {
        assert_eq!(replica.membership().len(), 5);
        assert_eq!(replica.membership().public_key(r(4)), Some(key.clone()));
        assert!(replica.detector().monitored().contains(&r(4)));
        assert_eq!(replica.membership().pending_proposals(), 0);
    }

    cluster.remove_everywhere(r(4));
    for replica in &cluster.replicas {
        assert!(!replica.membership().contains(r(4)));
        // Quorum stays tied to the configured cluster size
        assert_eq!(replica.membership().quorum_size(), 3);
    }
}

#[tokio::test(start_paused = true)]
async fn single_sender_cannot_remove_members() {
    let cluster = Cluster::new(4);
    let target = cluster.replica(0);
    for content in ["REMOVE:2", "REMOVE:3"] {
        let update = Message::control(MessageKind::MembershipUpdate, r(1), content).unwrap();
        assert!(target.route_bytes(&cluster.signed(update)));
    }
    assert!(target.membership().contains(r(2)));
    assert!(target.membership().contains(r(3)));

    let prepare = Message::new(MessageKind::Prepare, r(2), sha256_str("P"));
    assert!(target.route_bytes(&cluster.signed(prepare)));

    let outsider = Message::control(MessageKind::MembershipUpdate, r(9), "REMOVE:1").unwrap();
    assert!(!target.route_bytes(&cluster.signed(outsider)));
    assert!(target.membership().contains(r(1)));
}

#[tokio::test(start_paused = true)]
async fn view_change_votes_from_non_members_are_refused() {
    let cluster = Cluster::new(4);
    cluster.remove_everywhere(r(3));
    let target = cluster.replica(1);
    assert!(!target.membership().contains(r(3)));

    for sender in [2, 3, 9] {
        let vote = Message::control(MessageKind::ViewChange, r(sender), "2").unwrap();
        let accepted = target.route_bytes(&cluster.signed(vote));
        assert_eq!(accepted, sender == 2);
    }
    assert_eq!(target.election().current_view(), ViewNumber::ZERO);
    assert_eq!(target.view_change().vote_count(ViewNumber::new(2)), 1);
    assert_eq!(target.metrics().view_changes, 0);
}

#[tokio::test(start_paused = true)]
async fn fault_reports_from_non_members_are_refused() {
    let cluster = Cluster::new(4);
    cluster.network.partition(r(0));
    tokio::time::sleep(Duration::from_secs(31)).await;
    let target = cluster.replica(1);
    assert!(target.detector().detect().contains(&r(0)));

    let report = Message::control(MessageKind::FaultDetection, r(9), "0").unwrap();
    assert!(!target.route_bytes(&cluster.signed(report)));
    assert_eq!(target.election().current_view(), ViewNumber::ZERO);
    assert_eq!(target.metrics().view_changes, 0);
}

#[tokio::test(start_paused = true)]
async fn removed_primary_cannot_order_requests() {
    let cluster = Cluster::new(4);
    cluster.remove_everywhere(r(0));

    // Replica 0 is still primary of view 0 but no longer a member: the
    // request is broadcast, and its pre-prepare is refused everywhere
    cluster.replica(1).submit("W").unwrap();
    cluster.run();

    let digest = sha256_str("W");
    assert!(cluster.replica(0).consensus().payload(&digest).is_some());
    for id in 1..4 {
        assert!(cluster.replica(id).consensus().payload(&digest).is_none());
    }
    assert_eq!(cluster.invocations(&digest), vec![0; 4]);
}
