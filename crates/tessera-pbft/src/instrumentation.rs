//! Per-replica counters.
//!
//! Every [`crate::Replica`] owns one [`Metrics`] instance (no globals, so an
//! in-process cluster reports each replica separately). All counters are
//! relaxed atomics; a [`MetricsSnapshot`] is a point-in-time copy for tests,
//! the CLI and text export.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters for one replica.
#[derive(Debug, Default)]
pub struct Metrics {
    // === Inbound ===
    /// Frames that decoded and passed validation
    messages_received: AtomicU64,
    /// Frames that failed to decode
    messages_malformed: AtomicU64,
    /// Messages dropped for a missing or invalid signature
    signature_failures: AtomicU64,

    // === Agreement ===
    prepares_sent: AtomicU64,
    commits_sent: AtomicU64,
    prepared: AtomicU64,
    committed: AtomicU64,
    executions: AtomicU64,

    // === Fault management ===
    view_changes: AtomicU64,
    checkpoints: AtomicU64,
    state_updates_accepted: AtomicU64,
    state_updates_rejected: AtomicU64,
    faults_reported: AtomicU64,

    // === Clients ===
    client_requests: AtomicU64,
    client_retries: AtomicU64,
    client_failures: AtomicU64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $name(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        increment_received => messages_received,
        increment_malformed => messages_malformed,
        increment_signature_failures => signature_failures,
        increment_prepares_sent => prepares_sent,
        increment_commits_sent => commits_sent,
        increment_prepared => prepared,
        increment_committed => committed,
        increment_executions => executions,
        increment_view_changes => view_changes,
        increment_checkpoints => checkpoints,
        increment_state_updates_accepted => state_updates_accepted,
        increment_state_updates_rejected => state_updates_rejected,
        increment_faults_reported => faults_reported,
        increment_client_requests => client_requests,
        increment_client_retries => client_retries,
        increment_client_failures => client_failures,
    }

    /// Returns a point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            messages_received: load(&self.messages_received),
            messages_malformed: load(&self.messages_malformed),
            signature_failures: load(&self.signature_failures),
            prepares_sent: load(&self.prepares_sent),
            commits_sent: load(&self.commits_sent),
            prepared: load(&self.prepared),
            committed: load(&self.committed),
            executions: load(&self.executions),
            view_changes: load(&self.view_changes),
            checkpoints: load(&self.checkpoints),
            state_updates_accepted: load(&self.state_updates_accepted),
            state_updates_rejected: load(&self.state_updates_rejected),
            faults_reported: load(&self.faults_reported),
            client_requests: load(&self.client_requests),
            client_retries: load(&self.client_retries),
            client_failures: load(&self.client_failures),
        }
    }
}

/// Snapshot of a replica's counters at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub messages_malformed: u64,
    pub signature_failures: u64,
    pub prepares_sent: u64,
    pub commits_sent: u64,
    pub prepared: u64,
    pub committed: u64,
    pub executions: u64,
    pub view_changes: u64,
    pub checkpoints: u64,
    pub state_updates_accepted: u64,
    pub state_updates_rejected: u64,
    pub faults_reported: u64,
    pub client_requests: u64,
    pub client_retries: u64,
    pub client_failures: u64,
}

impl MetricsSnapshot {
    /// Renders the counters in Prometheus text exposition format, labelled
    /// with the replica id.
    pub fn to_prometheus(&self, replica: u32) -> String {
        let mut output = String::new();
        for (name, value) in [
            ("messages_received", self.messages_received),
            ("messages_malformed", self.messages_malformed),
            ("signature_failures", self.signature_failures),
            ("prepares_sent", self.prepares_sent),
            ("commits_sent", self.commits_sent),
            ("prepared", self.prepared),
            ("committed", self.committed),
            ("executions", self.executions),
            ("view_changes", self.view_changes),
            ("checkpoints", self.checkpoints),
            ("state_updates_accepted", self.state_updates_accepted),
            ("state_updates_rejected", self.state_updates_rejected),
            ("faults_reported", self.faults_reported),
            ("client_requests", self.client_requests),
            ("client_retries", self.client_retries),
            ("client_failures", self.client_failures),
        ] {
            let _ = write!(
                output,
                "# TYPE pbft_{name}_total counter\n\
                 pbft_{name}_total{{replica=\"{replica}\"}} {value}\n"
            );
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        assert_eq!(Metrics::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn increments_show_in_snapshot() {
        let metrics = Metrics::new();
        metrics.increment_received();
        metrics.increment_received();
        metrics.increment_executions();
        metrics.increment_client_retries();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_received, 2);
        assert_eq!(snapshot.executions, 1);
        assert_eq!(snapshot.client_retries, 1);
        assert_eq!(snapshot.commits_sent, 0);
    }

    #[test]
    fn prometheus_export_labels_replica() {
        let metrics = Metrics::new();
        metrics.increment_view_changes();
        let text = metrics.snapshot().to_prometheus(3);
        assert!(text.contains("# TYPE pbft_view_changes_total counter"));
        assert!(text.contains("pbft_view_changes_total{replica=\"3\"} 1"));
        assert!(text.contains("pbft_executions_total{replica=\"3\"} 0"));
    }

    #[test]
    fn snapshot_serializes() {
        let json = serde_json::to_string(&MetricsSnapshot::default()).unwrap();
        assert!(json.contains("\"client_failures\":0"));
    }
}
