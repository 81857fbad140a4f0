//! Simulate command - runs a whole cluster over an in-memory network.
//!
//! Every replica gets its own recording application and shares one key
//! ring. Requests are submitted round-robin through all replicas, so backups
//! forward to the primary exactly as they would in a deployment.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tessera_config::TesseraConfig;
use tessera_crypto::KeyRing;
use tessera_pbft::{FrameHandler, MemoryNetwork, MetricsSnapshot, RecordingApplication, Replica, ReplicaOptions};
use tessera_types::ReplicaId;

use crate::style::colors::SemanticStyle;
use crate::style::{print_success, print_warn, result_table};

/// What to run.
#[derive(Debug, Clone)]
pub struct SimulationPlan {
    pub replicas: u32,
    pub requests: u32,
    pub crash_primary: bool,
    pub detection_ms: u64,
    pub json: bool,
}

/// Final state of one replica.
#[derive(Debug, Serialize)]
pub struct ReplicaReport {
    pub id: u32,
    pub view: u64,
    pub primary: u32,
    pub partitioned: bool,
    pub executed: usize,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub replicas: u32,
    pub max_faulty: u32,
    pub requests: u32,
    pub crashed_primary: Option<u32>,
    pub frames_delivered: u64,
    pub frames_dropped: u64,
    pub nodes: Vec<ReplicaReport>,
}

struct SimCluster {
    network: MemoryNetwork,
    replicas: Vec<Arc<Replica>>,
    apps: Vec<Arc<RecordingApplication>>,
}

impl SimCluster {
    fn build(plan: &SimulationPlan) -> Result<Self> {
        let network = MemoryNetwork::new();
        let keys = Arc::new(KeyRing::shared());
        let mut replicas = Vec::new();
        let mut apps = Vec::new();

        for id in 0..plan.replicas {
            let mut config = TesseraConfig::local_cluster(id, plan.replicas);
            config.timeouts.fault_detection_interval_ms = plan.detection_ms;
            let options = ReplicaOptions::from_config(&config)?;

            let replica_id = ReplicaId::new(id);
            let app = Arc::new(RecordingApplication::new());
            let replica = Replica::new(options, network.transport(replica_id), keys.clone(), app.clone())
                .with_context(|| format!("Failed to start replica {id}"))?;
            replica.connect_peers()?;

            let handler: Arc<dyn FrameHandler> = replica.clone();
            network.attach(replica_id, Arc::downgrade(&handler));
            replicas.push(replica);
            apps.push(app);
        }

        Ok(Self {
            network,
            replicas,
            apps,
        })
    }

    fn submit_batch(&self, prefix: &str, count: u32, through: &[usize]) -> Result<()> {
        for i in 0..count {
            let replica = &self.replicas[through[i as usize % through.len()]];
            replica.submit(format!("{prefix}-{i}"))?;
            self.network.run_until_idle();
        }
        Ok(())
    }
}

pub fn run(plan: &SimulationPlan) -> Result<()> {
    if plan.replicas == 0 {
        anyhow::bail!("A cluster needs at least one replica");
    }
    if plan.crash_primary && plan.replicas < 4 {
        anyhow::bail!("Surviving a crashed primary needs at least 4 replicas");
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build runtime")?;
    let report = runtime.block_on(simulate(plan))?;

    if plan.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

async fn simulate(plan: &SimulationPlan) -> Result<SimulationReport> {
    let cluster = SimCluster::build(plan)?;
    let everyone: Vec<usize> = (0..cluster.replicas.len()).collect();

    cluster.submit_batch("req", plan.requests, &everyone)?;

    let mut crashed = None;
    if plan.crash_primary {
        let primary = cluster.replicas[0].election().primary();
        cluster.network.partition(primary);
        crashed = Some(primary);
        tracing::info!(primary = %primary, "primary partitioned");

        tokio::time::sleep(Duration::from_millis(plan.detection_ms) * 2).await;

        let survivors: Vec<usize> = everyone
            .iter()
            .copied()
            .filter(|index| *index != primary.as_index())
            .collect();
        for index in &survivors {
            let replica = &cluster.replicas[*index];
            let faulty = replica.detector().detect();
            replica.recovery().perform_system_recovery(&faulty)?;
        }
        cluster.network.run_until_idle();

        cluster.submit_batch("after-crash", plan.requests, &survivors)?;
    }

    Ok(SimulationReport {
        replicas: plan.replicas,
        max_faulty: tessera_pbft::max_faulty(plan.replicas),
        requests: plan.requests,
        crashed_primary: crashed.map(|id| id.as_u32()),
        frames_delivered: cluster.network.delivered(),
        frames_dropped: cluster.network.dropped(),
        nodes: cluster
            .replicas
            .iter()
            .zip(&cluster.apps)
            .map(|(replica, app)| ReplicaReport {
                id: replica.id().as_u32(),
                view: replica.election().current_view().as_u64(),
                primary: replica.election().primary().as_u32(),
                partitioned: crashed == Some(replica.id()),
                executed: app.total_invocations(),
                metrics: replica.metrics(),
            })
            .collect(),
    })
}

fn print_report(report: &SimulationReport) {
    println!(
        "{} {} replicas, tolerating {} faulty",
        "Cluster:".header(),
        report.replicas,
        report.max_faulty
    );

    let rows: Vec<Vec<String>> = report
        .nodes
        .iter()
        .map(|node| {
            vec![
                node.id.to_string(),
                node.view.to_string(),
                node.primary.to_string(),
                node.executed.to_string(),
                node.metrics.view_changes.to_string(),
                node.metrics.checkpoints.to_string(),
                node.metrics.messages_received.to_string(),
                if node.partitioned {
                    "partitioned".warning()
                } else {
                    "up".success()
                },
            ]
        })
        .collect();
    let table = result_table(
        &[
            "Replica", "View", "Primary", "Executed", "View changes", "Checkpoints", "Received", "Status",
        ],
        &rows,
    );
    println!("{table}");
    println!(
        "{}",
        format!(
            "{} frames delivered, {} dropped",
            report.frames_delivered, report.frames_dropped
        )
        .muted()
    );

    if let Some(primary) = report.crashed_primary {
        print_warn(&format!("Primary {primary} was partitioned"));
    }

    let expected = if report.crashed_primary.is_some() {
        report.requests as usize * 2
    } else {
        report.requests as usize
    };
    let live: Vec<&ReplicaReport> = report.nodes.iter().filter(|node| !node.partitioned).collect();
    if live.iter().all(|node| node.executed == expected) {
        print_success(&format!("All live replicas executed {expected} requests"));
    } else {
        print_warn("Live replicas disagree on executed requests");
    }
}
