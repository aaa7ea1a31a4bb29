//! Failure isolation and concurrent arbitration tests

use async_trait::async_trait;
use fleet_common::{FixProposal, FleetError, IssueType, Observed, ProposalKey, ProposalOutcome, Thresholds};
use fleetd::agents::{AgentDirectory, Fixer, FixerAgent, Gatekeeper, GatekeeperEndpoint};
use fleetd::cluster::ClusterController;
use fleetd::fleet::{Actuator, FleetView, RemediationAction};
use fleetd::host::MetricReadings;
use fleetd::knowledge::KnowledgeBase;
use fleetd::scheduler::{Scheduler, SchedulerConfig};
use fleetd::telemetry::TelemetrySource;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

// ============================================================================
// Cluster isolation
// ============================================================================

/// Panics while sampling the cluster named `broken` until disarmed
struct FaultyTelemetry {
    broken: String,
    armed: AtomicBool,
    samples: AtomicUsize,
}

impl TelemetrySource for FaultyTelemetry {
    fn sample(&self, cluster_id: &str, _host_id: &str, fields: &[String]) -> Result<MetricReadings, FleetError> {
        if cluster_id == self.broken && self.armed.load(Ordering::SeqCst) {
            panic!("telemetry backend for {} crashed", cluster_id);
        }
        self.samples.fetch_add(1, Ordering::SeqCst);
        Ok(fields.iter().map(|f| (f.clone(), 50.0)).collect())
    }

    fn ping(&self, _cluster_id: &str, _host_id: &str) -> bool {
        true
    }

    fn ssh(&self, _cluster_id: &str, _host_id: &str) -> bool {
        true
    }
}

fn scheduler(telemetry: Arc<FaultyTelemetry>, clusters: &[&str]) -> Scheduler {
    let directory = Arc::new(AgentDirectory::new(Duration::from_millis(100)));
    let view = FleetView::new();
    let mut scheduler = Scheduler::new(SchedulerConfig {
        tick_interval: Duration::ZERO,
        ping_every: 10,
        ssh_every: 30,
    });
    for id in clusters {
        let mut controller = ClusterController::new(
            *id,
            Thresholds::default(),
            vec!["cpu".to_string(), "mem".to_string()],
            telemetry.clone(),
            Arc::clone(&directory),
            view.clone(),
        );
        controller.add_host("host01");
        controller.add_host("host02");
        scheduler.add_cluster(controller);
    }
    scheduler
}

#[tokio::test]
async fn test_failing_cluster_does_not_stop_others() {
    let telemetry = Arc::new(FaultyTelemetry {
        broken: "A".to_string(),
        armed: AtomicBool::new(true),
        samples: AtomicUsize::new(0),
    });
    let mut scheduler = scheduler(telemetry.clone(), &["A", "B", "C"]);

    // Whatever the shuffled order, B and C are sampled in full
    for _ in 0..5 {
        let report = scheduler.tick().await;
        assert_eq!(report.failed, vec!["A".to_string()]);
        assert_eq!(report.completed, 2);
        assert_eq!(report.order.len(), 3);
    }
    assert_eq!(telemetry.samples.load(Ordering::SeqCst), 5 * 2 * 2);

    // The cluster recovers once its backend does
    telemetry.armed.store(false, Ordering::SeqCst);
    let report = scheduler.tick().await;
    assert!(report.failed.is_empty());
    assert_eq!(report.completed, 3);

    let a = scheduler.cluster("A").unwrap();
    assert_eq!(a.lock().await.snapshot().len(), 2);
}

#[tokio::test]
async fn test_visit_order_is_shuffled() {
    let telemetry = Arc::new(FaultyTelemetry {
        broken: String::new(),
        armed: AtomicBool::new(false),
        samples: AtomicUsize::new(0),
    });
    let ids = ["c1", "c2", "c3", "c4", "c5", "c6"];
    let mut scheduler = scheduler(telemetry, &ids);

    let mut orders = std::collections::HashSet::new();
    for _ in 0..20 {
        orders.insert(scheduler.tick().await.order);
    }
    // 6! orders; twenty identical draws would be astronomically unlikely
    assert!(orders.len() > 1);
}

// ============================================================================
// Concurrent arbitration
// ============================================================================

/// Blocks the first apply until released
struct HeldActuator {
    entered: Notify,
    release: Notify,
    applied: AtomicUsize,
}

#[async_trait]
impl Actuator for HeldActuator {
    async fn still_anomalous(&self, _key: &ProposalKey, _observed: &Observed) -> Option<bool> {
        None
    }

    async fn apply(&self, _action: &RemediationAction) -> Result<(), FleetError> {
        if self.applied.fetch_add(1, Ordering::SeqCst) == 0 {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_identical_proposals_arbitrated_once() {
    let actuator = Arc::new(HeldActuator {
        entered: Notify::new(),
        release: Notify::new(),
        applied: AtomicUsize::new(0),
    });
    let knowledge = Arc::new(KnowledgeBase::embedded().unwrap());
    let gatekeeper = Arc::new(Gatekeeper::new(knowledge, actuator.clone()).unwrap());

    let first = {
        let gatekeeper = Arc::clone(&gatekeeper);
        tokio::spawn(async move {
            let proposal = FixProposal::new("ESX0001", "host01", IssueType::Cpu, Observed::Value(100.0), "cpu-fixer");
            gatekeeper.propose(proposal).await
        })
    };
    actuator.entered.notified().await;

    let duplicates: Vec<_> = (0..4)
        .map(|_| {
            let gatekeeper = Arc::clone(&gatekeeper);
            tokio::spawn(async move {
                let proposal =
                    FixProposal::new("ESX0001", "host01", IssueType::Cpu, Observed::Value(100.0), "cpu-fixer");
                gatekeeper.propose(proposal).await
            })
        })
        .collect();
    for handle in duplicates {
        assert_eq!(handle.await.unwrap(), ProposalOutcome::Superseded);
    }

    actuator.release.notify_one();
    assert!(first.await.unwrap().is_applied());
    assert_eq!(actuator.applied.load(Ordering::SeqCst), 1);
    assert_eq!(gatekeeper.pending_count(), 0);

    let stats = gatekeeper.stats();
    assert_eq!(stats.applied, 1);
    assert_eq!(stats.superseded, 4);
}

#[tokio::test]
async fn test_different_keys_are_not_coalesced() {
    let actuator = Arc::new(HeldActuator {
        entered: Notify::new(),
        release: Notify::new(),
        applied: AtomicUsize::new(1),
    });
    let knowledge = Arc::new(KnowledgeBase::embedded().unwrap());
    let gatekeeper = Gatekeeper::new(knowledge, actuator.clone()).unwrap();

    for (host, issue, value) in [
        ("host01", IssueType::Cpu, 100.0),
        ("host01", IssueType::Disk, 100.0),
        ("host02", IssueType::Cpu, 100.0),
    ] {
        let proposal = FixProposal::new("ESX0001", host, issue, Observed::Value(value), "test");
        assert!(gatekeeper.propose(proposal).await.is_applied());
    }
    assert_eq!(gatekeeper.stats().applied, 3);
}

#[tokio::test]
async fn test_fixer_without_directory_still_records() {
    // Proposals fail to deliver; the issue is still recorded
    let directory = Arc::new(AgentDirectory::new(Duration::from_millis(50)));
    let fixer = FixerAgent::new(IssueType::Io, "agents/gatekeeper".into(), &directory, 4);
    drop(directory);

    fixer
        .flag_issue("ESX0001", "host01", fleet_common::Problem::metric("host01", "io", 100.0))
        .await
        .unwrap();
    fixer.settle().await;
    assert_eq!(fixer.recorded_issues().len(), 1);
}
