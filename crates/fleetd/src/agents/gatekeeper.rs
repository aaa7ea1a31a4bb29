//! Gatekeeper - sole authority allowed to act on the fleet
//!
//! Every proposal goes through the same steps:
//!
//! 1. claim the `(cluster, host, issue type)` key, or answer `Superseded`
//!    if an arbitration for it is already running;
//! 2. ask the knowledge base whether the remediation is feasible;
//! 3. if feasible, take the fleet-wide action lock, re-check that the problem
//!    is still present, and apply the action;
//! 4. release the key.
//!
//! Nothing is retried. A failed action is logged and reported back.

use async_trait::async_trait;
use fleet_common::{FixProposal, FleetError, ProposalKey, ProposalOutcome};
use prometheus::{register_int_counter_vec_with_registry, Encoder, IntCounterVec, Registry, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

use super::pending::PendingArbitrations;
use crate::fleet::{Actuator, RemediationAction};
use crate::knowledge::FeasibilityOracle;

const NO_RATIONALE: &str = "no rationale given";

/// Endpoint fixers propose remediations to
#[async_trait]
pub trait GatekeeperEndpoint: Send + Sync {
    async fn propose(&self, proposal: FixProposal) -> ProposalOutcome;
}

/// Point-in-time copy of the gatekeeper's outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub applied: u64,
    pub superseded: u64,
    pub infeasible: u64,
    pub resolved: u64,
    pub failed: u64,
}

impl StatsSnapshot {
    pub fn total(&self) -> u64 {
        self.applied + self.superseded + self.infeasible + self.resolved + self.failed
    }
}

const OUTCOMES: [&str; 5] = ["applied", "superseded", "infeasible", "resolved", "failed"];

/// Prometheus counters per proposal outcome
#[derive(Clone)]
pub struct GatekeeperStats {
    proposals_total: IntCounterVec,
    registry: Registry,
}

impl GatekeeperStats {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let proposals_total = register_int_counter_vec_with_registry!(
            "fleetd_gatekeeper_proposals_total",
            "Total number of proposals arbitrated by outcome",
            &["outcome"],
            registry
        )?;
        // Export every outcome from the start, zero included
        for outcome in OUTCOMES {
            proposals_total.with_label_values(&[outcome]);
        }
        Ok(Self {
            proposals_total,
            registry,
        })
    }

    fn record(&self, outcome: &ProposalOutcome) {
        let label = match outcome {
            ProposalOutcome::Applied { .. } => "applied",
            ProposalOutcome::Superseded => "superseded",
            ProposalOutcome::Infeasible { .. } => "infeasible",
            ProposalOutcome::Resolved => "resolved",
            ProposalOutcome::Failed { .. } => "failed",
        };
        self.proposals_total.with_label_values(&[label]).inc();
    }

    fn count(&self, outcome: &str) -> u64 {
        self.proposals_total.with_label_values(&[outcome]).get()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            applied: self.count("applied"),
            superseded: self.count("superseded"),
            infeasible: self.count("infeasible"),
            resolved: self.count("resolved"),
            failed: self.count("failed"),
        }
    }

    /// Export counters in Prometheus text format
    pub fn export(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Arbiter and executor of fleet actions
pub struct Gatekeeper {
    oracle: Arc<dyn FeasibilityOracle>,
    actuator: Arc<dyn Actuator>,
    pending: PendingArbitrations,
    /// Held while an action is checked and applied
    action_lock: Mutex<()>,
    recheck_before_apply: bool,
    stats: GatekeeperStats,
}

impl Gatekeeper {
    pub fn new(oracle: Arc<dyn FeasibilityOracle>, actuator: Arc<dyn Actuator>) -> prometheus::Result<Self> {
        Ok(Self {
            oracle,
            actuator,
            pending: PendingArbitrations::new(),
            action_lock: Mutex::new(()),
            recheck_before_apply: true,
            stats: GatekeeperStats::new()?,
        })
    }

    pub fn with_recheck(mut self, recheck_before_apply: bool) -> Self {
        self.recheck_before_apply = recheck_before_apply;
        self
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Outcome counters in Prometheus text format
    pub fn export_metrics(&self) -> prometheus::Result<String> {
        self.stats.export()
    }

    /// Whether an arbitration for `key` is running
    pub fn is_pending(&self, key: &ProposalKey) -> bool {
        self.pending.contains(key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    async fn arbitrate(&self, proposal: &FixProposal, key: ProposalKey) -> ProposalOutcome {
        let verdict = self
            .oracle
            .query(proposal.issue_type, &proposal.host_id, &proposal.facts());

        if !verdict.feasible {
            let rationale = verdict.rationale.unwrap_or_else(|| NO_RATIONALE.to_string());
            let rejection = FleetError::InfeasibleSolution {
                key,
                rationale: rationale.clone(),
            };
            error!("{}; rejected request: {:?}", rejection, proposal);
            return ProposalOutcome::Infeasible { rationale };
        }

        let action = RemediationAction {
            kind: verdict.action.unwrap_or(proposal.suggested),
            key,
            proposal_id: proposal.proposal_id,
            agent_id: proposal.agent_id.clone(),
        };

        let _serial = self.action_lock.lock().await;

        if self.recheck_before_apply && self.actuator.still_anomalous(&action.key, &proposal.observed).await == Some(false) {
            info!(
                "Problem {} cleared before remediation, dropping proposal {}",
                action.key, proposal.proposal_id
            );
            return ProposalOutcome::Resolved;
        }

        match self.actuator.apply(&action).await {
            Ok(()) => ProposalOutcome::Applied { action: action.kind },
            Err(e) => {
                error!("Remediation {} for proposal {} failed: {}", action.kind, proposal.proposal_id, e);
                ProposalOutcome::Failed { reason: e.to_string() }
            }
        }
    }
}

#[async_trait]
impl GatekeeperEndpoint for Gatekeeper {
    async fn propose(&self, proposal: FixProposal) -> ProposalOutcome {
        let key = proposal.key();

        let outcome = match self.pending.try_claim(key.clone()) {
            None => {
                let note = FleetError::DuplicateProposal { key };
                info!("{} (agent {}, proposal {})", note, proposal.agent_id, proposal.proposal_id);
                ProposalOutcome::Superseded
            }
            Some(_entry) => self.arbitrate(&proposal, key).await,
        };

        self.stats.record(&outcome);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::KnowledgeBase;
    use fleet_common::{Facts, IssueType, Observed, RemediationKind, Verdict};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedOracle(Verdict);

    impl FeasibilityOracle for FixedOracle {
        fn query(&self, _issue_type: IssueType, _host_id: &str, _facts: &Facts) -> Verdict {
            self.0.clone()
        }
    }

    #[derive(Default)]
    struct CountingActuator {
        applied: AtomicUsize,
        cleared: bool,
        fail: bool,
        kinds: std::sync::Mutex<Vec<RemediationKind>>,
    }

    #[async_trait]
    impl Actuator for CountingActuator {
        async fn still_anomalous(&self, _key: &ProposalKey, _observed: &Observed) -> Option<bool> {
            if self.cleared {
                Some(false)
            } else {
                None
            }
        }

        async fn apply(&self, action: &RemediationAction) -> Result<(), FleetError> {
            if self.fail {
                return Err(FleetError::ActionFailed {
                    key: action.key.clone(),
                    reason: "host refused".to_string(),
                });
            }
            self.applied.fetch_add(1, Ordering::SeqCst);
            self.kinds.lock().unwrap().push(action.kind);
            Ok(())
        }
    }

    fn proposal(issue: IssueType, value: f64) -> FixProposal {
        FixProposal::new("ESX0001", "host01", issue, Observed::Value(value), "test-fixer")
    }

    #[tokio::test]
    async fn test_feasible_applies_once_and_clears() {
        let actuator = Arc::new(CountingActuator::default());
        let gk = Gatekeeper::new(Arc::new(FixedOracle(Verdict::feasible())), actuator.clone()).unwrap();

        let outcome = gk.propose(proposal(IssueType::Disk, 100.0)).await;
        assert_eq!(outcome, ProposalOutcome::Applied { action: RemediationKind::Cleanup });
        assert_eq!(actuator.applied.load(Ordering::SeqCst), 1);
        assert_eq!(gk.pending_count(), 0);

        // Same key again is a new proposal, not a duplicate
        let outcome = gk.propose(proposal(IssueType::Disk, 100.0)).await;
        assert!(outcome.is_applied());
        assert_eq!(actuator.applied.load(Ordering::SeqCst), 2);
    }

    /// Holds every apply until released
    struct GatedActuator {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
        applied: AtomicUsize,
    }

    #[async_trait]
    impl Actuator for GatedActuator {
        async fn still_anomalous(&self, _key: &ProposalKey, _observed: &Observed) -> Option<bool> {
            None
        }

        async fn apply(&self, _action: &RemediationAction) -> Result<(), FleetError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.applied.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_duplicate_while_pending_is_superseded() {
        let actuator = Arc::new(GatedActuator {
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
            applied: AtomicUsize::new(0),
        });
        let gk = Arc::new(Gatekeeper::new(Arc::new(FixedOracle(Verdict::feasible())), actuator.clone()).unwrap());

        let first = {
            let gk = Arc::clone(&gk);
            tokio::spawn(async move { gk.propose(proposal(IssueType::Cpu, 100.0)).await })
        };
        actuator.entered.notified().await;
        assert!(gk.is_pending(&ProposalKey::new("ESX0001", "host01", IssueType::Cpu)));

        let second = gk.propose(proposal(IssueType::Cpu, 100.0)).await;
        assert_eq!(second, ProposalOutcome::Superseded);

        actuator.release.notify_one();
        assert!(first.await.unwrap().is_applied());
        assert_eq!(actuator.applied.load(Ordering::SeqCst), 1);
        assert_eq!(gk.pending_count(), 0);
        assert_eq!(gk.stats().superseded, 1);
    }

    #[tokio::test]
    async fn test_infeasible_never_applies() {
        let actuator = Arc::new(CountingActuator::default());
        let gk = Gatekeeper::new(
            Arc::new(FixedOracle(Verdict::infeasible("policy says no"))),
            actuator.clone(),
        )
        .unwrap();

        let outcome = gk.propose(proposal(IssueType::Cpu, 100.0)).await;
        assert_eq!(
            outcome,
            ProposalOutcome::Infeasible {
                rationale: "policy says no".to_string()
            }
        );
        assert_eq!(actuator.applied.load(Ordering::SeqCst), 0);
        assert_eq!(gk.pending_count(), 0);
        assert_eq!(gk.stats().infeasible, 1);
    }

    #[tokio::test]
    async fn test_verdict_action_overrides_suggestion() {
        let actuator = Arc::new(CountingActuator::default());
        let verdict = Verdict::feasible().with_action(RemediationKind::Reboot);
        let gk = Gatekeeper::new(Arc::new(FixedOracle(verdict)), actuator.clone()).unwrap();

        gk.propose(proposal(IssueType::Temp, 120.0)).await;
        assert_eq!(*actuator.kinds.lock().unwrap(), vec![RemediationKind::Reboot]);
    }

    #[tokio::test]
    async fn test_recheck_drops_cleared_problem() {
        let actuator = Arc::new(CountingActuator {
            cleared: true,
            ..Default::default()
        });
        let gk = Gatekeeper::new(Arc::new(FixedOracle(Verdict::feasible())), actuator.clone()).unwrap();

        assert_eq!(gk.propose(proposal(IssueType::Io, 100.0)).await, ProposalOutcome::Resolved);
        assert_eq!(actuator.applied.load(Ordering::SeqCst), 0);

        let gk = gk.with_recheck(false);
        assert!(gk.propose(proposal(IssueType::Io, 100.0)).await.is_applied());
        assert_eq!(actuator.applied.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_action_is_reported_and_cleared() {
        let actuator = Arc::new(CountingActuator {
            fail: true,
            ..Default::default()
        });
        let gk = Gatekeeper::new(Arc::new(FixedOracle(Verdict::feasible())), actuator).unwrap();

        let outcome = gk.propose(proposal(IssueType::Mem, 100.0)).await;
        assert!(matches!(outcome, ProposalOutcome::Failed { .. }));
        assert_eq!(gk.pending_count(), 0);
        assert_eq!(gk.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_with_embedded_knowledge() {
        let actuator = Arc::new(CountingActuator::default());
        let kb = Arc::new(KnowledgeBase::embedded().unwrap());
        let gk = Gatekeeper::new(kb, actuator.clone()).unwrap();

        assert!(gk.propose(proposal(IssueType::Cpu, 100.0)).await.is_applied());
        assert!(matches!(
            gk.propose(proposal(IssueType::Mem, 2.0)).await,
            ProposalOutcome::Infeasible { .. }
        ));
        assert_eq!(gk.stats(), StatsSnapshot { applied: 1, infeasible: 1, ..Default::default() });
    }

    #[tokio::test]
    async fn test_stats_exported_as_prometheus_text() {
        let actuator = Arc::new(CountingActuator::default());
        let gk = Gatekeeper::new(Arc::new(FixedOracle(Verdict::feasible())), actuator).unwrap();
        gk.propose(proposal(IssueType::Cpu, 100.0)).await;

        let text = gk.export_metrics().unwrap();
        assert!(text.contains("# TYPE fleetd_gatekeeper_proposals_total counter"));
        assert!(text.contains("fleetd_gatekeeper_proposals_total{outcome=\"applied\"} 1"));
        assert!(text.contains("fleetd_gatekeeper_proposals_total{outcome=\"superseded\"} 0"));
    }

    #[tokio::test]
    async fn test_recheck_looks_at_the_failed_probe_only() {
        use crate::fleet::{FleetView, SimulatedActuator};
        use crate::host::Host;
        use fleet_common::{ProbeKind, Thresholds};

        let view = FleetView::new();
        let actuator = Arc::new(SimulatedActuator::new(view.clone(), Thresholds::default()));
        let kb = Arc::new(KnowledgeBase::embedded().unwrap());
        let gk = Gatekeeper::new(kb, actuator.clone()).unwrap();
        let probe_failed = |probe| {
            FixProposal::new("ESX0001", "host01", IssueType::Connectivity, Observed::ProbeFailed(probe), "net-fixer")
        };

        // Ping answers again, ssh is down: the ping problem has cleared
        let mut host = Host::new("host01");
        host.set_reachable(true);
        host.set_shell_available(false);
        view.publish("ESX0001", &host);
        assert_eq!(gk.propose(probe_failed(ProbeKind::Ping)).await, ProposalOutcome::Resolved);
        assert!(gk.propose(probe_failed(ProbeKind::Ssh)).await.is_applied());

        // ssh answers again, ping is down
        host.set_reachable(false);
        host.set_shell_available(true);
        view.publish("ESX0001", &host);
        assert_eq!(gk.propose(probe_failed(ProbeKind::Ssh)).await, ProposalOutcome::Resolved);
        assert!(gk.propose(probe_failed(ProbeKind::Ping)).await.is_applied());

        assert_eq!(actuator.applied().len(), 2);
        assert_eq!(gk.stats(), StatsSnapshot { applied: 2, resolved: 2, ..Default::default() });
    }
}
