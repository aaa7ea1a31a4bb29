//! Cluster controller
//!
//! Owns the hosts of one cluster and its fixer registry. Each step samples
//! telemetry, classifies anomalies against the threshold band, and hands
//! every problem to the fixer registered for it. Hand-off is fire-and-forget:
//! the step never waits for a fixer to answer.

use chrono::Utc;
use fleet_common::{ClusterId, FleetError, HostId, ProbeKind, Problem, Thresholds};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::registry::FixerRegistry;
use crate::agents::{AgentAddress, AgentDirectory};
use crate::fleet::FleetView;
use crate::host::{Host, MetricReadings};
use crate::telemetry::TelemetrySource;

/// Outcome of one telemetry step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub hosts_sampled: usize,
    /// Hosts whose telemetry was unavailable this cycle
    pub hosts_skipped: usize,
    pub problems: usize,
    pub dispatched: usize,
    /// Problems with no fixer registered for their issue type
    pub unrouted: usize,
    /// Problems whose fixer could not be reached
    pub undeliverable: usize,
}

/// Outcome of one connectivity sweep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub probe: ProbeKind,
    pub probed: usize,
    pub failed: usize,
    pub dispatched: usize,
    pub unrouted: usize,
    pub undeliverable: usize,
}

#[derive(Debug, Default)]
struct DispatchTally {
    dispatched: usize,
    unrouted: usize,
    undeliverable: usize,
}

pub struct ClusterController {
    id: ClusterId,
    hosts: BTreeMap<HostId, Host>,
    registry: FixerRegistry,
    /// Metric names requested from telemetry each cycle
    metrics: Vec<String>,
    thresholds: Thresholds,
    telemetry: Arc<dyn TelemetrySource>,
    directory: Arc<AgentDirectory>,
    view: FleetView,
    /// Readings from the latest cycle, only for hosts sampled in it
    snapshot: BTreeMap<HostId, MetricReadings>,
    /// Problems found by the latest check, not yet handed off
    problems: Vec<Problem>,
    dispatches: JoinSet<()>,
}

impl ClusterController {
    pub fn new(
        id: impl Into<ClusterId>,
        thresholds: Thresholds,
        metrics: Vec<String>,
        telemetry: Arc<dyn TelemetrySource>,
        directory: Arc<AgentDirectory>,
        view: FleetView,
    ) -> Self {
        Self {
            id: id.into(),
            hosts: BTreeMap::new(),
            registry: FixerRegistry::new(),
            metrics,
            thresholds,
            telemetry,
            directory,
            view,
            snapshot: BTreeMap::new(),
            problems: Vec::new(),
            dispatches: JoinSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn host(&self, host_id: &str) -> Option<&Host> {
        self.hosts.get(host_id)
    }

    pub fn host_ids(&self) -> Vec<&str> {
        self.hosts.keys().map(String::as_str).collect()
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    pub fn registry(&self) -> &FixerRegistry {
        &self.registry
    }

    pub fn snapshot(&self) -> &BTreeMap<HostId, MetricReadings> {
        &self.snapshot
    }

    pub fn problems(&self) -> &[Problem] {
        &self.problems
    }

    /// Add a host. Returns false if the id is already taken.
    pub fn add_host(&mut self, host_id: impl Into<HostId>) -> bool {
        let host_id = host_id.into();
        if self.hosts.contains_key(&host_id) {
            warn!("Host {} already in cluster {}, not adding", host_id, self.id);
            return false;
        }
        let host = Host::new(host_id.clone());
        self.view.publish(&self.id, &host);
        self.hosts.insert(host_id, host);
        true
    }

    pub fn remove_host(&mut self, host_id: &str) -> Option<Host> {
        let removed = self.hosts.remove(host_id);
        match removed {
            Some(_) => {
                self.snapshot.remove(host_id);
                self.problems.retain(|p| p.host_id != host_id);
                self.view.forget(&self.id, host_id);
                info!("Removed host {} from cluster {}", host_id, self.id);
            }
            None => warn!("Host {} is not in cluster {}", host_id, self.id),
        }
        removed
    }

    /// See `FixerRegistry::register`
    pub fn register_fixer(&mut self, issue_type: impl Into<String>, address: AgentAddress) -> bool {
        self.registry.register(issue_type, address)
    }

    /// Sample every host. Returns how many hosts were skipped.
    ///
    /// A host whose telemetry is unavailable is left out of the snapshot for
    /// this cycle; its previous readings are not re-evaluated.
    pub fn collect_telemetry(&mut self) -> usize {
        self.snapshot.clear();
        let mut skipped = 0;

        for (host_id, host) in self.hosts.iter_mut() {
            match self.telemetry.sample(&self.id, host_id, &self.metrics) {
                Ok(readings) => {
                    host.record_metrics(readings.clone(), Utc::now());
                    self.view.publish(&self.id, host);
                    self.snapshot.insert(host_id.clone(), readings);
                }
                Err(e) => {
                    warn!("{}; skipping host this cycle", e);
                    skipped += 1;
                }
            }
        }
        skipped
    }

    /// Classify the latest snapshot. Returns the number of problems found.
    pub fn check_telemetry(&mut self) -> usize {
        self.problems = self
            .snapshot
            .keys()
            .filter_map(|host_id| self.hosts.get(host_id))
            .flat_map(|host| host.anomalies(&self.thresholds))
            .collect();

        for problem in &self.problems {
            debug!(
                "Problem in cluster {}: host={} {}={}",
                self.id, problem.host_id, problem.subject, problem.observed
            );
        }
        self.problems.len()
    }

    /// Hand every open problem to its fixer
    pub fn handle_problems(&mut self) -> (usize, usize, usize) {
        let problems = std::mem::take(&mut self.problems);
        let tally = self.dispatch_all(problems);
        (tally.dispatched, tally.unrouted, tally.undeliverable)
    }

    /// Sample, classify and dispatch
    pub fn step(&mut self) -> StepReport {
        let hosts_skipped = self.collect_telemetry();
        let problems = self.check_telemetry();
        let (dispatched, unrouted, undeliverable) = self.handle_problems();

        StepReport {
            hosts_sampled: self.snapshot.len(),
            hosts_skipped,
            problems,
            dispatched,
            unrouted,
            undeliverable,
        }
    }

    /// Reachability sweep
    pub fn ping_all(&mut self) -> ProbeReport {
        self.probe_all(ProbeKind::Ping)
    }

    /// Remote shell sweep
    pub fn probe_shell_all(&mut self) -> ProbeReport {
        self.probe_all(ProbeKind::Ssh)
    }

    fn probe_all(&mut self, probe: ProbeKind) -> ProbeReport {
        let mut failures = Vec::new();

        for (host_id, host) in self.hosts.iter_mut() {
            let ok = match probe {
                ProbeKind::Ping => {
                    let ok = self.telemetry.ping(&self.id, host_id);
                    host.set_reachable(ok);
                    ok
                }
                ProbeKind::Ssh => {
                    let ok = self.telemetry.ssh(&self.id, host_id);
                    host.set_shell_available(ok);
                    ok
                }
            };
            self.view.publish(&self.id, host);
            if !ok {
                warn!("{} probe failed for host {} in cluster {}", probe, host_id, self.id);
                failures.push(Problem::probe(host_id.clone(), probe));
            }
        }

        let failed = failures.len();
        let tally = self.dispatch_all(failures);
        ProbeReport {
            probe,
            probed: self.hosts.len(),
            failed,
            dispatched: tally.dispatched,
            unrouted: tally.unrouted,
            undeliverable: tally.undeliverable,
        }
    }

    fn dispatch_all(&mut self, problems: Vec<Problem>) -> DispatchTally {
        while self.dispatches.try_join_next().is_some() {}

        let mut tally = DispatchTally::default();
        for problem in problems {
            let Some(address) = self.registry.resolve(problem.registry_key()) else {
                let err = FleetError::UnregisteredFixer {
                    cluster_id: self.id.clone(),
                    issue: problem.registry_key().to_string(),
                };
                warn!("{}; dropping problem on host {}", err, problem.host_id);
                tally.unrouted += 1;
                continue;
            };

            let proxy = match self.directory.connect_fixer(address) {
                Ok(proxy) => proxy,
                Err(e) => {
                    warn!("{}; dropping problem on host {}", e, problem.host_id);
                    tally.undeliverable += 1;
                    continue;
                }
            };

            let cluster_id = self.id.clone();
            self.dispatches.spawn(async move {
                let host_id = problem.host_id.clone();
                if let Err(e) = proxy.flag_issue(&cluster_id, &host_id, problem).await {
                    warn!("{}; problem on host {} in cluster {} dropped", e, host_id, cluster_id);
                }
            });
            tally.dispatched += 1;
        }
        tally
    }

    /// Wait for every dispatch still in flight
    pub async fn settle(&mut self) {
        while let Some(result) = self.dispatches.join_next().await {
            if let Err(e) = result {
                warn!("Dispatch task in cluster {} aborted: {}", self.id, e);
            }
        }
    }
}
