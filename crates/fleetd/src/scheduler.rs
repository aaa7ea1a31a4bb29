//! Tick scheduler
//!
//! Every tick visits all clusters in a freshly shuffled order and runs one
//! telemetry step on each. Connectivity sweeps run on coarser cadences
//! (`ping_every`, `ssh_every`, counted on the global tick number which
//! starts at 1).
//!
//! Each cluster's work runs as its own task. An error or panic while
//! processing one cluster is logged and the remaining clusters of the same
//! tick are still processed.

use fleet_common::ClusterId;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info};

use crate::cluster::{ClusterController, ProbeReport, StepReport};
use crate::config::SchedulerSettings;

/// Controller shared between the scheduler and its per-cluster tasks
pub type SharedCluster = Arc<Mutex<ClusterController>>;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub ping_every: u64,
    pub ssh_every: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&SchedulerSettings::default())
    }
}

impl From<&SchedulerSettings> for SchedulerConfig {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            tick_interval: Duration::from_millis(settings.tick_interval_ms),
            ping_every: settings.ping_every.max(1),
            ssh_every: settings.ssh_every.max(1),
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub tick: u64,
    /// Visit order of this tick
    pub order: Vec<ClusterId>,
    pub completed: usize,
    /// Clusters whose work failed this tick
    pub failed: Vec<ClusterId>,
    pub pinged: bool,
    pub shell_probed: bool,
    pub problems: usize,
    pub probe_failures: usize,
    pub dispatched: usize,
}

struct ClusterPass {
    step: StepReport,
    ping: Option<ProbeReport>,
    ssh: Option<ProbeReport>,
}

pub struct Scheduler {
    config: SchedulerConfig,
    clusters: Vec<(ClusterId, SharedCluster)>,
    ticks: u64,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            clusters: Vec::new(),
            ticks: 0,
        }
    }

    pub fn add_cluster(&mut self, controller: ClusterController) -> SharedCluster {
        let id = controller.id().to_string();
        let shared = Arc::new(Mutex::new(controller));
        self.clusters.push((id, Arc::clone(&shared)));
        shared
    }

    pub fn cluster(&self, cluster_id: &str) -> Option<SharedCluster> {
        self.clusters
            .iter()
            .find(|(id, _)| id == cluster_id)
            .map(|(_, c)| Arc::clone(c))
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    /// Ticks run so far
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Run one tick over every cluster
    pub async fn tick(&mut self) -> TickReport {
        self.ticks += 1;
        let tick = self.ticks;
        let ping = tick % self.config.ping_every == 0;
        let ssh = tick % self.config.ssh_every == 0;

        let mut order: Vec<usize> = (0..self.clusters.len()).collect();
        order.shuffle(&mut rand::thread_rng());

        let mut report = TickReport {
            tick,
            pinged: ping,
            shell_probed: ssh,
            ..TickReport::default()
        };

        for index in order {
            let (id, cluster) = &self.clusters[index];
            report.order.push(id.clone());

            let cluster = Arc::clone(cluster);
            let handle = tokio::spawn(async move {
                let mut controller = cluster.lock().await;
                let step = controller.step();
                let ping = ping.then(|| controller.ping_all());
                let ssh = ssh.then(|| controller.probe_shell_all());
                ClusterPass { step, ping, ssh }
            });

            match handle.await {
                Ok(pass) => {
                    debug!(
                        "Tick {} cluster {}: {} problems, {} dispatched",
                        tick, id, pass.step.problems, pass.step.dispatched
                    );
                    report.completed += 1;
                    report.problems += pass.step.problems;
                    report.dispatched += pass.step.dispatched;
                    for probe in pass.ping.iter().chain(pass.ssh.iter()) {
                        report.probe_failures += probe.failed;
                        report.dispatched += probe.dispatched;
                    }
                }
                Err(e) => {
                    error!("Cluster {} failed during tick {}: {}", id, tick, e);
                    report.failed.push(id.clone());
                }
            }
        }
        report
    }

    /// Tick until `shutdown` flips to true, its sender goes away, or
    /// `max_ticks` ticks have run. Returns the number of ticks run.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>, max_ticks: Option<u64>) -> u64 {
        info!(
            "Scheduler started: {} clusters, ping every {} ticks, ssh every {} ticks",
            self.clusters.len(),
            self.config.ping_every,
            self.config.ssh_every
        );
        let start = self.ticks;

        loop {
            if *shutdown.borrow() || max_ticks.is_some_and(|max| self.ticks - start >= max) {
                break;
            }
            let report = self.tick().await;
            if !report.failed.is_empty() {
                info!("Tick {} finished with failed clusters: {:?}", report.tick, report.failed);
            }
            if max_ticks.is_some_and(|max| self.ticks - start >= max) {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        let ran = self.ticks - start;
        info!("Scheduler stopped after {} ticks", ran);
        ran
    }

    /// Wait for every dispatch still in flight in every cluster
    pub async fn settle(&self) {
        for (_, cluster) in &self.clusters {
            cluster.lock().await.settle().await;
        }
    }
}
