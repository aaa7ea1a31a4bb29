//! Fleet assembly
//!
//! Wires the agent directory, knowledge base, gatekeeper, fixers, cluster
//! controllers and scheduler from a `Config`, and runs the scheduler until
//! shutdown.

use anyhow::{Context, Result};
use fleet_common::IssueType;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::agents::{AgentAddress, AgentDirectory, Fixer, FixerAgent, Gatekeeper, StatsSnapshot};
use crate::cluster::ClusterController;
use crate::config::{fixer_address, Config};
use crate::fleet::{FleetView, SimulatedActuator};
use crate::knowledge::KnowledgeBase;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::telemetry::{RandomTelemetry, TelemetrySource};

/// Shutdown channel that flips to true once `signal` fires.
///
/// If listening for the signal fails the error is logged and the channel is
/// left untouched; its sender stays alive so receivers keep running.
pub fn shutdown_on<F>(signal: F) -> watch::Receiver<bool>
where
    F: Future<Output = std::io::Result<()>> + Send + 'static,
{
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal.await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                let _ = tx.send(true);
            }
            Err(e) => {
                error!("Failed to listen for interrupt: {}", e);
                std::future::pending::<()>().await;
            }
        }
    });
    rx
}

pub struct Fleet {
    directory: Arc<AgentDirectory>,
    gatekeeper: Arc<Gatekeeper>,
    actuator: Arc<SimulatedActuator>,
    fixers: Vec<Arc<FixerAgent>>,
    view: FleetView,
    scheduler: Scheduler,
    settle_timeout: Duration,
}

impl Fleet {
    /// Build a fleet fed by the random telemetry generator
    pub fn build(config: &Config) -> Result<Self> {
        let telemetry = Arc::new(RandomTelemetry::new(&config.telemetry));
        Self::build_with_telemetry(config, telemetry)
    }

    pub fn build_with_telemetry(config: &Config, telemetry: Arc<dyn TelemetrySource>) -> Result<Self> {
        config.validate()?;

        let directory = Arc::new(AgentDirectory::new(config.agents.call_timeout()));

        // Every issue type some cluster routes to needs its rule resource
        let mut required = BTreeSet::new();
        for cluster in &config.clusters {
            for issue in cluster.fixers.keys() {
                match issue.parse::<IssueType>() {
                    Ok(issue_type) => {
                        required.insert(issue_type);
                    }
                    Err(e) => warn!("{} in cluster {} registry", e, cluster.id),
                }
            }
        }
        let required: Vec<IssueType> = required.into_iter().collect();
        let knowledge = KnowledgeBase::initialize(config.knowledge.rules_dir.as_deref(), &required)
            .context("Failed to initialize knowledge base")?;
        info!("[BOOT] Knowledge base ready ({} rule sets)", knowledge.len());

        let view = FleetView::new();
        let actuator = Arc::new(SimulatedActuator::new(view.clone(), config.thresholds));
        let gatekeeper = Arc::new(
            Gatekeeper::new(Arc::new(knowledge), actuator.clone())
                .context("Failed to register gatekeeper metrics")?
                .with_recheck(config.gatekeeper.recheck_before_apply),
        );
        let gatekeeper_address = AgentAddress::new(config.agents.gatekeeper_address.clone());
        directory.bind_gatekeeper(gatekeeper_address.clone(), gatekeeper.clone());

        let fixers: Vec<Arc<FixerAgent>> = IssueType::ALL
            .into_iter()
            .map(|issue| {
                let fixer = Arc::new(FixerAgent::new(
                    issue,
                    gatekeeper_address.clone(),
                    &directory,
                    config.agents.issue_history,
                ));
                directory.bind_fixer(fixer_address(issue).into(), fixer.clone());
                fixer
            })
            .collect();

        let mut scheduler = Scheduler::new(SchedulerConfig::from(&config.scheduler));
        for cluster in &config.clusters {
            let mut controller = ClusterController::new(
                cluster.id.clone(),
                config.thresholds,
                config.telemetry.metrics.clone(),
                Arc::clone(&telemetry),
                Arc::clone(&directory),
                view.clone(),
            );
            for (issue, address) in &cluster.fixers {
                controller.register_fixer(issue.clone(), AgentAddress::new(address.clone()));
            }
            for host_id in cluster.host_ids() {
                controller.add_host(host_id);
            }
            info!(
                "[BOOT] Cluster {} ready: {} hosts, {} fixers",
                cluster.id,
                controller.host_count(),
                controller.registry().len()
            );
            scheduler.add_cluster(controller);
        }

        Ok(Self {
            directory,
            gatekeeper,
            actuator,
            fixers,
            view,
            scheduler,
            settle_timeout: config.settle_timeout(),
        })
    }

    pub fn directory(&self) -> &Arc<AgentDirectory> {
        &self.directory
    }

    pub fn gatekeeper(&self) -> &Arc<Gatekeeper> {
        &self.gatekeeper
    }

    pub fn actuator(&self) -> &Arc<SimulatedActuator> {
        &self.actuator
    }

    pub fn fixer(&self, issue: IssueType) -> Option<&Arc<FixerAgent>> {
        self.fixers.iter().find(|f| f.issue_type() == issue)
    }

    pub fn view(&self) -> &FleetView {
        &self.view
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// Wait for dispatches, then for proposals they triggered.
    /// Returns false if the settle timeout ran out first.
    pub async fn settle(&self) -> bool {
        let drain = async {
            self.scheduler.settle().await;
            for fixer in &self.fixers {
                fixer.settle().await;
            }
        };
        tokio::time::timeout(self.settle_timeout, drain).await.is_ok()
    }

    /// Run until `shutdown` fires or `max_ticks` ticks have run, then settle
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>, max_ticks: Option<u64>) -> StatsSnapshot {
        self.scheduler.run(shutdown, max_ticks).await;

        if !self.settle().await {
            warn!("In-flight work did not settle within {:?}", self.settle_timeout);
        }

        let stats = self.gatekeeper.stats();
        info!(
            "Gatekeeper stats: applied={} superseded={} infeasible={} resolved={} failed={}",
            stats.applied, stats.superseded, stats.infeasible, stats.resolved, stats.failed
        );
        stats
    }
}
