//! Fleet access for the gatekeeper
//!
//! Cluster controllers publish the latest status of their hosts into a
//! shared `FleetView`. The gatekeeper acts on hosts only through an
//! `Actuator`, which may consult that view to check a problem is still
//! present before acting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_common::{
    ClusterId, FleetError, HostId, IssueType, Observed, ProbeKind, ProposalKey, RemediationKind, Thresholds,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::host::{Host, MetricReadings};

/// Last published status of one host
#[derive(Debug, Clone, PartialEq)]
pub struct HostStatus {
    pub metrics: MetricReadings,
    pub reachable: bool,
    pub shell_available: bool,
    pub observed_at: DateTime<Utc>,
}

impl HostStatus {
    /// Whether the problem `observed` for `issue` is visible in this status.
    /// A failed probe is checked against that probe alone.
    /// `None` when the status carries no reading for it.
    pub fn shows(&self, issue: IssueType, observed: &Observed, thresholds: &Thresholds) -> Option<bool> {
        if issue.is_metric() {
            return self
                .metrics
                .get(issue.as_str())
                .map(|value| thresholds.is_anomalous(*value));
        }
        match observed.failed_probe() {
            Some(ProbeKind::Ping) => Some(!self.reachable),
            Some(ProbeKind::Ssh) => Some(!self.shell_available),
            None => Some(!self.reachable || !self.shell_available),
        }
    }
}

/// Shared latest status of every host in every cluster
#[derive(Debug, Clone, Default)]
pub struct FleetView {
    hosts: Arc<RwLock<HashMap<(ClusterId, HostId), HostStatus>>>,
}

impl FleetView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, cluster_id: &str, host: &Host) {
        let status = HostStatus {
            metrics: host.metrics().clone(),
            reachable: host.reachable(),
            shell_available: host.shell_available(),
            observed_at: host.last_sampled().unwrap_or_else(Utc::now),
        };
        let mut hosts = self.hosts.write().unwrap_or_else(|e| e.into_inner());
        hosts.insert((cluster_id.to_string(), host.id().to_string()), status);
    }

    pub fn forget(&self, cluster_id: &str, host_id: &str) {
        let mut hosts = self.hosts.write().unwrap_or_else(|e| e.into_inner());
        hosts.remove(&(cluster_id.to_string(), host_id.to_string()));
    }

    pub fn status(&self, cluster_id: &str, host_id: &str) -> Option<HostStatus> {
        let hosts = self.hosts.read().unwrap_or_else(|e| e.into_inner());
        hosts.get(&(cluster_id.to_string(), host_id.to_string())).cloned()
    }

    pub fn len(&self) -> usize {
        self.hosts.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Action the gatekeeper decided to apply
#[derive(Debug, Clone, PartialEq)]
pub struct RemediationAction {
    pub key: ProposalKey,
    pub kind: RemediationKind,
    pub proposal_id: Uuid,
    pub agent_id: String,
}

/// Record of an applied action
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedAction {
    pub action: RemediationAction,
    pub applied_at: DateTime<Utc>,
}

/// Capability to act on hosts
#[async_trait]
pub trait Actuator: Send + Sync {
    /// `Some(false)` when the problem `observed` on `key` has cleared,
    /// `None` when unknown
    async fn still_anomalous(&self, key: &ProposalKey, observed: &Observed) -> Option<bool>;

    async fn apply(&self, action: &RemediationAction) -> Result<(), FleetError>;
}

/// Actuator against the simulated fleet
#[derive(Debug)]
pub struct SimulatedActuator {
    view: FleetView,
    thresholds: Thresholds,
    applied: Mutex<Vec<AppliedAction>>,
}

impl SimulatedActuator {
    pub fn new(view: FleetView, thresholds: Thresholds) -> Self {
        Self {
            view,
            thresholds,
            applied: Mutex::new(Vec::new()),
        }
    }

    /// Every action applied so far, oldest first
    pub fn applied(&self) -> Vec<AppliedAction> {
        self.applied.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Actuator for SimulatedActuator {
    async fn still_anomalous(&self, key: &ProposalKey, observed: &Observed) -> Option<bool> {
        self.view
            .status(&key.cluster_id, &key.host_id)
            .and_then(|status| status.shows(key.issue_type, observed, &self.thresholds))
    }

    async fn apply(&self, action: &RemediationAction) -> Result<(), FleetError> {
        let key = &action.key;
        if self.view.status(&key.cluster_id, &key.host_id).is_none() {
            return Err(FleetError::ActionFailed {
                key: key.clone(),
                reason: "host is not part of the fleet".to_string(),
            });
        }

        if action.kind.is_disruptive() {
            warn!("Bouncing host {} in cluster {}", key.host_id, key.cluster_id);
        } else {
            info!(
                "Applying {} to host {} in cluster {} (proposal {})",
                action.kind, key.host_id, key.cluster_id, action.proposal_id
            );
        }

        self.applied
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(AppliedAction {
                action: action.clone(),
                applied_at: Utc::now(),
            });
        Ok(())
    }
}
