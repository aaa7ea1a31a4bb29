//! Core data types for the remediation pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type ClusterId = String;
pub type HostId = String;

/// Registry key reserved for reachability and shell-access failures
pub const CONNECTIVITY: &str = "connectivity";

// ============================================================================
// Issue types
// ============================================================================

/// Kind of problem a fixer agent is specialized in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueType {
    Cpu,
    Mem,
    Disk,
    Io,
    Temp,
    Fan,
    Connectivity,
}

impl IssueType {
    pub const ALL: [IssueType; 7] = [
        IssueType::Cpu,
        IssueType::Mem,
        IssueType::Disk,
        IssueType::Io,
        IssueType::Temp,
        IssueType::Fan,
        IssueType::Connectivity,
    ];

    /// Registry key for this issue type
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::Cpu => "cpu",
            IssueType::Mem => "mem",
            IssueType::Disk => "disk",
            IssueType::Io => "io",
            IssueType::Temp => "temp",
            IssueType::Fan => "fan",
            IssueType::Connectivity => CONNECTIVITY,
        }
    }

    /// Name of the rule resource backing this issue type
    pub fn rule_resource(&self) -> &'static str {
        match self {
            IssueType::Connectivity => "network",
            other => other.as_str(),
        }
    }

    /// Issue type whose rule resource carries the given name
    pub fn from_rule_resource(resource: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|issue| issue.rule_resource() == resource)
    }

    /// Whether this issue type is driven by a numeric metric
    pub fn is_metric(&self) -> bool {
        !matches!(self, IssueType::Connectivity)
    }

    /// Remediation a fixer of this type proposes for an observation
    pub fn default_remediation(&self, observed: &Observed) -> RemediationKind {
        match self {
            IssueType::Cpu => RemediationKind::Rebalance,
            IssueType::Mem => RemediationKind::Reclaim,
            IssueType::Disk => RemediationKind::Cleanup,
            IssueType::Io => RemediationKind::Throttle,
            IssueType::Temp => RemediationKind::Cooldown,
            IssueType::Fan => RemediationKind::FanReset,
            IssueType::Connectivity => match observed {
                Observed::ProbeFailed(ProbeKind::Ssh) => RemediationKind::RestartShell,
                _ => RemediationKind::Reboot,
            },
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when an issue type string has no exact match
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown issue type: {0}")]
pub struct UnknownIssueType(pub String);

impl FromStr for IssueType {
    type Err = UnknownIssueType;

    // Exact match: "CPU" is not "cpu".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|issue| issue.as_str() == s)
            .ok_or_else(|| UnknownIssueType(s.to_string()))
    }
}

/// Connectivity probe run against a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Ping,
    Ssh,
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Ping => "ping",
            ProbeKind::Ssh => "ssh",
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Corrective action the gatekeeper can apply to a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationKind {
    /// Move workloads off an over- or under-used host
    Rebalance,
    /// Reclaim memory from idle workloads
    Reclaim,
    /// Free disk space
    Cleanup,
    /// Throttle noisy I/O consumers
    Throttle,
    /// Lower load until temperature recovers
    Cooldown,
    /// Reset fan controller
    FanReset,
    /// Restart the remote shell service
    RestartShell,
    /// Bounce the host
    Reboot,
}

impl RemediationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemediationKind::Rebalance => "rebalance",
            RemediationKind::Reclaim => "reclaim",
            RemediationKind::Cleanup => "cleanup",
            RemediationKind::Throttle => "throttle",
            RemediationKind::Cooldown => "cooldown",
            RemediationKind::FanReset => "fan_reset",
            RemediationKind::RestartShell => "restart_shell",
            RemediationKind::Reboot => "reboot",
        }
    }

    /// Actions that interrupt every workload on the host
    pub fn is_disruptive(&self) -> bool {
        matches!(self, RemediationKind::Reboot)
    }
}

impl fmt::Display for RemediationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Observations and problems
// ============================================================================

/// What was observed on a host when a problem was flagged
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Observed {
    /// Metric reading outside the threshold band
    Value(f64),
    /// Connectivity probe that returned false
    ProbeFailed(ProbeKind),
}

impl Observed {
    pub fn value(&self) -> Option<f64> {
        match self {
            Observed::Value(v) => Some(*v),
            Observed::ProbeFailed(_) => None,
        }
    }

    pub fn failed_probe(&self) -> Option<ProbeKind> {
        match self {
            Observed::ProbeFailed(probe) => Some(*probe),
            Observed::Value(_) => None,
        }
    }
}

impl fmt::Display for Observed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Observed::Value(v) => write!(f, "{:.2}", v),
            Observed::ProbeFailed(probe) => write!(f, "{} failed", probe),
        }
    }
}

/// Anomaly found on a host during one telemetry cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Problem {
    pub host_id: HostId,
    /// Metric name ("cpu", "mem", ...) or probe name ("ping", "ssh")
    pub subject: String,
    pub observed: Observed,
}

impl Problem {
    pub fn metric(host_id: impl Into<HostId>, metric: impl Into<String>, value: f64) -> Self {
        Self {
            host_id: host_id.into(),
            subject: metric.into(),
            observed: Observed::Value(value),
        }
    }

    pub fn probe(host_id: impl Into<HostId>, probe: ProbeKind) -> Self {
        Self {
            host_id: host_id.into(),
            subject: probe.as_str().to_string(),
            observed: Observed::ProbeFailed(probe),
        }
    }

    /// Registry key used to route this problem to a fixer
    pub fn registry_key(&self) -> &str {
        match self.observed {
            Observed::ProbeFailed(_) => CONNECTIVITY,
            Observed::Value(_) => &self.subject,
        }
    }
}

// ============================================================================
// Thresholds
// ============================================================================

fn default_low() -> f64 {
    5.0
}

fn default_high() -> f64 {
    99.0
}

/// Band `[low, high]` outside of which a metric is anomalous
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_low")]
    pub low: f64,
    #[serde(default = "default_high")]
    pub high: f64,
}

impl Thresholds {
    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    /// True when `value` falls outside the band. NaN is never inside.
    pub fn is_anomalous(&self, value: f64) -> bool {
        !(self.low..=self.high).contains(&value)
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            low: default_low(),
            high: default_high(),
        }
    }
}

// ============================================================================
// Proposals and arbitration
// ============================================================================

/// Deduplication key for pending arbitrations
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProposalKey {
    pub cluster_id: ClusterId,
    pub host_id: HostId,
    pub issue_type: IssueType,
}

impl ProposalKey {
    pub fn new(cluster_id: impl Into<ClusterId>, host_id: impl Into<HostId>, issue_type: IssueType) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            host_id: host_id.into(),
            issue_type,
        }
    }
}

impl fmt::Display for ProposalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.cluster_id, self.host_id, self.issue_type)
    }
}

/// Remediation request sent by a fixer agent to the gatekeeper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixProposal {
    pub proposal_id: Uuid,
    pub cluster_id: ClusterId,
    pub host_id: HostId,
    pub issue_type: IssueType,
    pub observed: Observed,
    pub agent_id: String,
    /// Action the proposing agent would apply
    pub suggested: RemediationKind,
    pub created_at: DateTime<Utc>,
}

impl FixProposal {
    pub fn new(
        cluster_id: impl Into<ClusterId>,
        host_id: impl Into<HostId>,
        issue_type: IssueType,
        observed: Observed,
        agent_id: impl Into<String>,
    ) -> Self {
        Self {
            proposal_id: Uuid::new_v4(),
            cluster_id: cluster_id.into(),
            host_id: host_id.into(),
            issue_type,
            observed,
            agent_id: agent_id.into(),
            suggested: issue_type.default_remediation(&observed),
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> ProposalKey {
        ProposalKey::new(self.cluster_id.clone(), self.host_id.clone(), self.issue_type)
    }

    pub fn facts(&self) -> Facts {
        Facts {
            observed: self.observed,
        }
    }
}

/// Facts handed to the knowledge base with a feasibility query
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Facts {
    pub observed: Observed,
}

impl Facts {
    pub fn value(value: f64) -> Self {
        Self {
            observed: Observed::Value(value),
        }
    }

    pub fn probe_failed(probe: ProbeKind) -> Self {
        Self {
            observed: Observed::ProbeFailed(probe),
        }
    }
}

/// Knowledge base answer to a feasibility query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub feasible: bool,
    pub rationale: Option<String>,
    /// Action the rule prescribes instead of the proposed one
    pub action: Option<RemediationKind>,
}

impl Verdict {
    pub fn feasible() -> Self {
        Self {
            feasible: true,
            rationale: None,
            action: None,
        }
    }

    pub fn infeasible(rationale: impl Into<String>) -> Self {
        Self {
            feasible: false,
            rationale: Some(rationale.into()),
            action: None,
        }
    }

    pub fn with_action(mut self, action: RemediationKind) -> Self {
        self.action = Some(action);
        self
    }
}

/// Result of a proposal as reported back to the proposing agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProposalOutcome {
    /// Action applied against the host
    Applied { action: RemediationKind },
    /// Another proposal for the same key was already pending
    Superseded,
    /// Knowledge base rejected the remediation
    Infeasible { rationale: String },
    /// Problem cleared before the action was applied
    Resolved,
    /// Action was attempted and failed
    Failed { reason: String },
}

impl ProposalOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalOutcome::Applied { .. } => "applied",
            ProposalOutcome::Superseded => "superseded",
            ProposalOutcome::Infeasible { .. } => "dropped-infeasible",
            ProposalOutcome::Resolved => "resolved",
            ProposalOutcome::Failed { .. } => "failed",
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, ProposalOutcome::Applied { .. })
    }
}

impl fmt::Display for ProposalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProposalOutcome::Applied { action } => write!(f, "applied ({})", action),
            ProposalOutcome::Infeasible { rationale } => {
                write!(f, "dropped-infeasible ({})", rationale)
            }
            ProposalOutcome::Failed { reason } => write!(f, "failed ({})", reason),
            other => f.write_str(other.as_str()),
        }
    }
}
