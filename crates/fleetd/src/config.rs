//! Configuration management for fleetd.
//!
//! Loads settings from /etc/fleetd/config.toml, an explicit path, or uses
//! defaults. Every field has a default so partial files are accepted.

use anyhow::{bail, Context, Result};
use fleet_common::{IssueType, Thresholds};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/fleetd/config.toml";

/// Scheduler cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Pause between ticks in milliseconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Run the reachability sweep every N ticks
    #[serde(default = "default_ping_every")]
    pub ping_every: u64,

    /// Run the remote shell sweep every N ticks
    #[serde(default = "default_ssh_every")]
    pub ssh_every: u64,

    /// How long shutdown waits for in-flight dispatches
    #[serde(default = "default_settle_timeout")]
    pub settle_timeout_ms: u64,
}

fn default_tick_interval() -> u64 {
    1_000
}

fn default_ping_every() -> u64 {
    10
}

fn default_ssh_every() -> u64 {
    30
}

fn default_settle_timeout() -> u64 {
    5_000
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            ping_every: default_ping_every(),
            ssh_every: default_ssh_every(),
            settle_timeout_ms: default_settle_timeout(),
        }
    }
}

/// Agent addressing and delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Per-call delivery timeout in milliseconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,

    /// Issues each fixer remembers
    #[serde(default = "default_issue_history")]
    pub issue_history: usize,

    /// Address the gatekeeper is bound to
    #[serde(default = "default_gatekeeper_address")]
    pub gatekeeper_address: String,
}

fn default_call_timeout() -> u64 {
    500
}

fn default_issue_history() -> usize {
    256
}

fn default_gatekeeper_address() -> String {
    "agents/gatekeeper".to_string()
}

impl AgentSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout(),
            issue_history: default_issue_history(),
            gatekeeper_address: default_gatekeeper_address(),
        }
    }
}

/// Gatekeeper behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatekeeperSettings {
    /// Check the problem is still present right before acting
    #[serde(default = "default_recheck")]
    pub recheck_before_apply: bool,
}

fn default_recheck() -> bool {
    true
}

impl Default for GatekeeperSettings {
    fn default() -> Self {
        Self {
            recheck_before_apply: default_recheck(),
        }
    }
}

/// Rule resource location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KnowledgeSettings {
    /// Directory holding `<resource>.yaml` rule sets; embedded rules when unset
    #[serde(default)]
    pub rules_dir: Option<PathBuf>,
}

/// Simulated telemetry parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Metrics tracked on every host
    #[serde(default = "default_metrics")]
    pub metrics: Vec<String>,

    #[serde(default = "default_mean")]
    pub mean: f64,

    #[serde(default = "default_std_dev")]
    pub std_dev: f64,

    /// Probability that a host's metrics cannot be read in a cycle
    #[serde(default)]
    pub dropout_rate: f64,

    #[serde(default = "default_ping_success")]
    pub ping_success_rate: f64,

    #[serde(default = "default_ssh_success")]
    pub ssh_success_rate: f64,
}

fn default_metrics() -> Vec<String> {
    IssueType::ALL
        .iter()
        .filter(|issue| issue.is_metric())
        .map(|issue| issue.as_str().to_string())
        .collect()
}

fn default_mean() -> f64 {
    70.0
}

fn default_std_dev() -> f64 {
    10.0
}

fn default_ping_success() -> f64 {
    0.999
}

fn default_ssh_success() -> f64 {
    0.99
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            metrics: default_metrics(),
            mean: default_mean(),
            std_dev: default_std_dev(),
            dropout_rate: 0.0,
            ping_success_rate: default_ping_success(),
            ssh_success_rate: default_ssh_success(),
        }
    }
}

/// One cluster and its fixer registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub id: String,

    /// Explicit host ids
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Generate `host01..hostNN` when no explicit hosts are listed
    #[serde(default)]
    pub host_count: usize,

    /// Issue type string -> fixer address
    #[serde(default = "default_fixers")]
    pub fixers: BTreeMap<String, String>,
}

fn default_fixers() -> BTreeMap<String, String> {
    IssueType::ALL
        .iter()
        .map(|issue| (issue.as_str().to_string(), fixer_address(*issue)))
        .collect()
}

/// Address a standard fixer is bound to
pub fn fixer_address(issue: IssueType) -> String {
    format!("agents/fixer/{}", issue)
}

impl ClusterConfig {
    pub fn new(id: impl Into<String>, host_count: usize) -> Self {
        Self {
            id: id.into(),
            hosts: Vec::new(),
            host_count,
            fixers: default_fixers(),
        }
    }

    /// Host ids for this cluster
    pub fn host_ids(&self) -> Vec<String> {
        if !self.hosts.is_empty() {
            return self.hosts.clone();
        }
        (1..=self.host_count).map(|n| format!("host{:02}", n)).collect()
    }
}

fn default_clusters() -> Vec<ClusterConfig> {
    ["ESX0001", "ESX0002", "ESX0003"]
        .iter()
        .map(|id| ClusterConfig::new(*id, 8))
        .collect()
}

/// Complete fleetd configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub thresholds: Thresholds,

    #[serde(default)]
    pub scheduler: SchedulerSettings,

    #[serde(default)]
    pub agents: AgentSettings,

    #[serde(default)]
    pub gatekeeper: GatekeeperSettings,

    #[serde(default)]
    pub knowledge: KnowledgeSettings,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default = "default_clusters")]
    pub clusters: Vec<ClusterConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            scheduler: SchedulerSettings::default(),
            agents: AgentSettings::default(),
            gatekeeper: GatekeeperSettings::default(),
            knowledge: KnowledgeSettings::default(),
            telemetry: TelemetryConfig::default(),
            clusters: default_clusters(),
        }
    }
}

impl Config {
    /// Load config from an explicit path, the system path, or defaults.
    ///
    /// An explicit path must exist. The system path is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::load_or_default(Path::new(CONFIG_PATH)),
        };
        config.validate()?;
        Ok(config)
    }

    /// Optional config file: defaults when absent or unusable
    fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            info!("No config at {}, using defaults", path.display());
            return Config::default();
        }
        Self::load_from_path(path).unwrap_or_else(|e| {
            warn!("Failed to load config, using defaults: {:#}", e);
            Config::default()
        })
    }

    /// Load config from specific path
    fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let t = &self.thresholds;
        if !t.low.is_finite() || !t.high.is_finite() || t.low > t.high {
            bail!("Invalid thresholds: low={} high={}", t.low, t.high);
        }
        if self.scheduler.ping_every == 0 || self.scheduler.ssh_every == 0 {
            bail!("Probe cadences must be at least one tick");
        }
        let tel = &self.telemetry;
        if tel.metrics.is_empty() {
            bail!("At least one tracked metric is required");
        }
        if !tel.mean.is_finite() || !tel.std_dev.is_finite() || tel.std_dev < 0.0 {
            bail!("Invalid telemetry distribution: mean={} std_dev={}", tel.mean, tel.std_dev);
        }
        for (name, rate) in [
            ("dropout_rate", tel.dropout_rate),
            ("ping_success_rate", tel.ping_success_rate),
            ("ssh_success_rate", tel.ssh_success_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                bail!("Telemetry {} must lie in [0, 1], got {}", name, rate);
            }
        }

        let mut seen = HashSet::new();
        for cluster in &self.clusters {
            if !seen.insert(cluster.id.as_str()) {
                bail!("Duplicate cluster id: {}", cluster.id);
            }
            if let Some((issue, _)) = cluster.fixers.iter().find(|(_, addr)| addr.is_empty()) {
                bail!("Empty fixer address for '{}' in cluster {}", issue, cluster.id);
            }
        }
        Ok(())
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.scheduler.settle_timeout_ms)
    }
}
