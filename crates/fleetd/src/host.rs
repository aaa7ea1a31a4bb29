//! Simulated virtualization host
//!
//! Holds the latest metric readings and the two connectivity probes.
//! Records are owned by exactly one cluster controller.

use chrono::{DateTime, Utc};
use fleet_common::{HostId, Problem, Thresholds};
use std::collections::BTreeMap;

/// Metric readings from one telemetry cycle, keyed by metric name
pub type MetricReadings = BTreeMap<String, f64>;

/// Host record
#[derive(Debug, Clone)]
pub struct Host {
    id: HostId,
    metrics: MetricReadings,
    reachable: bool,
    shell_available: bool,
    /// When metrics were last recorded
    last_sampled: Option<DateTime<Utc>>,
}

impl Host {
    pub fn new(id: impl Into<HostId>) -> Self {
        Self {
            id: id.into(),
            metrics: MetricReadings::new(),
            reachable: true,
            shell_available: true,
            last_sampled: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn metrics(&self) -> &MetricReadings {
        &self.metrics
    }

    pub fn reachable(&self) -> bool {
        self.reachable
    }

    pub fn shell_available(&self) -> bool {
        self.shell_available
    }

    pub fn last_sampled(&self) -> Option<DateTime<Utc>> {
        self.last_sampled
    }

    /// Replace readings with a fresh telemetry sample
    pub fn record_metrics(&mut self, readings: MetricReadings, at: DateTime<Utc>) {
        self.metrics = readings;
        self.last_sampled = Some(at);
    }

    pub fn set_reachable(&mut self, reachable: bool) {
        self.reachable = reachable;
    }

    pub fn set_shell_available(&mut self, available: bool) {
        self.shell_available = available;
    }

    /// Metric problems for the current readings, in metric name order
    pub fn anomalies(&self, thresholds: &Thresholds) -> Vec<Problem> {
        self.metrics
            .iter()
            .filter(|(_, value)| thresholds.is_anomalous(**value))
            .map(|(name, value)| Problem::metric(self.id.clone(), name.clone(), *value))
            .collect()
    }
}
