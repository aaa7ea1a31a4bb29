//! Telemetry sources
//!
//! The pipeline only consumes readings. `RandomTelemetry` stands in for a
//! real metrics source: it draws metrics from a normal distribution and
//! lets probes fail with a small probability.

use crate::config::TelemetryConfig;
use crate::host::MetricReadings;
use fleet_common::FleetError;
use rand::Rng;
use std::f64::consts::TAU;

/// Source of host readings
pub trait TelemetrySource: Send + Sync {
    /// Read every requested metric for a host
    fn sample(
        &self,
        cluster_id: &str,
        host_id: &str,
        fields: &[String],
    ) -> Result<MetricReadings, FleetError>;

    /// Reachability probe
    fn ping(&self, cluster_id: &str, host_id: &str) -> bool;

    /// Remote shell probe
    fn ssh(&self, cluster_id: &str, host_id: &str) -> bool;
}

/// Random stand-in for a metrics backend
#[derive(Debug, Clone)]
pub struct RandomTelemetry {
    mean: f64,
    std_dev: f64,
    dropout_rate: f64,
    ping_success_rate: f64,
    ssh_success_rate: f64,
}

impl RandomTelemetry {
    pub fn new(config: &TelemetryConfig) -> Self {
        Self {
            mean: config.mean,
            std_dev: config.std_dev.abs(),
            dropout_rate: config.dropout_rate.clamp(0.0, 1.0),
            ping_success_rate: config.ping_success_rate.clamp(0.0, 1.0),
            ssh_success_rate: config.ssh_success_rate.clamp(0.0, 1.0),
        }
    }

    /// One normal draw (Box-Muller)
    fn gaussian<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let u1: f64 = 1.0 - rng.gen::<f64>();
        let u2: f64 = rng.gen::<f64>();
        let z = (-2.0 * u1.ln()).sqrt() * (TAU * u2).cos();
        self.mean + self.std_dev * z
    }
}

impl Default for RandomTelemetry {
    fn default() -> Self {
        Self::new(&TelemetryConfig::default())
    }
}

impl TelemetrySource for RandomTelemetry {
    fn sample(
        &self,
        cluster_id: &str,
        host_id: &str,
        fields: &[String],
    ) -> Result<MetricReadings, FleetError> {
        let mut rng = rand::thread_rng();

        if self.dropout_rate > 0.0 && rng.gen_bool(self.dropout_rate) {
            return Err(FleetError::TelemetryUnavailable {
                cluster_id: cluster_id.to_string(),
                host_id: host_id.to_string(),
                reason: "metrics endpoint did not answer".to_string(),
            });
        }

        Ok(fields
            .iter()
            .map(|field| (field.clone(), self.gaussian(&mut rng)))
            .collect())
    }

    fn ping(&self, _cluster_id: &str, _host_id: &str) -> bool {
        rand::thread_rng().gen_bool(self.ping_success_rate)
    }

    fn ssh(&self, _cluster_id: &str, _host_id: &str) -> bool {
        rand::thread_rng().gen_bool(self.ssh_success_rate)
    }
}
