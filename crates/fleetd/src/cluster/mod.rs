//! Clusters of hosts and their controllers

pub mod controller;
pub mod registry;

pub use controller::{ClusterController, ProbeReport, StepReport};
pub use registry::FixerRegistry;
