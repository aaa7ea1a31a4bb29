//! Fleet daemon library - exposes modules for testing.

pub mod agents;
pub mod cluster;
pub mod config;
pub mod daemon;
pub mod fleet;
pub mod host;
pub mod knowledge;
pub mod scheduler;
pub mod telemetry;
