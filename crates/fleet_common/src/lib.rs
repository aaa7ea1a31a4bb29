//! Fleet Common - Shared types for the fleet remediation pipeline
//!
//! Issue types, problems, proposals and verdicts exchanged between the
//! cluster controllers, the fixer agents and the gatekeeper.

pub mod error;
pub mod types;

pub use error::FleetError;
pub use types::*;
