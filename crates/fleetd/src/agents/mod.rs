//! Remediation agents
//!
//! Fixers receive flagged issues from cluster controllers and propose
//! remediations; the gatekeeper arbitrates and applies them. Agents talk to
//! each other only through addresses resolved by the `AgentDirectory`.

pub mod directory;
pub mod fixer;
pub mod gatekeeper;
pub mod pending;

pub use directory::{AgentAddress, AgentDirectory, FixerProxy, GatekeeperProxy};
pub use fixer::{FixerAgent, Fixer, FlaggedIssue};
pub use gatekeeper::{Gatekeeper, GatekeeperEndpoint, GatekeeperStats, StatsSnapshot};
pub use pending::{PendingArbitrations, PendingGuard};
