//! Error taxonomy for the remediation pipeline
//!
//! Every variant is handled at the component boundary where it is detected.
//! None of them is allowed to reach the scheduler's tick loop.

use crate::types::{ClusterId, HostId, ProposalKey};

/// Pipeline errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FleetError {
    #[error("No fixer registered for '{issue}' in cluster {cluster_id}")]
    UnregisteredFixer { cluster_id: ClusterId, issue: String },

    /// `timed_out` is set when the call was delivered but gave no answer in
    /// time; the agent may still complete it.
    #[error("Agent {address} unreachable: {reason}")]
    UnreachableAgent {
        address: String,
        reason: String,
        timed_out: bool,
    },

    #[error("Remediation for {key} rejected as infeasible: {rationale}")]
    InfeasibleSolution { key: ProposalKey, rationale: String },

    #[error("Telemetry unavailable for host {host_id} in cluster {cluster_id}: {reason}")]
    TelemetryUnavailable {
        cluster_id: ClusterId,
        host_id: HostId,
        reason: String,
    },

    #[error("Proposal for {key} coalesced into the pending arbitration")]
    DuplicateProposal { key: ProposalKey },

    #[error("Action on {key} failed: {reason}")]
    ActionFailed { key: ProposalKey, reason: String },
}

impl FleetError {
    pub fn unreachable(address: impl Into<String>, reason: impl Into<String>) -> Self {
        FleetError::UnreachableAgent {
            address: address.into(),
            reason: reason.into(),
            timed_out: false,
        }
    }

    pub fn no_answer(address: impl Into<String>, timeout: std::time::Duration) -> Self {
        FleetError::UnreachableAgent {
            address: address.into(),
            reason: format!("no answer within {:?}", timeout),
            timed_out: true,
        }
    }

    /// Delivered call whose answer missed the deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, FleetError::UnreachableAgent { timed_out: true, .. })
    }

    /// Duplicate proposals are expected under load and are not failures
    pub fn is_informational(&self) -> bool {
        matches!(self, FleetError::DuplicateProposal { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IssueType;

    #[test]
    fn test_only_duplicates_are_informational() {
        let key = ProposalKey::new("ESX0001", "host01", IssueType::Cpu);
        assert!(FleetError::DuplicateProposal { key: key.clone() }.is_informational());
        assert!(!FleetError::unreachable("fixer/cpu", "not bound").is_informational());
        assert!(!FleetError::InfeasibleSolution {
            key,
            rationale: "no rule matched".to_string()
        }
        .is_informational());
    }

    #[test]
    fn test_timeout_is_told_apart_from_delivery_failure() {
        let late = FleetError::no_answer("agents/gatekeeper", std::time::Duration::from_millis(50));
        assert!(late.is_timeout());
        assert_eq!(late.to_string(), "Agent agents/gatekeeper unreachable: no answer within 50ms");
        assert!(!FleetError::unreachable("agents/gatekeeper", "not bound").is_timeout());
    }

    #[test]
    fn test_error_messages_name_the_target() {
        let err = FleetError::UnregisteredFixer {
            cluster_id: "ESX0002".to_string(),
            issue: "fan".to_string(),
        };
        assert_eq!(err.to_string(), "No fixer registered for 'fan' in cluster ESX0002");
    }
}
