//! Fixer agents
//!
//! One `FixerAgent` per issue type. A flagged issue is recorded and a
//! proposal is sent to the gatekeeper from a background task, so
//! `flag_issue` returns as soon as the issue is recorded. The gatekeeper's
//! answer is only logged: a dropped proposal is never re-sent, a new
//! flagged issue is required.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_common::{ClusterId, FixProposal, FleetError, HostId, IssueType, Problem, ProposalOutcome};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::directory::{AgentAddress, AgentDirectory};

/// Issue as recorded by the fixer that received it
#[derive(Debug, Clone, PartialEq)]
pub struct FlaggedIssue {
    pub cluster_id: ClusterId,
    pub host_id: HostId,
    pub issue_type: IssueType,
    pub problem: Problem,
    pub flagged_at: DateTime<Utc>,
}

impl FlaggedIssue {
    pub fn proposal(&self, agent_id: &str) -> FixProposal {
        FixProposal::new(
            self.cluster_id.clone(),
            self.host_id.clone(),
            self.issue_type,
            self.problem.observed,
            agent_id,
        )
    }
}

/// Remediation capability shared by every fixer variant
#[async_trait]
pub trait Fixer: Send + Sync {
    fn issue_type(&self) -> IssueType;

    fn agent_id(&self) -> &str;

    /// Record an issue and start proposing a fix without waiting for it
    async fn flag_issue(&self, cluster_id: &str, host_id: &str, problem: Problem) -> Result<(), FleetError>;

    /// Send a proposal for `issue` and wait for the gatekeeper's answer
    async fn propose_fix(&self, issue: FlaggedIssue) -> Result<ProposalOutcome, FleetError>;
}

/// Fixer specialized in one issue type
pub struct FixerAgent {
    agent_id: String,
    issue_type: IssueType,
    gatekeeper: AgentAddress,
    directory: Weak<AgentDirectory>,
    history: Mutex<VecDeque<FlaggedIssue>>,
    history_capacity: usize,
    in_flight: Mutex<JoinSet<()>>,
}

impl FixerAgent {
    pub fn new(
        issue_type: IssueType,
        gatekeeper: AgentAddress,
        directory: &Arc<AgentDirectory>,
        history_capacity: usize,
    ) -> Self {
        Self {
            agent_id: format!("{}-fixer", issue_type),
            issue_type,
            gatekeeper,
            directory: Arc::downgrade(directory),
            history: Mutex::new(VecDeque::new()),
            history_capacity: history_capacity.max(1),
            in_flight: Mutex::new(JoinSet::new()),
        }
    }

    /// Issues received so far, oldest first
    pub fn recorded_issues(&self) -> Vec<FlaggedIssue> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().cloned().collect()
    }

    /// Wait for every proposal still in flight
    pub async fn settle(&self) {
        let mut tasks = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *in_flight, JoinSet::new())
        };
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!("{} proposal task aborted: {}", self.agent_id, e);
            }
        }
    }

    fn record(&self, issue: FlaggedIssue) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        if history.len() == self.history_capacity {
            history.pop_front();
        }
        history.push_back(issue);
    }
}

/// Deliver a proposal to the gatekeeper at `address`
async fn submit(
    directory: &Weak<AgentDirectory>,
    address: &AgentAddress,
    proposal: FixProposal,
) -> Result<ProposalOutcome, FleetError> {
    let directory = directory
        .upgrade()
        .ok_or_else(|| FleetError::unreachable(address.as_str(), "agent directory shut down"))?;
    let gatekeeper = directory.connect_gatekeeper(address)?;
    gatekeeper.propose(proposal).await
}

fn log_outcome(agent_id: &str, proposal: &FixProposal, result: &Result<ProposalOutcome, FleetError>) {
    match result {
        Ok(outcome) => info!(
            "{} proposal {} for {}: {}",
            agent_id,
            proposal.proposal_id,
            proposal.key(),
            outcome
        ),
        Err(e) if e.is_timeout() => warn!(
            "{} got no answer within deadline for proposal {} on {}; arbitration may still complete ({})",
            agent_id,
            proposal.proposal_id,
            proposal.key(),
            e
        ),
        Err(e) => warn!(
            "{} could not deliver proposal {} for {}: {}",
            agent_id,
            proposal.proposal_id,
            proposal.key(),
            e
        ),
    }
}

#[async_trait]
impl Fixer for FixerAgent {
    fn issue_type(&self) -> IssueType {
        self.issue_type
    }

    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    async fn flag_issue(&self, cluster_id: &str, host_id: &str, problem: Problem) -> Result<(), FleetError> {
        debug!(
            "{} flagged: cluster={} host={} {}={}",
            self.agent_id, cluster_id, host_id, problem.subject, problem.observed
        );

        let issue = FlaggedIssue {
            cluster_id: cluster_id.to_string(),
            host_id: host_id.to_string(),
            issue_type: self.issue_type,
            problem,
            flagged_at: Utc::now(),
        };
        let proposal = issue.proposal(&self.agent_id);
        self.record(issue);

        let directory = self.directory.clone();
        let gatekeeper = self.gatekeeper.clone();
        let agent_id = self.agent_id.clone();

        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            while in_flight.try_join_next().is_some() {}
            in_flight.spawn(async move {
                let result = submit(&directory, &gatekeeper, proposal.clone()).await;
                log_outcome(&agent_id, &proposal, &result);
            });
        }
        Ok(())
    }

    async fn propose_fix(&self, issue: FlaggedIssue) -> Result<ProposalOutcome, FleetError> {
        let proposal = issue.proposal(&self.agent_id);
        let result = submit(&self.directory, &self.gatekeeper, proposal.clone()).await;
        log_outcome(&self.agent_id, &proposal, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::GatekeeperEndpoint;
    use fleet_common::{Observed, ProbeKind};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingGatekeeper {
        proposals: Mutex<Vec<FixProposal>>,
    }

    #[async_trait]
    impl GatekeeperEndpoint for RecordingGatekeeper {
        async fn propose(&self, proposal: FixProposal) -> ProposalOutcome {
            self.proposals.lock().unwrap().push(proposal);
            ProposalOutcome::Superseded
        }
    }

    fn setup() -> (Arc<AgentDirectory>, Arc<RecordingGatekeeper>) {
        let directory = Arc::new(AgentDirectory::new(Duration::from_millis(500)));
        let gatekeeper = Arc::new(RecordingGatekeeper::default());
        directory.bind_gatekeeper("gk".into(), gatekeeper.clone());
        (directory, gatekeeper)
    }

    #[tokio::test]
    async fn test_flag_issue_records_and_proposes() {
        let (directory, gatekeeper) = setup();
        let fixer = FixerAgent::new(IssueType::Cpu, "gk".into(), &directory, 16);

        fixer
            .flag_issue("ESX0001", "host01", Problem::metric("host01", "cpu", 100.0))
            .await
            .unwrap();
        fixer.settle().await;

        let issues = fixer.recorded_issues();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].issue_type, IssueType::Cpu);

        let proposals = gatekeeper.proposals.lock().unwrap();
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].cluster_id, "ESX0001");
        assert_eq!(proposals[0].host_id, "host01");
        assert_eq!(proposals[0].observed, Observed::Value(100.0));
        assert_eq!(proposals[0].agent_id, "cpu-fixer");
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let (directory, _gatekeeper) = setup();
        let fixer = FixerAgent::new(IssueType::Mem, "gk".into(), &directory, 2);

        for host in ["h1", "h2", "h3"] {
            fixer
                .flag_issue("ESX0001", host, Problem::metric(host, "mem", 100.0))
                .await
                .unwrap();
        }
        fixer.settle().await;

        let hosts: Vec<_> = fixer.recorded_issues().into_iter().map(|i| i.host_id).collect();
        assert_eq!(hosts, vec!["h2", "h3"]);
    }

    #[tokio::test]
    async fn test_missing_gatekeeper_does_not_fail_flag() {
        let directory = Arc::new(AgentDirectory::new(Duration::from_millis(50)));
        let fixer = FixerAgent::new(IssueType::Connectivity, "nowhere".into(), &directory, 8);

        let result = fixer
            .flag_issue("ESX0001", "host01", Problem::probe("host01", ProbeKind::Ping))
            .await;
        assert!(result.is_ok());
        fixer.settle().await;
        assert_eq!(fixer.recorded_issues().len(), 1);

        let issue = fixer.recorded_issues().remove(0);
        let err = fixer.propose_fix(issue).await.unwrap_err();
        assert!(matches!(err, FleetError::UnreachableAgent { .. }));
    }

    #[tokio::test]
    async fn test_propose_fix_returns_outcome() {
        let (directory, gatekeeper) = setup();
        let fixer = FixerAgent::new(IssueType::Fan, "gk".into(), &directory, 4);
        let issue = FlaggedIssue {
            cluster_id: "ESX0002".to_string(),
            host_id: "host03".to_string(),
            issue_type: IssueType::Fan,
            problem: Problem::metric("host03", "fan", 0.5),
            flagged_at: Utc::now(),
        };

        let outcome = fixer.propose_fix(issue).await.unwrap();
        assert_eq!(outcome, ProposalOutcome::Superseded);
        assert_eq!(gatekeeper.proposals.lock().unwrap().len(), 1);
    }
}
