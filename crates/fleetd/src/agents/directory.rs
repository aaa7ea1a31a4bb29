//! Agent addressing
//!
//! Agents are bound to opaque addresses. Callers `connect` to an address and
//! get a proxy whose calls run as their own task and are answered within the
//! configured deadline. A missing binding or a late answer both surface as
//! `FleetError::UnreachableAgent`; nothing here retries.

use fleet_common::{FixProposal, FleetError, Problem, ProposalOutcome};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

use super::fixer::Fixer;
use super::gatekeeper::GatekeeperEndpoint;

/// Opaque logical agent address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AgentAddress(String);

impl AgentAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentAddress {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for AgentAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

#[derive(Clone)]
enum Binding {
    Fixer(Arc<dyn Fixer>),
    Gatekeeper(Arc<dyn GatekeeperEndpoint>),
}

impl Binding {
    fn kind(&self) -> &'static str {
        match self {
            Binding::Fixer(_) => "fixer",
            Binding::Gatekeeper(_) => "gatekeeper",
        }
    }
}

/// Address book for every agent in the process
pub struct AgentDirectory {
    bindings: RwLock<HashMap<AgentAddress, Binding>>,
    call_timeout: Duration,
}

impl AgentDirectory {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
            call_timeout,
        }
    }

    /// Bind a fixer, replacing whatever was bound to the address
    pub fn bind_fixer(&self, address: AgentAddress, fixer: Arc<dyn Fixer>) {
        debug!("Binding {} fixer {} at {}", fixer.issue_type(), fixer.agent_id(), address);
        self.bind(address, Binding::Fixer(fixer));
    }

    /// Bind a gatekeeper, replacing whatever was bound to the address
    pub fn bind_gatekeeper(&self, address: AgentAddress, gatekeeper: Arc<dyn GatekeeperEndpoint>) {
        debug!("Binding gatekeeper at {}", address);
        self.bind(address, Binding::Gatekeeper(gatekeeper));
    }

    fn bind(&self, address: AgentAddress, binding: Binding) {
        let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        bindings.insert(address, binding);
    }

    /// Remove a binding. Returns whether something was bound.
    pub fn unbind(&self, address: &AgentAddress) -> bool {
        let mut bindings = self.bindings.write().unwrap_or_else(|e| e.into_inner());
        bindings.remove(address).is_some()
    }

    pub fn is_bound(&self, address: &AgentAddress) -> bool {
        let bindings = self.bindings.read().unwrap_or_else(|e| e.into_inner());
        bindings.contains_key(address)
    }

    fn lookup(&self, address: &AgentAddress) -> Result<Binding, FleetError> {
        let bindings = self.bindings.read().unwrap_or_else(|e| e.into_inner());
        bindings
            .get(address)
            .cloned()
            .ok_or_else(|| FleetError::unreachable(address.as_str(), "no agent bound to address"))
    }

    pub fn connect_fixer(&self, address: &AgentAddress) -> Result<FixerProxy, FleetError> {
        match self.lookup(address)? {
            Binding::Fixer(endpoint) => Ok(FixerProxy {
                address: address.clone(),
                endpoint,
                timeout: self.call_timeout,
            }),
            other => Err(FleetError::unreachable(
                address.as_str(),
                format!("expected a fixer, found a {}", other.kind()),
            )),
        }
    }

    pub fn connect_gatekeeper(&self, address: &AgentAddress) -> Result<GatekeeperProxy, FleetError> {
        match self.lookup(address)? {
            Binding::Gatekeeper(endpoint) => Ok(GatekeeperProxy {
                address: address.clone(),
                endpoint,
                timeout: self.call_timeout,
            }),
            other => Err(FleetError::unreachable(
                address.as_str(),
                format!("expected a gatekeeper, found a {}", other.kind()),
            )),
        }
    }
}

/// Run an agent call as its own task and wait at most `timeout` for the answer.
///
/// On timeout the call keeps running on the agent side; only the caller
/// stops waiting.
async fn call_with_deadline<T, F>(address: &AgentAddress, timeout: Duration, call: F) -> Result<T, FleetError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, FleetError>> + Send + 'static,
{
    let handle = tokio::spawn(call);
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(FleetError::unreachable(
            address.as_str(),
            format!("agent call aborted: {}", join_err),
        )),
        Err(_) => Err(FleetError::no_answer(address.as_str(), timeout)),
    }
}

/// Connected fixer
pub struct FixerProxy {
    address: AgentAddress,
    endpoint: Arc<dyn Fixer>,
    timeout: Duration,
}

impl FixerProxy {
    pub async fn flag_issue(&self, cluster_id: &str, host_id: &str, problem: Problem) -> Result<(), FleetError> {
        let endpoint = Arc::clone(&self.endpoint);
        let cluster_id = cluster_id.to_string();
        let host_id = host_id.to_string();
        call_with_deadline(&self.address, self.timeout, async move {
            endpoint.flag_issue(&cluster_id, &host_id, problem).await
        })
        .await
    }
}

/// Connected gatekeeper
pub struct GatekeeperProxy {
    address: AgentAddress,
    endpoint: Arc<dyn GatekeeperEndpoint>,
    timeout: Duration,
}

impl GatekeeperProxy {
    pub async fn propose(&self, proposal: FixProposal) -> Result<ProposalOutcome, FleetError> {
        let endpoint = Arc::clone(&self.endpoint);
        call_with_deadline(&self.address, self.timeout, async move {
            Ok(endpoint.propose(proposal).await)
        })
        .await
    }
}
