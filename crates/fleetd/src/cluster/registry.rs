//! Per-cluster fixer registry
//!
//! Maps an issue-type string to the address of the fixer handling it.
//! Lookups are exact and case-sensitive with no fallback; a missing entry
//! means there is no remediation path, not an error.

use std::collections::HashMap;
use tracing::debug;

use crate::agents::AgentAddress;

#[derive(Debug, Clone, Default)]
pub struct FixerRegistry {
    entries: HashMap<String, AgentAddress>,
}

impl FixerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `address` for `issue_type`. The first registration wins;
    /// returns false when the issue type already had a fixer.
    pub fn register(&mut self, issue_type: impl Into<String>, address: AgentAddress) -> bool {
        let issue_type = issue_type.into();
        if let Some(existing) = self.entries.get(&issue_type) {
            debug!(
                "Fixer for '{}' already registered at {}, ignoring {}",
                issue_type, existing, address
            );
            return false;
        }
        self.entries.insert(issue_type, address);
        true
    }

    pub fn resolve(&self, issue_type: &str) -> Option<&AgentAddress> {
        self.entries.get(issue_type)
    }

    /// Registered issue-type strings, sorted
    pub fn issue_types(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, A: Into<AgentAddress>> FromIterator<(K, A)> for FixerRegistry {
    fn from_iter<I: IntoIterator<Item = (K, A)>>(iter: I) -> Self {
        let mut registry = FixerRegistry::new();
        for (issue_type, address) in iter {
            registry.register(issue_type, address.into());
        }
        registry
    }
}
