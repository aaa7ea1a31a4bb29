//! Pending-arbitration entries
//!
//! At most one live entry per `(cluster, host, issue type)`. Claiming is a
//! single check-and-insert under the lock; the entry is released when the
//! returned guard is dropped, whatever path the arbitration took.

use fleet_common::ProposalKey;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Set of keys currently under arbitration
#[derive(Debug, Clone, Default)]
pub struct PendingArbitrations {
    keys: Arc<Mutex<HashSet<ProposalKey>>>,
}

impl PendingArbitrations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key`, or `None` if it is already pending
    pub fn try_claim(&self, key: ProposalKey) -> Option<PendingGuard> {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        if !keys.insert(key.clone()) {
            return None;
        }
        Some(PendingGuard {
            keys: Arc::clone(&self.keys),
            key,
        })
    }

    pub fn contains(&self, key: &ProposalKey) -> bool {
        self.keys.lock().unwrap_or_else(|e| e.into_inner()).contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Live pending entry. Dropping it clears the entry.
#[must_use = "dropping the guard releases the pending entry immediately"]
#[derive(Debug)]
pub struct PendingGuard {
    keys: Arc<Mutex<HashSet<ProposalKey>>>,
    key: ProposalKey,
}

impl PendingGuard {
    pub fn key(&self) -> &ProposalKey {
        &self.key
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut keys = self.keys.lock().unwrap_or_else(|e| e.into_inner());
        keys.remove(&self.key);
    }
}
