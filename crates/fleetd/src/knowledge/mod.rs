//! Knowledge base consulted by the gatekeeper
//!
//! One rule set per issue type, loaded once at startup and read-only
//! afterwards. Queries are deterministic for fixed rules and facts.
//!
//! Rule resources are YAML files named after the resource (`cpu.yaml`,
//! `network.yaml`, ...). When no rules directory is configured the
//! resources compiled into the binary are used.

mod rules;

pub use rules::{Condition, Rule, RuleSet, NO_MATCH};

use fleet_common::{Facts, IssueType, Verdict};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Feasibility decision interface
pub trait FeasibilityOracle: Send + Sync {
    fn query(&self, issue_type: IssueType, host_id: &str, facts: &Facts) -> Verdict;
}

/// Rule loading errors. All of them abort startup.
#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    #[error("Missing rule resource '{resource}' at {}", path.display())]
    MissingRuleSet { resource: String, path: PathBuf },

    #[error("Failed to read rule resource {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse rule resource '{resource}': {source}")]
    Parse {
        resource: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Rule resource '{expected}' declares itself as '{found}'")]
    ResourceMismatch { expected: String, found: String },
}

/// Rule store keyed by issue type
#[derive(Debug, Clone, Default)]
pub struct KnowledgeBase {
    rule_sets: HashMap<IssueType, RuleSet>,
}

impl KnowledgeBase {
    /// Rule sets compiled into the binary
    pub fn embedded() -> Result<Self, KnowledgeError> {
        let mut rule_sets = HashMap::new();
        for (resource, content) in rules::EMBEDDED_RULES {
            let set = parse_resource(resource, content)?;
            if let Some(issue) = IssueType::from_rule_resource(resource) {
                rule_sets.insert(issue, set);
            }
        }
        info!("Loaded {} embedded rule sets", rule_sets.len());
        Ok(Self { rule_sets })
    }

    /// Load `<dir>/<resource>.yaml` for every required issue type
    pub fn load(dir: &Path, required: &[IssueType]) -> Result<Self, KnowledgeError> {
        let mut rule_sets = HashMap::new();
        for issue in required {
            let resource = issue.rule_resource();
            let path = dir.join(format!("{}.yaml", resource));
            if !path.exists() {
                return Err(KnowledgeError::MissingRuleSet {
                    resource: resource.to_string(),
                    path,
                });
            }
            let content = std::fs::read_to_string(&path).map_err(|source| KnowledgeError::Io {
                path: path.clone(),
                source,
            })?;
            let set = parse_resource(resource, &content)?;
            debug!("Loaded {} rules for {} from {}", set.rules.len(), issue, path.display());
            rule_sets.insert(*issue, set);
        }
        info!("Loaded {} rule sets from {}", rule_sets.len(), dir.display());
        Ok(Self { rule_sets })
    }

    /// Embedded rules, or rules from `dir` when configured
    pub fn initialize(dir: Option<&Path>, required: &[IssueType]) -> Result<Self, KnowledgeError> {
        match dir {
            Some(dir) => Self::load(dir, required),
            None => {
                let kb = Self::embedded()?;
                if let Some(missing) = required.iter().find(|issue| !kb.has_rules_for(**issue)) {
                    return Err(KnowledgeError::MissingRuleSet {
                        resource: missing.rule_resource().to_string(),
                        path: PathBuf::from("<embedded>"),
                    });
                }
                Ok(kb)
            }
        }
    }

    pub fn has_rules_for(&self, issue: IssueType) -> bool {
        self.rule_sets.contains_key(&issue)
    }

    pub fn len(&self) -> usize {
        self.rule_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rule_sets.is_empty()
    }
}

impl FeasibilityOracle for KnowledgeBase {
    fn query(&self, issue_type: IssueType, host_id: &str, facts: &Facts) -> Verdict {
        let verdict = match self.rule_sets.get(&issue_type) {
            Some(set) => set.evaluate(facts),
            None => Verdict::infeasible(format!("no rule set loaded for {}", issue_type)),
        };
        debug!(
            "Knowledge query: issue={} host={} observed={} feasible={}",
            issue_type, host_id, facts.observed, verdict.feasible
        );
        verdict
    }
}

fn parse_resource(resource: &str, content: &str) -> Result<RuleSet, KnowledgeError> {
    let set = RuleSet::from_yaml(content).map_err(|source| KnowledgeError::Parse {
        resource: resource.to_string(),
        source,
    })?;
    if set.resource != resource {
        return Err(KnowledgeError::ResourceMismatch {
            expected: resource.to_string(),
            found: set.resource,
        });
    }
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::{ProbeKind, RemediationKind};

    #[test]
    fn test_embedded_covers_every_issue_type() {
        let kb = KnowledgeBase::embedded().unwrap();
        assert_eq!(kb.len(), IssueType::ALL.len());
        for issue in IssueType::ALL {
            assert!(kb.has_rules_for(issue), "missing rules for {}", issue);
        }
    }

    #[test]
    fn test_query_is_deterministic() {
        let kb = KnowledgeBase::embedded().unwrap();
        let facts = Facts::value(100.0);
        let first = kb.query(IssueType::Cpu, "host01", &facts);
        for _ in 0..20 {
            assert_eq!(kb.query(IssueType::Cpu, "host01", &facts), first);
        }
        assert!(first.feasible);
        assert_eq!(first.action, Some(RemediationKind::Rebalance));
    }

    #[test]
    fn test_embedded_verdicts() {
        let kb = KnowledgeBase::embedded().unwrap();
        assert!(!kb.query(IssueType::Mem, "h", &Facts::value(2.0)).feasible);
        assert!(kb.query(IssueType::Mem, "h", &Facts::value(100.0)).feasible);
        assert!(!kb.query(IssueType::Temp, "h", &Facts::value(400.0)).feasible);

        let verdict = kb.query(IssueType::Connectivity, "h", &Facts::probe_failed(ProbeKind::Ssh));
        assert!(verdict.feasible);
        assert_eq!(verdict.action, Some(RemediationKind::RestartShell));
    }

    #[test]
    fn test_query_without_rule_set_is_infeasible() {
        let kb = KnowledgeBase::default();
        let verdict = kb.query(IssueType::Fan, "host01", &Facts::value(0.0));
        assert!(!verdict.feasible);
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("disk.yaml"),
            "resource: disk\nrules:\n  - condition: { when: any }\n    feasible: true\n",
        )
        .unwrap();

        let kb = KnowledgeBase::load(dir.path(), &[IssueType::Disk]).unwrap();
        assert!(kb.query(IssueType::Disk, "h", &Facts::value(50.0)).feasible);
        assert!(!kb.has_rules_for(IssueType::Cpu));
    }

    #[test]
    fn test_missing_resource_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = KnowledgeBase::load(dir.path(), &[IssueType::Connectivity]).unwrap_err();
        match err {
            KnowledgeError::MissingRuleSet { resource, .. } => assert_eq!(resource, "network"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_mismatched_resource_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("io.yaml"), "resource: disk\nrules: []\n").unwrap();
        let err = KnowledgeBase::load(dir.path(), &[IssueType::Io]).unwrap_err();
        assert!(matches!(err, KnowledgeError::ResourceMismatch { .. }));
    }

    #[test]
    fn test_malformed_resource_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("fan.yaml"), "resource: [").unwrap();
        let err = KnowledgeBase::load(dir.path(), &[IssueType::Fan]).unwrap_err();
        assert!(matches!(err, KnowledgeError::Parse { .. }));
    }
}
