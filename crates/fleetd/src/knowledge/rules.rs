//! Rule sets and their evaluation
//!
//! A rule set is an ordered list of rules. The first rule whose condition
//! matches the facts decides the verdict.

use fleet_common::{Facts, ProbeKind, RemediationKind, Verdict};
use serde::{Deserialize, Serialize};

/// Rationale used when no rule in a set matches
pub const NO_MATCH: &str = "no rule matched";

/// Predicate over the facts of a feasibility query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "when", rename_all = "snake_case")]
pub enum Condition {
    /// Value strictly greater than `bound`
    Above { bound: f64 },
    /// Value strictly lower than `bound`
    Below { bound: f64 },
    /// Value outside `[low, high]`
    Outside { low: f64, high: f64 },
    /// Value inside `[low, high]`
    Within { low: f64, high: f64 },
    /// The named connectivity probe failed
    ProbeDown { probe: ProbeKind },
    /// Always matches
    Any,
}

impl Condition {
    pub fn matches(&self, facts: &Facts) -> bool {
        let value = facts.observed.value();
        match self {
            Condition::Above { bound } => value.is_some_and(|v| v > *bound),
            Condition::Below { bound } => value.is_some_and(|v| v < *bound),
            Condition::Outside { low, high } => value.is_some_and(|v| v < *low || v > *high),
            Condition::Within { low, high } => value.is_some_and(|v| (*low..=*high).contains(&v)),
            Condition::ProbeDown { probe } => facts.observed.failed_probe() == Some(*probe),
            Condition::Any => true,
        }
    }
}

/// Single rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub condition: Condition,
    pub feasible: bool,
    /// Overrides the action the fixer proposed
    #[serde(default)]
    pub action: Option<RemediationKind>,
    #[serde(default)]
    pub rationale: Option<String>,
}

/// Rules loaded from one named resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    pub resource: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(resource: impl Into<String>, rules: Vec<Rule>) -> Self {
        Self {
            resource: resource.into(),
            rules,
        }
    }

    /// Parse a YAML rule resource
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// Verdict of the first matching rule
    pub fn evaluate(&self, facts: &Facts) -> Verdict {
        match self.rules.iter().find(|rule| rule.condition.matches(facts)) {
            Some(rule) => Verdict {
                feasible: rule.feasible,
                rationale: rule.rationale.clone(),
                action: rule.action,
            },
            None => Verdict::infeasible(NO_MATCH),
        }
    }
}

/// Rule resources compiled into the binary, by resource name
pub(crate) const EMBEDDED_RULES: [(&str, &str); 7] = [
    ("cpu", include_str!("../../rules/cpu.yaml")),
    ("mem", include_str!("../../rules/mem.yaml")),
    ("disk", include_str!("../../rules/disk.yaml")),
    ("io", include_str!("../../rules/io.yaml")),
    ("temp", include_str!("../../rules/temp.yaml")),
    ("fan", include_str!("../../rules/fan.yaml")),
    ("network", include_str!("../../rules/network.yaml")),
];
