//! Goals: what a plan is compiled to achieve.
//!
//! A goal names the blackboard keys it must produce (`targets`) and the
//! values available before any step runs (`inputs`). The compiler chains
//! backwards from the targets through template postconditions until every
//! consumed key is either an input or produced by another step.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Plan-level reaction to a step that ends up `failed`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// The first failed step aborts the whole plan
    #[default]
    AbortOnAnyFailure,
    /// Independent branches keep running; dependents of a failed step are blocked
    BestEffort,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::AbortOnAnyFailure => write!(f, "abort-on-any-failure"),
            FailurePolicy::BestEffort => write!(f, "best-effort"),
        }
    }
}

/// A goal description
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    /// Short name used in logs and as the sub-plan label
    pub id: String,
    /// What the goal accomplishes
    #[serde(default)]
    pub description: String,
    /// Blackboard keys the compiled plan must produce
    pub targets: Vec<String>,
    /// Values seeded onto the blackboard before execution starts
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, Value>,
    /// Behaviour when a step fails
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Goal {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            targets: Vec::new(),
            inputs: BTreeMap::new(),
            failure_policy: FailurePolicy::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_target(mut self, key: impl Into<String>) -> Self {
        self.targets.push(key.into());
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    /// Declare a key as available without giving it a value yet.
    ///
    /// Sub-goals use this for keys the delegating step hands down at run time.
    pub fn with_provided(mut self, key: impl Into<String>) -> Self {
        self.inputs.insert(key.into(), Value::Null);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Whether `key` is available without any producing step
    pub fn provides(&self, key: &str) -> bool {
        self.inputs.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_goal_builder() {
        let goal = Goal::new("report")
            .with_description("Publish a summary")
            .with_target("published")
            .with_input("url", json!("https://example.org"))
            .with_failure_policy(FailurePolicy::BestEffort);

        assert_eq!(goal.targets, vec!["published".to_string()]);
        assert!(goal.provides("url"));
        assert!(!goal.provides("published"));
        assert_eq!(goal.failure_policy, FailurePolicy::BestEffort);
    }

    #[test]
    fn test_failure_policy_default_is_strict() {
        assert_eq!(FailurePolicy::default(), FailurePolicy::AbortOnAnyFailure);
    }

    #[test]
    fn test_goal_deserializes_with_defaults() {
        let goal: Goal = serde_json::from_value(json!({
            "id": "g",
            "targets": ["out"]
        }))
        .unwrap();
        assert!(goal.inputs.is_empty());
        assert_eq!(goal.failure_policy, FailurePolicy::AbortOnAnyFailure);
    }
}
