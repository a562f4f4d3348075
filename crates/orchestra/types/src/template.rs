//! Step templates: the static catalog entries plans are compiled from.
//!
//! A template declares what it consumes and produces on the blackboard,
//! how it is executed (a registered capability or a composite sub-goal),
//! how its output is verified and how its failures are retried.

use crate::{CapabilityId, Goal, TemplateId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// How a step built from this template is executed
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TemplateKind {
    /// Route directly to a registered capability
    Capability { capability_id: CapabilityId },
    /// Decompose into a nested sub-plan for the embedded goal
    Composite { goal: Box<Goal> },
}

/// Scheduling priority of ready steps
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

/// Success criteria evaluated by the verifier
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VerificationCriteria {
    /// Any output passes
    #[default]
    Accept,
    /// The output must be an object carrying every named field
    ExpectedShape {
        required_fields: Vec<String>,
        /// Reject null, empty strings and empty collections
        #[serde(default)]
        non_empty: bool,
    },
    /// A numeric field of the output must reach `min_score`
    ScoreThreshold {
        field: String,
        min_score: f64,
        /// Scores below this are fatal instead of retryable
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fatal_below: Option<f64>,
    },
    /// A secondary capability judges the output
    Checker {
        capability_id: CapabilityId,
        #[serde(default = "default_checker_min_score")]
        min_score: f64,
    },
    /// Every nested criterion must pass
    All { criteria: Vec<VerificationCriteria> },
}

fn default_checker_min_score() -> f64 {
    0.5
}

/// Per-template retry and re-plan limits
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Upper bound on attempts, the first one included
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles on each further attempt
    pub base_backoff_ms: u64,
    /// Ceiling for any single backoff
    pub max_backoff_ms: u64,
    /// Multiplier applied to the base interval for resource failures
    pub resource_backoff_factor: u32,
    /// How many times the step may be re-planned onto an alternative template
    pub max_replans: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 100,
            max_backoff_ms: 10_000,
            resource_backoff_factor: 4,
            max_replans: 1,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_backoff_ms(mut self, base_backoff_ms: u64) -> Self {
        self.base_backoff_ms = base_backoff_ms;
        self
    }

    pub fn with_max_replans(mut self, max_replans: u32) -> Self {
        self.max_replans = max_replans;
        self
    }
}

/// A catalog entry describing one kind of step
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepTemplate {
    pub id: TemplateId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub kind: TemplateKind,
    /// Blackboard keys that must exist before the step can run
    #[serde(default)]
    pub consumes: Vec<String>,
    /// Blackboard keys the step publishes on success
    pub produces: Vec<String>,
    /// Static input merged into every invocation under `"params"`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub verification: VerificationCriteria,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    /// Templates that may replace this one when the step is re-planned
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<TemplateId>,
    #[serde(default)]
    pub priority: Priority,
}

impl StepTemplate {
    /// Template backed by a registered capability
    pub fn capability(id: impl Into<String>, capability_id: impl Into<String>) -> Self {
        Self::with_kind(
            id,
            TemplateKind::Capability {
                capability_id: CapabilityId::new(capability_id),
            },
        )
    }

    /// Template that decomposes into a sub-plan
    pub fn composite(id: impl Into<String>, goal: Goal) -> Self {
        Self::with_kind(
            id,
            TemplateKind::Composite {
                goal: Box::new(goal),
            },
        )
    }

    fn with_kind(id: impl Into<String>, kind: TemplateKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id: TemplateId::new(id),
            description: String::new(),
            kind,
            consumes: Vec::new(),
            produces: Vec::new(),
            parameters: BTreeMap::new(),
            verification: VerificationCriteria::default(),
            retry_policy: RetryPolicy::default(),
            alternatives: Vec::new(),
            priority: Priority::default(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn consumes(mut self, key: impl Into<String>) -> Self {
        self.consumes.push(key.into());
        self
    }

    pub fn produces(mut self, key: impl Into<String>) -> Self {
        self.produces.push(key.into());
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn with_verification(mut self, criteria: VerificationCriteria) -> Self {
        self.verification = criteria;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_alternative(mut self, template_id: impl Into<String>) -> Self {
        self.alternatives.push(TemplateId::new(template_id));
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Capability bound by this template, if it is not composite
    pub fn capability_id(&self) -> Option<&CapabilityId> {
        match &self.kind {
            TemplateKind::Capability { capability_id } => Some(capability_id),
            TemplateKind::Composite { .. } => None,
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.kind, TemplateKind::Composite { .. })
    }

    /// Structural problems that make the template unusable, if any
    pub fn validate(&self) -> Result<(), String> {
        if self.produces.is_empty() {
            return Err("template produces no keys".into());
        }
        if let Some(key) = self.produces.iter().find(|k| self.consumes.contains(k)) {
            return Err(format!("key '{key}' is both consumed and produced"));
        }
        if self.alternatives.contains(&self.id) {
            return Err("template lists itself as an alternative".into());
        }
        if self.retry_policy.max_attempts == 0 {
            return Err("max_attempts must be at least 1".into());
        }
        Ok(())
    }
}
