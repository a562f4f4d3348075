//! Human-in-the-loop escalation records and decisions.

use crate::{FailureRecord, PlanId, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A human's answer to an escalated step
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum HumanDecision {
    /// Accept the step with the supplied result
    Approve { result: Value },
    /// Fail the step
    Reject { reason: String },
    /// Leave the step escalated for later review
    Defer {
        #[serde(default)]
        note: String,
    },
}

/// Context handed to the human reviewer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EscalationContext {
    pub plan_id: PlanId,
    pub step_id: StepId,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
    /// Last output the step produced, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_output: Option<Value>,
}

/// Durable record of an escalation and how it was resolved
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub id: uuid::Uuid,
    pub context: EscalationContext,
    pub reason: String,
    pub raised_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<HumanDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl EscalationRecord {
    pub fn new(context: EscalationContext, reason: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            context,
            reason: reason.into(),
            raised_at: Utc::now(),
            resolution: None,
            resolved_at: None,
        }
    }

    pub fn resolve(&mut self, decision: HumanDecision) {
        self.resolution = Some(decision);
        self.resolved_at = Some(Utc::now());
    }

    /// Still waiting on a human answer, or explicitly deferred
    pub fn is_pending(&self) -> bool {
        matches!(self.resolution, None | Some(HumanDecision::Defer { .. }))
    }
}
