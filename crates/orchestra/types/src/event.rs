//! Lifecycle events published on the observability stream.

use crate::{
    FailureKind, HumanDecision, PlanId, PlanStatus, RecoveryDecision, StepId, StepStatus,
    TemplateId, Verdict,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry of the lifecycle stream
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Position in the stream, starting at 0
    pub sequence: u64,
    pub plan_id: PlanId,
    /// Nesting depth of the plan that emitted the event
    pub depth: u32,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    PlanStarted {
        goal: String,
        steps: usize,
    },
    StepTransition {
        step_id: StepId,
        from: StepStatus,
        to: StepStatus,
        attempt: u32,
    },
    VerdictIssued {
        step_id: StepId,
        verdict: Verdict,
    },
    RecoveryDecided {
        step_id: StepId,
        failure: FailureKind,
        decision: RecoveryDecision,
    },
    StepReplanned {
        step_id: StepId,
        from: TemplateId,
        to: TemplateId,
    },
    EscalationRaised {
        step_id: StepId,
        reason: String,
    },
    EscalationResolved {
        step_id: StepId,
        decision: HumanDecision,
    },
    SubPlanSpawned {
        step_id: StepId,
        sub_plan: PlanId,
        depth: u32,
    },
    BlackboardCommitted {
        step_id: StepId,
        key: String,
        version: u64,
    },
    PlanFinished {
        status: PlanStatus,
    },
}

impl LifecycleEvent {
    /// Step the event concerns, if any
    pub fn step_id(&self) -> Option<&StepId> {
        match &self.kind {
            EventKind::StepTransition { step_id, .. }
            | EventKind::VerdictIssued { step_id, .. }
            | EventKind::RecoveryDecided { step_id, .. }
            | EventKind::StepReplanned { step_id, .. }
            | EventKind::EscalationRaised { step_id, .. }
            | EventKind::EscalationResolved { step_id, .. }
            | EventKind::SubPlanSpawned { step_id, .. }
            | EventKind::BlackboardCommitted { step_id, .. } => Some(step_id),
            EventKind::PlanStarted { .. } | EventKind::PlanFinished { .. } => None,
        }
    }
}
