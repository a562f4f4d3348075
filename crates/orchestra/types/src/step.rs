//! Steps: units of work inside a plan, and the failure records attached to them.

use crate::{Priority, StepId, TemplateId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Lifecycle status of a step
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting on dependencies
    #[default]
    Pending,
    /// Dependencies satisfied; queued for a worker
    Ready,
    /// A worker is executing the step
    Running,
    /// Output is being checked by the verifier
    Verifying,
    /// Waiting out a backoff before becoming ready again
    RetryPending,
    /// Handed to a human; may still resolve either way
    Escalated,
    Succeeded,
    Failed,
    /// Cancelled, or blocked by a failed dependency
    Aborted,
}

impl StepStatus {
    /// No further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Aborted
        )
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        use StepStatus::*;
        match (self, next) {
            (Pending, Ready) | (Pending, Aborted) => true,
            (Ready, Running) | (Ready, Aborted) => true,
            (Running, Verifying)
            | (Running, RetryPending)
            | (Running, Escalated)
            | (Running, Failed)
            | (Running, Aborted) => true,
            (Verifying, Succeeded)
            | (Verifying, RetryPending)
            | (Verifying, Escalated)
            | (Verifying, Failed)
            | (Verifying, Aborted) => true,
            (RetryPending, Ready) | (RetryPending, Aborted) => true,
            (Escalated, Succeeded) | (Escalated, Failed) | (Escalated, Aborted) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            StepStatus::Pending => "pending",
            StepStatus::Ready => "ready",
            StepStatus::Running => "running",
            StepStatus::Verifying => "verifying",
            StepStatus::RetryPending => "retry-pending",
            StepStatus::Escalated => "escalated",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

/// Classification of a step failure, which selects the recovery path
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Worth retrying as-is after a backoff
    Transient,
    /// Output rejected by the verifier
    Validation,
    /// Capacity problem: delegation ceiling, capability unavailable
    Resource,
    /// Never retried
    Fatal,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FailureKind::Transient => "transient",
            FailureKind::Validation => "validation",
            FailureKind::Resource => "resource",
            FailureKind::Fatal => "fatal",
        };
        f.write_str(label)
    }
}

/// A failure observed on one attempt of a step
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: FailureKind,
    pub step_id: StepId,
    /// Template in effect when the attempt failed
    pub template_id: TemplateId,
    pub attempt: u32,
    pub diagnostic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub recorded_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(
        kind: FailureKind,
        step_id: StepId,
        template_id: TemplateId,
        attempt: u32,
        diagnostic: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            step_id,
            template_id,
            attempt,
            diagnostic: diagnostic.into(),
            payload: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// A unit of work inside a plan
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    /// Template currently bound; a re-plan may substitute an alternative
    pub template_id: TemplateId,
    dependencies: BTreeSet<StepId>,
    pub status: StepStatus,
    pub attempts: u32,
    /// Number of times the step was re-planned onto another template
    #[serde(default)]
    pub replans: u32,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Most recent failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
    /// Every failure ever recorded, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failure_history: Vec<FailureRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(
        id: StepId,
        template_id: TemplateId,
        dependencies: impl IntoIterator<Item = StepId>,
    ) -> Self {
        Self {
            id,
            template_id,
            dependencies: dependencies.into_iter().collect(),
            status: StepStatus::Pending,
            attempts: 0,
            replans: 0,
            priority: Priority::default(),
            result: None,
            failure: None,
            failure_history: Vec::new(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Steps that must succeed before this one may run
    pub fn dependencies(&self) -> &BTreeSet<StepId> {
        &self.dependencies
    }

    pub fn depends_on(&self, other: &StepId) -> bool {
        self.dependencies.contains(other)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Attach a failure, keeping the full history
    pub fn record_failure(&mut self, failure: FailureRecord) {
        self.failure_history.push(failure.clone());
        self.failure = Some(failure);
    }

    /// Wall-clock time between the first start and the final settle
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> Step {
        Step::new(
            StepId::new(id),
            TemplateId::new(id),
            deps.iter().map(|d| StepId::new(*d)),
        )
    }

    #[test]
    fn test_new_step_is_pending() {
        let s = step("summarize", &["fetch"]);
        assert_eq!(s.status, StepStatus::Pending);
        assert_eq!(s.attempts, 0);
        assert!(s.depends_on(&StepId::new("fetch")));
        assert!(!s.is_terminal());
    }

    #[test]
    fn test_happy_path_transitions() {
        use StepStatus::*;
        let path = [Pending, Ready, Running, Verifying, Succeeded];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_retry_loop_transitions() {
        use StepStatus::*;
        assert!(Verifying.can_transition_to(RetryPending));
        assert!(Running.can_transition_to(RetryPending));
        assert!(RetryPending.can_transition_to(Ready));
        assert!(!RetryPending.can_transition_to(Running));
    }

    #[test]
    fn test_terminal_states_are_final() {
        use StepStatus::*;
        for terminal in [Succeeded, Failed, Aborted] {
            assert!(terminal.is_terminal());
            for next in [Pending, Ready, Running, Verifying, RetryPending, Escalated] {
                assert!(!terminal.can_transition_to(next));
            }
        }
        assert!(!Escalated.is_terminal());
    }

    #[test]
    fn test_pending_cannot_skip_to_running() {
        assert!(!StepStatus::Pending.can_transition_to(StepStatus::Running));
    }

    #[test]
    fn test_record_failure_keeps_history() {
        let mut s = step("publish", &[]);
        for attempt in 1..=2 {
            s.record_failure(FailureRecord::new(
                FailureKind::Transient,
                s.id.clone(),
                s.template_id.clone(),
                attempt,
                "timeout",
            ));
        }
        assert_eq!(s.failure_history.len(), 2);
        assert_eq!(s.failure.as_ref().map(|f| f.attempt), Some(2));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(StepStatus::RetryPending.to_string(), "retry-pending");
        assert_eq!(FailureKind::Resource.to_string(), "resource");
    }
}
