//! Error types for compilation, the template catalog, the blackboard and
//! the engine itself.
//!
//! Step-level failures are not errors: they are [`FailureRecord`](crate::FailureRecord)
//! values routed through recovery. The enums here cover conditions that stop
//! a plan from being built or an engine from making progress.

use crate::{PlanId, PlanStatus, StepId, StepStatus, TemplateId};
use thiserror::Error;

fn join_ids(ids: &[StepId]) -> String {
    ids.iter()
        .map(|id| id.0.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Plan compilation failed; nothing was executed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    #[error("Goal '{0}' declares no targets")]
    EmptyGoal(String),

    #[error("Cyclic plan: {}", join_ids(.cycle))]
    CyclicPlan { cycle: Vec<StepId> },

    #[error("Unresolved dependency: {consumer} needs '{key}' but nothing in scope produces it")]
    UnresolvedDependency { consumer: String, key: String },

    #[error("Depth exceeded: plan at depth {depth} is deeper than the maximum of {max_depth}")]
    DepthExceeded { depth: u32, max_depth: u32 },

    #[error("Unknown template: {0}")]
    UnknownTemplate(TemplateId),

    #[error("Template {template} is bound to unregistered capability {capability}")]
    UnknownCapability { template: TemplateId, capability: String },

    #[error("Step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: StepId, dependency: StepId },

    #[error("Duplicate step: {0}")]
    DuplicateStep(StepId),
}

pub type CompileResult<T> = Result<T, CompileError>;

/// Template catalog registration failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("Template already registered: {0}")]
    Duplicate(TemplateId),

    #[error("Invalid template {template}: {reason}")]
    InvalidTemplate { template: TemplateId, reason: String },
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Blackboard read or write failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlackboardError {
    #[error("Key not found: {key} (as of version {as_of:?})")]
    NotFound { key: String, as_of: Option<u64> },

    #[error("Stale write to '{key}': expected version {expected:?}, found {actual:?}")]
    StaleVersion {
        key: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("Blackboard is closed")]
    Closed,
}

pub type BlackboardResult<T> = Result<T, BlackboardError>;

/// The engine could not make progress. Always surfaced to the caller.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Blackboard conflict: {0}")]
    Blackboard(#[from] BlackboardError),

    #[error("Invalid transition for step {step}: {from} -> {to}")]
    InvalidTransition {
        step: StepId,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("Unknown step: {0}")]
    UnknownStep(StepId),

    #[error("Plan {plan} cannot run from status {status}")]
    NotRunnable { plan: PlanId, status: PlanStatus },

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Snapshot(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
