//! Delegation Router: resolves a step to a direct capability or a sub-plan.
//!
//! Recursion is bounded twice. The compiler rejects nesting deeper than
//! `max_depth`, and a [`DelegationBudget`] shared by a whole plan tree caps
//! how many sub-plans may be alive at once. Exceeding the cap, or spawning
//! while the ready queue is over its high watermark, fails the delegating
//! step with a `resource` failure.

use crate::capability::{Capability, CapabilityDescriptor, CapabilityRegistry};
use crate::catalog::TemplateCatalog;
use crate::compiler::{sub_goal, PlanCompiler};
use orchestra_types::{FailureKind, Plan, StepId, TemplateKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Admission limits shared by a root plan and all of its sub-plans
#[derive(Clone, Debug)]
pub struct DelegationBudget {
    live: Arc<AtomicUsize>,
    ceiling: usize,
    queue_depth: Arc<AtomicUsize>,
    high_watermark: usize,
}

impl DelegationBudget {
    pub fn new(ceiling: usize, high_watermark: usize) -> Self {
        Self {
            live: Arc::new(AtomicUsize::new(0)),
            ceiling,
            queue_depth: Arc::new(AtomicUsize::new(0)),
            high_watermark,
        }
    }

    /// Sub-plans currently alive in this tree
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Ready steps queued across the tree
    pub fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::Acquire)
    }

    pub(crate) fn queue_grew(&self, by: usize) {
        self.queue_depth.fetch_add(by, Ordering::AcqRel);
    }

    pub(crate) fn queue_shrank(&self, by: usize) {
        let _ = self
            .queue_depth
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                Some(d.saturating_sub(by))
            });
    }

    fn over_watermark(&self) -> bool {
        self.queue_depth() > self.high_watermark
    }

    /// Claim a sub-plan slot, or `None` at the ceiling
    fn try_acquire(&self) -> Option<SubPlanPermit> {
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.ceiling).then_some(live + 1)
            })
            .ok()
            .map(|_| SubPlanPermit {
                live: Arc::clone(&self.live),
            })
    }
}

/// Holds one live sub-plan slot until dropped
#[derive(Debug)]
pub struct SubPlanPermit {
    live: Arc<AtomicUsize>,
}

impl Drop for SubPlanPermit {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A compiled sub-plan together with its live slot
#[derive(Debug)]
pub struct SubPlanSpec {
    pub plan: Plan,
    pub permit: SubPlanPermit,
}

/// Where a step's work goes
pub enum Resolution {
    Direct {
        capability: Arc<dyn Capability>,
        descriptor: CapabilityDescriptor,
    },
    SubPlan(SubPlanSpec),
}

impl std::fmt::Debug for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resolution::Direct { descriptor, .. } => f
                .debug_struct("Direct")
                .field("descriptor", descriptor)
                .finish(),
            Resolution::SubPlan(spec) => f
                .debug_struct("SubPlan")
                .field("plan_id", &spec.plan.id)
                .field("depth", &spec.plan.depth)
                .finish(),
        }
    }
}

/// Why a step could not be routed; becomes the step's failure record
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} routing failure: {reason}")]
pub struct RouteError {
    pub kind: FailureKind,
    pub reason: String,
}

impl RouteError {
    fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Routes steps for one engine
#[derive(Clone, Debug)]
pub struct DelegationRouter {
    catalog: Arc<TemplateCatalog>,
    capabilities: Arc<CapabilityRegistry>,
    compiler: PlanCompiler,
}

impl DelegationRouter {
    pub fn new(
        catalog: Arc<TemplateCatalog>,
        capabilities: Arc<CapabilityRegistry>,
        compiler: PlanCompiler,
    ) -> Self {
        Self {
            catalog,
            capabilities,
            compiler,
        }
    }

    pub fn resolve(
        &self,
        plan: &Plan,
        step_id: &StepId,
        budget: &DelegationBudget,
    ) -> Result<Resolution, RouteError> {
        let template = plan
            .current_template(step_id)
            .ok_or_else(|| RouteError::new(FailureKind::Fatal, format!("step {step_id} has no template")))?;

        match &template.kind {
            TemplateKind::Capability { capability_id } => {
                let capability = self.capabilities.get(capability_id).ok_or_else(|| {
                    RouteError::new(
                        FailureKind::Resource,
                        format!("capability {capability_id} is not registered"),
                    )
                })?;
                let descriptor = capability.descriptor();
                Ok(Resolution::Direct {
                    capability,
                    descriptor,
                })
            }
            TemplateKind::Composite { .. } => {
                if budget.over_watermark() {
                    return Err(RouteError::new(
                        FailureKind::Resource,
                        format!(
                            "ready queue depth {} is over the high watermark",
                            budget.queue_depth()
                        ),
                    ));
                }
                let permit = budget.try_acquire().ok_or_else(|| {
                    RouteError::new(
                        FailureKind::Resource,
                        format!("live sub-plan ceiling of {} reached", budget.ceiling()),
                    )
                })?;
                let goal = sub_goal(template).ok_or_else(|| {
                    RouteError::new(FailureKind::Fatal, format!("template {} has no sub-goal", template.id))
                })?;
                let sub_plan = self
                    .compiler
                    .compile_at_depth(&goal, &self.catalog, plan.max_depth, plan.depth + 1)
                    .map_err(|e| RouteError::new(FailureKind::Fatal, e.to_string()))?
                    .with_parent(plan.id.clone(), step_id.clone());

                tracing::debug!(
                    plan_id = %plan.id,
                    step_id = %step_id,
                    sub_plan = %sub_plan.id,
                    depth = sub_plan.depth,
                    live = budget.live(),
                    "Sub-plan compiled"
                );
                Ok(Resolution::SubPlan(SubPlanSpec {
                    plan: sub_plan,
                    permit,
                }))
            }
        }
    }
}
