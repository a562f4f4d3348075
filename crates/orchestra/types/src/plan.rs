//! Plans: compiled, acyclic graphs of steps.
//!
//! A plan's graph (step ids and dependency edges) is fixed at construction.
//! [`Plan::new`] is the only constructor and it refuses cyclic graphs, so a
//! `Plan` value is always a DAG. What changes during execution is per-step
//! bookkeeping: status, attempts, results, failure records and, on re-plan,
//! the template a step is bound to.

use crate::{
    CompileError, CompileResult, EngineError, EngineResult, Goal, PlanId, Step, StepId,
    StepStatus, StepTemplate, TemplateId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

/// Plan-level lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Built but not yet handed to an engine
    #[default]
    Compiled,
    Running,
    /// Every step succeeded
    Completed,
    /// Best-effort run that settled with at least one failed step
    PartiallyCompleted,
    Aborted,
    /// Settled with steps still awaiting a human decision
    EscalatedTerminal,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Completed
                | PlanStatus::PartiallyCompleted
                | PlanStatus::Aborted
                | PlanStatus::EscalatedTerminal
        )
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PlanStatus::Compiled => "compiled",
            PlanStatus::Running => "running",
            PlanStatus::Completed => "completed",
            PlanStatus::PartiallyCompleted => "partially-completed",
            PlanStatus::Aborted => "aborted",
            PlanStatus::EscalatedTerminal => "escalated-terminal",
        };
        f.write_str(label)
    }
}

/// The step in a parent plan that delegated to this plan
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub plan_id: PlanId,
    pub step_id: StepId,
}

/// Counts over a plan's steps
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub total_steps: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub escalated: usize,
    pub aborted: usize,
    /// Steps not yet settled
    pub unsettled: usize,
    /// Sum of attempts across all steps
    pub attempts: u32,
    /// Sum of per-step wall-clock durations
    pub total_duration_ms: i64,
    /// Succeeded steps over total steps, in percent
    pub success_rate: f64,
}

/// A compiled DAG of steps for one goal
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub goal: Goal,
    /// Nesting depth below the root plan; the root is 0
    pub depth: u32,
    /// Deepest nesting the compiler allowed for this plan tree
    pub max_depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
    pub status: PlanStatus,
    steps: BTreeMap<StepId, Step>,
    order: Vec<StepId>,
    /// Every template a step may be bound to, alternatives included
    templates: BTreeMap<TemplateId, StepTemplate>,
    pub compiled_at: DateTime<Utc>,
}

impl Plan {
    /// Build a plan, validating the step graph.
    ///
    /// Fails when the depth is beyond `max_depth`, a step id repeats, a
    /// dependency or template is unknown, or the graph contains a cycle.
    pub fn new(
        goal: Goal,
        depth: u32,
        max_depth: u32,
        steps: Vec<Step>,
        templates: impl IntoIterator<Item = StepTemplate>,
    ) -> CompileResult<Self> {
        if depth > max_depth {
            return Err(CompileError::DepthExceeded { depth, max_depth });
        }

        let templates: BTreeMap<TemplateId, StepTemplate> =
            templates.into_iter().map(|t| (t.id.clone(), t)).collect();

        let mut by_id = BTreeMap::new();
        for step in steps {
            if !templates.contains_key(&step.template_id) {
                return Err(CompileError::UnknownTemplate(step.template_id.clone()));
            }
            if by_id.contains_key(&step.id) {
                return Err(CompileError::DuplicateStep(step.id.clone()));
            }
            by_id.insert(step.id.clone(), step);
        }

        for step in by_id.values() {
            for dep in step.dependencies() {
                if dep == &step.id {
                    return Err(CompileError::CyclicPlan {
                        cycle: vec![step.id.clone(), step.id.clone()],
                    });
                }
                if !by_id.contains_key(dep) {
                    return Err(CompileError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let order = topological_order(&by_id)?;

        Ok(Self {
            id: PlanId::generate(),
            goal,
            depth,
            max_depth,
            parent: None,
            status: PlanStatus::Compiled,
            steps: by_id,
            order,
            templates,
            compiled_at: Utc::now(),
        })
    }

    pub fn with_parent(mut self, plan_id: PlanId, step_id: StepId) -> Self {
        self.parent = Some(ParentRef { plan_id, step_id });
        self
    }

    // ── Graph queries ────────────────────────────────────────────────

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps in a dependency-respecting order
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.order.iter().filter_map(|id| self.steps.get(id))
    }

    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.steps.get(id)
    }

    /// Mutable access to a step's bookkeeping. The dependency set stays fixed.
    pub fn step_mut(&mut self, id: &StepId) -> Option<&mut Step> {
        self.steps.get_mut(id)
    }

    pub fn topological_order(&self) -> &[StepId] {
        &self.order
    }

    pub fn template(&self, id: &TemplateId) -> Option<&StepTemplate> {
        self.templates.get(id)
    }

    pub fn templates(&self) -> impl Iterator<Item = &StepTemplate> {
        self.templates.values()
    }

    /// Template the step is currently bound to
    pub fn current_template(&self, step_id: &StepId) -> Option<&StepTemplate> {
        self.steps
            .get(step_id)
            .and_then(|step| self.templates.get(&step.template_id))
    }

    /// Steps that list `id` as a direct dependency
    pub fn dependents(&self, id: &StepId) -> Vec<StepId> {
        self.order
            .iter()
            .filter(|candidate| {
                self.steps
                    .get(*candidate)
                    .is_some_and(|step| step.depends_on(id))
            })
            .cloned()
            .collect()
    }

    /// Every step reachable from `id` along dependent edges
    pub fn transitive_dependents(&self, id: &StepId) -> Vec<StepId> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<StepId> = self.dependents(id).into();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.clone()) {
                queue.extend(self.dependents(&next));
            }
        }
        self.order
            .iter()
            .filter(|s| seen.contains(*s))
            .cloned()
            .collect()
    }

    /// All dependencies of the step have succeeded
    pub fn dependencies_satisfied(&self, id: &StepId) -> bool {
        self.steps.get(id).is_some_and(|step| {
            step.dependencies().iter().all(|dep| {
                self.steps
                    .get(dep)
                    .is_some_and(|d| d.status == StepStatus::Succeeded)
            })
        })
    }

    /// Pending steps whose dependencies have all succeeded
    pub fn ready_candidates(&self) -> Vec<StepId> {
        self.order
            .iter()
            .filter(|id| {
                self.steps
                    .get(*id)
                    .is_some_and(|s| s.status == StepStatus::Pending)
                    && self.dependencies_satisfied(id)
            })
            .cloned()
            .collect()
    }

    /// Topological layers: each step sits one layer after its deepest dependency
    pub fn execution_waves(&self) -> Vec<Vec<StepId>> {
        let mut level: HashMap<&StepId, usize> = HashMap::new();
        let mut waves: Vec<Vec<StepId>> = Vec::new();
        for id in &self.order {
            let Some(step) = self.steps.get(id) else {
                continue;
            };
            let lvl = step
                .dependencies()
                .iter()
                .filter_map(|dep| level.get(dep))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level.insert(id, lvl);
            if waves.len() <= lvl {
                waves.resize_with(lvl + 1, Vec::new);
            }
            waves[lvl].push(id.clone());
        }
        waves
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Move a step to `to`, returning the status it left
    pub fn transition(&mut self, id: &StepId, to: StepStatus) -> EngineResult<StepStatus> {
        let step = self
            .steps
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownStep(id.clone()))?;
        let from = step.status;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition {
                step: id.clone(),
                from,
                to,
            });
        }
        step.status = to;
        let now = Utc::now();
        if to == StepStatus::Running && step.started_at.is_none() {
            step.started_at = Some(now);
        }
        if to.is_terminal() || to == StepStatus::Escalated {
            step.finished_at = Some(now);
        }
        Ok(from)
    }

    /// Bind a step to another template already known to this plan
    pub fn rebind_template(&mut self, id: &StepId, template_id: &TemplateId) -> EngineResult<()> {
        if !self.templates.contains_key(template_id) {
            return Err(EngineError::Compile(CompileError::UnknownTemplate(
                template_id.clone(),
            )));
        }
        let step = self
            .steps
            .get_mut(id)
            .ok_or_else(|| EngineError::UnknownStep(id.clone()))?;
        step.template_id = template_id.clone();
        step.replans += 1;
        Ok(())
    }

    /// Return interrupted steps to `pending` so an engine can pick the plan up again.
    ///
    /// Attempt counts are kept; an interrupted attempt still counts.
    pub fn prepare_resume(&mut self) {
        for step in self.steps.values_mut() {
            if matches!(
                step.status,
                StepStatus::Ready
                    | StepStatus::Running
                    | StepStatus::Verifying
                    | StepStatus::RetryPending
            ) {
                step.status = StepStatus::Pending;
            }
        }
        if self.status != PlanStatus::Compiled {
            self.status = PlanStatus::Running;
        }
    }

    pub fn count_by_status(&self, status: StepStatus) -> usize {
        self.steps.values().filter(|s| s.status == status).count()
    }

    /// Ids of steps currently in `status`, in topological order
    pub fn steps_with_status(&self, status: StepStatus) -> Vec<StepId> {
        self.steps()
            .filter(|s| s.status == status)
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn summary(&self) -> PlanSummary {
        let total = self.steps.len();
        let succeeded = self.count_by_status(StepStatus::Succeeded);
        let failed = self.count_by_status(StepStatus::Failed);
        let escalated = self.count_by_status(StepStatus::Escalated);
        let aborted = self.count_by_status(StepStatus::Aborted);
        PlanSummary {
            total_steps: total,
            succeeded,
            failed,
            escalated,
            aborted,
            unsettled: total - succeeded - failed - escalated - aborted,
            attempts: self.steps.values().map(|s| s.attempts).sum(),
            total_duration_ms: self
                .steps
                .values()
                .filter_map(|s| s.duration())
                .map(|d| d.num_milliseconds())
                .sum(),
            success_rate: if total == 0 {
                0.0
            } else {
                succeeded as f64 * 100.0 / total as f64
            },
        }
    }
}

/// Kahn's algorithm; leftover nodes mean a cycle
fn topological_order(steps: &BTreeMap<StepId, Step>) -> CompileResult<Vec<StepId>> {
    let mut in_degree: BTreeMap<&StepId, usize> = steps
        .iter()
        .map(|(id, s)| (id, s.dependencies().len()))
        .collect();
    let mut queue: VecDeque<&StepId> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(steps.len());

    while let Some(id) = queue.pop_front() {
        order.push(id.clone());
        for (other, step) in steps {
            if step.depends_on(id) {
                if let Some(d) = in_degree.get_mut(other) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(other);
                    }
                }
            }
        }
    }

    if order.len() == steps.len() {
        return Ok(order);
    }

    let placed: HashSet<&StepId> = order.iter().collect();
    let leftover: BTreeMap<&StepId, &Step> = steps
        .iter()
        .filter(|(id, _)| !placed.contains(id))
        .collect();
    Err(CompileError::CyclicPlan {
        cycle: find_cycle(&leftover),
    })
}

/// Walk dependency edges inside the leftover set until a node repeats.
///
/// Every leftover node keeps at least one leftover dependency, so the walk
/// always closes a cycle.
fn find_cycle(leftover: &BTreeMap<&StepId, &Step>) -> Vec<StepId> {
    let Some((start, _)) = leftover.iter().next() else {
        return Vec::new();
    };
    let mut path: Vec<StepId> = Vec::new();
    let mut position: HashMap<StepId, usize> = HashMap::new();
    let mut current = (*start).clone();
    loop {
        if let Some(&at) = position.get(&current) {
            let mut cycle = path[at..].to_vec();
            cycle.push(current);
            return cycle;
        }
        position.insert(current.clone(), path.len());
        path.push(current.clone());
        let next = leftover.get(&current).and_then(|step| {
            step.dependencies()
                .iter()
                .find(|dep| leftover.contains_key(dep))
                .cloned()
        });
        match next {
            Some(next) => current = next,
            None => return path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(id: &str) -> StepTemplate {
        StepTemplate::capability(id, id).produces(id)
    }

    fn step(id: &str, deps: &[&str]) -> Step {
        Step::new(
            StepId::new(id),
            TemplateId::new(id),
            deps.iter().map(|d| StepId::new(*d)),
        )
    }

    fn build(specs: &[(&str, &[&str])]) -> CompileResult<Plan> {
        let steps = specs.iter().map(|(id, deps)| step(id, deps)).collect();
        let templates = specs.iter().map(|(id, _)| template(id)).collect::<Vec<_>>();
        Plan::new(Goal::new("test").with_target("x"), 0, 3, steps, templates)
    }

    fn linear() -> Plan {
        build(&[
            ("fetch", &[]),
            ("summarize", &["fetch"]),
            ("publish", &["summarize"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_linear_plan_order() {
        let plan = linear();
        let order: Vec<&str> = plan.topological_order().iter().map(|s| s.as_str()).collect();
        assert_eq!(order, vec!["fetch", "summarize", "publish"]);
        assert_eq!(plan.status, PlanStatus::Compiled);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let result = build(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"]), ("d", &[])]);
        match result {
            Err(CompileError::CyclicPlan { cycle }) => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let result = build(&[("a", &["a"])]);
        assert!(matches!(result, Err(CompileError::CyclicPlan { .. })));
    }

    #[test]
    fn test_unknown_dependency() {
        let result = build(&[("a", &["ghost"])]);
        assert!(matches!(
            result,
            Err(CompileError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_depth_checked_at_construction() {
        let result = Plan::new(Goal::new("deep"), 4, 3, Vec::new(), Vec::new());
        assert_eq!(
            result.unwrap_err(),
            CompileError::DepthExceeded {
                depth: 4,
                max_depth: 3
            }
        );
    }

    #[test]
    fn test_execution_waves() {
        let plan = build(&[
            ("fetch_a", &[]),
            ("fetch_b", &[]),
            ("merge", &["fetch_a", "fetch_b"]),
            ("publish", &["merge"]),
            ("audit", &["fetch_a"]),
        ])
        .unwrap();
        let waves = plan.execution_waves();
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0].len(), 2);
        assert!(waves[1].contains(&StepId::new("merge")));
        assert!(waves[1].contains(&StepId::new("audit")));
        assert_eq!(waves[2], vec![StepId::new("publish")]);
    }

    #[test]
    fn test_ready_candidates_follow_success() {
        let mut plan = linear();
        assert_eq!(plan.ready_candidates(), vec![StepId::new("fetch")]);

        let fetch = StepId::new("fetch");
        plan.transition(&fetch, StepStatus::Ready).unwrap();
        plan.transition(&fetch, StepStatus::Running).unwrap();
        plan.transition(&fetch, StepStatus::Verifying).unwrap();
        assert!(plan.ready_candidates().is_empty());
        plan.transition(&fetch, StepStatus::Succeeded).unwrap();
        assert_eq!(plan.ready_candidates(), vec![StepId::new("summarize")]);
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut plan = linear();
        let err = plan
            .transition(&StepId::new("fetch"), StepStatus::Running)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn test_transitive_dependents() {
        let plan = linear();
        assert_eq!(
            plan.transitive_dependents(&StepId::new("fetch")),
            vec![StepId::new("summarize"), StepId::new("publish")]
        );
        assert!(plan.transitive_dependents(&StepId::new("publish")).is_empty());
    }

    #[test]
    fn test_prepare_resume_keeps_attempts() {
        let mut plan = linear();
        let fetch = StepId::new("fetch");
        plan.status = PlanStatus::Running;
        plan.transition(&fetch, StepStatus::Ready).unwrap();
        plan.transition(&fetch, StepStatus::Running).unwrap();
        plan.step_mut(&fetch).unwrap().attempts = 1;

        plan.prepare_resume();
        let step = plan.step(&fetch).unwrap();
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(step.attempts, 1);
    }

    #[test]
    fn test_summary_counts() {
        let mut plan = linear();
        let fetch = StepId::new("fetch");
        for to in [
            StepStatus::Ready,
            StepStatus::Running,
            StepStatus::Verifying,
            StepStatus::Succeeded,
        ] {
            plan.transition(&fetch, to).unwrap();
        }
        plan.transition(&StepId::new("summarize"), StepStatus::Aborted)
            .unwrap();

        let summary = plan.summary();
        assert_eq!(summary.total_steps, 3);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.aborted, 1);
        assert_eq!(summary.unsettled, 1);
        assert!((summary.success_rate - 100.0 / 3.0).abs() < 1e-9);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        /// Edges only point from a higher index to a lower one, so the graph is a DAG
        fn arb_dag() -> impl Strategy<Value = Vec<Vec<usize>>> {
            (1usize..12).prop_flat_map(|n| {
                (0..n)
                    .map(|i| proptest::collection::vec(0..i.max(1), 0..=i.min(3)))
                    .collect::<Vec<_>>()
            })
        }

        fn plan_from(edges: &[Vec<usize>]) -> CompileResult<Plan> {
            let names: Vec<String> = (0..edges.len()).map(|i| format!("s{i}")).collect();
            let steps = edges
                .iter()
                .enumerate()
                .map(|(i, deps)| {
                    step(
                        &names[i],
                        &deps
                            .iter()
                            .filter(|d| **d < i)
                            .map(|d| names[*d].as_str())
                            .collect::<Vec<_>>(),
                    )
                })
                .collect();
            let templates = names.iter().map(|n| template(n)).collect::<Vec<_>>();
            Plan::new(Goal::new("prop"), 0, 1, steps, templates)
        }

        proptest! {
            #[test]
            fn prop_dag_compiles_in_dependency_order(edges in arb_dag()) {
                let plan = plan_from(&edges).unwrap();
                let order = plan.topological_order();
                prop_assert_eq!(order.len(), edges.len());
                for (pos, id) in order.iter().enumerate() {
                    for dep in plan.step(id).unwrap().dependencies() {
                        let dep_pos = order.iter().position(|o| o == dep).unwrap();
                        prop_assert!(dep_pos < pos);
                    }
                }
            }

            #[test]
            fn prop_back_edge_always_rejected(edges in arb_dag(), pick in any::<prop::sample::Index>()) {
                prop_assume!(edges.len() >= 2);
                let mut edges = edges;
                let target = pick.index(edges.len() - 1) + 1;
                // s{target} and s0 now depend on each other.
                edges[target].push(0);
                let steps = edges
                    .iter()
                    .enumerate()
                    .map(|(i, deps)| {
                        let mut deps: Vec<String> = deps
                            .iter()
                            .filter(|d| **d < i)
                            .map(|d| format!("s{d}"))
                            .collect();
                        if i == 0 {
                            deps.push(format!("s{target}"));
                        }
                        Step::new(
                            StepId::new(format!("s{i}")),
                            TemplateId::new(format!("s{i}")),
                            deps.into_iter().map(StepId::new),
                        )
                    })
                    .collect();
                let templates = (0..edges.len())
                    .map(|i| template(&format!("s{i}")))
                    .collect::<Vec<_>>();
                let result = Plan::new(Goal::new("prop"), 0, 1, steps, templates);
                let is_cycle = matches!(result, Err(CompileError::CyclicPlan { .. }));
                prop_assert!(is_cycle);
            }
        }
    }

    #[test]
    fn test_plan_round_trips_through_json() {
        let plan = linear();
        let json = serde_json::to_string(&plan).unwrap();
        let back: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plan);
    }
}
