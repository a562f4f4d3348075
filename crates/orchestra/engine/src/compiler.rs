//! Plan compiler: goal + catalog → validated DAG
//!
//! Compilation is static backward chaining. Starting from the goal's target
//! keys, each key is resolved to its primary producing template; that
//! template's consumed keys are resolved the same way until every key is
//! either a goal input or produced by a step already in the plan. Each
//! template contributes one step, and producer/consumer relationships
//! become dependency edges.
//!
//! Composite templates are compiled one level deeper as part of the same
//! pass, so a structure nested beyond `max_depth` is rejected here and
//! never reaches execution.

use crate::capability::CapabilityRegistry;
use crate::catalog::TemplateCatalog;
use orchestra_types::{
    CompileError, CompileResult, Goal, Plan, Step, StepId, StepTemplate, TemplateId, TemplateKind,
};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

/// Sub-goal a composite template decomposes into.
///
/// The template's consumed keys are handed down from the parent plan, so
/// they count as provided inside the sub-plan.
pub fn sub_goal(template: &StepTemplate) -> Option<Goal> {
    match &template.kind {
        TemplateKind::Composite { goal } => {
            let mut goal = (**goal).clone();
            for key in &template.consumes {
                if !goal.provides(key) {
                    goal = goal.with_provided(key.clone());
                }
            }
            if goal.targets.is_empty() {
                goal.targets = template.produces.clone();
            }
            Some(goal)
        }
        TemplateKind::Capability { .. } => None,
    }
}

/// A substitute template a failed step may be re-planned onto
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Alternative {
    pub template_id: TemplateId,
    /// Cost of the bound capability; `None` for composite templates
    pub cost: Option<u32>,
}

/// Compiles goals into plans
#[derive(Clone, Debug, Default)]
pub struct PlanCompiler {
    /// When present, capability bindings are checked at compile time
    capabilities: Option<Arc<CapabilityRegistry>>,
}

impl PlanCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject templates bound to capabilities missing from `registry`
    pub fn with_capabilities(mut self, registry: Arc<CapabilityRegistry>) -> Self {
        self.capabilities = Some(registry);
        self
    }

    /// Compile a root plan
    pub fn compile(
        &self,
        goal: &Goal,
        catalog: &TemplateCatalog,
        max_depth: u32,
    ) -> CompileResult<Plan> {
        self.compile_at_depth(goal, catalog, max_depth, 0)
    }

    /// Compile a plan nested `depth` levels below the root
    pub fn compile_at_depth(
        &self,
        goal: &Goal,
        catalog: &TemplateCatalog,
        max_depth: u32,
        depth: u32,
    ) -> CompileResult<Plan> {
        if depth > max_depth {
            return Err(CompileError::DepthExceeded { depth, max_depth });
        }
        if goal.targets.is_empty() {
            return Err(CompileError::EmptyGoal(goal.id.clone()));
        }

        let mut resolver = Resolver {
            goal,
            catalog,
            visiting: Vec::new(),
            edges: BTreeMap::new(),
        };
        for key in &goal.targets {
            resolver.resolve_key(key, &format!("goal {}", goal.id))?;
        }

        // Chosen templates plus every alternative reachable from them.
        let mut included: BTreeMap<TemplateId, StepTemplate> = BTreeMap::new();
        let mut frontier: Vec<TemplateId> = resolver.edges.keys().cloned().collect();
        while let Some(id) = frontier.pop() {
            if included.contains_key(&id) {
                continue;
            }
            let template = catalog
                .get(&id)
                .ok_or_else(|| CompileError::UnknownTemplate(id.clone()))?;
            self.check_binding(template, catalog, max_depth, depth)?;
            frontier.extend(template.alternatives.iter().cloned());
            included.insert(id, template.clone());
        }

        let steps: Vec<Step> = resolver
            .edges
            .iter()
            .map(|(template_id, deps)| {
                let priority = included
                    .get(template_id)
                    .map(|t| t.priority)
                    .unwrap_or_default();
                Step::new(
                    StepId::new(template_id.as_str()),
                    template_id.clone(),
                    deps.iter().map(|d| StepId::new(d.as_str())),
                )
                .with_priority(priority)
            })
            .collect();

        let plan = Plan::new(goal.clone(), depth, max_depth, steps, included.into_values())?;
        tracing::debug!(
            plan_id = %plan.id,
            goal = %goal.id,
            depth,
            steps = plan.len(),
            "Plan compiled"
        );
        Ok(plan)
    }

    /// Capability templates must be bound to a registered capability;
    /// composite templates must compile one level deeper.
    fn check_binding(
        &self,
        template: &StepTemplate,
        catalog: &TemplateCatalog,
        max_depth: u32,
        depth: u32,
    ) -> CompileResult<()> {
        match &template.kind {
            TemplateKind::Capability { capability_id } => {
                if let Some(registry) = &self.capabilities {
                    if !registry.contains(capability_id) {
                        return Err(CompileError::UnknownCapability {
                            template: template.id.clone(),
                            capability: capability_id.to_string(),
                        });
                    }
                }
                Ok(())
            }
            TemplateKind::Composite { .. } => {
                let goal = sub_goal(template).ok_or_else(|| {
                    CompileError::UnknownTemplate(template.id.clone())
                })?;
                self.compile_at_depth(&goal, catalog, max_depth, depth + 1)
                    .map(|_| ())
            }
        }
    }

    /// Alternatives a step can be re-planned onto.
    ///
    /// Candidates come from every template the step has been bound to, minus
    /// the ones already tried. A candidate must produce everything the
    /// current template produces and consume only keys the step's
    /// dependencies or the goal provide, so the graph stays unchanged.
    pub fn alternatives(&self, plan: &Plan, step_id: &StepId) -> Vec<Alternative> {
        let Some(step) = plan.step(step_id) else {
            return Vec::new();
        };
        let Some(current) = plan.template(&step.template_id) else {
            return Vec::new();
        };

        let tried: HashSet<&TemplateId> = step
            .failure_history
            .iter()
            .map(|f| &f.template_id)
            .chain(std::iter::once(&step.template_id))
            .collect();

        let available: HashSet<&str> = step
            .dependencies()
            .iter()
            .filter_map(|dep| plan.current_template(dep))
            .flat_map(|t| t.produces.iter().map(String::as_str))
            .chain(plan.goal.inputs.keys().map(String::as_str))
            .collect();

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for source in &tried {
            let Some(template) = plan.template(source) else {
                continue;
            };
            for alt_id in &template.alternatives {
                if tried.contains(alt_id) || !seen.insert(alt_id.clone()) {
                    continue;
                }
                let Some(alt) = plan.template(alt_id) else {
                    continue;
                };
                let covers_outputs = current.produces.iter().all(|k| alt.produces.contains(k));
                let inputs_available = alt.consumes.iter().all(|k| available.contains(k.as_str()));
                if covers_outputs && inputs_available {
                    let cost = alt.capability_id().map(|id| {
                        self.capabilities
                            .as_ref()
                            .and_then(|r| r.descriptor(id))
                            .map_or(1, |d| d.cost)
                    });
                    candidates.push(Alternative {
                        template_id: alt_id.clone(),
                        cost,
                    });
                }
            }
        }
        candidates.sort_by(|a, b| a.template_id.cmp(&b.template_id));
        candidates
    }
}

/// Backward-chaining state for one compilation
struct Resolver<'a> {
    goal: &'a Goal,
    catalog: &'a TemplateCatalog,
    /// Templates on the current resolution path, for cycle reporting
    visiting: Vec<TemplateId>,
    /// Resolved template → templates it depends on
    edges: BTreeMap<TemplateId, BTreeSet<TemplateId>>,
}

impl Resolver<'_> {
    /// Producer of `key`, or `None` when the goal provides it
    fn resolve_key(&mut self, key: &str, consumer: &str) -> CompileResult<Option<TemplateId>> {
        if self.goal.provides(key) {
            return Ok(None);
        }
        let producer = self
            .catalog
            .primary_producer(key)
            .ok_or_else(|| CompileError::UnresolvedDependency {
                consumer: consumer.to_string(),
                key: key.to_string(),
            })?;
        let id = producer.id.clone();
        self.visit(&id)?;
        Ok(Some(id))
    }

    fn visit(&mut self, id: &TemplateId) -> CompileResult<()> {
        if let Some(pos) = self.visiting.iter().position(|v| v == id) {
            let mut cycle: Vec<StepId> = self.visiting[pos..]
                .iter()
                .map(|t| StepId::new(t.as_str()))
                .collect();
            cycle.push(StepId::new(id.as_str()));
            return Err(CompileError::CyclicPlan { cycle });
        }
        if self.edges.contains_key(id) {
            return Ok(());
        }

        let catalog = self.catalog;
        let template = catalog
            .get(id)
            .ok_or_else(|| CompileError::UnknownTemplate(id.clone()))?;

        self.visiting.push(id.clone());
        let mut deps = BTreeSet::new();
        for key in &template.consumes {
            if let Some(dep) = self.resolve_key(key, &format!("step {id}"))? {
                deps.insert(dep);
            }
        }
        self.visiting.pop();
        self.edges.insert(id.clone(), deps);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CapabilityDescriptor, FnCapability, Invocation};
    use serde_json::json;

    fn pipeline_catalog() -> TemplateCatalog {
        TemplateCatalog::new()
            .with(StepTemplate::capability("fetch", "http.fetch").consumes("url").produces("document"))
            .unwrap()
            .with(
                StepTemplate::capability("summarize", "llm.summarize")
                    .consumes("document")
                    .produces("summary")
                    .with_alternative("summarize-lite"),
            )
            .unwrap()
            .with(
                StepTemplate::capability("summarize-lite", "llm.summarize.small")
                    .consumes("document")
                    .produces("summary"),
            )
            .unwrap()
            .with(StepTemplate::capability("publish", "cms.publish").consumes("summary").produces("published"))
            .unwrap()
    }

    fn goal() -> Goal {
        Goal::new("report")
            .with_target("published")
            .with_input("url", json!("https://example.org"))
    }

    #[test]
    fn test_compile_linear_pipeline() {
        let plan = PlanCompiler::new()
            .compile(&goal(), &pipeline_catalog(), 2)
            .unwrap();

        assert_eq!(plan.len(), 3);
        let order: Vec<&str> = plan.topological_order().iter().map(|s| s.as_str()).collect();
        assert_eq!(order, vec!["fetch", "summarize", "publish"]);
        assert!(plan
            .step(&StepId::new("publish"))
            .unwrap()
            .depends_on(&StepId::new("summarize")));
        // The alternative is carried for re-planning but is not a step.
        assert!(plan.template(&TemplateId::new("summarize-lite")).is_some());
        assert!(plan.step(&StepId::new("summarize-lite")).is_none());
    }

    #[test]
    fn test_unresolved_dependency() {
        let goal = Goal::new("report").with_target("published");
        let err = PlanCompiler::new()
            .compile(&goal, &pipeline_catalog(), 2)
            .unwrap_err();
        assert_eq!(
            err,
            CompileError::UnresolvedDependency {
                consumer: "step fetch".into(),
                key: "url".into()
            }
        );
    }

    #[test]
    fn test_missing_target_producer() {
        let goal = Goal::new("report").with_target("nobody-makes-this");
        let err = PlanCompiler::new()
            .compile(&goal, &pipeline_catalog(), 2)
            .unwrap_err();
        assert!(matches!(err, CompileError::UnresolvedDependency { .. }));
    }

    #[test]
    fn test_cycle_through_templates() {
        let catalog = TemplateCatalog::new()
            .with(StepTemplate::capability("a", "x").consumes("kb").produces("ka"))
            .unwrap()
            .with(StepTemplate::capability("b", "x").consumes("ka").produces("kb"))
            .unwrap();
        let err = PlanCompiler::new()
            .compile(&Goal::new("loop").with_target("ka"), &catalog, 1)
            .unwrap_err();
        assert_eq!(
            err,
            CompileError::CyclicPlan {
                cycle: vec![StepId::new("a"), StepId::new("b"), StepId::new("a")]
            }
        );
    }

    #[test]
    fn test_empty_goal() {
        let err = PlanCompiler::new()
            .compile(&Goal::new("nothing"), &pipeline_catalog(), 1)
            .unwrap_err();
        assert!(matches!(err, CompileError::EmptyGoal(_)));
    }

    #[test]
    fn test_shared_producer_is_one_step() {
        let catalog = TemplateCatalog::new()
            .with(StepTemplate::capability("load", "x").produces("data"))
            .unwrap()
            .with(StepTemplate::capability("left", "x").consumes("data").produces("l"))
            .unwrap()
            .with(StepTemplate::capability("right", "x").consumes("data").produces("r"))
            .unwrap()
            .with(
                StepTemplate::capability("join", "x")
                    .consumes("l")
                    .consumes("r")
                    .produces("out"),
            )
            .unwrap();
        let plan = PlanCompiler::new()
            .compile(&Goal::new("diamond").with_target("out"), &catalog, 1)
            .unwrap();
        assert_eq!(plan.len(), 4);
        assert_eq!(plan.execution_waves().len(), 3);
    }

    #[test]
    fn test_self_recursive_composite_exceeds_depth() {
        let inner = Goal::new("again").with_target("result");
        let catalog = TemplateCatalog::new()
            .with(StepTemplate::composite("recurse", inner).produces("result"))
            .unwrap();
        let err = PlanCompiler::new()
            .compile(&Goal::new("root").with_target("result"), &catalog, 3)
            .unwrap_err();
        assert_eq!(
            err,
            CompileError::DepthExceeded {
                depth: 4,
                max_depth: 3
            }
        );
    }

    #[test]
    fn test_composite_within_depth() {
        let sub = Goal::new("draft").with_target("draft");
        let catalog = TemplateCatalog::new()
            .with(StepTemplate::capability("outline", "x").consumes("topic").produces("outline"))
            .unwrap()
            .with(StepTemplate::capability("write", "x").consumes("outline").produces("draft"))
            .unwrap()
            .with(
                StepTemplate::composite("author", sub)
                    .consumes("topic")
                    .produces("draft"),
            )
            .unwrap();
        // `author` is only an alternative, so `write` produces `draft`.
        let goal = Goal::new("root")
            .with_target("article")
            .with_input("topic", json!("rust"));
        let catalog = catalog
            .with(
                StepTemplate::capability("edit", "x")
                    .consumes("draft")
                    .produces("article")
                    .with_alternative("author"),
            )
            .unwrap();
        let plan = PlanCompiler::new().compile(&goal, &catalog, 1).unwrap();
        assert_eq!(plan.len(), 3);

        let sub_plan = PlanCompiler::new()
            .compile_at_depth(
                &sub_goal(catalog.get(&TemplateId::new("author")).unwrap()).unwrap(),
                &catalog,
                1,
                1,
            )
            .unwrap();
        assert_eq!(sub_plan.depth, 1);
        assert_eq!(sub_plan.len(), 2);
    }

    #[test]
    fn test_unknown_capability_with_registry() {
        let registry = Arc::new(CapabilityRegistry::new());
        for id in ["http.fetch", "llm.summarize", "llm.summarize.small"] {
            registry.register(Arc::new(FnCapability::new(
                CapabilityDescriptor::retry_safe(id),
                |inv: Invocation| async move { Ok(inv.input) },
            )));
        }
        let err = PlanCompiler::new()
            .with_capabilities(registry)
            .compile(&goal(), &pipeline_catalog(), 1)
            .unwrap_err();
        assert!(matches!(err, CompileError::UnknownCapability { .. }));
    }

    #[test]
    fn test_alternatives_exclude_tried_templates() {
        let compiler = PlanCompiler::new();
        let mut plan = compiler.compile(&goal(), &pipeline_catalog(), 1).unwrap();
        let summarize = StepId::new("summarize");

        let alts = compiler.alternatives(&plan, &summarize);
        assert_eq!(
            alts,
            vec![Alternative {
                template_id: TemplateId::new("summarize-lite"),
                cost: Some(1)
            }]
        );

        plan.rebind_template(&summarize, &TemplateId::new("summarize-lite"))
            .unwrap();
        plan.step_mut(&summarize).unwrap().record_failure(orchestra_types::FailureRecord::new(
            orchestra_types::FailureKind::Validation,
            summarize.clone(),
            TemplateId::new("summarize"),
            1,
            "too long",
        ));
        assert!(compiler.alternatives(&plan, &summarize).is_empty());
    }
}
