//! Dry run: compile a goal and show the resulting plan

use super::build_engine;
use crate::demo::load_goal;
use crate::output::{print_info, print_json, print_table, OutputFormat};
use anyhow::Context;
use colored::*;
use orchestra_engine::EngineConfig;
use orchestra_types::{Plan, TemplateKind};
use std::path::Path;
use tabled::Tabled;

#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "Wave")]
    wave: usize,
    #[tabled(rename = "Step")]
    step: String,
    #[tabled(rename = "Runs")]
    runs: String,
    #[tabled(rename = "Depends On")]
    depends_on: String,
    #[tabled(rename = "Produces")]
    produces: String,
    #[tabled(rename = "Priority")]
    priority: String,
}

pub fn execute(
    catalog: &Path,
    goal: &Path,
    config: EngineConfig,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let engine = build_engine(catalog, config, None)?;
    let goal = load_goal(goal)?;
    let plan = engine
        .compile(&goal)
        .with_context(|| format!("compiling goal {}", goal.id))?;

    match format {
        OutputFormat::Json => print_json(&plan),
        OutputFormat::Table => {
            print_info(&format!(
                "Plan {} for goal {} ({} steps, {})",
                plan.id.short().bold(),
                goal.id.bold(),
                plan.len(),
                goal.failure_policy
            ));
            print_table(rows(&plan));
            Ok(())
        }
    }
}

fn rows(plan: &Plan) -> Vec<StepRow> {
    let mut rows = Vec::with_capacity(plan.len());
    for (index, wave) in plan.execution_waves().iter().enumerate() {
        for id in wave {
            let Some(step) = plan.step(id) else { continue };
            let template = plan.current_template(id);
            let runs = match template.map(|t| &t.kind) {
                Some(TemplateKind::Capability { capability_id }) => capability_id.to_string(),
                Some(TemplateKind::Composite { goal }) => format!("sub-goal {}", goal.id),
                None => "-".to_string(),
            };
            rows.push(StepRow {
                wave: index + 1,
                step: id.to_string(),
                runs,
                depends_on: join(step.dependencies().iter().map(|d| d.to_string())),
                produces: join(template.into_iter().flat_map(|t| t.produces.iter().cloned())),
                priority: format!("{:?}", step.priority).to_lowercase(),
            });
        }
    }
    rows
}

fn join(items: impl Iterator<Item = String>) -> String {
    let joined = items.collect::<Vec<_>>().join(", ");
    if joined.is_empty() {
        "-".to_string()
    } else {
        joined
    }
}
