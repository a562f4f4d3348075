//! Inspect a snapshot file

use crate::output::{plan_status, print_info, print_json, print_table, step_status, truncate, OutputFormat};
use colored::*;
use orchestra_engine::{FileSnapshotStore, PlanSnapshot};
use std::path::Path;
use tabled::Tabled;

#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "Step")]
    step: String,
    #[tabled(rename = "Template")]
    template: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Re-plans")]
    replans: u32,
    #[tabled(rename = "Failures")]
    failures: usize,
}

#[derive(Tabled)]
struct EntryRow {
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Version")]
    version: u64,
    #[tabled(rename = "Author")]
    author: String,
    #[tabled(rename = "Written")]
    written_at: String,
    #[tabled(rename = "Value")]
    value: String,
}

pub async fn execute(path: &Path, format: OutputFormat) -> anyhow::Result<()> {
    let snapshot = FileSnapshotStore::read_file(path).await?;

    match format {
        OutputFormat::Json => print_json(&snapshot),
        OutputFormat::Table => {
            print_snapshot(&snapshot);
            Ok(())
        }
    }
}

fn print_snapshot(snapshot: &PlanSnapshot) {
    let plan = &snapshot.plan;
    print_info(&format!(
        "Plan {} for goal {} is {} (taken {})",
        plan.id.as_str().bold(),
        plan.goal.id.bold(),
        plan_status(plan.status),
        snapshot.taken_at.format("%Y-%m-%d %H:%M:%S")
    ));

    println!();
    println!("{}", "Steps".bold());
    print_table(
        plan.topological_order()
            .iter()
            .filter_map(|id| plan.step(id))
            .map(|step| StepRow {
                step: step.id.to_string(),
                template: step.template_id.to_string(),
                status: step_status(step.status).to_string(),
                attempts: step.attempts,
                replans: step.replans,
                failures: step.failure_history.len(),
            })
            .collect(),
    );

    println!();
    println!("{}", "Blackboard".bold());
    print_table(
        snapshot
            .blackboard
            .entries
            .values()
            .flatten()
            .map(|entry| EntryRow {
                key: entry.key.clone(),
                version: entry.version,
                author: entry.author.to_string(),
                written_at: entry.written_at.format("%H:%M:%S%.3f").to_string(),
                value: truncate(&entry.value.to_string(), 48),
            })
            .collect(),
    );

    if !snapshot.escalations.is_empty() {
        println!();
        println!("{}", "Escalations".bold());
        for record in &snapshot.escalations {
            let state = if record.is_pending() {
                "pending".yellow()
            } else {
                "resolved".green()
            };
            println!("  {} [{}] {}", record.context.step_id, state, record.reason);
        }
    }
}
