//! Execute a goal, or resume a plan from its snapshot

use super::build_engine;
use crate::demo::load_goal;
use crate::output::{plan_status, print_error, print_json, print_success, print_table, print_warning, step_status, OutputFormat};
use anyhow::{bail, Context};
use orchestra_engine::{
    CancellationToken, EngineConfig, EventStream, FileSnapshotStore, PlanReport, SnapshotStore,
};
use orchestra_types::{EventKind, LifecycleEvent, PlanId, PlanStatus};
use std::path::PathBuf;
use std::sync::Arc;
use tabled::Tabled;
use tracing::{info, warn};

pub struct RunArgs {
    pub catalog: PathBuf,
    pub goal: Option<PathBuf>,
    pub snapshot_dir: Option<PathBuf>,
    pub resume: Option<String>,
}

#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "Step")]
    step: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "Duration (ms)")]
    duration_ms: String,
    #[tabled(rename = "Last Failure")]
    failure: String,
}

pub async fn execute(args: RunArgs, config: EngineConfig, format: OutputFormat) -> anyhow::Result<()> {
    let store = args.snapshot_dir.as_ref().map(|dir| Arc::new(FileSnapshotStore::new(dir)));
    let engine = build_engine(
        &args.catalog,
        config,
        store.clone().map(|s| s as Arc<dyn SnapshotStore>),
    )?;

    let monitor = tokio::spawn(log_events(engine.events().subscribe()));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, aborting plan");
            trigger.cancel();
        }
    });

    let result = match (&args.resume, &store) {
        (Some(plan_id), Some(store)) => {
            let snapshot = store
                .load(&PlanId::new(plan_id.as_str()))
                .await?
                .with_context(|| format!("no snapshot for plan {plan_id} in {}", store.dir().display()))?;
            info!(plan_id = %plan_id, status = %snapshot.plan.status, "Resuming plan");
            engine.resume(snapshot, cancel).await
        }
        (Some(_), None) => bail!("--resume needs --snapshot-dir"),
        (None, _) => {
            let path = args.goal.as_ref().context("--goal is required")?;
            let goal = load_goal(path)?;
            let plan = engine
                .compile(&goal)
                .with_context(|| format!("compiling goal {}", goal.id))?;
            engine.run_with(plan, cancel).await
        }
    };

    engine.events().close();
    if let Err(e) = monitor.await {
        warn!(error = %e, "Event monitor ended abnormally");
    }

    let report = result.context("running plan")?;
    print_report(&report, format)?;

    if !report.is_completed() {
        bail!("plan {} ended {}", report.plan_id, report.status);
    }
    Ok(())
}

/// Forward lifecycle events to the log until the event log closes
async fn log_events(mut stream: EventStream) {
    while let Some(event) = stream.next().await {
        log_event(&event);
    }
}

fn log_event(event: &LifecycleEvent) {
    let plan = event.plan_id.short();
    let depth = event.depth;
    match &event.kind {
        EventKind::PlanStarted { goal, steps } => {
            info!(plan, depth, goal = %goal, steps, "Plan started")
        }
        EventKind::StepTransition { step_id, from, to, attempt } => {
            info!(plan, depth, step = %step_id, %from, %to, attempt, "Step transition")
        }
        EventKind::VerdictIssued { step_id, verdict } => {
            info!(plan, depth, step = %step_id, verdict = ?verdict, "Verdict issued")
        }
        EventKind::RecoveryDecided { step_id, failure, decision } => {
            warn!(plan, depth, step = %step_id, %failure, decision = ?decision, "Recovery decided")
        }
        EventKind::StepReplanned { step_id, from, to } => {
            info!(plan, depth, step = %step_id, %from, %to, "Step re-planned")
        }
        EventKind::EscalationRaised { step_id, reason } => {
            warn!(plan, depth, step = %step_id, reason = %reason, "Escalation raised")
        }
        EventKind::EscalationResolved { step_id, decision } => {
            info!(plan, depth, step = %step_id, decision = ?decision, "Escalation resolved")
        }
        EventKind::SubPlanSpawned { step_id, sub_plan, depth: sub_depth } => {
            info!(plan, depth, step = %step_id, sub_plan = %sub_plan.short(), sub_depth, "Sub-plan spawned")
        }
        EventKind::BlackboardCommitted { step_id, key, version } => {
            info!(plan, depth, step = %step_id, key = %key, version, "Blackboard committed")
        }
        EventKind::PlanFinished { status } => {
            info!(plan, depth, %status, "Plan finished")
        }
    }
}

fn print_report(report: &PlanReport, format: OutputFormat) -> anyhow::Result<()> {
    if let OutputFormat::Json = format {
        return print_json(report);
    }

    let rows = report
        .plan
        .steps()
        .map(|step| StepRow {
            step: step.id.to_string(),
            status: step_status(step.status).to_string(),
            attempts: step.attempts,
            duration_ms: report
                .durations_ms
                .get(&step.id)
                .map(|ms| ms.to_string())
                .unwrap_or_else(|| "-".to_string()),
            failure: step
                .failure
                .as_ref()
                .map(|f| crate::output::truncate(&format!("{}: {}", f.kind, f.diagnostic), 60))
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();
    print_table(rows);

    let summary = &report.summary;
    let line = format!(
        "Plan {} {}: {}/{} steps succeeded, {} attempts, {:.0}% success",
        report.plan_id.short(),
        plan_status(report.status),
        summary.succeeded,
        summary.total_steps,
        summary.attempts,
        summary.success_rate
    );
    match report.status {
        PlanStatus::Completed => print_success(&line),
        PlanStatus::Aborted => print_error(&line),
        _ => print_warning(&line),
    }
    for target in &report.plan.goal.targets {
        if let Some(value) = report.output(target) {
            println!("  {target} = {value}");
        }
    }
    Ok(())
}
