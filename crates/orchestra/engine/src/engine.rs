//! Workflow Engine: the state machine and scheduler that drives a plan.
//!
//! One coordinator task owns the [`Plan`] and is the only writer of step
//! statuses. Ready steps wait in a priority queue; a bounded number of
//! worker tasks execute them and report back over a completion channel.
//! Backoff timers and human reviews are separate tasks reporting on the
//! same channel, so a step waiting on either never holds a worker.
//!
//! ```text
//! pending ─► ready ─► running ─► verifying ─► succeeded
//!                        │            │
//!                        └────┬───────┘
//!                             ▼
//!              retry-pending │ escalated │ failed
//! ```
//!
//! Delegating steps run their sub-plan through the same machinery, one
//! level deeper, on the sub-plan's own blackboard.

use crate::blackboard::{Blackboard, BlackboardSnapshot};
use crate::capability::{invoke_with_deadline, Capability, CapabilityRegistry, Invocation};
use crate::catalog::TemplateCatalog;
use crate::compiler::PlanCompiler;
use crate::config::EngineConfig;
use crate::delegation::{DelegationBudget, DelegationRouter, Resolution, SubPlanSpec};
use crate::events::EventLog;
use crate::recovery::{RecoveryContext, RecoveryController};
use crate::snapshot::{PlanSnapshot, SnapshotStore};
use crate::verifier::Verifier;
use futures::future::BoxFuture;
use futures::FutureExt;
use orchestra_types::{
    CapabilityId, CompileResult, EngineError, EngineResult, EscalationContext, EscalationRecord,
    EventKind, FailureKind, FailurePolicy, FailureRecord, Goal, HumanDecision, Plan, PlanId,
    PlanStatus, PlanSummary, Priority, RecoveryDecision, Step, StepId, StepStatus, StepTemplate,
    TemplateId, Verdict,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

/// Author recorded on blackboard entries seeded from goal inputs
pub const GOAL_AUTHOR: &str = "goal";

// ── Report ───────────────────────────────────────────────────────────

/// Outcome of a plan run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanReport {
    pub plan_id: PlanId,
    pub status: PlanStatus,
    /// Final plan: statuses, attempts and failure history of every step
    pub plan: Plan,
    pub succeeded: Vec<StepId>,
    pub failed: Vec<StepId>,
    /// Steps still waiting on a human
    pub escalated: Vec<StepId>,
    pub aborted: Vec<StepId>,
    /// Wall-clock time per settled step
    pub durations_ms: BTreeMap<StepId, i64>,
    pub escalations: Vec<EscalationRecord>,
    /// Steps whose attempts ran work that is unsafe to repeat
    #[serde(default)]
    pub side_effects: Vec<StepId>,
    pub blackboard: BlackboardSnapshot,
    pub summary: PlanSummary,
}

impl PlanReport {
    fn new(
        plan: Plan,
        blackboard: BlackboardSnapshot,
        escalations: Vec<EscalationRecord>,
        side_effects: Vec<StepId>,
    ) -> Self {
        let durations_ms = plan
            .steps()
            .filter_map(|s| s.duration().map(|d| (s.id.clone(), d.num_milliseconds())))
            .collect();
        Self {
            plan_id: plan.id.clone(),
            status: plan.status,
            succeeded: plan.steps_with_status(StepStatus::Succeeded),
            failed: plan.steps_with_status(StepStatus::Failed),
            escalated: plan.steps_with_status(StepStatus::Escalated),
            aborted: plan.steps_with_status(StepStatus::Aborted),
            durations_ms,
            escalations,
            side_effects,
            blackboard,
            summary: plan.summary(),
            plan,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == PlanStatus::Completed
    }

    /// Latest committed value of a blackboard key
    pub fn output(&self, key: &str) -> Option<&Value> {
        self.blackboard
            .entries
            .get(key)
            .and_then(|history| history.last())
            .map(|e| &e.value)
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.plan.step(&StepId::new(id))
    }
}

// ── Engine ───────────────────────────────────────────────────────────

/// Shared by every plan an engine runs, including sub-plans
struct EngineCore {
    config: EngineConfig,
    catalog: Arc<TemplateCatalog>,
    capabilities: Arc<CapabilityRegistry>,
    compiler: PlanCompiler,
    verifier: Verifier,
    recovery: RecoveryController,
    router: DelegationRouter,
    events: EventLog,
    snapshots: Option<Arc<dyn SnapshotStore>>,
}

/// Builder for [`WorkflowEngine`]
pub struct EngineBuilder {
    config: EngineConfig,
    catalog: TemplateCatalog,
    capabilities: Arc<CapabilityRegistry>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    events: EventLog,
}

impl EngineBuilder {
    fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            catalog: TemplateCatalog::new(),
            capabilities: Arc::new(CapabilityRegistry::new()),
            snapshots: None,
            events: EventLog::new(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn catalog(mut self, catalog: TemplateCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Register one capability
    pub fn capability(self, capability: Arc<dyn Capability>) -> Self {
        self.capabilities.register(capability);
        self
    }

    /// Use an existing registry
    pub fn capabilities(mut self, registry: Arc<CapabilityRegistry>) -> Self {
        self.capabilities = registry;
        self
    }

    /// Save a snapshot after every settled step
    pub fn snapshot_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn event_log(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> EngineResult<WorkflowEngine> {
        self.config.validate().map_err(EngineError::Config)?;

        let catalog = Arc::new(self.catalog);
        let compiler = PlanCompiler::new().with_capabilities(Arc::clone(&self.capabilities));
        let verifier = Verifier::new(
            Arc::clone(&self.capabilities),
            self.config.default_capability_timeout(),
        );
        let recovery = RecoveryController::new(&self.config.recovery);
        let router = DelegationRouter::new(
            Arc::clone(&catalog),
            Arc::clone(&self.capabilities),
            compiler.clone(),
        );

        Ok(WorkflowEngine {
            core: Arc::new(EngineCore {
                config: self.config,
                catalog,
                capabilities: self.capabilities,
                compiler,
                verifier,
                recovery,
                router,
                events: self.events,
                snapshots: self.snapshots,
            }),
        })
    }
}

/// Compiles goals and runs plans
#[derive(Clone)]
pub struct WorkflowEngine {
    core: Arc<EngineCore>,
}

impl WorkflowEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    pub fn catalog(&self) -> &TemplateCatalog {
        &self.core.catalog
    }

    pub fn capabilities(&self) -> &Arc<CapabilityRegistry> {
        &self.core.capabilities
    }

    /// Lifecycle events of every plan this engine runs
    pub fn events(&self) -> &EventLog {
        &self.core.events
    }

    pub fn compile(&self, goal: &Goal) -> CompileResult<Plan> {
        self.core
            .compiler
            .compile(goal, &self.core.catalog, self.core.config.max_depth)
    }

    /// Compile and run a goal
    pub async fn run_goal(&self, goal: &Goal) -> EngineResult<PlanReport> {
        let plan = self.compile(goal)?;
        self.run(plan).await
    }

    pub async fn run(&self, plan: Plan) -> EngineResult<PlanReport> {
        self.run_with(plan, CancellationToken::new()).await
    }

    /// Run a plan until it settles or `cancel` fires
    pub async fn run_with(&self, plan: Plan, cancel: CancellationToken) -> EngineResult<PlanReport> {
        if plan.status.is_terminal() {
            return Err(EngineError::NotRunnable {
                plan: plan.id.clone(),
                status: plan.status,
            });
        }
        let board = Arc::new(Blackboard::new(
            plan.id.clone(),
            self.core.config.conflict_policy,
        ));
        seed(&board, &plan.goal.inputs).await?;
        execute(
            Arc::clone(&self.core),
            plan,
            board,
            cancel,
            self.budget(),
            Carried::default(),
        )
        .await
    }

    /// Continue a plan from a snapshot.
    ///
    /// Interrupted steps go back to `pending` with their attempt counts
    /// kept; the blackboard is restored with every committed version.
    pub async fn resume(
        &self,
        snapshot: PlanSnapshot,
        cancel: CancellationToken,
    ) -> EngineResult<PlanReport> {
        let PlanSnapshot {
            mut plan,
            blackboard,
            escalations,
            side_effects,
            ..
        } = snapshot;
        if plan.status.is_terminal() {
            return Err(EngineError::NotRunnable {
                plan: plan.id.clone(),
                status: plan.status,
            });
        }
        plan.prepare_resume();
        let board = Arc::new(Blackboard::restore(
            plan.id.clone(),
            self.core.config.conflict_policy,
            &blackboard,
        ));
        seed(&board, &plan.goal.inputs).await?;
        info!(plan_id = %plan.id, steps = plan.len(), "Resuming plan");
        execute(
            Arc::clone(&self.core),
            plan,
            board,
            cancel,
            self.budget(),
            Carried {
                escalations,
                side_effects: side_effects.into_iter().collect(),
            },
        )
        .await
    }

    fn budget(&self) -> DelegationBudget {
        DelegationBudget::new(
            self.core.config.max_live_subplans,
            self.core.config.ready_queue_high_watermark,
        )
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("config", &self.core.config)
            .field("templates", &self.core.catalog.len())
            .field("capabilities", &self.core.capabilities.len())
            .finish()
    }
}

/// Write goal inputs that are not on the board yet
async fn seed(board: &Blackboard, inputs: &BTreeMap<String, Value>) -> EngineResult<()> {
    let author = StepId::new(GOAL_AUTHOR);
    for (key, value) in inputs {
        if !board.contains(key) {
            board.write(key, value.clone(), &author).await?;
        }
    }
    Ok(())
}

/// Run one plan to completion; boxed so sub-plans can recurse
fn execute(
    core: Arc<EngineCore>,
    plan: Plan,
    board: Arc<Blackboard>,
    cancel: CancellationToken,
    budget: DelegationBudget,
    carried: Carried,
) -> BoxFuture<'static, EngineResult<PlanReport>> {
    let span = tracing::info_span!("plan", plan_id = %plan.id, depth = plan.depth);
    async move {
        PlanRun::new(core, plan, board, cancel, budget, carried)
            .run()
            .await
    }
    .instrument(span)
    .boxed()
}

/// State a resumed run picks up from its snapshot
#[derive(Default)]
struct Carried {
    escalations: Vec<EscalationRecord>,
    side_effects: BTreeSet<StepId>,
}

// ── Coordinator ──────────────────────────────────────────────────────

enum Message {
    /// The capability returned; verification has started
    Executed { step_id: StepId },
    Finished { step_id: StepId, outcome: StepOutcome },
    RetryDue { step_id: StepId },
    /// A sub-plan ran work that is unsafe to repeat
    SideEffects { step_id: StepId },
    HumanDecided {
        step_id: StepId,
        record_id: uuid::Uuid,
        decision: Result<HumanDecision, String>,
    },
}

enum StepOutcome {
    Passed {
        output: Value,
        verdict: Verdict,
        commits: Vec<(String, u64)>,
    },
    Rejected {
        output: Value,
        verdict: Verdict,
    },
    Errored(FailureRecord),
    Internal(EngineError),
}

/// Ready-queue entry: higher priority first, then first come first served
#[derive(Debug, PartialEq, Eq)]
struct Queued {
    priority: Priority,
    sequence: u64,
    step_id: StepId,
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct PlanRun {
    core: Arc<EngineCore>,
    plan: Plan,
    board: Arc<Blackboard>,
    budget: DelegationBudget,
    run_token: CancellationToken,
    escalations: Vec<EscalationRecord>,
    side_effects: BTreeSet<StepId>,
    queue: BinaryHeap<Queued>,
    enqueued: u64,
    in_flight: usize,
    timers: usize,
    pending_human: usize,
    aborted: bool,
    tasks: JoinSet<()>,
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl PlanRun {
    fn new(
        core: Arc<EngineCore>,
        plan: Plan,
        board: Arc<Blackboard>,
        cancel: CancellationToken,
        budget: DelegationBudget,
        carried: Carried,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            core,
            plan,
            board,
            budget,
            run_token: cancel.child_token(),
            escalations: carried.escalations,
            side_effects: carried.side_effects,
            queue: BinaryHeap::new(),
            enqueued: 0,
            in_flight: 0,
            timers: 0,
            pending_human: 0,
            aborted: false,
            tasks: JoinSet::new(),
            tx,
            rx,
        }
    }

    async fn run(mut self) -> EngineResult<PlanReport> {
        if self.plan.status.is_terminal() {
            return Err(EngineError::NotRunnable {
                plan: self.plan.id.clone(),
                status: self.plan.status,
            });
        }
        self.plan.status = PlanStatus::Running;
        self.emit(EventKind::PlanStarted {
            goal: self.plan.goal.id.clone(),
            steps: self.plan.len(),
        });
        info!(
            plan_id = %self.plan.id,
            goal = %self.plan.goal.id,
            depth = self.plan.depth,
            steps = self.plan.len(),
            policy = %self.plan.goal.failure_policy,
            "Plan started"
        );

        if let Err(e) = self.drive().await {
            error!(plan_id = %self.plan.id, error = %e, "Plan stopped on internal error");
            self.run_token.cancel();
            self.tasks.abort_all();
            self.clear_queue();
            self.board.close();
            return Err(e);
        }
        self.drain().await;
        self.finish().await
    }

    async fn drive(&mut self) -> EngineResult<()> {
        // Escalations carried over from a snapshot still need an answer.
        for id in self.plan.steps_with_status(StepStatus::Escalated) {
            self.request_human(&id)?;
        }

        loop {
            if self.aborted {
                return Ok(());
            }
            self.promote_ready()?;
            self.dispatch_ready()?;
            if self.aborted
                || (self.in_flight == 0 && self.timers == 0 && self.pending_human == 0)
            {
                return Ok(());
            }

            tokio::select! {
                biased;
                _ = self.run_token.cancelled() => {
                    self.abort_plan("plan cancelled")?;
                }
                Some(joined) = self.tasks.join_next() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(plan_id = %self.plan.id, "Engine task panicked");
                        }
                    }
                }
                message = self.rx.recv() => {
                    let Some(message) = message else {
                        return Err(EngineError::Internal("completion channel closed".into()));
                    };
                    self.handle(message).await?;
                }
            }
        }
    }

    /// After an abort, wait up to the grace period for in-flight workers
    async fn drain(&mut self) {
        if self.aborted && self.in_flight > 0 {
            let grace = self.core.config.cancellation_grace();
            let deadline = tokio::time::sleep(grace);
            tokio::pin!(deadline);
            while self.in_flight > 0 {
                tokio::select! {
                    _ = &mut deadline => {
                        warn!(
                            plan_id = %self.plan.id,
                            in_flight = self.in_flight,
                            grace_ms = grace.as_millis() as u64,
                            "Grace period elapsed; abandoning in-flight calls"
                        );
                        break;
                    }
                    message = self.rx.recv() => match message {
                        Some(Message::Finished { .. }) => self.in_flight -= 1,
                        Some(_) => {}
                        None => break,
                    }
                }
            }
        }
        self.run_token.cancel();
        self.tasks.abort_all();
    }

    async fn finish(mut self) -> EngineResult<PlanReport> {
        self.clear_queue();
        let status = if self.aborted {
            PlanStatus::Aborted
        } else {
            // Anything still pending is blocked behind an unresolved step.
            for id in self.plan.steps_with_status(StepStatus::Pending) {
                self.transition(&id, StepStatus::Aborted)?;
            }
            let summary = self.plan.summary();
            if summary.succeeded == summary.total_steps {
                PlanStatus::Completed
            } else if summary.failed == 0 && summary.escalated > 0 {
                PlanStatus::EscalatedTerminal
            } else {
                PlanStatus::PartiallyCompleted
            }
        };
        self.plan.status = status;
        self.emit(EventKind::PlanFinished { status });

        let summary = self.plan.summary();
        info!(
            plan_id = %self.plan.id,
            status = %status,
            succeeded = summary.succeeded,
            failed = summary.failed,
            escalated = summary.escalated,
            aborted = summary.aborted,
            "Plan finished"
        );

        self.checkpoint().await?;
        let report = PlanReport::new(
            self.plan.clone(),
            self.board.snapshot(),
            self.escalations.clone(),
            self.side_effects.iter().cloned().collect(),
        );
        self.board.close();
        Ok(report)
    }

    // ── Messages ─────────────────────────────────────────────────────

    async fn handle(&mut self, message: Message) -> EngineResult<()> {
        match message {
            Message::Executed { step_id } => {
                if self.status_of(&step_id)? == StepStatus::Running {
                    self.transition(&step_id, StepStatus::Verifying)?;
                }
                Ok(())
            }
            Message::Finished { step_id, outcome } => {
                self.in_flight -= 1;
                self.settle(step_id, outcome).await?;
                self.checkpoint().await
            }
            Message::RetryDue { step_id } => {
                self.timers -= 1;
                if self.status_of(&step_id)? == StepStatus::RetryPending {
                    self.transition(&step_id, StepStatus::Ready)?;
                    self.enqueue(&step_id);
                }
                Ok(())
            }
            Message::SideEffects { step_id } => {
                self.side_effects.insert(step_id);
                Ok(())
            }
            Message::HumanDecided {
                step_id,
                record_id,
                decision,
            } => {
                self.pending_human -= 1;
                self.resolve_escalation(step_id, record_id, decision).await?;
                self.checkpoint().await
            }
        }
    }

    async fn settle(&mut self, id: StepId, outcome: StepOutcome) -> EngineResult<()> {
        if let StepOutcome::Internal(e) = outcome {
            return Err(e);
        }
        let status = self.status_of(&id)?;
        if !matches!(status, StepStatus::Running | StepStatus::Verifying) {
            debug!(plan_id = %self.plan.id, step_id = %id, %status, "Ignoring late completion");
            return Ok(());
        }

        match outcome {
            StepOutcome::Passed {
                output,
                verdict,
                commits,
            } => {
                self.emit(EventKind::VerdictIssued {
                    step_id: id.clone(),
                    verdict,
                });
                for (key, version) in commits {
                    self.emit(EventKind::BlackboardCommitted {
                        step_id: id.clone(),
                        key,
                        version,
                    });
                }
                if let Some(step) = self.plan.step_mut(&id) {
                    step.result = Some(output);
                }
                self.transition(&id, StepStatus::Succeeded)?;
                info!(plan_id = %self.plan.id, step_id = %id, "Step succeeded");
                Ok(())
            }
            StepOutcome::Rejected { output, verdict } => {
                self.emit(EventKind::VerdictIssued {
                    step_id: id.clone(),
                    verdict: verdict.clone(),
                });
                let (template_id, attempt) = self.identity(&id)?;
                let failure = FailureRecord::new(
                    verdict.failure_kind().unwrap_or(FailureKind::Validation),
                    id.clone(),
                    template_id,
                    attempt,
                    verdict.rationale,
                )
                .with_payload(json!({ "score": verdict.score }));
                self.handle_failure(&id, failure, Some(output))
            }
            StepOutcome::Errored(failure) => self.handle_failure(&id, failure, None),
            StepOutcome::Internal(_) => Ok(()),
        }
    }

    // ── Scheduling ───────────────────────────────────────────────────

    fn promote_ready(&mut self) -> EngineResult<()> {
        for id in self.plan.ready_candidates() {
            self.transition(&id, StepStatus::Ready)?;
            self.enqueue(&id);
        }
        Ok(())
    }

    fn enqueue(&mut self, id: &StepId) {
        let priority = self.plan.step(id).map(|s| s.priority).unwrap_or_default();
        self.enqueued += 1;
        self.queue.push(Queued {
            priority,
            sequence: self.enqueued,
            step_id: id.clone(),
        });
        self.budget.queue_grew(1);
    }

    fn clear_queue(&mut self) {
        self.budget.queue_shrank(self.queue.len());
        self.queue.clear();
    }

    fn dispatch_ready(&mut self) -> EngineResult<()> {
        while !self.aborted && self.in_flight < self.core.config.max_workers {
            let Some(next) = self.queue.pop() else {
                break;
            };
            self.budget.queue_shrank(1);
            if self.status_of(&next.step_id)? == StepStatus::Ready {
                self.dispatch(&next.step_id)?;
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, id: &StepId) -> EngineResult<()> {
        if !self.plan.dependencies_satisfied(id) {
            return Err(EngineError::Internal(format!(
                "step {id} scheduled before its dependencies succeeded"
            )));
        }
        let template = self.template_of(id)?;

        // A resumed step may already have used its whole retry budget.
        let step = self
            .plan
            .step_mut(id)
            .ok_or_else(|| EngineError::UnknownStep(id.clone()))?;
        let exhausted = step.attempts >= template.retry_policy.max_attempts;
        if !exhausted {
            step.attempts += 1;
        }
        let attempt = step.attempts;
        self.transition(id, StepStatus::Running)?;

        if exhausted {
            let failure = FailureRecord::new(
                FailureKind::Transient,
                id.clone(),
                template.id.clone(),
                attempt,
                "attempt interrupted with no retries left",
            );
            if let Some(step) = self.plan.step_mut(id) {
                step.record_failure(failure.clone());
            }
            return self.escalate(
                id,
                format!("{attempt} attempts exhausted"),
                Some(failure),
                None,
            );
        }

        let input = self.step_input(&template);
        let step = self
            .plan
            .step(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownStep(id.clone()))?;

        match self.core.router.resolve(&self.plan, id, &self.budget) {
            Err(route) => {
                let failure =
                    FailureRecord::new(route.kind, id.clone(), template.id.clone(), attempt, route.reason);
                self.handle_failure(id, failure, None)
            }
            Ok(Resolution::Direct {
                capability,
                descriptor,
            }) => {
                let invocation = Invocation {
                    capability_id: descriptor.id.clone(),
                    plan_id: self.plan.id.clone(),
                    step_id: id.clone(),
                    attempt,
                    input,
                    cancellation: self.run_token.child_token(),
                    timeout: descriptor
                        .timeout()
                        .unwrap_or_else(|| self.core.config.default_capability_timeout()),
                };
                debug!(
                    plan_id = %self.plan.id,
                    step_id = %id,
                    capability_id = %descriptor.id,
                    attempt,
                    "Dispatching step"
                );
                if !descriptor.retry_safe {
                    self.side_effects.insert(id.clone());
                }
                self.spawn_worker(step, template, Work::Direct { capability, invocation });
                Ok(())
            }
            Ok(Resolution::SubPlan(spec)) => {
                self.emit(EventKind::SubPlanSpawned {
                    step_id: id.clone(),
                    sub_plan: spec.plan.id.clone(),
                    depth: spec.plan.depth,
                });
                info!(
                    plan_id = %self.plan.id,
                    step_id = %id,
                    sub_plan = %spec.plan.id,
                    "Delegating step to sub-plan"
                );
                self.spawn_worker(step, template, Work::SubPlan { spec, input });
                Ok(())
            }
        }
    }

    /// Consumed keys' latest values plus the template's static parameters
    fn step_input(&self, template: &StepTemplate) -> Value {
        let mut input = Map::new();
        for key in &template.consumes {
            let value = self
                .board
                .read(key, None)
                .map(|(value, _)| value)
                .unwrap_or(Value::Null);
            input.insert(key.clone(), value);
        }
        input.insert(
            "params".to_string(),
            Value::Object(template.parameters.clone().into_iter().collect()),
        );
        Value::Object(input)
    }

    fn spawn_worker(&mut self, step: Step, template: StepTemplate, work: Work) {
        let worker = Worker {
            core: Arc::clone(&self.core),
            plan_id: self.plan.id.clone(),
            board: Arc::clone(&self.board),
            budget: self.budget.clone(),
            token: self.run_token.clone(),
            tx: self.tx.clone(),
            step,
            template,
        };
        self.in_flight += 1;
        self.tasks.spawn(worker.run(work));
    }

    fn schedule_retry(&mut self, id: &StepId, delay: Duration) -> EngineResult<()> {
        if delay.is_zero() {
            self.transition(id, StepStatus::Ready)?;
            self.enqueue(id);
            return Ok(());
        }
        let token = self.run_token.clone();
        let tx = self.tx.clone();
        let step_id = id.clone();
        self.timers += 1;
        self.tasks.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Message::RetryDue { step_id });
                }
            }
        });
        Ok(())
    }

    // ── Failure handling ─────────────────────────────────────────────

    fn handle_failure(
        &mut self,
        id: &StepId,
        failure: FailureRecord,
        last_output: Option<Value>,
    ) -> EngineResult<()> {
        let template = self.template_of(id)?;
        warn!(
            plan_id = %self.plan.id,
            step_id = %id,
            attempt = failure.attempt,
            kind = %failure.kind,
            diagnostic = %failure.diagnostic,
            "Step attempt failed"
        );
        let step = self
            .plan
            .step_mut(id)
            .ok_or_else(|| EngineError::UnknownStep(id.clone()))?;
        step.record_failure(failure.clone());
        let (attempts, replans) = (step.attempts, step.replans);

        // An unregistered capability was never invoked, so repeating is safe.
        // A sub-plan is unsafe to repeat once any of its steps ran such work.
        let (retry_safe, current_cost) = match template.capability_id() {
            Some(capability_id) => self
                .core
                .capabilities
                .descriptor(capability_id)
                .map_or((true, None), |d| (d.retry_safe, Some(d.cost))),
            None => (!self.side_effects.contains(id), None),
        };
        let alternatives = self.core.compiler.alternatives(&self.plan, id);
        let ctx = RecoveryContext {
            policy: &template.retry_policy,
            failure_policy: self.plan.goal.failure_policy,
            retry_safe,
            attempts,
            replans,
            current_cost,
            alternatives: &alternatives,
        };
        let decision = self.core.recovery.decide(&failure, &ctx);
        self.emit(EventKind::RecoveryDecided {
            step_id: id.clone(),
            failure: failure.kind,
            decision: decision.clone(),
        });

        match decision {
            RecoveryDecision::RetryAfter { delay_ms } => {
                self.transition(id, StepStatus::RetryPending)?;
                debug!(plan_id = %self.plan.id, step_id = %id, delay_ms, "Retry scheduled");
                self.schedule_retry(id, Duration::from_millis(delay_ms))
            }
            RecoveryDecision::Reassign {
                template_id,
                delay_ms,
            } => {
                self.transition(id, StepStatus::RetryPending)?;
                self.plan.rebind_template(id, &template_id)?;
                info!(
                    plan_id = %self.plan.id,
                    step_id = %id,
                    from = %template.id,
                    to = %template_id,
                    "Step re-planned"
                );
                self.emit(EventKind::StepReplanned {
                    step_id: id.clone(),
                    from: template.id,
                    to: template_id,
                });
                self.schedule_retry(id, Duration::from_millis(delay_ms))
            }
            RecoveryDecision::Escalate { reason } => {
                self.escalate(id, reason, Some(failure), last_output)
            }
            RecoveryDecision::Abort { reason } => self.fail_step(id, &reason),
        }
    }

    fn escalate(
        &mut self,
        id: &StepId,
        reason: String,
        failure: Option<FailureRecord>,
        last_output: Option<Value>,
    ) -> EngineResult<()> {
        self.transition(id, StepStatus::Escalated)?;
        let (_, attempt) = self.identity(id)?;
        let record = EscalationRecord::new(
            EscalationContext {
                plan_id: self.plan.id.clone(),
                step_id: id.clone(),
                attempt,
                failure,
                last_output,
            },
            reason.clone(),
        );
        warn!(plan_id = %self.plan.id, step_id = %id, reason = %reason, "Step escalated");
        self.emit(EventKind::EscalationRaised {
            step_id: id.clone(),
            reason,
        });
        self.escalations.push(record);
        self.request_human(id)
    }

    /// Ask the configured reviewer; without one the escalation fails the step
    fn request_human(&mut self, id: &StepId) -> EngineResult<()> {
        let reviewer = self
            .core
            .config
            .escalation_capability
            .as_deref()
            .map(CapabilityId::new)
            .filter(|reviewer| self.core.capabilities.contains(reviewer));
        let Some(reviewer) = reviewer else {
            return self.fail_step(id, "escalated with no human reviewer registered");
        };
        let Some(record) = self
            .escalations
            .iter()
            .rev()
            .find(|r| &r.context.step_id == id && r.is_pending())
            .cloned()
        else {
            return self.fail_step(id, "escalation record missing");
        };

        let core = Arc::clone(&self.core);
        let tx = self.tx.clone();
        let cancellation = self.run_token.child_token();
        let plan_id = self.plan.id.clone();
        let step_id = id.clone();
        self.pending_human += 1;
        self.tasks.spawn(async move {
            let timeout = core
                .capabilities
                .descriptor(&reviewer)
                .and_then(|d| d.timeout())
                .unwrap_or_else(|| core.config.default_capability_timeout());
            let invocation = Invocation {
                capability_id: reviewer,
                plan_id,
                step_id: step_id.clone(),
                attempt: record.context.attempt,
                input: json!({ "context": record.context, "reason": record.reason }),
                cancellation,
                timeout,
            };
            let decision = match core.capabilities.invoke(invocation).await {
                Ok(value) => serde_json::from_value::<HumanDecision>(value)
                    .map_err(|e| format!("unreadable decision: {e}")),
                Err(e) => Err(e.to_string()),
            };
            let _ = tx.send(Message::HumanDecided {
                step_id,
                record_id: record.id,
                decision,
            });
        });
        Ok(())
    }

    async fn resolve_escalation(
        &mut self,
        id: StepId,
        record_id: uuid::Uuid,
        decision: Result<HumanDecision, String>,
    ) -> EngineResult<()> {
        if self.status_of(&id)? != StepStatus::Escalated {
            return Ok(());
        }
        let decision = match decision {
            Ok(decision) => decision,
            Err(reason) => return self.fail_step(&id, &format!("human review failed: {reason}")),
        };
        if let Some(record) = self.escalations.iter_mut().find(|r| r.id == record_id) {
            record.resolve(decision.clone());
        }
        self.emit(EventKind::EscalationResolved {
            step_id: id.clone(),
            decision: decision.clone(),
        });

        match decision {
            HumanDecision::Approve { result } => {
                let template = self.template_of(&id)?;
                let entries = match publication(&template, &result) {
                    Ok(entries) => entries,
                    Err(reason) => {
                        return self.fail_step(&id, &format!("approved result unusable: {reason}"))
                    }
                };
                for (key, version) in commit(&self.board, &id, entries).await? {
                    self.emit(EventKind::BlackboardCommitted {
                        step_id: id.clone(),
                        key,
                        version,
                    });
                }
                if let Some(step) = self.plan.step_mut(&id) {
                    step.result = Some(result);
                }
                info!(plan_id = %self.plan.id, step_id = %id, "Escalated step approved");
                self.transition(&id, StepStatus::Succeeded)
            }
            HumanDecision::Reject { reason } => {
                let (template_id, attempt) = self.identity(&id)?;
                if let Some(step) = self.plan.step_mut(&id) {
                    step.record_failure(FailureRecord::new(
                        FailureKind::Fatal,
                        id.clone(),
                        template_id,
                        attempt,
                        format!("rejected by reviewer: {reason}"),
                    ));
                }
                self.fail_step(&id, &reason)
            }
            HumanDecision::Defer { note } => {
                info!(plan_id = %self.plan.id, step_id = %id, note = %note, "Escalation deferred");
                Ok(())
            }
        }
    }

    /// Mark a step failed and apply the plan's failure policy
    fn fail_step(&mut self, id: &StepId, reason: &str) -> EngineResult<()> {
        self.transition(id, StepStatus::Failed)?;
        error!(plan_id = %self.plan.id, step_id = %id, reason, "Step failed");

        match self.plan.goal.failure_policy {
            FailurePolicy::AbortOnAnyFailure => {
                self.abort_plan(&format!("step {id} failed: {reason}"))
            }
            FailurePolicy::BestEffort => {
                for blocked in self.plan.transitive_dependents(id) {
                    if self.status_of(&blocked)?.is_terminal() {
                        continue;
                    }
                    let (template_id, attempt) = self.identity(&blocked)?;
                    if let Some(step) = self.plan.step_mut(&blocked) {
                        step.record_failure(FailureRecord::new(
                            FailureKind::Fatal,
                            blocked.clone(),
                            template_id,
                            attempt,
                            format!("blocked by failed step {id}"),
                        ));
                    }
                    self.transition(&blocked, StepStatus::Aborted)?;
                }
                Ok(())
            }
        }
    }

    /// Stop scheduling, signal in-flight calls and abort every unsettled step
    fn abort_plan(&mut self, reason: &str) -> EngineResult<()> {
        if self.aborted {
            return Ok(());
        }
        self.aborted = true;
        warn!(plan_id = %self.plan.id, reason, "Aborting plan");
        self.run_token.cancel();
        self.clear_queue();
        for id in self.plan.topological_order().to_vec() {
            if !self.status_of(&id)?.is_terminal() {
                self.transition(&id, StepStatus::Aborted)?;
            }
        }
        Ok(())
    }

    // ── Helpers ──────────────────────────────────────────────────────

    fn transition(&mut self, id: &StepId, to: StepStatus) -> EngineResult<()> {
        let from = self.plan.transition(id, to)?;
        let attempt = self.plan.step(id).map_or(0, |s| s.attempts);
        debug!(plan_id = %self.plan.id, step_id = %id, %from, %to, attempt, "Step transition");
        self.emit(EventKind::StepTransition {
            step_id: id.clone(),
            from,
            to,
            attempt,
        });
        Ok(())
    }

    fn emit(&self, kind: EventKind) {
        self.core.events.emit(&self.plan.id, self.plan.depth, kind);
    }

    fn status_of(&self, id: &StepId) -> EngineResult<StepStatus> {
        self.plan
            .step(id)
            .map(|s| s.status)
            .ok_or_else(|| EngineError::UnknownStep(id.clone()))
    }

    fn identity(&self, id: &StepId) -> EngineResult<(TemplateId, u32)> {
        self.plan
            .step(id)
            .map(|s| (s.template_id.clone(), s.attempts))
            .ok_or_else(|| EngineError::UnknownStep(id.clone()))
    }

    fn template_of(&self, id: &StepId) -> EngineResult<StepTemplate> {
        self.plan
            .current_template(id)
            .cloned()
            .ok_or_else(|| EngineError::Internal(format!("step {id} has no template")))
    }

    async fn checkpoint(&self) -> EngineResult<()> {
        if self.plan.depth != 0 {
            return Ok(());
        }
        let Some(store) = &self.core.snapshots else {
            return Ok(());
        };
        let snapshot = PlanSnapshot::new(
            self.plan.clone(),
            self.board.snapshot(),
            self.escalations.clone(),
        )
        .with_side_effects(self.side_effects.iter().cloned().collect());
        store.save(&snapshot).await
    }
}

// ── Workers ──────────────────────────────────────────────────────────

enum Work {
    Direct {
        capability: Arc<dyn Capability>,
        invocation: Invocation,
    },
    SubPlan {
        spec: SubPlanSpec,
        input: Value,
    },
}

/// Executes one attempt of one step
struct Worker {
    core: Arc<EngineCore>,
    plan_id: PlanId,
    board: Arc<Blackboard>,
    budget: DelegationBudget,
    token: CancellationToken,
    tx: mpsc::UnboundedSender<Message>,
    step: Step,
    template: StepTemplate,
}

impl Worker {
    async fn run(self, work: Work) {
        let step_id = self.step.id.clone();
        let tx = self.tx.clone();
        let panicked = self.failure(FailureKind::Fatal, "worker panicked");
        let outcome = AssertUnwindSafe(self.execute(work))
            .catch_unwind()
            .await
            .unwrap_or(StepOutcome::Errored(panicked));
        let _ = tx.send(Message::Finished { step_id, outcome });
    }

    async fn execute(&self, work: Work) -> StepOutcome {
        let output = match work {
            Work::Direct {
                capability,
                invocation,
            } => match invoke_with_deadline(capability, invocation).await {
                Ok(output) => output,
                Err(e) => return StepOutcome::Errored(self.failure(e.kind(), e.to_string())),
            },
            Work::SubPlan { spec, input } => match self.delegate(spec, input).await {
                Ok(output) => output,
                Err(outcome) => return outcome,
            },
        };
        let _ = self.tx.send(Message::Executed {
            step_id: self.step.id.clone(),
        });

        let verdict = self
            .core
            .verifier
            .verify(&self.plan_id, &self.step, &self.template, &output, &self.token)
            .await;
        if !verdict.is_pass() {
            return StepOutcome::Rejected { output, verdict };
        }
        if self.token.is_cancelled() {
            return StepOutcome::Errored(
                self.failure(FailureKind::Transient, "plan cancelled before publication"),
            );
        }

        let entries = match publication(&self.template, &output) {
            Ok(entries) => entries,
            Err(reason) => {
                return StepOutcome::Rejected {
                    output,
                    verdict: Verdict::retryable(0.0, reason),
                }
            }
        };
        match commit(&self.board, &self.step.id, entries).await {
            Ok(commits) => StepOutcome::Passed {
                output,
                verdict,
                commits,
            },
            Err(e) => StepOutcome::Internal(e),
        }
    }

    /// Run a sub-plan on its own blackboard; its outputs become this step's result
    async fn delegate(&self, spec: SubPlanSpec, input: Value) -> Result<Value, StepOutcome> {
        let SubPlanSpec { plan, permit } = spec;
        let board = Arc::new(Blackboard::new(
            plan.id.clone(),
            self.core.config.conflict_policy,
        ));
        let seeds: Vec<(String, Value)> = plan
            .goal
            .inputs
            .iter()
            .map(|(key, fallback)| {
                let value = input.get(key).cloned().unwrap_or_else(|| fallback.clone());
                (key.clone(), value)
            })
            .collect();
        commit(&board, &StepId::new(GOAL_AUTHOR), seeds)
            .await
            .map_err(StepOutcome::Internal)?;

        let targets = plan.goal.targets.clone();
        let report = execute(
            Arc::clone(&self.core),
            plan,
            board,
            self.token.child_token(),
            self.budget.clone(),
            Carried::default(),
        )
        .await;
        drop(permit);
        let report = report.map_err(StepOutcome::Internal)?;
        if !report.side_effects.is_empty() {
            let _ = self.tx.send(Message::SideEffects {
                step_id: self.step.id.clone(),
            });
        }

        if report.status != PlanStatus::Completed {
            let cause = report
                .plan
                .steps()
                .find(|s| matches!(s.status, StepStatus::Failed | StepStatus::Escalated))
                .and_then(|s| s.failure.clone());
            let kind = cause.as_ref().map_or(FailureKind::Fatal, |f| f.kind);
            let detail = cause.map_or_else(
                || "no step failed".to_string(),
                |f| format!("step {} failed: {}", f.step_id, f.diagnostic),
            );
            let failure = self
                .failure(
                    kind,
                    format!("sub-plan {} ended {}: {detail}", report.plan_id, report.status),
                )
                .with_payload(serde_json::to_value(&report.summary).unwrap_or(Value::Null));
            return Err(StepOutcome::Errored(failure));
        }

        Ok(sub_plan_output(&self.template, &targets, &report.blackboard))
    }

    fn failure(&self, kind: FailureKind, diagnostic: impl Into<String>) -> FailureRecord {
        FailureRecord::new(
            kind,
            self.step.id.clone(),
            self.template.id.clone(),
            self.step.attempts,
            diagnostic,
        )
    }
}

/// Blackboard writes for a step result.
///
/// A single produced key receives the whole result; several keys need an
/// object result with a field per key.
fn publication(template: &StepTemplate, output: &Value) -> Result<Vec<(String, Value)>, String> {
    match template.produces.as_slice() {
        [single] => Ok(vec![(single.clone(), output.clone())]),
        keys => keys
            .iter()
            .map(|key| {
                output
                    .get(key.as_str())
                    .cloned()
                    .map(|value| (key.clone(), value))
                    .ok_or_else(|| format!("output lacks produced key '{key}'"))
            })
            .collect(),
    }
}

async fn commit(
    board: &Blackboard,
    author: &StepId,
    entries: Vec<(String, Value)>,
) -> EngineResult<Vec<(String, u64)>> {
    let mut commits = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        let version = board.write(&key, value, author).await?;
        commits.push((key, version));
    }
    Ok(commits)
}

/// Collect a finished sub-plan's targets into the delegating step's result
fn sub_plan_output(template: &StepTemplate, targets: &[String], board: &BlackboardSnapshot) -> Value {
    let latest = board.latest();
    let mut collected = Map::new();
    for key in targets.iter().chain(template.produces.iter()) {
        if let Some(entry) = latest.get(key.as_str()) {
            collected.insert(key.clone(), entry.value.clone());
        }
    }
    let single = match (template.produces.as_slice(), targets) {
        ([produced], _) if collected.contains_key(produced) => collected.get(produced).cloned(),
        ([_], [only]) => collected.get(only).cloned(),
        _ => None,
    };
    single.unwrap_or(Value::Object(collected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blackboard::ConflictPolicy;

    #[test]
    fn test_queue_orders_by_priority_then_arrival() {
        let mut queue = BinaryHeap::new();
        for (sequence, (id, priority)) in [
            ("low", Priority::Low),
            ("first-medium", Priority::Medium),
            ("urgent", Priority::Urgent),
            ("second-medium", Priority::Medium),
        ]
        .into_iter()
        .enumerate()
        {
            queue.push(Queued {
                priority,
                sequence: sequence as u64,
                step_id: StepId::new(id),
            });
        }
        let order: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|q| q.step_id.0)
            .collect();
        assert_eq!(order, vec!["urgent", "first-medium", "second-medium", "low"]);
    }

    #[test]
    fn test_publication_single_and_multi_key() {
        let single = StepTemplate::capability("fetch", "http.get").produces("document");
        let entries = publication(&single, &json!("body")).unwrap();
        assert_eq!(entries, vec![("document".to_string(), json!("body"))]);

        let multi = StepTemplate::capability("split", "x")
            .produces("head")
            .produces("tail");
        let entries = publication(&multi, &json!({"head": 1, "tail": 2, "extra": 3})).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(publication(&multi, &json!({"head": 1})).is_err());
    }

    #[tokio::test]
    async fn test_sub_plan_output_prefers_produced_key() {
        let board = Blackboard::new(PlanId::new("sub"), ConflictPolicy::default());
        let author = StepId::new("draft");
        board.write("draft", json!("text"), &author).await.unwrap();
        let snapshot = board.snapshot();

        let renamed = StepTemplate::composite("report", Goal::new("g").with_target("draft"))
            .produces("draft_report");
        assert_eq!(
            sub_plan_output(&renamed, &["draft".to_string()], &snapshot),
            json!("text")
        );

        let multi = StepTemplate::composite("bundle", Goal::new("g").with_target("draft"))
            .produces("draft")
            .produces("notes");
        assert_eq!(
            sub_plan_output(&multi, &["draft".to_string()], &snapshot),
            json!({"draft": "text"})
        );
    }

    #[tokio::test]
    async fn test_seed_skips_existing_keys() {
        let board = Blackboard::new(PlanId::new("p"), ConflictPolicy::default());
        let mut inputs = BTreeMap::new();
        inputs.insert("url".to_string(), json!("https://example.com"));
        seed(&board, &inputs).await.unwrap();
        seed(&board, &inputs).await.unwrap();
        assert_eq!(board.latest_version("url"), Some(1));
        assert_eq!(board.entry("url", None).unwrap().author, StepId::new(GOAL_AUTHOR));
    }
}
