//! Recovery Controller: turns a failure record into the next action.
//!
//! | Failure    | First choice                                     | When exhausted |
//! |------------|--------------------------------------------------|----------------|
//! | transient  | retry after exponential backoff with jitter      | escalate       |
//! | validation | re-plan onto an alternative template             | escalate       |
//! | resource   | cheaper alternative, else retry with longer base | escalate       |
//! | fatal      | abort (strict policy) or escalate (best effort)  | never retried  |
//!
//! A capability that is not retry-safe is never re-invoked automatically:
//! the step is escalated so the possible side effect is surfaced.

use crate::compiler::Alternative;
use orchestra_types::{FailureKind, FailurePolicy, FailureRecord, RecoveryDecision, RetryPolicy};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

/// Recovery tuning shared by every step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Upper bound of the random extra delay, as a fraction of the backoff
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,

    /// Fixed RNG seed for reproducible delays
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_jitter_fraction() -> f64 {
    0.2
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            jitter_fraction: default_jitter_fraction(),
            seed: None,
        }
    }
}

/// Everything about the failing step the controller needs besides the failure itself
#[derive(Debug, Clone, Copy)]
pub struct RecoveryContext<'a> {
    pub policy: &'a RetryPolicy,
    pub failure_policy: FailurePolicy,
    /// Whether the bound capability may be invoked again safely
    pub retry_safe: bool,
    /// Attempts made so far, including the one that failed
    pub attempts: u32,
    pub replans: u32,
    /// Cost of the capability currently bound to the step
    pub current_cost: Option<u32>,
    /// Untried substitute templates, see [`PlanCompiler::alternatives`](crate::PlanCompiler::alternatives)
    pub alternatives: &'a [Alternative],
}

/// Decides retry, reassign, escalate or abort for failed attempts
#[derive(Debug)]
pub struct RecoveryController {
    jitter_fraction: f64,
    rng: Mutex<StdRng>,
}

impl RecoveryController {
    pub fn new(config: &RecoveryConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            jitter_fraction: config.jitter_fraction.clamp(0.0, 1.0),
            rng: Mutex::new(rng),
        }
    }

    pub fn decide(&self, failure: &FailureRecord, ctx: &RecoveryContext<'_>) -> RecoveryDecision {
        let decision = self.decide_inner(failure, ctx);
        tracing::debug!(
            step_id = %failure.step_id,
            attempt = failure.attempt,
            kind = %failure.kind,
            decision = ?decision,
            "Recovery decided"
        );
        decision
    }

    fn decide_inner(&self, failure: &FailureRecord, ctx: &RecoveryContext<'_>) -> RecoveryDecision {
        if failure.kind == FailureKind::Fatal {
            let reason = format!("fatal failure: {}", failure.diagnostic);
            return match ctx.failure_policy {
                FailurePolicy::AbortOnAnyFailure => RecoveryDecision::abort(reason),
                FailurePolicy::BestEffort => RecoveryDecision::escalate(reason),
            };
        }

        if ctx.attempts >= ctx.policy.max_attempts {
            return RecoveryDecision::escalate(format!(
                "{} attempts exhausted; last failure: {}",
                ctx.attempts, failure.diagnostic
            ));
        }
        let replans_left = ctx.replans < ctx.policy.max_replans;

        match failure.kind {
            FailureKind::Validation => match ctx.alternatives.first() {
                Some(alternative) if replans_left => {
                    RecoveryDecision::reassign(alternative.template_id.clone(), Duration::ZERO)
                }
                _ => RecoveryDecision::escalate(format!(
                    "output rejected and no re-plan left: {}",
                    failure.diagnostic
                )),
            },
            FailureKind::Resource => {
                let cheaper = ctx
                    .alternatives
                    .iter()
                    .filter_map(|alt| alt.cost.map(|cost| (cost, alt)))
                    .filter(|(cost, _)| ctx.current_cost.map_or(true, |current| *cost < current))
                    .min_by_key(|(cost, _)| *cost)
                    .map(|(_, alt)| alt);
                let delay = self.backoff(ctx.policy, ctx.attempts, failure.kind);
                match cheaper {
                    Some(alternative) if replans_left => {
                        RecoveryDecision::reassign(alternative.template_id.clone(), delay)
                    }
                    _ if ctx.retry_safe => RecoveryDecision::retry_after(delay),
                    _ => RecoveryDecision::escalate(format!(
                        "resource unavailable for a capability that is not retry-safe: {}",
                        failure.diagnostic
                    )),
                }
            }
            _ if !ctx.retry_safe => RecoveryDecision::escalate(format!(
                "capability is not retry-safe; a prior attempt may have had side effects: {}",
                failure.diagnostic
            )),
            _ => RecoveryDecision::retry_after(self.backoff(ctx.policy, ctx.attempts, failure.kind)),
        }
    }

    /// Delay before attempt `attempt + 1`.
    ///
    /// `base * 2^(attempt - 1)`, with the base multiplied for resource
    /// failures, plus jitter of at most `jitter_fraction` of that, capped at
    /// the policy maximum.
    pub fn backoff(&self, policy: &RetryPolicy, attempt: u32, kind: FailureKind) -> Duration {
        let base = match kind {
            FailureKind::Resource => policy
                .base_backoff_ms
                .saturating_mul(u64::from(policy.resource_backoff_factor.max(1))),
            _ => policy.base_backoff_ms,
        };
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = base
            .saturating_mul(1u64 << exponent)
            .min(policy.max_backoff_ms);

        let jitter_cap = (delay as f64 * self.jitter_fraction) as u64;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            rng.gen_range(0..=jitter_cap)
        };
        Duration::from_millis(delay.saturating_add(jitter).min(policy.max_backoff_ms))
    }
}

impl Default for RecoveryController {
    fn default() -> Self {
        Self::new(&RecoveryConfig::default())
    }
}
