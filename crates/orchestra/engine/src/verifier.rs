//! Verifier: judges a step's output against its template's criteria.
//!
//! Before any declared criterion runs, the output must be publishable: a
//! template producing several keys must return an object holding each of
//! them. Criteria are evaluated in declaration order; a fatal verdict stops
//! evaluation immediately.

use crate::capability::{CapabilityRegistry, Invocation};
use orchestra_types::{
    CapabilityId, PlanId, Step, StepTemplate, Verdict, VerificationCriteria,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Evaluates step outputs
#[derive(Clone, Debug)]
pub struct Verifier {
    capabilities: Arc<CapabilityRegistry>,
    checker_timeout: Duration,
}

impl Verifier {
    pub fn new(capabilities: Arc<CapabilityRegistry>, checker_timeout: Duration) -> Self {
        Self {
            capabilities,
            checker_timeout,
        }
    }

    /// Produce a verdict for one attempt's output
    pub async fn verify(
        &self,
        plan_id: &PlanId,
        step: &Step,
        template: &StepTemplate,
        output: &Value,
        cancellation: &CancellationToken,
    ) -> Verdict {
        let mut verdict = publishable(template, output);
        if !verdict.is_pass() {
            return verdict;
        }

        for criterion in flatten(&template.verification) {
            let next = match criterion {
                VerificationCriteria::Accept => Verdict::pass(1.0, "accepted"),
                VerificationCriteria::ExpectedShape {
                    required_fields,
                    non_empty,
                } => expected_shape(output, required_fields, *non_empty),
                VerificationCriteria::ScoreThreshold {
                    field,
                    min_score,
                    fatal_below,
                } => score_threshold(output, field, *min_score, *fatal_below),
                VerificationCriteria::Checker {
                    capability_id,
                    min_score,
                } => {
                    self.checker(plan_id, step, capability_id, *min_score, output, cancellation)
                        .await
                }
                VerificationCriteria::All { .. } => continue,
            };
            verdict = verdict.and(next);
            if verdict.outcome == orchestra_types::VerdictOutcome::FailFatal {
                break;
            }
        }

        tracing::debug!(
            plan_id = %plan_id,
            step_id = %step.id,
            outcome = ?verdict.outcome,
            score = verdict.score,
            "Verdict issued"
        );
        verdict
    }

    /// Ask a secondary capability to judge the output.
    ///
    /// The checker receives `{step, template, output}` and answers with an
    /// object carrying `score` and optionally `verdict` (`pass`, `fail` or
    /// `fatal`) and `rationale`.
    async fn checker(
        &self,
        plan_id: &PlanId,
        step: &Step,
        capability_id: &CapabilityId,
        min_score: f64,
        output: &Value,
        cancellation: &CancellationToken,
    ) -> Verdict {
        let invocation = Invocation {
            capability_id: capability_id.clone(),
            plan_id: plan_id.clone(),
            step_id: step.id.clone(),
            attempt: step.attempts,
            input: json!({
                "step": step.id,
                "template": step.template_id,
                "output": output,
            }),
            cancellation: cancellation.child_token(),
            timeout: self.checker_timeout,
        };
        let response = match self.capabilities.invoke(invocation).await {
            Ok(response) => response,
            Err(e) => {
                return Verdict::unavailable(e.kind(), format!("checker {capability_id} failed: {e}"))
            }
        };

        let label = response.get("verdict").and_then(Value::as_str);
        let rationale = response
            .get("rationale")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let score = response
            .get("score")
            .and_then(Value::as_f64)
            .unwrap_or(match label {
                Some("pass") => 1.0,
                _ => 0.0,
            });

        match label {
            Some("fatal") => Verdict::fatal(score, non_empty_or(rationale, "checker rejected output")),
            Some("fail") => Verdict::retryable(score, non_empty_or(rationale, "checker failed output")),
            _ if score < min_score => Verdict::retryable(
                score,
                format!("checker score {score:.2} below {min_score:.2}"),
            ),
            _ => Verdict::pass(score, non_empty_or(rationale, "checker passed output")),
        }
    }
}

fn non_empty_or(text: String, fallback: &str) -> String {
    if text.is_empty() {
        fallback.to_string()
    } else {
        text
    }
}

/// Leaf criteria in declaration order
fn flatten(criteria: &VerificationCriteria) -> Vec<&VerificationCriteria> {
    let mut leaves = Vec::new();
    let mut stack = vec![criteria];
    while let Some(next) = stack.pop() {
        match next {
            VerificationCriteria::All { criteria } => stack.extend(criteria.iter().rev()),
            leaf => leaves.push(leaf),
        }
    }
    leaves
}

/// Multi-key templates must return an object with every produced key
fn publishable(template: &StepTemplate, output: &Value) -> Verdict {
    if template.produces.len() <= 1 {
        return Verdict::pass(1.0, "output publishable");
    }
    let missing: Vec<&str> = template
        .produces
        .iter()
        .filter(|k| output.get(k.as_str()).is_none())
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        Verdict::pass(1.0, "output publishable")
    } else {
        Verdict::retryable(0.0, format!("output lacks produced keys: {}", missing.join(", ")))
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn expected_shape(output: &Value, required: &[String], non_empty: bool) -> Verdict {
    let Some(object) = output.as_object() else {
        return Verdict::retryable(0.0, "output is not an object");
    };
    let missing: Vec<&str> = required
        .iter()
        .filter(|field| match object.get(field.as_str()) {
            None => true,
            Some(value) => non_empty && is_empty_value(value),
        })
        .map(String::as_str)
        .collect();
    if missing.is_empty() {
        return Verdict::pass(1.0, "shape matches");
    }
    let present = required.len() - missing.len();
    let score = if required.is_empty() {
        0.0
    } else {
        present as f64 / required.len() as f64
    };
    Verdict::retryable(score, format!("missing or empty fields: {}", missing.join(", ")))
}

/// `field` is a top-level key, or a JSON pointer when it starts with `/`
fn score_threshold(output: &Value, field: &str, min_score: f64, fatal_below: Option<f64>) -> Verdict {
    let value = if field.starts_with('/') {
        output.pointer(field)
    } else {
        output.get(field)
    };
    let Some(score) = value.and_then(Value::as_f64) else {
        return Verdict::retryable(0.0, format!("no numeric '{field}' in output"));
    };
    if fatal_below.is_some_and(|floor| score < floor) {
        return Verdict::fatal(score, format!("{field} {score:.2} below fatal floor"));
    }
    if score < min_score {
        return Verdict::retryable(score, format!("{field} {score:.2} below {min_score:.2}"));
    }
    Verdict::pass(score, format!("{field} {score:.2} meets {min_score:.2}"))
}
