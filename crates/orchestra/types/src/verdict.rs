//! Verifier output.

use crate::FailureKind;
use serde::{Deserialize, Serialize};

/// Judgement on a step result
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictOutcome {
    Pass,
    FailRetryable,
    FailFatal,
}

/// Verdict issued for one attempt of a step
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub outcome: VerdictOutcome,
    /// Score in `[0, 1]` where the criterion produced one; `1.0` for a plain pass
    pub score: f64,
    /// Why the verdict was reached; feeds the re-plan path on failure
    pub rationale: String,
    /// Set when verification itself could not run, e.g. a checker outage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureKind>,
}

impl Verdict {
    pub fn pass(score: f64, rationale: impl Into<String>) -> Self {
        Self {
            outcome: VerdictOutcome::Pass,
            score,
            rationale: rationale.into(),
            cause: None,
        }
    }

    pub fn retryable(score: f64, rationale: impl Into<String>) -> Self {
        Self {
            outcome: VerdictOutcome::FailRetryable,
            score,
            rationale: rationale.into(),
            cause: None,
        }
    }

    pub fn fatal(score: f64, rationale: impl Into<String>) -> Self {
        Self {
            outcome: VerdictOutcome::FailFatal,
            score,
            rationale: rationale.into(),
            cause: None,
        }
    }

    /// Verification could not be carried out; the failure keeps `kind`
    /// so a transient outage is retried rather than treated as a bad output
    pub fn unavailable(kind: FailureKind, rationale: impl Into<String>) -> Self {
        let outcome = match kind {
            FailureKind::Fatal => VerdictOutcome::FailFatal,
            _ => VerdictOutcome::FailRetryable,
        };
        Self {
            outcome,
            score: 0.0,
            rationale: rationale.into(),
            cause: Some(kind),
        }
    }

    pub fn is_pass(&self) -> bool {
        self.outcome == VerdictOutcome::Pass
    }

    /// Failure kind the recovery controller should see, if the verdict failed
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self.outcome {
            VerdictOutcome::Pass => None,
            VerdictOutcome::FailRetryable => Some(self.cause.unwrap_or(FailureKind::Validation)),
            VerdictOutcome::FailFatal => Some(FailureKind::Fatal),
        }
    }

    /// Combine two verdicts, keeping the worse outcome and the lower score
    pub fn and(self, other: Verdict) -> Verdict {
        let rank = |o: VerdictOutcome| match o {
            VerdictOutcome::Pass => 0,
            VerdictOutcome::FailRetryable => 1,
            VerdictOutcome::FailFatal => 2,
        };
        let score = self.score.min(other.score);
        let (worse, better) = if rank(other.outcome) > rank(self.outcome) {
            (other, self)
        } else {
            (self, other)
        };
        let cause = worse.cause;
        let rationale = if worse.is_pass() {
            if better.rationale.is_empty() {
                worse.rationale
            } else {
                format!("{}; {}", worse.rationale, better.rationale)
            }
        } else {
            worse.rationale
        };
        Verdict {
            outcome: worse.outcome,
            score,
            rationale,
            cause,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_mapping() {
        assert_eq!(Verdict::pass(1.0, "ok").failure_kind(), None);
        assert_eq!(
            Verdict::retryable(0.2, "missing field").failure_kind(),
            Some(FailureKind::Validation)
        );
        assert_eq!(
            Verdict::fatal(0.0, "garbage").failure_kind(),
            Some(FailureKind::Fatal)
        );
    }

    #[test]
    fn test_unavailable_keeps_cause() {
        let outage = Verdict::unavailable(FailureKind::Transient, "checker timed out");
        assert_eq!(outage.outcome, VerdictOutcome::FailRetryable);
        assert_eq!(outage.failure_kind(), Some(FailureKind::Transient));

        let combined = Verdict::pass(1.0, "shape ok").and(outage);
        assert_eq!(combined.failure_kind(), Some(FailureKind::Transient));

        let fatal = Verdict::unavailable(FailureKind::Fatal, "checker misconfigured");
        assert_eq!(fatal.outcome, VerdictOutcome::FailFatal);
    }

    #[test]
    fn test_and_keeps_worst_outcome() {
        let combined = Verdict::pass(0.9, "shape ok").and(Verdict::retryable(0.4, "low score"));
        assert_eq!(combined.outcome, VerdictOutcome::FailRetryable);
        assert_eq!(combined.rationale, "low score");
        assert!((combined.score - 0.4).abs() < f64::EPSILON);

        let fatal = Verdict::retryable(0.4, "a").and(Verdict::fatal(0.1, "b"));
        assert_eq!(fatal.outcome, VerdictOutcome::FailFatal);
    }

    #[test]
    fn test_and_of_passes_joins_rationale() {
        let combined = Verdict::pass(1.0, "shape ok").and(Verdict::pass(0.8, "score ok"));
        assert!(combined.is_pass());
        assert_eq!(combined.rationale, "shape ok; score ok");
    }
}
