//! Recovery decisions issued for failed step attempts.

use crate::TemplateId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do with a failed attempt
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryDecision {
    /// Re-attempt the same template after the delay
    RetryAfter { delay_ms: u64 },
    /// Re-attempt with a substitute template after the delay
    Reassign {
        template_id: TemplateId,
        delay_ms: u64,
    },
    /// Hand the step to a human
    Escalate { reason: String },
    /// Give up on the step
    Abort { reason: String },
}

impl RecoveryDecision {
    pub fn retry_after(delay: Duration) -> Self {
        RecoveryDecision::RetryAfter {
            delay_ms: duration_ms(delay),
        }
    }

    pub fn reassign(template_id: TemplateId, delay: Duration) -> Self {
        RecoveryDecision::Reassign {
            template_id,
            delay_ms: duration_ms(delay),
        }
    }

    pub fn escalate(reason: impl Into<String>) -> Self {
        RecoveryDecision::Escalate {
            reason: reason.into(),
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        RecoveryDecision::Abort {
            reason: reason.into(),
        }
    }

    /// Delay before the next attempt, for decisions that re-attempt
    pub fn delay(&self) -> Option<Duration> {
        match self {
            RecoveryDecision::RetryAfter { delay_ms }
            | RecoveryDecision::Reassign { delay_ms, .. } => Some(Duration::from_millis(*delay_ms)),
            _ => None,
        }
    }

    pub fn is_reattempt(&self) -> bool {
        self.delay().is_some()
    }
}

fn duration_ms(delay: Duration) -> u64 {
    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)
}
