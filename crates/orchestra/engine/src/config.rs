//! Configuration for the workflow engine

use crate::blackboard::ConflictPolicy;
use crate::recovery::RecoveryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Parallel workers per plan
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Deepest sub-plan nesting below the root
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Live sub-plans allowed per root plan
    #[serde(default = "default_max_live_subplans")]
    pub max_live_subplans: usize,

    /// Ready-queue depth above which no new sub-plans are spawned
    #[serde(default = "default_high_watermark")]
    pub ready_queue_high_watermark: usize,

    /// How long an aborted plan waits for in-flight calls
    #[serde(default = "default_grace_ms")]
    pub cancellation_grace_ms: u64,

    /// Deadline for capabilities that declare none
    #[serde(default = "default_capability_timeout_ms")]
    pub default_capability_timeout_ms: u64,

    /// Blackboard write conflict handling
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,

    /// Capability that receives escalations; without one, escalated steps fail
    #[serde(default)]
    pub escalation_capability: Option<String>,

    /// Backoff tuning
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_depth: default_max_depth(),
            max_live_subplans: default_max_live_subplans(),
            ready_queue_high_watermark: default_high_watermark(),
            cancellation_grace_ms: default_grace_ms(),
            default_capability_timeout_ms: default_capability_timeout_ms(),
            conflict_policy: ConflictPolicy::default(),
            escalation_capability: None,
            recovery: RecoveryConfig::default(),
        }
    }
}

// Default value helpers
fn default_max_workers() -> usize {
    4
}

fn default_max_depth() -> u32 {
    3
}

fn default_max_live_subplans() -> usize {
    8
}

fn default_high_watermark() -> usize {
    64
}

fn default_grace_ms() -> u64 {
    500
}

fn default_capability_timeout_ms() -> u64 {
    30_000
}

impl EngineConfig {
    /// Load configuration: defaults, then the optional file, then
    /// `ORCHESTRA_*` environment variables (`__` separates nested keys,
    /// e.g. `ORCHESTRA_RECOVERY__SEED`).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&EngineConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("ORCHESTRA")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<(), String> {
        if self.max_workers == 0 {
            return Err("max_workers must be at least 1".into());
        }
        if !(0.0..1.0).contains(&self.recovery.jitter_fraction) {
            return Err(format!(
                "recovery.jitter_fraction must be in [0, 1), got {}",
                self.recovery.jitter_fraction
            ));
        }
        if self.escalation_capability.as_deref() == Some("") {
            return Err("escalation_capability must not be empty".into());
        }
        Ok(())
    }

    pub fn cancellation_grace(&self) -> Duration {
        Duration::from_millis(self.cancellation_grace_ms)
    }

    pub fn default_capability_timeout(&self) -> Duration {
        Duration::from_millis(self.default_capability_timeout_ms)
    }

    /// Development settings: fast, reproducible backoff
    pub fn development() -> Self {
        Self {
            recovery: RecoveryConfig {
                jitter_fraction: 0.0,
                seed: Some(0),
            },
            cancellation_grace_ms: 100,
            ..Default::default()
        }
    }
}
