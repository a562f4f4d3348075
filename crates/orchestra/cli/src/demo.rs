//! Scripted capabilities declared alongside the step templates.
//!
//! A catalog file carries both the templates the compiler draws from and a
//! list of demo capabilities whose behavior is fixed in the file, so whole
//! plans can be exercised without any real backend:
//!
//! ```json
//! {
//!   "templates": [{"id": "fetch", "kind": {"type": "capability", "capability_id": "http.get"},
//!                  "consumes": ["url"], "produces": ["document"]}],
//!   "capabilities": [{"id": "http.get", "retry_safe": true, "latency_ms": 50,
//!                     "behavior": {"kind": "flaky", "failures": 1, "value": "<html/>"}}]
//! }
//! ```

use anyhow::Context;
use orchestra_engine::{CapabilityDescriptor, CapabilityError, FnCapability, Invocation, TemplateCatalog};
use orchestra_types::{FailureKind, Goal, StepTemplate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Contents of a catalog file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoCatalog {
    pub templates: Vec<StepTemplate>,
    #[serde(default)]
    pub capabilities: Vec<DemoCapability>,
}

/// A capability whose answers are scripted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoCapability {
    #[serde(flatten)]
    pub descriptor: CapabilityDescriptor,
    /// Simulated call latency
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub behavior: Behavior,
}

/// What a demo capability does when invoked
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Behavior {
    /// Return the invocation input unchanged
    #[default]
    Echo,
    /// Always return `value`
    Constant { value: Value },
    /// Fail transiently for the first `failures` calls, then return `value`
    Flaky { failures: usize, value: Value },
    /// Always fail with the given classification
    Fail { error: FailureKind, message: String },
}

impl DemoCatalog {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading catalog {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing catalog {}", path.display()))
    }

    /// Split into a validated template catalog and the capabilities to register
    pub fn into_parts(self) -> anyhow::Result<(TemplateCatalog, Vec<Arc<FnCapability>>)> {
        let mut catalog = TemplateCatalog::new();
        for template in self.templates {
            let id = template.id.clone();
            catalog
                .register(template)
                .with_context(|| format!("registering template {id}"))?;
        }
        let capabilities = self.capabilities.into_iter().map(DemoCapability::build).collect();
        Ok((catalog, capabilities))
    }
}

impl DemoCapability {
    pub fn build(self) -> Arc<FnCapability> {
        let latency = Duration::from_millis(self.latency_ms);
        let behavior = Arc::new(self.behavior);
        let calls = Arc::new(AtomicUsize::new(0));
        Arc::new(FnCapability::new(self.descriptor, move |inv: Invocation| {
            let behavior = Arc::clone(&behavior);
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if !latency.is_zero() {
                    tokio::select! {
                        _ = inv.cancellation.cancelled() => return Err(CapabilityError::Cancelled),
                        _ = tokio::time::sleep(latency) => {}
                    }
                }
                behavior.answer(call, inv.input)
            }
        }))
    }
}

impl Behavior {
    /// Result of the `call`-th invocation (0-based)
    fn answer(&self, call: usize, input: Value) -> Result<Value, CapabilityError> {
        match self {
            Behavior::Echo => Ok(input),
            Behavior::Constant { value } => Ok(value.clone()),
            Behavior::Flaky { failures, value } => {
                if call < *failures {
                    Err(CapabilityError::Transient(format!(
                        "scripted failure {} of {failures}",
                        call + 1
                    )))
                } else {
                    Ok(value.clone())
                }
            }
            Behavior::Fail { error, message } => Err(match error {
                FailureKind::Transient => CapabilityError::Transient(message.clone()),
                FailureKind::Validation => CapabilityError::Validation(message.clone()),
                FailureKind::Resource => CapabilityError::Resource(message.clone()),
                FailureKind::Fatal => CapabilityError::Fatal(message.clone()),
            }),
        }
    }
}

pub fn load_goal(path: &Path) -> anyhow::Result<Goal> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading goal {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing goal {}", path.display()))
}
