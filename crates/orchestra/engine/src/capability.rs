//! Execution interface: capabilities and their registry
//!
//! A capability is anything the engine can invoke for a step: a model call,
//! a tool, a human prompt. The engine only sees the [`Capability`] contract,
//! the declared [`CapabilityDescriptor`], and the error classification it
//! returns. Every call carries a cancellation token and a deadline.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use orchestra_types::{CapabilityId, FailureKind, PlanId, StepId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Registration data for a capability
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub id: CapabilityId,
    /// Safe to call again after a failure without duplicating side effects
    pub retry_safe: bool,
    /// Per-call deadline; the engine default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Relative price; lower is cheaper
    #[serde(default = "default_cost")]
    pub cost: u32,
}

fn default_cost() -> u32 {
    1
}

impl CapabilityDescriptor {
    /// Descriptor for an idempotent capability
    pub fn retry_safe(id: impl Into<String>) -> Self {
        Self {
            id: CapabilityId::new(id),
            retry_safe: true,
            timeout_ms: None,
            cost: default_cost(),
        }
    }

    /// Descriptor for a capability with side effects that must not be repeated blindly
    pub fn side_effecting(id: impl Into<String>) -> Self {
        Self {
            retry_safe: false,
            ..Self::retry_safe(id)
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// One call to a capability
#[derive(Clone, Debug)]
pub struct Invocation {
    pub capability_id: CapabilityId,
    pub plan_id: PlanId,
    pub step_id: StepId,
    pub attempt: u32,
    pub input: Value,
    /// Cancelled when the plan is aborted; long-running capabilities should watch it
    pub cancellation: CancellationToken,
    pub timeout: Duration,
}

/// Failure reported by a capability call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("invalid output: {0}")]
    Validation(String),

    #[error("resource unavailable: {0}")]
    Resource(String),

    #[error("fatal failure: {0}")]
    Fatal(String),

    #[error("call cancelled")]
    Cancelled,

    #[error("call timed out after {0:?}")]
    Timeout(Duration),
}

impl CapabilityError {
    /// Recovery class of the failure
    pub fn kind(&self) -> FailureKind {
        match self {
            CapabilityError::Transient(_)
            | CapabilityError::Timeout(_)
            | CapabilityError::Cancelled => FailureKind::Transient,
            CapabilityError::Validation(_) => FailureKind::Validation,
            CapabilityError::Resource(_) => FailureKind::Resource,
            CapabilityError::Fatal(_) => FailureKind::Fatal,
        }
    }
}

pub type CapabilityResult = Result<Value, CapabilityError>;

/// An executable action the engine can dispatch a step to
#[async_trait]
pub trait Capability: Send + Sync {
    /// Registration data: id, retry safety, timeout, cost
    fn descriptor(&self) -> CapabilityDescriptor;

    /// Run the capability.
    ///
    /// # Arguments
    ///
    /// * `invocation` - Step identity, JSON input, cancellation token and deadline
    async fn invoke(&self, invocation: Invocation) -> CapabilityResult;
}

type Handler = dyn Fn(Invocation) -> BoxFuture<'static, CapabilityResult> + Send + Sync;

/// Capability backed by an async closure
pub struct FnCapability {
    descriptor: CapabilityDescriptor,
    handler: Arc<Handler>,
}

impl FnCapability {
    pub fn new<F, Fut>(descriptor: CapabilityDescriptor, handler: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CapabilityResult> + Send + 'static,
    {
        Self {
            descriptor,
            handler: Arc::new(
                move |invocation: Invocation| -> BoxFuture<'static, CapabilityResult> {
                    Box::pin(handler(invocation))
                },
            ),
        }
    }
}

#[async_trait]
impl Capability for FnCapability {
    fn descriptor(&self) -> CapabilityDescriptor {
        self.descriptor.clone()
    }

    async fn invoke(&self, invocation: Invocation) -> CapabilityResult {
        (self.handler)(invocation).await
    }
}

impl std::fmt::Debug for FnCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnCapability")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

/// Capabilities known to an engine, keyed by id
#[derive(Default)]
pub struct CapabilityRegistry {
    entries: DashMap<CapabilityId, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability under its descriptor id, replacing any previous one
    pub fn register(&self, capability: Arc<dyn Capability>) -> CapabilityId {
        let id = capability.descriptor().id;
        if self.entries.insert(id.clone(), capability).is_some() {
            tracing::warn!(capability_id = %id, "Capability re-registered");
        } else {
            tracing::debug!(capability_id = %id, "Capability registered");
        }
        id
    }

    pub fn get(&self, id: &CapabilityId) -> Option<Arc<dyn Capability>> {
        self.entries.get(id).map(|e| Arc::clone(e.value()))
    }

    pub fn descriptor(&self, id: &CapabilityId) -> Option<CapabilityDescriptor> {
        self.entries.get(id).map(|e| e.value().descriptor())
    }

    pub fn contains(&self, id: &CapabilityId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn ids(&self) -> Vec<CapabilityId> {
        let mut ids: Vec<CapabilityId> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Invoke a registered capability under a deadline and cancellation token.
    ///
    /// An unregistered id is a resource failure: the capability is unavailable.
    pub async fn invoke(&self, invocation: Invocation) -> CapabilityResult {
        let Some(capability) = self.get(&invocation.capability_id) else {
            return Err(CapabilityError::Resource(format!(
                "capability {} is not registered",
                invocation.capability_id
            )));
        };
        invoke_with_deadline(capability, invocation).await
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("capabilities", &self.ids())
            .finish()
    }
}

/// Race a call against its deadline and its cancellation token
pub async fn invoke_with_deadline(
    capability: Arc<dyn Capability>,
    invocation: Invocation,
) -> CapabilityResult {
    let cancellation = invocation.cancellation.clone();
    let timeout = invocation.timeout;
    if cancellation.is_cancelled() {
        return Err(CapabilityError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancellation.cancelled() => Err(CapabilityError::Cancelled),
        result = tokio::time::timeout(timeout, capability.invoke(invocation)) => {
            result.unwrap_or(Err(CapabilityError::Timeout(timeout)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invocation(capability: &str, timeout: Duration) -> Invocation {
        Invocation {
            capability_id: CapabilityId::new(capability),
            plan_id: PlanId::new("plan"),
            step_id: StepId::new("step"),
            attempt: 1,
            input: json!({"text": "hello"}),
            cancellation: CancellationToken::new(),
            timeout,
        }
    }

    fn echo() -> Arc<dyn Capability> {
        Arc::new(FnCapability::new(
            CapabilityDescriptor::retry_safe("echo"),
            |inv: Invocation| async move { Ok(inv.input) },
        ))
    }

    fn sleeper() -> Arc<dyn Capability> {
        Arc::new(FnCapability::new(
            CapabilityDescriptor::side_effecting("sleep"),
            |_inv: Invocation| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!(null))
            },
        ))
    }

    #[tokio::test]
    async fn test_invoke_registered() {
        let registry = CapabilityRegistry::new();
        registry.register(echo());
        let output = registry
            .invoke(invocation("echo", Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(output, json!({"text": "hello"}));
    }

    #[tokio::test]
    async fn test_unregistered_is_resource_failure() {
        let registry = CapabilityRegistry::new();
        let err = registry
            .invoke(invocation("missing", Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::Resource);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let registry = CapabilityRegistry::new();
        registry.register(sleeper());
        let err = registry
            .invoke(invocation("sleep", Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::Timeout(_)));
        assert_eq!(err.kind(), FailureKind::Transient);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_call() {
        let registry = CapabilityRegistry::new();
        registry.register(sleeper());
        let inv = invocation("sleep", Duration::from_secs(30));
        let token = inv.cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let err = registry.invoke(inv).await.unwrap_err();
        assert_eq!(err, CapabilityError::Cancelled);
    }

    #[test]
    fn test_descriptor_builders() {
        let d = CapabilityDescriptor::side_effecting("cms.publish")
            .with_timeout(Duration::from_secs(5))
            .with_cost(3);
        assert!(!d.retry_safe);
        assert_eq!(d.timeout(), Some(Duration::from_secs(5)));
        assert_eq!(d.cost, 3);
    }

    #[test]
    fn test_ids_are_sorted() {
        let registry = CapabilityRegistry::new();
        for id in ["b", "a"] {
            registry.register(Arc::new(FnCapability::new(
                CapabilityDescriptor::retry_safe(id),
                |_inv: Invocation| async move { Ok(Value::Null) },
            )));
        }
        assert_eq!(
            registry.ids(),
            vec![CapabilityId::new("a"), CapabilityId::new("b")]
        );
        assert!(registry.contains(&CapabilityId::new("a")));
    }
}
