//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use orchestra_engine::{
    CapabilityDescriptor, CapabilityError, EngineConfig, FnCapability, Invocation,
    TemplateCatalog, WorkflowEngine,
};
use orchestra_types::{
    EventKind, FailureKind, LifecycleEvent, RecoveryDecision, RetryPolicy, StepId, StepStatus,
    StepTemplate,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Short backoff so retry paths finish quickly
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::default().with_base_backoff_ms(10)
}

/// Deterministic backoff, short grace period
pub fn test_config() -> EngineConfig {
    EngineConfig::development()
}

/// Capability that returns `f(input)`
pub fn capability<F>(descriptor: CapabilityDescriptor, f: F) -> Arc<FnCapability>
where
    F: Fn(&Value) -> Value + Send + Sync + 'static,
{
    let f = Arc::new(f);
    Arc::new(FnCapability::new(descriptor, move |inv: Invocation| {
        let f = Arc::clone(&f);
        async move { Ok(f(&inv.input)) }
    }))
}

/// Capability that always returns `value`
pub fn constant(id: &str, value: Value) -> Arc<FnCapability> {
    capability(CapabilityDescriptor::retry_safe(id), move |_| value.clone())
}

/// Capability that always fails with `error`
pub fn failing(descriptor: CapabilityDescriptor, error: CapabilityError) -> Arc<FnCapability> {
    Arc::new(FnCapability::new(descriptor, move |_inv: Invocation| {
        let error = error.clone();
        async move { Err(error) }
    }))
}

/// Capability that fails its first `failures` calls, then returns `value`.
/// The returned counter tracks total calls.
pub fn flaky(
    descriptor: CapabilityDescriptor,
    failures: usize,
    value: Value,
) -> (Arc<FnCapability>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let capability = Arc::new(FnCapability::new(descriptor, move |_inv: Invocation| {
        let call = counter.fetch_add(1, Ordering::SeqCst);
        let value = value.clone();
        async move {
            if call < failures {
                Err(CapabilityError::Transient(format!("attempt {} refused", call + 1)))
            } else {
                Ok(value)
            }
        }
    }));
    (capability, calls)
}

/// fetch(url) -> document -> summarize -> summary -> publish -> receipt
pub fn pipeline_catalog() -> TemplateCatalog {
    TemplateCatalog::new()
        .with(
            StepTemplate::capability("fetch", "http.get")
                .consumes("url")
                .produces("document")
                .with_retry_policy(fast_retry()),
        )
        .and_then(|c| {
            c.with(
                StepTemplate::capability("summarize", "llm.summarize")
                    .consumes("document")
                    .produces("summary")
                    .with_retry_policy(fast_retry()),
            )
        })
        .and_then(|c| {
            c.with(
                StepTemplate::capability("publish", "blog.publish")
                    .consumes("summary")
                    .produces("receipt")
                    .with_retry_policy(fast_retry()),
            )
        })
        .unwrap()
}

pub fn fetch() -> Arc<FnCapability> {
    capability(CapabilityDescriptor::retry_safe("http.get"), |input| {
        json!(format!("<html>{}</html>", input["url"].as_str().unwrap_or_default()))
    })
}

pub fn summarize() -> Arc<FnCapability> {
    capability(CapabilityDescriptor::retry_safe("llm.summarize"), |input| {
        let document = input["document"].as_str().unwrap_or_default();
        json!(format!("summary of {} chars", document.len()))
    })
}

pub fn publish() -> Arc<FnCapability> {
    constant("blog.publish", json!({"post": 42}))
}

/// Transitions of one step, in emission order
pub fn transitions(events: &[LifecycleEvent], step: &str) -> Vec<(StepStatus, StepStatus)> {
    let step = StepId::new(step);
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::StepTransition { step_id, from, to, .. } if *step_id == step => {
                Some((*from, *to))
            }
            _ => None,
        })
        .collect()
}

/// Recovery decisions taken for one step, in emission order
pub fn decisions(events: &[LifecycleEvent], step: &str) -> Vec<(FailureKind, RecoveryDecision)> {
    let step = StepId::new(step);
    events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::RecoveryDecided {
                step_id,
                failure,
                decision,
            } if *step_id == step => Some((*failure, decision.clone())),
            _ => None,
        })
        .collect()
}

pub fn entered(events: &[LifecycleEvent], step: &str, status: StepStatus) -> usize {
    transitions(events, step)
        .iter()
        .filter(|(_, to)| *to == status)
        .count()
}

pub fn engine(catalog: TemplateCatalog, capabilities: Vec<Arc<FnCapability>>) -> WorkflowEngine {
    engine_with(test_config(), catalog, capabilities)
}

pub fn engine_with(
    config: EngineConfig,
    catalog: TemplateCatalog,
    capabilities: Vec<Arc<FnCapability>>,
) -> WorkflowEngine {
    capabilities
        .into_iter()
        .fold(
            WorkflowEngine::builder().config(config).catalog(catalog),
            |builder, capability| builder.capability(capability),
        )
        .build()
        .unwrap()
}
