//! Orchestra Engine: the runtime of the orchestration core
//!
//! Turns a [`Goal`] into a [`Plan`] and drives it to a terminal state,
//! verifying every step result before it is published and recovering from
//! failures without losing the audit trail.
//!
//! # Key Principle
//!
//! **The engine coordinates, capabilities execute.**
//!
//! Steps never call each other. They read their inputs from the plan's
//! [`Blackboard`] and publish results back to it once the [`Verifier`]
//! accepts them. All work happens behind the [`Capability`] trait.
//!
//! # Architecture
//!
//! The [`WorkflowEngine`] composes specialized components:
//!
//! - [`TemplateCatalog`]: step templates indexed by the keys they produce
//! - [`PlanCompiler`]: resolves a goal's targets into an acyclic plan
//! - [`Blackboard`]: versioned, append-only shared state with subscriptions
//! - [`Verifier`]: judges step outputs against template criteria
//! - [`RecoveryController`]: retry, reassign, escalate or abort
//! - [`DelegationRouter`]: direct capability call or nested sub-plan
//! - [`EventLog`]: ordered lifecycle events for observers
//! - [`SnapshotStore`]: plan and blackboard snapshots for resumption
//!
//! # Example
//!
//! ```rust
//! use orchestra_engine::{
//!     CapabilityDescriptor, FnCapability, Invocation, TemplateCatalog, WorkflowEngine,
//! };
//! use orchestra_types::{Goal, PlanStatus, StepTemplate};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let catalog = TemplateCatalog::new()
//!     .with(StepTemplate::capability("greet", "text.greet").consumes("name").produces("greeting"))
//!     .unwrap();
//!
//! let engine = WorkflowEngine::builder()
//!     .catalog(catalog)
//!     .capability(Arc::new(FnCapability::new(
//!         CapabilityDescriptor::retry_safe("text.greet"),
//!         |inv: Invocation| async move {
//!             let name = inv.input["name"].as_str().unwrap_or("world").to_string();
//!             Ok(json!(format!("hello, {name}")))
//!         },
//!     )))
//!     .build()
//!     .unwrap();
//!
//! let goal = Goal::new("greeting")
//!     .with_input("name", json!("ada"))
//!     .with_target("greeting");
//! let report = engine.run_goal(&goal).await.unwrap();
//!
//! assert_eq!(report.status, PlanStatus::Completed);
//! assert_eq!(report.output("greeting"), Some(&json!("hello, ada")));
//! # });
//! ```

#![deny(unsafe_code)]

pub mod blackboard;
pub mod capability;
pub mod catalog;
pub mod compiler;
pub mod config;
pub mod delegation;
pub mod engine;
pub mod events;
pub mod recovery;
pub mod snapshot;
pub mod verifier;

mod journal;

pub use blackboard::{
    Blackboard, BlackboardChange, BlackboardEntry, BlackboardSnapshot, ConflictPolicy, KeyPattern,
    Subscription,
};
pub use capability::{
    invoke_with_deadline, Capability, CapabilityDescriptor, CapabilityError, CapabilityRegistry,
    CapabilityResult, FnCapability, Invocation,
};
pub use catalog::TemplateCatalog;
pub use compiler::{sub_goal, Alternative, PlanCompiler};
pub use config::EngineConfig;
pub use delegation::{
    DelegationBudget, DelegationRouter, Resolution, RouteError, SubPlanPermit, SubPlanSpec,
};
pub use engine::{EngineBuilder, PlanReport, WorkflowEngine, GOAL_AUTHOR};
pub use events::{EventLog, EventStream};
pub use recovery::{RecoveryConfig, RecoveryContext, RecoveryController};
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, PlanSnapshot, SnapshotStore};
pub use verifier::Verifier;

pub use orchestra_types::{Goal, Plan};
pub use tokio_util::sync::CancellationToken;
