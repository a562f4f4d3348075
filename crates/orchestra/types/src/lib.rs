//! Orchestra Types: the data model of the orchestration core
//!
//! This crate defines the values that flow between the plan compiler, the
//! workflow engine and its collaborators. It performs no I/O and owns no
//! runtime state.
//!
//! # Key Concepts
//!
//! - [`Goal`]: the blackboard keys a plan must produce, plus seed inputs
//! - [`StepTemplate`]: a catalog entry, bound to a capability or a sub-goal
//! - [`Plan`]: a compiled, acyclic graph of [`Step`]s
//! - [`FailureRecord`] and [`Verdict`]: what went wrong with an attempt, and
//!   what the verifier thought of its output
//! - [`RecoveryDecision`]: retry, reassign, escalate or abort
//! - [`LifecycleEvent`]: the observability stream

#![deny(unsafe_code)]

pub mod error;
pub mod escalation;
pub mod event;
pub mod goal;
pub mod ids;
pub mod plan;
pub mod recovery;
pub mod step;
pub mod template;
pub mod verdict;

pub use error::*;
pub use escalation::*;
pub use event::*;
pub use goal::*;
pub use ids::*;
pub use plan::*;
pub use recovery::*;
pub use step::*;
pub use template::*;
pub use verdict::*;
