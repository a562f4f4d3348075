//! CLI command implementations

pub mod inspect;
pub mod plan;
pub mod run;

use crate::demo::DemoCatalog;
use anyhow::Context;
use orchestra_engine::{SnapshotStore, WorkflowEngine};
use std::path::Path;
use std::sync::Arc;

/// Engine wired to the templates and demo capabilities of a catalog file
pub(crate) fn build_engine(
    catalog: &Path,
    config: orchestra_engine::EngineConfig,
    snapshots: Option<Arc<dyn SnapshotStore>>,
) -> anyhow::Result<WorkflowEngine> {
    let (templates, capabilities) = DemoCatalog::load(catalog)?.into_parts()?;

    let mut builder = WorkflowEngine::builder().config(config).catalog(templates);
    for capability in capabilities {
        builder = builder.capability(capability);
    }
    if let Some(store) = snapshots {
        builder = builder.snapshot_store(store);
    }
    builder.build().context("building workflow engine")
}
