//! Persistence surface: plan + blackboard snapshots for crash recovery.
//!
//! A snapshot is enough to resume a plan: step statuses, attempt counts,
//! failure history, every committed blackboard version and the escalation
//! records. The engine saves one after each step settles when a store is
//! configured.

use crate::blackboard::BlackboardSnapshot;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestra_types::{EngineError, EngineResult, EscalationRecord, Plan, PlanId, StepId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// Everything needed to resume a plan
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub plan: Plan,
    pub blackboard: BlackboardSnapshot,
    #[serde(default)]
    pub escalations: Vec<EscalationRecord>,
    /// Steps that already ran work unsafe to repeat
    #[serde(default)]
    pub side_effects: Vec<StepId>,
    pub taken_at: DateTime<Utc>,
}

impl PlanSnapshot {
    pub fn new(plan: Plan, blackboard: BlackboardSnapshot, escalations: Vec<EscalationRecord>) -> Self {
        Self {
            plan,
            blackboard,
            escalations,
            side_effects: Vec::new(),
            taken_at: Utc::now(),
        }
    }

    pub fn with_side_effects(mut self, side_effects: Vec<StepId>) -> Self {
        self.side_effects = side_effects;
        self
    }

    pub fn plan_id(&self) -> &PlanId {
        &self.plan.id
    }
}

/// Where snapshots are kept
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Store a snapshot, replacing any earlier one for the same plan
    async fn save(&self, snapshot: &PlanSnapshot) -> EngineResult<()>;

    /// Latest snapshot of a plan
    async fn load(&self, plan_id: &PlanId) -> EngineResult<Option<PlanSnapshot>>;

    /// Plans with a stored snapshot
    async fn list(&self) -> EngineResult<Vec<PlanId>>;
}

/// In-memory snapshot store for development and testing
#[derive(Debug, Default, Clone)]
pub struct MemorySnapshotStore {
    snapshots: Arc<RwLock<HashMap<PlanId, PlanSnapshot>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: &PlanSnapshot) -> EngineResult<()> {
        let mut snapshots = self.snapshots.write().await;
        snapshots.insert(snapshot.plan.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, plan_id: &PlanId) -> EngineResult<Option<PlanSnapshot>> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots.get(plan_id).cloned())
    }

    async fn list(&self) -> EngineResult<Vec<PlanId>> {
        let snapshots = self.snapshots.read().await;
        let mut ids: Vec<PlanId> = snapshots.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// One pretty-printed JSON file per plan: `<dir>/<plan_id>.json`
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, plan_id: &PlanId) -> PathBuf {
        self.dir.join(format!("{}.json", plan_id.as_str()))
    }

    /// Read a snapshot file directly
    pub async fn read_file(path: impl AsRef<Path>) -> EngineResult<PlanSnapshot> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| EngineError::Snapshot(format!("reading {}: {e}", path.display())))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    #[instrument(skip(self, snapshot), fields(plan_id = %snapshot.plan.id))]
    async fn save(&self, snapshot: &PlanSnapshot) -> EngineResult<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| EngineError::Snapshot(format!("creating {}: {e}", self.dir.display())))?;

        let path = self.path_for(&snapshot.plan.id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| EngineError::Snapshot(format!("writing {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| EngineError::Snapshot(format!("renaming {}: {e}", path.display())))?;

        debug!(path = %path.display(), "Snapshot saved");
        Ok(())
    }

    #[instrument(skip(self), fields(plan_id = %plan_id))]
    async fn load(&self, plan_id: &PlanId) -> EngineResult<Option<PlanSnapshot>> {
        let path = self.path_for(plan_id);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        Self::read_file(&path).await.map(Some)
    }

    async fn list(&self) -> EngineResult<Vec<PlanId>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(EngineError::Snapshot(format!(
                    "listing {}: {e}",
                    self.dir.display()
                )))
            }
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EngineError::Snapshot(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(PlanId::new(stem));
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blackboard::{Blackboard, ConflictPolicy};
    use orchestra_types::{Goal, Step, StepId, StepStatus, StepTemplate, TemplateId};
    use serde_json::json;

    fn plan() -> Plan {
        let steps = vec![
            Step::new(StepId::new("fetch"), TemplateId::new("fetch"), []),
            Step::new(
                StepId::new("summarize"),
                TemplateId::new("summarize"),
                [StepId::new("fetch")],
            ),
        ];
        let templates = vec![
            StepTemplate::capability("fetch", "http.get").produces("document"),
            StepTemplate::capability("summarize", "llm.summarize")
                .consumes("document")
                .produces("summary"),
        ];
        let mut plan = Plan::new(Goal::new("digest").with_target("summary"), 0, 3, steps, templates)
            .unwrap();
        let fetch = StepId::new("fetch");
        plan.transition(&fetch, StepStatus::Ready).unwrap();
        plan.transition(&fetch, StepStatus::Running).unwrap();
        plan.step_mut(&fetch).unwrap().attempts = 2;
        plan
    }

    async fn snapshot() -> PlanSnapshot {
        let plan = plan();
        let board = Blackboard::new(plan.id.clone(), ConflictPolicy::default());
        let author = StepId::new("fetch");
        board.write("document", json!("v1"), &author).await.unwrap();
        board.write("document", json!("v2"), &author).await.unwrap();
        PlanSnapshot::new(plan, board.snapshot(), Vec::new())
            .with_side_effects(vec![StepId::new("fetch")])
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySnapshotStore::new();
        let snap = snapshot().await;
        store.save(&snap).await.unwrap();

        let loaded = store.load(snap.plan_id()).await.unwrap().unwrap();
        assert_eq!(loaded, snap);
        assert_eq!(store.list().await.unwrap(), vec![snap.plan_id().clone()]);
        assert!(store.load(&PlanId::new("other")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_round_trips_statuses_and_versions() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path().join("snapshots"));
        assert!(store.list().await.unwrap().is_empty());

        let snap = snapshot().await;
        store.save(&snap).await.unwrap();

        let loaded = store.load(snap.plan_id()).await.unwrap().unwrap();
        let fetch = loaded.plan.step(&StepId::new("fetch")).unwrap();
        assert_eq!(fetch.status, StepStatus::Running);
        assert_eq!(fetch.attempts, 2);
        let versions: Vec<u64> = loaded.blackboard.entries["document"]
            .iter()
            .map(|e| e.version)
            .collect();
        assert_eq!(versions, vec![1, 2]);
        assert_eq!(loaded.side_effects, vec![StepId::new("fetch")]);
        assert_eq!(store.list().await.unwrap(), vec![snap.plan_id().clone()]);
    }

    #[tokio::test]
    async fn test_file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        tokio::fs::write(&path, b"not json").await.unwrap();
        let err = FileSnapshotStore::read_file(&path).await.unwrap_err();
        assert!(matches!(err, EngineError::Snapshot(_)));
    }
}
