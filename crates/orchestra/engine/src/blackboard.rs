//! Blackboard: the versioned key/value store shared by the steps of one plan.
//!
//! Every write appends a new version to the key's history; nothing is ever
//! overwritten. Writers to the same key serialize on a per-key async lock,
//! so versions are gapless and strictly increasing. Readers never take that
//! lock: they see the latest committed version at the time of the read.
//!
//! A blackboard is scoped to one plan. Sub-plans get their own board and
//! publish results upward through the delegating step.

use crate::journal::{Journal, JournalCursor};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use orchestra_types::{BlackboardError, BlackboardResult, PlanId, StepId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

/// What happens when two writers race on the same key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Later writers wait for the earlier commit, then commit on top of it
    #[default]
    LastWriterWins,
    /// A writer whose observed version went stale while it waited is rejected
    RejectOnStale,
}

/// One committed version of a key
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlackboardEntry {
    pub key: String,
    pub value: Value,
    pub version: u64,
    pub author: StepId,
    pub written_at: DateTime<Utc>,
}

/// A change delivered to subscribers
pub type BlackboardChange = BlackboardEntry;

/// Serializable copy of every committed version, grouped by key
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BlackboardSnapshot {
    pub plan_id: Option<PlanId>,
    pub entries: BTreeMap<String, Vec<BlackboardEntry>>,
}

impl BlackboardSnapshot {
    /// Latest version of each key
    pub fn latest(&self) -> BTreeMap<&str, &BlackboardEntry> {
        self.entries
            .iter()
            .filter_map(|(k, history)| history.last().map(|e| (k.as_str(), e)))
            .collect()
    }
}

/// Key filter for subscriptions: `*`, `prefix*`, or an exact key
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyPattern {
    Any,
    Prefix(String),
    Exact(String),
}

impl KeyPattern {
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            KeyPattern::Any
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            KeyPattern::Prefix(prefix.to_string())
        } else {
            KeyPattern::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Any => true,
            KeyPattern::Prefix(prefix) => key.starts_with(prefix.as_str()),
            KeyPattern::Exact(exact) => key == exact,
        }
    }
}

impl From<&str> for KeyPattern {
    fn from(pattern: &str) -> Self {
        KeyPattern::parse(pattern)
    }
}

#[derive(Default)]
struct KeySlot {
    writer: Mutex<()>,
    history: RwLock<Vec<BlackboardEntry>>,
}

impl KeySlot {
    fn latest_version(&self) -> Option<u64> {
        self.history
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .map(|e| e.version)
    }
}

/// Versioned store shared by the steps of one plan
pub struct Blackboard {
    plan_id: PlanId,
    conflict_policy: ConflictPolicy,
    slots: DashMap<String, Arc<KeySlot>>,
    changes: Arc<Journal<BlackboardChange>>,
    closed: AtomicBool,
}

impl Blackboard {
    pub fn new(plan_id: PlanId, conflict_policy: ConflictPolicy) -> Self {
        Self {
            plan_id,
            conflict_policy,
            slots: DashMap::new(),
            changes: Journal::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Rebuild a board from a snapshot, keeping every committed version
    pub fn restore(
        plan_id: PlanId,
        conflict_policy: ConflictPolicy,
        snapshot: &BlackboardSnapshot,
    ) -> Self {
        let board = Self::new(plan_id, conflict_policy);
        let mut replay: Vec<&BlackboardEntry> = snapshot.entries.values().flatten().collect();
        replay.sort_by(|a, b| {
            a.written_at
                .cmp(&b.written_at)
                .then_with(|| a.key.cmp(&b.key))
                .then_with(|| a.version.cmp(&b.version))
        });
        for (key, history) in &snapshot.entries {
            let slot = KeySlot {
                writer: Mutex::new(()),
                history: RwLock::new(history.clone()),
            };
            board.slots.insert(key.clone(), Arc::new(slot));
        }
        for entry in replay {
            board.changes.append(entry.clone());
        }
        board
    }

    pub fn plan_id(&self) -> &PlanId {
        &self.plan_id
    }

    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.conflict_policy
    }

    fn slot(&self, key: &str) -> Arc<KeySlot> {
        self.slots
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(KeySlot::default()))
            .value()
            .clone()
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Commit a new version of `key`, returning its version number.
    ///
    /// Under [`ConflictPolicy::LastWriterWins`] a contended write waits for
    /// the earlier commit. Under [`ConflictPolicy::RejectOnStale`] it fails
    /// with [`BlackboardError::StaleVersion`] if another writer committed
    /// between the call and acquiring the key.
    pub async fn write(
        &self,
        key: &str,
        value: Value,
        author: &StepId,
    ) -> BlackboardResult<u64> {
        let slot = self.slot(key);
        let observed = slot.latest_version();
        let _guard = slot.writer.lock().await;
        let expected = match self.conflict_policy {
            ConflictPolicy::LastWriterWins => None,
            ConflictPolicy::RejectOnStale => Some(observed),
        };
        self.commit(&slot, key, value, author, expected)
    }

    /// Compare-and-set: commit only if the latest version is `expected`
    /// (`None` meaning the key must not exist yet).
    pub async fn write_expecting(
        &self,
        key: &str,
        value: Value,
        author: &StepId,
        expected: Option<u64>,
    ) -> BlackboardResult<u64> {
        let slot = self.slot(key);
        let _guard = slot.writer.lock().await;
        self.commit(&slot, key, value, author, Some(expected))
    }

    /// Caller must hold `slot.writer`
    fn commit(
        &self,
        slot: &KeySlot,
        key: &str,
        value: Value,
        author: &StepId,
        expected: Option<Option<u64>>,
    ) -> BlackboardResult<u64> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BlackboardError::Closed);
        }
        let mut history = slot.history.write().unwrap_or_else(|e| e.into_inner());
        let actual = history.last().map(|e| e.version);
        if let Some(expected) = expected {
            if expected != actual {
                return Err(BlackboardError::StaleVersion {
                    key: key.to_string(),
                    expected,
                    actual,
                });
            }
        }
        let version = actual.map_or(1, |v| v + 1);
        let entry = BlackboardEntry {
            key: key.to_string(),
            value,
            version,
            author: author.clone(),
            written_at: Utc::now(),
        };
        history.push(entry.clone());
        drop(history);
        self.changes.append(entry);
        tracing::trace!(plan_id = %self.plan_id, key, version, author = %author, "Blackboard write committed");
        Ok(version)
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Latest committed value, or the latest at or below `as_of`
    pub fn read(&self, key: &str, as_of: Option<u64>) -> BlackboardResult<(Value, u64)> {
        self.entry(key, as_of).map(|e| (e.value, e.version))
    }

    /// Full entry for a read, including author and timestamp
    pub fn entry(&self, key: &str, as_of: Option<u64>) -> BlackboardResult<BlackboardEntry> {
        let not_found = || BlackboardError::NotFound {
            key: key.to_string(),
            as_of,
        };
        let slot = self.slots.get(key).map(|s| s.value().clone()).ok_or_else(not_found)?;
        let history = slot.history.read().unwrap_or_else(|e| e.into_inner());
        let found = match as_of {
            None => history.last(),
            Some(version) => history.iter().rev().find(|e| e.version <= version),
        };
        found.cloned().ok_or_else(not_found)
    }

    pub fn latest_version(&self, key: &str) -> Option<u64> {
        self.slots.get(key).and_then(|s| s.latest_version())
    }

    /// Every committed version of `key`, oldest first
    pub fn history(&self, key: &str) -> Vec<BlackboardEntry> {
        self.slots
            .get(key)
            .map(|s| {
                s.history
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
            })
            .unwrap_or_default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.latest_version(key).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .slots
            .iter()
            .filter(|s| s.value().latest_version().is_some())
            .map(|s| s.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn snapshot(&self) -> BlackboardSnapshot {
        let entries = self
            .keys()
            .into_iter()
            .map(|key| {
                let history = self.history(&key);
                (key, history)
            })
            .collect();
        BlackboardSnapshot {
            plan_id: Some(self.plan_id.clone()),
            entries,
        }
    }

    // ── Subscriptions ────────────────────────────────────────────────

    /// Changes to keys matching `pattern`, replaying history first
    pub fn subscribe(&self, pattern: impl Into<KeyPattern>) -> Subscription {
        self.subscribe_from(pattern, 0)
    }

    /// Resume a subscription at a position taken from [`Subscription::position`]
    pub fn subscribe_from(&self, pattern: impl Into<KeyPattern>, position: usize) -> Subscription {
        Subscription {
            pattern: pattern.into(),
            cursor: self.changes.cursor(position),
        }
    }

    /// Refuse further writes and end subscriptions once drained
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.changes.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Blackboard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blackboard")
            .field("plan_id", &self.plan_id)
            .field("conflict_policy", &self.conflict_policy)
            .field("keys", &self.slots.len())
            .field("changes", &self.changes.len())
            .finish()
    }
}

/// A lazy, restartable feed of blackboard changes
pub struct Subscription {
    pattern: KeyPattern,
    cursor: JournalCursor<BlackboardChange>,
}

impl Subscription {
    /// Position to pass to [`Blackboard::subscribe_from`] to resume after the last change seen
    pub fn position(&self) -> usize {
        self.cursor.position()
    }

    pub async fn next(&mut self) -> Option<BlackboardChange> {
        while let Some(change) = self.cursor.next().await {
            if self.pattern.matches(&change.key) {
                return Some(change);
            }
        }
        None
    }

    pub fn into_stream(self) -> impl Stream<Item = BlackboardChange> {
        let pattern = self.pattern;
        futures::StreamExt::filter(self.cursor.into_stream(), move |change| {
            futures::future::ready(pattern.matches(&change.key))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn board(policy: ConflictPolicy) -> Blackboard {
        Blackboard::new(PlanId::new("plan"), policy)
    }

    fn author(id: &str) -> StepId {
        StepId::new(id)
    }

    #[tokio::test]
    async fn test_write_appends_versions() {
        let bb = board(ConflictPolicy::LastWriterWins);
        assert_eq!(bb.write("doc", json!("v1"), &author("fetch")).await.unwrap(), 1);
        assert_eq!(bb.write("doc", json!("v2"), &author("fetch")).await.unwrap(), 2);

        assert_eq!(bb.read("doc", None).unwrap(), (json!("v2"), 2));
        assert_eq!(bb.read("doc", Some(1)).unwrap(), (json!("v1"), 1));
        assert_eq!(bb.history("doc").len(), 2);
    }

    #[tokio::test]
    async fn test_read_missing_key() {
        let bb = board(ConflictPolicy::LastWriterWins);
        assert!(matches!(
            bb.read("nope", None),
            Err(BlackboardError::NotFound { .. })
        ));
        bb.write("k", json!(1), &author("s")).await.unwrap();
        assert!(matches!(
            bb.read("k", Some(0)),
            Err(BlackboardError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_write_expecting_rejects_stale() {
        let bb = board(ConflictPolicy::LastWriterWins);
        bb.write_expecting("k", json!(1), &author("a"), None)
            .await
            .unwrap();
        let err = bb
            .write_expecting("k", json!(2), &author("b"), None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BlackboardError::StaleVersion {
                key: "k".into(),
                expected: None,
                actual: Some(1)
            }
        );
        assert_eq!(
            bb.write_expecting("k", json!(2), &author("b"), Some(1))
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_concurrent_writers_last_writer_wins() {
        let bb = Arc::new(board(ConflictPolicy::LastWriterWins));
        let mut handles = Vec::new();
        for i in 0..16 {
            let bb = Arc::clone(&bb);
            handles.push(tokio::spawn(async move {
                bb.write("counter", json!(i), &StepId::new(format!("w{i}")))
                    .await
            }));
        }
        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap().unwrap());
        }
        versions.sort();
        assert_eq!(versions, (1..=16).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_reject_on_stale_under_contention() {
        let bb = Arc::new(board(ConflictPolicy::RejectOnStale));
        let slot = bb.slot("k");
        let guard = slot.writer.lock().await;

        let contender = {
            let bb = Arc::clone(&bb);
            tokio::spawn(async move { bb.write("k", json!("late"), &StepId::new("late")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Commit while the contender is parked on the key lock.
        bb.commit(&slot, "k", json!("first"), &author("first"), None)
            .unwrap();
        drop(guard);

        let result = contender.await.unwrap();
        assert!(matches!(result, Err(BlackboardError::StaleVersion { .. })));
        assert_eq!(bb.read("k", None).unwrap().1, 1);
    }

    #[tokio::test]
    async fn test_subscription_filters_and_restarts() {
        let bb = board(ConflictPolicy::LastWriterWins);
        bb.write("fetch.raw", json!("a"), &author("fetch")).await.unwrap();
        bb.write("summary", json!("b"), &author("summarize")).await.unwrap();
        bb.write("fetch.meta", json!("c"), &author("fetch")).await.unwrap();

        let mut sub = bb.subscribe("fetch.*");
        let first = sub.next().await.unwrap();
        assert_eq!(first.key, "fetch.raw");
        let resume_at = sub.position();

        let mut resumed = bb.subscribe_from("fetch.*", resume_at);
        assert_eq!(resumed.next().await.unwrap().key, "fetch.meta");

        bb.close();
        assert!(resumed.next().await.is_none());
        assert!(matches!(
            bb.write("x", json!(1), &author("late")).await,
            Err(BlackboardError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_snapshot_restore_keeps_history() {
        let bb = board(ConflictPolicy::LastWriterWins);
        bb.write("a", json!(1), &author("s1")).await.unwrap();
        bb.write("a", json!(2), &author("s1")).await.unwrap();
        bb.write("b", json!("x"), &author("s2")).await.unwrap();

        let snapshot = bb.snapshot();
        let restored = Blackboard::restore(
            PlanId::new("plan"),
            ConflictPolicy::LastWriterWins,
            &snapshot,
        );
        assert_eq!(restored.history("a"), bb.history("a"));
        assert_eq!(restored.read("b", None).unwrap(), (json!("x"), 1));
        assert_eq!(
            restored.write("a", json!(3), &author("s1")).await.unwrap(),
            3
        );
        assert_eq!(snapshot.latest().get("a").map(|e| e.version), Some(2));
    }

    #[test]
    fn test_key_pattern() {
        assert!(KeyPattern::parse("*").matches("anything"));
        assert!(KeyPattern::parse("fetch.*").matches("fetch.raw"));
        assert!(!KeyPattern::parse("fetch.*").matches("summary"));
        assert!(KeyPattern::parse("summary").matches("summary"));
        assert!(!KeyPattern::parse("summary").matches("summary2"));
    }
}
