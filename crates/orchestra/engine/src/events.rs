//! Lifecycle event log: the observability surface of the engine.
//!
//! Events from the root plan and every nested sub-plan land in one
//! append-only log. Monitors read it through [`EventStream`]s, which can be
//! created at any position and therefore restarted after a disconnect.

use crate::journal::{Journal, JournalCursor};
use chrono::Utc;
use futures::Stream;
use orchestra_types::{EventKind, LifecycleEvent, PlanId};
use std::sync::Arc;

/// Shared, append-only log of lifecycle events
#[derive(Clone)]
pub struct EventLog {
    journal: Arc<Journal<LifecycleEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            journal: Journal::new(),
        }
    }

    /// Append an event; returns its sequence number, or `None` once closed
    pub fn emit(&self, plan_id: &PlanId, depth: u32, kind: EventKind) -> Option<u64> {
        self.journal
            .append_with(|position| LifecycleEvent {
                sequence: position as u64,
                plan_id: plan_id.clone(),
                depth,
                timestamp: Utc::now(),
                kind,
            })
            .map(|position| position as u64)
    }

    /// Stream every event from the beginning
    pub fn subscribe(&self) -> EventStream {
        self.subscribe_from(0)
    }

    /// Stream events starting at `sequence`
    pub fn subscribe_from(&self, sequence: u64) -> EventStream {
        EventStream {
            cursor: self
                .journal
                .cursor(usize::try_from(sequence).unwrap_or(usize::MAX)),
        }
    }

    /// Copy of every event recorded so far
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.journal.entries()
    }

    /// Events emitted by one plan
    pub fn events_for(&self, plan_id: &PlanId) -> Vec<LifecycleEvent> {
        self.journal
            .entries()
            .into_iter()
            .filter(|e| &e.plan_id == plan_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.journal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop recording; open streams end after draining
    pub fn close(&self) {
        self.journal.close();
    }

    pub fn is_closed(&self) -> bool {
        self.journal.is_closed()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A lazy reader over the event log
pub struct EventStream {
    cursor: JournalCursor<LifecycleEvent>,
}

impl EventStream {
    /// Sequence number of the next event this stream will yield
    pub fn position(&self) -> u64 {
        self.cursor.position() as u64
    }

    pub async fn next(&mut self) -> Option<LifecycleEvent> {
        self.cursor.next().await
    }

    pub fn try_next(&mut self) -> Option<LifecycleEvent> {
        self.cursor.try_next()
    }

    pub fn into_stream(self) -> impl Stream<Item = LifecycleEvent> {
        self.cursor.into_stream()
    }
}
