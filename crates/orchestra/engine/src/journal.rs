//! Append-only journal with restartable cursors.
//!
//! Both the blackboard change feed and the lifecycle event stream are
//! journals: every append is retained, readers hold an independent position
//! and can resume from any earlier position. Readers that have caught up
//! park on a watch channel until the next append or until the journal closes.

use futures::Stream;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct JournalState {
    len: usize,
    closed: bool,
}

pub(crate) struct Journal<T> {
    entries: RwLock<Vec<T>>,
    state: watch::Sender<JournalState>,
}

impl<T: Clone + Send + Sync + 'static> Journal<T> {
    pub(crate) fn new() -> Arc<Self> {
        let (state, _) = watch::channel(JournalState {
            len: 0,
            closed: false,
        });
        Arc::new(Self {
            entries: RwLock::new(Vec::new()),
            state,
        })
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, Vec<T>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an entry built from its position. Returns `None` once closed.
    pub(crate) fn append_with(&self, build: impl FnOnce(usize) -> T) -> Option<usize> {
        let mut entries = self.write_entries();
        if self.state.borrow().closed {
            return None;
        }
        let position = entries.len();
        entries.push(build(position));
        let len = entries.len();
        self.state.send_modify(|s| s.len = len);
        Some(position)
    }

    pub(crate) fn append(&self, entry: T) -> Option<usize> {
        self.append_with(|_| entry)
    }

    pub(crate) fn get(&self, position: usize) -> Option<T> {
        self.read_entries().get(position).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub(crate) fn entries(&self) -> Vec<T> {
        self.read_entries().clone()
    }

    /// Stop accepting appends and release parked readers
    pub(crate) fn close(&self) {
        let _entries = self.write_entries();
        self.state.send_modify(|s| s.closed = true);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    pub(crate) fn cursor(self: &Arc<Self>, position: usize) -> JournalCursor<T> {
        JournalCursor {
            journal: Arc::clone(self),
            position,
            state: self.state.subscribe(),
        }
    }
}

/// An independent read position in a journal
pub(crate) struct JournalCursor<T> {
    journal: Arc<Journal<T>>,
    position: usize,
    state: watch::Receiver<JournalState>,
}

impl<T: Clone + Send + Sync + 'static> JournalCursor<T> {
    pub(crate) fn position(&self) -> usize {
        self.position
    }

    /// Next entry if one is already available
    pub(crate) fn try_next(&mut self) -> Option<T> {
        let entry = self.journal.get(self.position)?;
        self.position += 1;
        Some(entry)
    }

    /// Wait for the next entry; `None` once the journal is closed and drained
    pub(crate) async fn next(&mut self) -> Option<T> {
        loop {
            // Mark the current state seen before looking, so an append that
            // lands after the look still wakes `changed()`.
            let closed = self.state.borrow_and_update().closed;
            if let Some(entry) = self.try_next() {
                return Some(entry);
            }
            if closed {
                return None;
            }
            if self.state.changed().await.is_err() {
                return self.try_next();
            }
        }
    }

    pub(crate) fn into_stream(self) -> impl Stream<Item = T> {
        futures::stream::unfold(self, |mut cursor| async move {
            cursor.next().await.map(|entry| (entry, cursor))
        })
    }
}
