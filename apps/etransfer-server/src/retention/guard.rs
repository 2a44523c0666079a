//! Reference guards between deliveries and deletions
//!
//! A delivery holds a `ReadGuard` for as long as it streams bytes. A
//! deletion must obtain a `DeleteGuard`, which is refused while any reader
//! holds the id; while the delete guard is held, new readers are refused.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Default)]
struct GuardState {
    readers: usize,
    deleting: bool,
}

#[derive(Clone, Default)]
pub struct ReadGuards {
    inner: Arc<Mutex<HashMap<String, GuardState>>>,
}

impl ReadGuards {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reader; `None` while a deletion is in progress
    pub fn acquire_read(&self, id: &str) -> Option<ReadGuard> {
        let mut table = self.inner.lock();
        let state = table.entry(id.to_string()).or_default();
        if state.deleting {
            return None;
        }
        state.readers += 1;

        Some(ReadGuard {
            guards: self.clone(),
            id: id.to_string(),
        })
    }

    /// Claim the id for deletion; `None` while readers are active
    pub fn try_begin_delete(&self, id: &str) -> Option<DeleteGuard> {
        let mut table = self.inner.lock();
        let state = table.entry(id.to_string()).or_default();
        if state.deleting || state.readers > 0 {
            return None;
        }
        state.deleting = true;

        Some(DeleteGuard {
            guards: self.clone(),
            id: id.to_string(),
        })
    }

    pub fn readers(&self, id: &str) -> usize {
        self.inner.lock().get(id).map_or(0, |s| s.readers)
    }

    fn update(&self, id: &str, f: impl FnOnce(&mut GuardState)) {
        let mut table = self.inner.lock();
        if let Some(state) = table.get_mut(id) {
            f(state);
            if state.readers == 0 && !state.deleting {
                table.remove(id);
            }
        }
    }
}

/// Held by an in-progress delivery
pub struct ReadGuard {
    guards: ReadGuards,
    id: String,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.guards
            .update(&self.id, |s| s.readers = s.readers.saturating_sub(1));
    }
}

/// Held by an in-progress deletion
pub struct DeleteGuard {
    guards: ReadGuards,
    id: String,
}

impl Drop for DeleteGuard {
    fn drop(&mut self) {
        self.guards.update(&self.id, |s| s.deleting = false);
    }
}
