//! Process-wide mutual exclusion for alignment jobs.

use std::sync::{Arc, Mutex};

use crate::kv::KeyValueStore;

/// Key of the persisted in-progress marker.
pub const IN_PROGRESS_KEY: &str = "alignment-in-progress";

/// Marker value meaning "no job running".
const FREE: &str = "false";

/// Allows at most one alignment job at a time and remembers which collection it is for.
///
/// The marker is mirrored into the key-value store so a restarted process can
/// see that a job was interrupted. A marker found at startup is reported by
/// [`JobGate::orphaned`] and otherwise ignored: the gate always starts free.
pub struct JobGate {
    current: Mutex<Option<String>>,
    markers: Arc<KeyValueStore>,
    orphaned: Option<String>,
}

impl JobGate {
    pub fn new(markers: Arc<KeyValueStore>) -> Self {
        let orphaned = markers
            .get(IN_PROGRESS_KEY)
            .filter(|name| !name.is_empty() && name != FREE);

        if let Some(name) = &orphaned {
            tracing::warn!(collection = %name, "Found stale alignment marker from a previous run");
        }

        Self {
            current: Mutex::new(None),
            markers,
            orphaned,
        }
    }

    /// Mark `collection` as in progress if no job is running.
    pub fn try_acquire(&self, collection: &str) -> bool {
        let mut current = self.lock();
        if let Some(running) = current.as_deref() {
            tracing::debug!(running = %running, requested = %collection, "Alignment gate busy");
            return false;
        }
        *current = Some(collection.to_string());
        self.persist(collection);
        true
    }

    /// Like [`JobGate::try_acquire`], but hands out a guard that releases on drop.
    pub fn acquire(self: &Arc<Self>, collection: &str) -> Option<GateGuard> {
        self.try_acquire(collection).then(|| GateGuard {
            gate: Arc::clone(self),
            collection: collection.to_string(),
            released: false,
        })
    }

    /// Clear the in-progress marker unconditionally.
    pub fn release(&self) {
        let mut current = self.lock();
        if let Some(name) = current.take() {
            tracing::debug!(collection = %name, "Alignment gate released");
        }
        self.persist(FREE);
    }

    pub fn current(&self) -> Option<String> {
        self.lock().clone()
    }

    /// Collection whose marker was left behind by an earlier process, if any.
    pub fn orphaned(&self) -> Option<&str> {
        self.orphaned.as_deref()
    }

    /// Release only if `collection` still holds the gate.
    fn release_held(&self, collection: &str) {
        let mut current = self.lock();
        if current.as_deref() == Some(collection) {
            *current = None;
            self.persist(FREE);
            tracing::debug!(collection = %collection, "Alignment gate released");
        }
    }

    /// The in-memory state is authoritative; a failed write only loses crash detection.
    fn persist(&self, value: &str) {
        if let Err(e) = self.markers.set(IN_PROGRESS_KEY, value) {
            tracing::warn!(error = %e, "Failed to persist alignment marker");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Holds the gate for one job.
pub struct GateGuard {
    gate: Arc<JobGate>,
    collection: String,
    released: bool,
}

impl GateGuard {
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn release(mut self) {
        self.released = true;
        self.gate.release_held(&self.collection);
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        if !self.released {
            self.gate.release_held(&self.collection);
        }
    }
}

impl std::fmt::Debug for GateGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateGuard")
            .field("collection", &self.collection)
            .finish()
    }
}
