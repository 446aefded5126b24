//! Process-wide tracking of live guards
//!
//! The registry holds weak references only; a guard dropped everywhere else
//! disappears from it on the next sweep.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::info;

/// Something that can be shut down as part of a coordinated stop
pub trait Lifecycle: Send + Sync {
    fn name(&self) -> &str;

    /// Cancel in-flight work and refuse new work; must be idempotent
    fn shutdown(&self);

    fn is_shut_down(&self) -> bool;
}

/// Handle returned by [`Registry::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

#[derive(Debug, Default)]
pub struct Registry {
    entries: Mutex<Vec<(RegistrationId, Weak<dyn Lifecycle>)>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<L: Lifecycle + 'static>(&self, instance: &Arc<L>) -> RegistrationId {
        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let weak: Weak<L> = Arc::downgrade(instance);
        let weak: Weak<dyn Lifecycle> = weak;

        let mut entries = self.lock_entries();
        entries.retain(|(_, entry)| entry.strong_count() > 0);
        entries.push((id, weak));
        id
    }

    /// Stop tracking an instance; returns false if it was not registered
    pub fn deregister(&self, id: RegistrationId) -> bool {
        let mut entries = self.lock_entries();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Number of registered instances still alive
    pub fn len(&self) -> usize {
        let mut entries = self.lock_entries();
        entries.retain(|(_, entry)| entry.strong_count() > 0);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut down every live instance and forget them all
    ///
    /// Returns how many instances were shut down.
    pub fn shutdown_all(&self) -> usize {
        // Collect first so shutdown hooks never run under the registry lock
        let live: Vec<Arc<dyn Lifecycle>> = {
            let mut entries = self.lock_entries();
            entries
                .drain(..)
                .filter_map(|(_, entry)| entry.upgrade())
                .collect()
        };

        for instance in &live {
            info!(name = instance.name(), "Shutting down registered instance");
            instance.shutdown();
        }
        live.len()
    }

    fn lock_entries(&self) -> MutexGuard<'_, Vec<(RegistrationId, Weak<dyn Lifecycle>)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
