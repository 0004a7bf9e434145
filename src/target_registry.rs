use std::collections::hash_map::Entry;
use std::sync::{Arc, Weak};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};
use crate::message::TargetId;

/// Process-local lookup of the application objects that incoming messages update.
///
/// The registry holds weak references only: a target stays registered while the application
///  keeps it alive somewhere else, and it never keeps a target alive by itself. Entries whose
///  target was dropped are pruned lazily on lookup, by the periodic [TargetRegistry::sweep],
///  or by an explicit [TargetRegistry::remove] when the application destroys a target.
pub struct TargetRegistry<T> {
    entries: FxHashMap<TargetId, Weak<T>>,
}

impl<T> Default for TargetRegistry<T> {
    fn default() -> Self {
        TargetRegistry::new()
    }
}

impl<T> TargetRegistry<T> {
    pub fn new() -> TargetRegistry<T> {
        TargetRegistry {
            entries: FxHashMap::default(),
        }
    }

    pub fn get(&mut self, id: &TargetId) -> Option<Arc<T>> {
        match self.entries.entry(*id) {
            Entry::Occupied(e) => {
                let target = e.get().upgrade();
                if target.is_none() {
                    trace!("target {} was dropped - removing it from the registry", id);
                    e.remove();
                }
                target
            }
            Entry::Vacant(_) => None,
        }
    }

    /// registers a target, replacing a previous registration for the same id
    pub fn insert(&mut self, id: TargetId, target: &Arc<T>) {
        self.entries.insert(id, Arc::downgrade(target));
    }

    pub fn remove(&mut self, id: &TargetId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Removes all entries whose target is no longer alive, returning the number of removed
    ///  entries
    pub fn sweep(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, target| target.strong_count() > 0);

        let num_removed = before - self.entries.len();
        if num_removed > 0 {
            debug!("registry sweep removed {} dropped targets, {} remaining", num_removed, self.entries.len());
        }
        num_removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
