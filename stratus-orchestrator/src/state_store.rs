use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use stratus_common::Instance;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("refusing to register an instance with an empty id")]
    EmptyInstanceId,
}

/// Registry of known instances, keyed by instance id.
///
/// All access goes through a single lock; callers get clones, never
/// references into the map.
#[derive(Debug, Default)]
pub struct InstanceStateStore {
    instances: Mutex<HashMap<String, Instance>>,
}

impl InstanceStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, instance_id: &str) -> Option<Instance> {
        self.lock().get(instance_id).cloned()
    }

    /// Snapshot of every instance, oldest first.
    pub fn list(&self) -> Vec<Instance> {
        let mut instances: Vec<Instance> = self.lock().values().cloned().collect();
        instances.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        instances
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Atomic read-modify-write over the whole registry: `f` receives a
    /// copy of the current map and returns its replacement. If `f` panics
    /// the registry is left as it was.
    pub fn modify_all<F>(&self, f: F)
    where
        F: FnOnce(HashMap<String, Instance>) -> HashMap<String, Instance>,
    {
        let mut guard = self.lock();
        let next = f(guard.clone());
        *guard = next;
    }

    /// Inserts `instance`, replacing any previous record with the same id.
    pub fn register(&self, instance: Instance) -> Result<(), StoreError> {
        if instance.id.is_empty() {
            return Err(StoreError::EmptyInstanceId);
        }
        self.lock().insert(instance.id.clone(), instance);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instance>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
