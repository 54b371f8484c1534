//! Identity map from object id to managed instance
//!
//! At most one instance per object id. Instances without an id (transient,
//! or new with identity assigned at flush) are not cached.

use persista_core::{Error, InstanceId, ObjectId, Result};
use rustc_hash::FxHashMap;

/// Object id to instance map
#[derive(Debug, Default, Clone)]
pub struct InstanceCache {
    by_oid: FxHashMap<ObjectId, InstanceId>,
}

impl InstanceCache {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Instance managing `oid`
    pub fn get(&self, oid: &ObjectId) -> Option<InstanceId> {
        self.by_oid.get(oid).copied()
    }

    /// Whether `oid` is managed
    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.by_oid.contains_key(oid)
    }

    /// Register `instance` as the manager of `oid`
    ///
    /// # Errors
    ///
    /// Returns an `ObjectExists` error when another instance already
    /// manages the id.
    pub fn insert(&mut self, oid: ObjectId, instance: InstanceId) -> Result<()> {
        match self.by_oid.get(&oid) {
            Some(existing) if *existing != instance => Err(Error::exists(format!(
                "{} is already managed by {}",
                oid_label(&oid),
                existing
            ))
            .with_failed(instance)),
            _ => {
                self.by_oid.insert(oid, instance);
                Ok(())
            }
        }
    }

    /// Forget `oid` if `instance` manages it
    pub fn remove(&mut self, oid: &ObjectId, instance: InstanceId) -> bool {
        if self.by_oid.get(oid) == Some(&instance) {
            self.by_oid.remove(oid);
            true
        } else {
            false
        }
    }

    /// Number of cached ids
    pub fn len(&self) -> usize {
        self.by_oid.len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.by_oid.is_empty()
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.by_oid.clear();
    }
}

fn oid_label(oid: &ObjectId) -> String {
    format!("{}#{:?}", oid.type_name(), oid.key())
}
