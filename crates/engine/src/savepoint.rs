//! Savepoint snapshots
//!
//! A savepoint records [`InstanceSnapshot`]s. The first savepoint of a
//! transaction snapshots every transactional instance; later ones only the
//! instances touched since the previous savepoint. Rolling back to savepoint
//! `k` therefore restores, per instance, the latest snapshot taken at or
//! before `k`.
//!
//! Savepoints form a stack. Releasing or rolling back to a savepoint
//! discards it together with every savepoint set after it.

use persista_core::{Error, InstanceId, Result};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::instance::InstanceSnapshot;

/// Storage for savepoint snapshots
pub trait SavepointStore: Send {
    /// Whether rows flushed after a savepoint can be undone by rolling back
    /// to it
    ///
    /// When false the session refuses explicit flushes while savepoints are
    /// active and refuses new savepoints once the transaction has flushed.
    fn supports_incremental_flush(&self) -> bool;

    /// Push a savepoint
    fn save(&mut self, name: &str, snapshots: Vec<(InstanceId, InstanceSnapshot)>) -> Result<()>;

    /// Whether a savepoint called `name` exists
    fn contains(&self, name: &str) -> bool;

    /// Names from oldest to newest
    fn names(&self) -> Vec<String>;

    /// Drop `name` and every later savepoint
    ///
    /// Returns the dropped names, newest first.
    fn release(&mut self, name: &str) -> Result<Vec<String>>;

    /// Drop `name` and every later savepoint, returning the state each
    /// recorded instance had when `name` was set
    fn rollback(&mut self, name: &str) -> Result<FxHashMap<InstanceId, InstanceSnapshot>>;

    /// Drop everything
    fn clear(&mut self);

    /// Whether no savepoint is active
    fn is_empty(&self) -> bool {
        self.names().is_empty()
    }
}

#[derive(Debug)]
struct Savepoint {
    name: String,
    snapshots: FxHashMap<InstanceId, InstanceSnapshot>,
}

/// In-memory savepoint stack
#[derive(Debug, Default)]
pub struct MemorySavepoints {
    stack: Vec<Savepoint>,
}

impl MemorySavepoints {
    /// Empty stack
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.stack
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| Error::user(format!("No savepoint named '{}'", name)))
    }
}

impl SavepointStore for MemorySavepoints {
    fn supports_incremental_flush(&self) -> bool {
        false
    }

    fn save(&mut self, name: &str, snapshots: Vec<(InstanceId, InstanceSnapshot)>) -> Result<()> {
        if self.contains(name) {
            return Err(Error::user(format!("Savepoint '{}' already exists", name)));
        }
        debug!(target: "persista::savepoint", name, instances = snapshots.len(), "Savepoint set");
        self.stack.push(Savepoint {
            name: name.to_string(),
            snapshots: snapshots.into_iter().collect(),
        });
        Ok(())
    }

    fn contains(&self, name: &str) -> bool {
        self.stack.iter().any(|s| s.name == name)
    }

    fn names(&self) -> Vec<String> {
        self.stack.iter().map(|s| s.name.clone()).collect()
    }

    fn release(&mut self, name: &str) -> Result<Vec<String>> {
        let k = self.position(name)?;
        let released: Vec<String> = self.stack.drain(k..).rev().map(|s| s.name).collect();
        debug!(target: "persista::savepoint", ?released, "Savepoints released");
        Ok(released)
    }

    fn rollback(&mut self, name: &str) -> Result<FxHashMap<InstanceId, InstanceSnapshot>> {
        let k = self.position(name)?;
        let mut merged = FxHashMap::default();
        for savepoint in &self.stack[..=k] {
            for (id, snap) in &savepoint.snapshots {
                merged.insert(*id, snap.clone());
            }
        }
        self.stack.truncate(k);
        debug!(target: "persista::savepoint", name, instances = merged.len(), "Rolled back to savepoint");
        Ok(merged)
    }

    fn clear(&mut self) {
        self.stack.clear();
    }

    fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::ManagedInstance;
    use persista_core::{FieldDescriptor, FieldValue, TypeDescriptor};
    use std::sync::Arc;

    fn instance(id: u64) -> ManagedInstance {
        let desc = TypeDescriptor::builder("Item")
            .field(FieldDescriptor::new("id").primary_key())
            .field(FieldDescriptor::new("name"))
            .build()
            .unwrap();
        ManagedInstance::transient(InstanceId::new(id), Arc::new(desc))
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut sp = MemorySavepoints::new();
        sp.save("a", Vec::new()).unwrap();
        assert!(sp.save("a", Vec::new()).is_err());
    }

    #[test]
    fn test_release_drops_later_savepoints_newest_first() {
        let mut sp = MemorySavepoints::new();
        for name in ["a", "b", "c"] {
            sp.save(name, Vec::new()).unwrap();
        }
        assert_eq!(sp.release("b").unwrap(), vec!["c".to_string(), "b".to_string()]);
        assert_eq!(sp.names(), vec!["a".to_string()]);
        assert!(sp.release("z").is_err());
    }

    #[test]
    fn test_rollback_takes_latest_snapshot_at_or_before() {
        let mut sp = MemorySavepoints::new();
        let mut one = instance(1);
        let two = instance(2);

        one.set_untracked(1, "first".into());
        sp.save("a", vec![(one.id(), one.snapshot()), (two.id(), two.snapshot())])
            .unwrap();
        one.set_untracked(1, "second".into());
        sp.save("b", vec![(one.id(), one.snapshot())]).unwrap();
        one.set_untracked(1, "third".into());
        sp.save("c", vec![(one.id(), one.snapshot())]).unwrap();

        let restored = sp.rollback("b").unwrap();
        assert_eq!(
            restored[&InstanceId::new(1)].values()[1],
            FieldValue::Text("second".into())
        );
        assert!(restored.contains_key(&InstanceId::new(2)));
        assert_eq!(sp.names(), vec!["a".to_string()]);
        assert!(!sp.supports_incremental_flush());
    }
}
