//! Datastore lock managers
//!
//! A [`LockTable`] is shared by every connection to the same database. Each
//! session gets its own [`MemoryLockManager`] handle from it, identified by
//! an owner id, and remembers which of its instances it has locked.
//!
//! Compatibility:
//!
//! | held \ requested | read | write |
//! |---|---|---|
//! | none | yes | yes |
//! | read (others) | yes | no |
//! | write (other) | no | no |
//!
//! A lock held by the requesting owner never blocks itself, so read locks
//! upgrade to write when no one else reads.

use parking_lot::{Condvar, Mutex};
use persista_core::{Error, InstanceId, LockLevel, LockManager, ObjectId, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Default)]
struct LockEntry {
    readers: FxHashSet<u64>,
    writer: Option<u64>,
}

impl LockEntry {
    fn grantable(&self, owner: u64, level: LockLevel) -> bool {
        let writer_ok = self.writer.map_or(true, |w| w == owner);
        match level {
            LockLevel::None => true,
            LockLevel::Read => writer_ok,
            LockLevel::Write => writer_ok && self.readers.iter().all(|r| *r == owner),
        }
    }

    fn grant(&mut self, owner: u64, level: LockLevel) {
        match level {
            LockLevel::None => {}
            LockLevel::Read => {
                self.readers.insert(owner);
            }
            LockLevel::Write => self.writer = Some(owner),
        }
    }

    fn is_free(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none()
    }
}

/// Lock table shared between sessions
#[derive(Debug, Default)]
pub struct LockTable {
    entries: Mutex<FxHashMap<ObjectId, LockEntry>>,
    released: Condvar,
    next_owner: AtomicU64,
}

impl LockTable {
    /// Empty table
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Lock manager for one session
    pub fn manager(self: &Arc<Self>) -> MemoryLockManager {
        MemoryLockManager {
            table: Arc::clone(self),
            owner: self.next_owner.fetch_add(1, Ordering::Relaxed) + 1,
            held: Mutex::new(FxHashMap::default()),
        }
    }

    /// Whether anyone holds a lock on `oid`
    pub fn is_locked(&self, oid: &ObjectId) -> bool {
        self.entries.lock().get(oid).map_or(false, |e| !e.is_free())
    }

    /// Whether someone holds a write lock on `oid`
    pub fn is_write_locked(&self, oid: &ObjectId) -> bool {
        self.entries
            .lock()
            .get(oid)
            .map_or(false, |e| e.writer.is_some())
    }

    fn acquire(&self, owner: u64, oid: &ObjectId, level: LockLevel, timeout_ms: i64) -> Result<()> {
        let deadline = u64::try_from(timeout_ms)
            .ok()
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let mut entries = self.entries.lock();
        loop {
            let entry = entries.entry(oid.clone()).or_default();
            if entry.grantable(owner, level) {
                entry.grant(owner, level);
                return Ok(());
            }
            match deadline {
                None => self.released.wait(&mut entries),
                Some(deadline) => {
                    if self.released.wait_until(&mut entries, deadline).timed_out() {
                        let entry = entries.entry(oid.clone()).or_default();
                        if entry.grantable(owner, level) {
                            entry.grant(owner, level);
                            return Ok(());
                        }
                        return Err(Error::lock_timeout(
                            format!("{} lock on {}", level, oid),
                            timeout_ms,
                        ));
                    }
                }
            }
        }
    }

    fn release(&self, owner: u64, oid: &ObjectId) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(oid) {
            entry.readers.remove(&owner);
            if entry.writer == Some(owner) {
                entry.writer = None;
            }
            if entry.is_free() {
                entries.remove(oid);
            }
        }
        self.released.notify_all();
    }
}

#[derive(Debug, Clone)]
struct Held {
    oid: Option<ObjectId>,
    level: LockLevel,
}

/// Lock manager backed by a shared [`LockTable`]
///
/// Instances without a durable identity are recorded as locked without
/// touching the table; nobody else can see them yet.
#[derive(Debug)]
pub struct MemoryLockManager {
    table: Arc<LockTable>,
    owner: u64,
    held: Mutex<FxHashMap<InstanceId, Held>>,
}

impl MemoryLockManager {
    /// Owner id of this manager in the table
    pub fn owner(&self) -> u64 {
        self.owner
    }

    /// Number of instances currently locked
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }

    fn release_all(&self) {
        let held: Vec<Held> = self.held.lock().drain().map(|(_, h)| h).collect();
        for h in held {
            if let Some(oid) = h.oid {
                self.table.release(self.owner, &oid);
            }
        }
    }
}

impl LockManager for MemoryLockManager {
    fn lock(
        &self,
        instance: InstanceId,
        oid: Option<&ObjectId>,
        level: LockLevel,
        timeout_ms: i64,
    ) -> Result<()> {
        if !level.is_locking() || self.lock_level(instance) >= level {
            return Ok(());
        }
        if let Some(oid) = oid {
            self.table
                .acquire(self.owner, oid, level, timeout_ms)
                .map_err(|e| e.with_failed(instance))?;
        }
        debug!(target: "persista::store", %instance, %level, "Lock granted");
        self.held.lock().insert(
            instance,
            Held {
                oid: oid.cloned(),
                level,
            },
        );
        Ok(())
    }

    fn lock_level(&self, instance: InstanceId) -> LockLevel {
        self.held
            .lock()
            .get(&instance)
            .map_or(LockLevel::None, |h| h.level)
    }

    fn release(&self, instance: InstanceId) {
        let held = self.held.lock().remove(&instance);
        if let Some(Held { oid: Some(oid), .. }) = held {
            self.table.release(self.owner, &oid);
        }
    }

    fn end_transaction(&self) {
        self.release_all();
    }

    fn close(&self) {
        self.release_all();
    }
}

impl Drop for MemoryLockManager {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Lock manager that never locks
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLockManager;

impl LockManager for NoLockManager {
    fn lock(
        &self,
        _instance: InstanceId,
        _oid: Option<&ObjectId>,
        _level: LockLevel,
        _timeout_ms: i64,
    ) -> Result<()> {
        Ok(())
    }

    fn lock_level(&self, _instance: InstanceId) -> LockLevel {
        LockLevel::None
    }

    fn release(&self, _instance: InstanceId) {}

    fn end_transaction(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use persista_core::{ErrorKind, IdKey};

    fn oid(n: i64) -> ObjectId {
        ObjectId::new("Item", IdKey::Long(n))
    }

    #[test]
    fn test_readers_share() {
        let table = LockTable::new();
        let a = table.manager();
        let b = table.manager();
        a.lock(InstanceId::new(1), Some(&oid(1)), LockLevel::Read, 0).unwrap();
        b.lock(InstanceId::new(1), Some(&oid(1)), LockLevel::Read, 0).unwrap();
        assert!(table.is_locked(&oid(1)));
        assert!(!table.is_write_locked(&oid(1)));
    }

    #[test]
    fn test_writer_excludes_and_times_out() {
        let table = LockTable::new();
        let a = table.manager();
        let b = table.manager();
        a.lock(InstanceId::new(1), Some(&oid(1)), LockLevel::Write, 0).unwrap();
        let err = b
            .lock(InstanceId::new(5), Some(&oid(1)), LockLevel::Read, 10)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockTimeout);
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
        assert_eq!(err.failed(), &[InstanceId::new(5)]);
    }

    #[test]
    fn test_upgrade_own_read_lock() {
        let table = LockTable::new();
        let a = table.manager();
        a.lock(InstanceId::new(1), Some(&oid(1)), LockLevel::Read, 0).unwrap();
        a.lock(InstanceId::new(1), Some(&oid(1)), LockLevel::Write, 0).unwrap();
        assert_eq!(a.lock_level(InstanceId::new(1)), LockLevel::Write);
    }

    #[test]
    fn test_end_transaction_releases() {
        let table = LockTable::new();
        let a = table.manager();
        a.lock(InstanceId::new(1), Some(&oid(1)), LockLevel::Write, 0).unwrap();
        a.lock(InstanceId::new(2), None, LockLevel::Write, 0).unwrap();
        assert_eq!(a.held_count(), 2);
        a.end_transaction();
        assert_eq!(a.held_count(), 0);
        assert!(!table.is_locked(&oid(1)));
    }

    #[test]
    fn test_drop_releases() {
        let table = LockTable::new();
        {
            let a = table.manager();
            a.lock(InstanceId::new(1), Some(&oid(1)), LockLevel::Write, 0).unwrap();
        }
        assert!(!table.is_locked(&oid(1)));
    }

    #[test]
    fn test_no_lock_manager_holds_nothing() {
        let m = NoLockManager;
        m.lock(InstanceId::new(1), Some(&oid(1)), LockLevel::Write, 0).unwrap();
        assert_eq!(m.lock_level(InstanceId::new(1)), LockLevel::None);
    }
}
