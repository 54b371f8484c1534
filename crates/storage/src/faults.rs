//! Scripted failures for tests

use parking_lot::Mutex;
use persista_core::{Error, ObjectId, Result};
use rustc_hash::FxHashMap;
use std::time::Duration;

/// Kind of failure to inject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Optimistic conflict
    Optimistic,
    /// Generic store failure
    Store,
    /// Lock timeout
    LockTimeout,
}

impl Fault {
    fn to_error(self, what: &str) -> Error {
        match self {
            Fault::Optimistic => Error::optimistic(format!("injected conflict on {}", what)),
            Fault::Store => Error::store(format!("injected failure on {}", what)),
            Fault::LockTimeout => Error::lock_timeout(format!("injected timeout on {}", what), 0),
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    flush: FxHashMap<ObjectId, Fault>,
    load: FxHashMap<ObjectId, Fault>,
    begin: Option<Fault>,
    commit: Option<Fault>,
    flush_delay: Option<Duration>,
}

/// Failures a [`MemoryStore`](crate::MemoryStore) raises on purpose
///
/// Flush and load faults are keyed by object and persist until cleared;
/// begin and commit faults fire once.
#[derive(Debug, Default)]
pub struct FaultInjector {
    inner: Mutex<Faults>,
}

impl FaultInjector {
    /// No faults
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every flush of `oid`
    pub fn fail_flush(&self, oid: ObjectId, fault: Fault) {
        self.inner.lock().flush.insert(oid, fault);
    }

    /// Fail every load of `oid`
    pub fn fail_load(&self, oid: ObjectId, fault: Fault) {
        self.inner.lock().load.insert(oid, fault);
    }

    /// Fail the next begin
    pub fn fail_next_begin(&self, fault: Fault) {
        self.inner.lock().begin = Some(fault);
    }

    /// Fail the next commit
    pub fn fail_next_commit(&self, fault: Fault) {
        self.inner.lock().commit = Some(fault);
    }

    /// Sleep this long before writing each flush entry
    pub fn delay_flush(&self, delay: Duration) {
        self.inner.lock().flush_delay = Some(delay);
    }

    /// Remove every fault
    pub fn clear(&self) {
        *self.inner.lock() = Faults::default();
    }

    pub(crate) fn check_flush(&self, oid: &ObjectId) -> Result<()> {
        match self.inner.lock().flush.get(oid) {
            Some(fault) => Err(fault.to_error(&oid.to_string())),
            None => Ok(()),
        }
    }

    pub(crate) fn check_load(&self, oid: &ObjectId) -> Result<()> {
        match self.inner.lock().load.get(oid) {
            Some(fault) => Err(fault.to_error(&oid.to_string())),
            None => Ok(()),
        }
    }

    pub(crate) fn check_begin(&self) -> Result<()> {
        match self.inner.lock().begin.take() {
            Some(fault) => Err(fault.to_error("begin")),
            None => Ok(()),
        }
    }

    pub(crate) fn check_commit(&self) -> Result<()> {
        match self.inner.lock().commit.take() {
            Some(fault) => Err(fault.to_error("commit")),
            None => Ok(()),
        }
    }

    pub(crate) fn flush_delay(&self) -> Option<Duration> {
        self.inner.lock().flush_delay
    }
}
