//! Collaborator traits for storage and locking
//!
//! The kernel never touches rows, SQL or lock tables itself. Everything
//! durable goes through a [`StoreManager`]; every datastore lock through a
//! [`LockManager`]. Both are shared by reference and must be safe to call
//! from more than one thread (`Send + Sync`): a watchdog thread may call
//! [`StoreManager::cancel_all`] while the owning session is blocked in a flush.

use crate::error::Result;
use crate::fields::FieldSet;
use crate::id::{InstanceId, ObjectId, TypeName};
use crate::lock::LockLevel;
use crate::meta::IdentityStrategy;
use crate::value::FieldValue;
use crate::version::Version;

/// Request to populate some fields of one persistent instance
#[derive(Debug, Clone)]
pub struct LoadRequest {
    /// Instance being loaded
    pub instance: InstanceId,
    /// Its durable identity
    pub oid: ObjectId,
    /// Fields to populate
    pub fields: FieldSet,
    /// Lock to take while reading
    pub lock_level: LockLevel,
    /// Active fetch groups, for stores that prefetch
    pub fetch_groups: Vec<String>,
}

/// Field values read from the store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedState {
    /// `(field index, value)` for each populated field
    pub values: Vec<(usize, FieldValue)>,
    /// Version token of the row
    pub version: Option<Version>,
}

/// Kind of write a flushed instance needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOp {
    /// New row
    Insert,
    /// Changed row
    Update,
    /// Removed row
    Delete,
}

/// One instance handed to [`StoreManager::flush`]
#[derive(Debug, Clone)]
pub struct FlushEntry {
    /// Instance being written
    pub instance: InstanceId,
    /// Durable identity, `None` when the store generates it on insert
    pub oid: Option<ObjectId>,
    /// Type of the instance
    pub type_name: TypeName,
    /// Write kind
    pub op: FlushOp,
    /// Inserts carry every loaded persistent field, updates only the
    /// dirty fields not yet flushed, deletes nothing
    pub values: Vec<(usize, FieldValue)>,
    /// Version observed when the instance was loaded
    pub version: Option<Version>,
    /// Compare `version` with the stored one before writing
    pub check_version: bool,
    /// Advance the version even if no field changed
    pub update_version: bool,
}

/// Failure of one entry (or of the whole batch when `instance` is `None`)
#[derive(Debug, Clone)]
pub struct FlushFailure {
    /// Instance whose write failed
    pub instance: Option<InstanceId>,
    /// Cause
    pub error: crate::error::Error,
}

/// Result of a bulk flush
///
/// Flush does not stop at the first failure; every entry that could be
/// written is written and every failure is reported.
#[derive(Debug, Clone, Default)]
pub struct FlushOutcome {
    /// Per-entry failures
    pub failures: Vec<FlushFailure>,
    /// Identities generated during insert
    pub assigned: Vec<(InstanceId, ObjectId)>,
    /// New versions of successfully written rows
    pub versions: Vec<(InstanceId, Version)>,
    /// Store-generated field values `(instance, field, value)`
    pub generated: Vec<(InstanceId, usize, FieldValue)>,
}

impl FlushOutcome {
    /// Whether every entry was written
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Whether the given instance failed
    pub fn failed(&self, instance: InstanceId) -> bool {
        self.failures.iter().any(|f| f.instance == Some(instance))
    }
}

/// Request for a durable identity
#[derive(Debug, Clone)]
pub struct AssignRequest {
    /// Instance needing an identity
    pub instance: InstanceId,
    /// Its type
    pub type_name: TypeName,
    /// Identity strategy of the type
    pub strategy: IdentityStrategy,
    /// Whether the caller is preparing a flush
    pub pre_flush: bool,
}

/// Storage abstraction
///
/// Thread safety: all methods must be safe to call concurrently from
/// multiple threads (requires Send + Sync).
pub trait StoreManager: Send + Sync {
    /// Start a datastore transaction immediately (pessimistic)
    fn begin(&self) -> Result<()>;

    /// Note the start of an optimistic transaction; the datastore
    /// transaction is deferred until the first flush
    fn begin_optimistic(&self) -> Result<()>;

    /// Commit the datastore transaction
    fn commit(&self) -> Result<()>;

    /// Roll back the datastore transaction
    fn rollback(&self) -> Result<()>;

    /// End an optimistic transaction that never started a datastore
    /// transaction
    fn rollback_optimistic(&self) -> Result<()>;

    /// Populate fields of one instance
    ///
    /// Returns `None` if the row does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage operation fails.
    fn load(&self, request: &LoadRequest) -> Result<Option<LoadedState>>;

    /// Populate many instances; `None` entries did not exist
    fn load_all(&self, requests: &[LoadRequest]) -> Result<Vec<(InstanceId, Option<LoadedState>)>> {
        requests
            .iter()
            .map(|r| Ok((r.instance, self.load(r)?)))
            .collect()
    }

    /// Write every entry, collecting failures instead of stopping
    fn flush(&self, entries: &[FlushEntry]) -> FlushOutcome;

    /// Produce a durable identity
    ///
    /// Returns `None` when the identity only exists after the row is
    /// inserted.
    fn assign_object_id(&self, request: &AssignRequest) -> Result<Option<ObjectId>>;

    /// Produce a generated value for a field
    ///
    /// Returns `None` when the value only exists after the row is inserted.
    fn assign_field(&self, type_name: &TypeName, field: usize, pre_flush: bool)
        -> Result<Option<FieldValue>>;

    /// Whether a row exists for `oid`
    fn exists(&self, oid: &ObjectId) -> Result<bool>;

    /// Whether `version` is still the stored version of `oid`
    fn sync_version(&self, oid: &ObjectId, version: Option<Version>) -> Result<bool>;

    /// Abort statements in flight
    ///
    /// Called from another thread without the session lock. Returns whether
    /// anything was cancelled.
    fn cancel_all(&self) -> Result<bool>;

    /// Release resources
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Datastore lock abstraction
///
/// Timeouts are in milliseconds; `-1` waits forever. A timeout surfaces as
/// a retryable `Error::LockTimeout`.
pub trait LockManager: Send + Sync {
    /// A transaction started
    fn begin_transaction(&self) {}

    /// Lock one instance at `level` or above
    ///
    /// # Errors
    ///
    /// Returns `Error::LockTimeout` when the lock is not granted in time.
    fn lock(
        &self,
        instance: InstanceId,
        oid: Option<&ObjectId>,
        level: LockLevel,
        timeout_ms: i64,
    ) -> Result<()>;

    /// Lock several instances
    fn lock_all(
        &self,
        targets: &[(InstanceId, Option<ObjectId>)],
        level: LockLevel,
        timeout_ms: i64,
    ) -> Result<()> {
        for (instance, oid) in targets {
            self.lock(*instance, oid.as_ref(), level, timeout_ms)?;
        }
        Ok(())
    }

    /// Level currently held for `instance`
    fn lock_level(&self, instance: InstanceId) -> LockLevel;

    /// Release the lock on one instance
    fn release(&self, instance: InstanceId);

    /// The instance was refreshed; re-validate any held lock
    fn refresh_lock(&self, _instance: InstanceId) -> Result<()> {
        Ok(())
    }

    /// The transaction ended; release everything
    fn end_transaction(&self);

    /// The session closed
    fn close(&self) {}
}
