//! In-memory store connection
//!
//! A [`MemoryStore`] is one connection to a [`MemoryDatabase`]. Flushed
//! writes go into a per-connection buffer that is visible to this
//! connection's loads immediately and to everybody else only after commit.
//!
//! ## Flush
//!
//! ```text
//! 1. start the deferred datastore transaction (optimistic mode)
//! 2. assign identities to inserts that have none
//! 3. for each entry, in order:
//!      stop if cancel_all() was called
//!      resolve session references through the assigned identities
//!      validate (duplicate insert, stale version, vanished row)
//!      write into the buffer, advancing the version
//! 4. report every failure; written entries stay written
//! ```
//!
//! ## Commit
//!
//! Every buffered row is validated first-committer-wins against the
//! committed table under the database commit lock, then applied.

use parking_lot::Mutex;
use persista_core::{
    AssignRequest, Error, FieldValue, FlushEntry, FlushFailure, FlushOp, FlushOutcome, IdKey,
    IdentityStrategy, InstanceId, LoadRequest, LoadedState, ObjectId, Result, StoreManager,
    TypeName, Version,
};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::database::{MemoryDatabase, StoredRow};
use crate::faults::FaultInjector;
use crate::validation::{self, ValidationResult};

/// Datastore transaction status of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnStatus {
    /// No transaction
    Idle,
    /// Optimistic transaction noted; datastore transaction not yet started
    Deferred,
    /// Datastore transaction running
    Active,
}

#[derive(Debug)]
struct StoreTxn {
    status: TxnStatus,
    /// Rows written in this transaction; `None` is a delete
    writes: FxHashMap<ObjectId, Option<StoredRow>>,
    /// Committed version of each written row when first written
    base: FxHashMap<ObjectId, Option<Version>>,
}

impl StoreTxn {
    fn new() -> Self {
        StoreTxn {
            status: TxnStatus::Idle,
            writes: FxHashMap::default(),
            base: FxHashMap::default(),
        }
    }

    fn reset(&mut self) {
        self.status = TxnStatus::Idle;
        self.writes.clear();
        self.base.clear();
    }
}

/// Counters of one connection
#[derive(Debug, Default)]
pub struct StoreStats {
    loads: AtomicU64,
    flushes: AtomicU64,
    flushed_entries: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

/// Point-in-time copy of [`StoreStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStatsSnapshot {
    /// Load calls
    pub loads: u64,
    /// Flush calls
    pub flushes: u64,
    /// Entries received by flush
    pub flushed_entries: u64,
    /// Datastore commits
    pub commits: u64,
    /// Datastore rollbacks
    pub rollbacks: u64,
}

impl StoreStats {
    fn snapshot(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            loads: self.loads.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flushed_entries: self.flushed_entries.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the in-flight counter when a flush ends
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        InFlight(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One connection to a [`MemoryDatabase`]
pub struct MemoryStore {
    db: Arc<MemoryDatabase>,
    txn: Mutex<StoreTxn>,
    faults: FaultInjector,
    cancel: AtomicBool,
    in_flight: AtomicUsize,
    stats: StoreStats,
    last_flush: Mutex<Vec<FlushEntry>>,
}

impl MemoryStore {
    pub(crate) fn new(db: Arc<MemoryDatabase>) -> Self {
        MemoryStore {
            db,
            txn: Mutex::new(StoreTxn::new()),
            faults: FaultInjector::new(),
            cancel: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            stats: StoreStats::default(),
            last_flush: Mutex::new(Vec::new()),
        }
    }

    /// Database this connection belongs to
    pub fn database(&self) -> &Arc<MemoryDatabase> {
        &self.db
    }

    /// Fault injection hooks
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Counters
    pub fn stats(&self) -> StoreStatsSnapshot {
        self.stats.snapshot()
    }

    /// Entries received by the most recent flush
    pub fn last_flush(&self) -> Vec<FlushEntry> {
        self.last_flush.lock().clone()
    }

    /// Whether a datastore transaction is running
    pub fn in_datastore_transaction(&self) -> bool {
        self.txn.lock().status == TxnStatus::Active
    }

    /// Number of rows written but not committed
    pub fn pending_writes(&self) -> usize {
        self.txn.lock().writes.len()
    }

    /// Row as this connection sees it
    fn visible(&self, txn: &StoreTxn, oid: &ObjectId) -> Option<StoredRow> {
        match txn.writes.get(oid) {
            Some(buffered) => buffered.clone(),
            None => self.db.get(oid),
        }
    }

    fn write(&self, txn: &mut StoreTxn, oid: ObjectId, row: Option<StoredRow>) {
        if !txn.base.contains_key(&oid) {
            txn.base.insert(oid.clone(), self.db.version_of(&oid));
        }
        txn.writes.insert(oid, row);
    }

    fn assign_identity(&self, type_name: &TypeName, strategy: IdentityStrategy) -> Option<ObjectId> {
        match strategy {
            IdentityStrategy::Sequence | IdentityStrategy::Identity => Some(ObjectId::new(
                type_name.clone(),
                IdKey::Long(self.db.next_sequence(type_name.as_str())),
            )),
            IdentityStrategy::Uuid => Some(ObjectId::new(type_name.clone(), IdKey::random_uuid())),
            IdentityStrategy::Application => None,
        }
    }

    /// Replace session references with durable ones
    fn resolve(
        value: FieldValue,
        assigned: &FxHashMap<InstanceId, ObjectId>,
    ) -> std::result::Result<FieldValue, InstanceId> {
        Ok(match value {
            FieldValue::Ref(id) => match assigned.get(&id) {
                Some(oid) => FieldValue::ObjectRef(oid.clone()),
                None => return Err(id),
            },
            FieldValue::List(items) => FieldValue::List(
                items
                    .into_iter()
                    .map(|v| Self::resolve(v, assigned))
                    .collect::<std::result::Result<_, _>>()?,
            ),
            FieldValue::Map(entries) => FieldValue::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((k, Self::resolve(v, assigned)?)))
                    .collect::<std::result::Result<_, _>>()?,
            ),
            FieldValue::Record(items) => FieldValue::Record(
                items
                    .into_iter()
                    .map(|v| Self::resolve(v, assigned))
                    .collect::<std::result::Result<_, _>>()?,
            ),
            other => other,
        })
    }

    /// Write one entry into the buffer
    fn flush_entry(
        &self,
        txn: &mut StoreTxn,
        entry: &FlushEntry,
        oid: ObjectId,
        assigned: &FxHashMap<InstanceId, ObjectId>,
        outcome: &mut FlushOutcome,
    ) -> Result<()> {
        self.faults.check_flush(&oid)?;

        let mut values = Vec::with_capacity(entry.values.len());
        for (field, value) in &entry.values {
            let value = Self::resolve(value.clone(), assigned).map_err(|target| {
                Error::store(format!(
                    "{} references {} which has no identity",
                    oid, target
                ))
            })?;
            values.push((*field, value));
        }

        let current = self.visible(txn, &oid);
        let current_version = current.as_ref().map(|r| r.version);

        match entry.op {
            FlushOp::Insert => {
                conflicts(validation::validate_insert(&oid, current_version), entry)?;
                let mut row = StoredRow::new(entry.type_name.clone(), values);
                let descriptor = self.db.metadata().descriptor(entry.type_name.as_str())?;
                for field in descriptor.fields().iter().filter(|f| f.generated) {
                    if row.get(field.index).is_null() {
                        let seq = format!("{}.{}", entry.type_name, field.name);
                        let value = FieldValue::Int(self.db.next_sequence(&seq));
                        row.values.insert(field.index, value.clone());
                        outcome.generated.push((entry.instance, field.index, value));
                    }
                }
                outcome.versions.push((entry.instance, row.version));
                self.write(txn, oid, Some(row));
            }
            FlushOp::Update => {
                conflicts(
                    validation::validate_write(
                        &oid,
                        current_version,
                        entry.version,
                        entry.check_version,
                    ),
                    entry,
                )?;
                let Some(mut row) = current else {
                    return Err(Error::internal("validated update without a row"));
                };
                if !values.is_empty() || entry.update_version {
                    row.values.extend(values);
                    row.version = row.version.next();
                }
                outcome.versions.push((entry.instance, row.version));
                self.write(txn, oid, Some(row));
            }
            FlushOp::Delete => {
                if current.is_none() && !entry.check_version {
                    debug!(target: "persista::store", %oid, "Delete of missing row ignored");
                    return Ok(());
                }
                conflicts(
                    validation::validate_write(
                        &oid,
                        current_version,
                        entry.version,
                        entry.check_version,
                    ),
                    entry,
                )?;
                self.write(txn, oid, None);
            }
        }
        Ok(())
    }
}

fn conflicts(result: ValidationResult, entry: &FlushEntry) -> Result<()> {
    match result.conflicts.into_iter().next() {
        Some(conflict) => Err(conflict.into_error(Some(entry.instance))),
        None => Ok(()),
    }
}

impl StoreManager for MemoryStore {
    fn begin(&self) -> Result<()> {
        self.faults.check_begin()?;
        let mut txn = self.txn.lock();
        if txn.status == TxnStatus::Active {
            return Err(Error::invalid_state("datastore transaction already active"));
        }
        txn.reset();
        txn.status = TxnStatus::Active;
        debug!(target: "persista::store", "Datastore transaction started");
        Ok(())
    }

    fn begin_optimistic(&self) -> Result<()> {
        self.faults.check_begin()?;
        let mut txn = self.txn.lock();
        txn.reset();
        txn.status = TxnStatus::Deferred;
        debug!(target: "persista::store", "Optimistic transaction noted");
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let mut txn = self.txn.lock();
        if txn.status == TxnStatus::Idle {
            return Err(Error::invalid_state("no datastore transaction to commit"));
        }
        if let Err(e) = self.faults.check_commit() {
            txn.reset();
            return Err(e);
        }

        let _commit = self.db.lock_commits();
        let mut result = ValidationResult::ok();
        for (oid, base) in &txn.base {
            result.merge(validation::validate_commit(
                oid,
                *base,
                self.db.version_of(oid),
            ));
        }
        if let Some(err) = result.into_error() {
            warn!(target: "persista::store", error = %err, "Commit validation failed");
            txn.reset();
            self.stats.rollbacks.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }

        let writes = std::mem::take(&mut txn.writes);
        let count = writes.len();
        self.db.apply(writes);
        txn.reset();
        self.stats.commits.fetch_add(1, Ordering::Relaxed);
        info!(target: "persista::store", rows = count, "Datastore transaction committed");
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let mut txn = self.txn.lock();
        let discarded = txn.writes.len();
        txn.reset();
        self.stats.rollbacks.fetch_add(1, Ordering::Relaxed);
        debug!(target: "persista::store", discarded, "Datastore transaction rolled back");
        Ok(())
    }

    fn rollback_optimistic(&self) -> Result<()> {
        let mut txn = self.txn.lock();
        if txn.status == TxnStatus::Active {
            warn!(target: "persista::store", "Optimistic rollback of a started datastore transaction");
        }
        txn.reset();
        Ok(())
    }

    fn load(&self, request: &LoadRequest) -> Result<Option<LoadedState>> {
        self.stats.loads.fetch_add(1, Ordering::Relaxed);
        self.faults.check_load(&request.oid)?;
        let txn = self.txn.lock();
        let Some(row) = self.visible(&txn, &request.oid) else {
            return Ok(None);
        };
        let values = request
            .fields
            .iter()
            .map(|field| (field, row.get(field)))
            .collect();
        Ok(Some(LoadedState {
            values,
            version: Some(row.version),
        }))
    }

    fn flush(&self, entries: &[FlushEntry]) -> FlushOutcome {
        self.cancel.store(false, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.in_flight);
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .flushed_entries
            .fetch_add(entries.len() as u64, Ordering::Relaxed);
        *self.last_flush.lock() = entries.to_vec();

        let mut outcome = FlushOutcome::default();
        let mut txn = self.txn.lock();
        match txn.status {
            TxnStatus::Idle => {
                outcome.failures.push(FlushFailure {
                    instance: None,
                    error: Error::store("flush outside a datastore transaction"),
                });
                return outcome;
            }
            TxnStatus::Deferred => {
                txn.status = TxnStatus::Active;
                debug!(target: "persista::store", "Deferred datastore transaction started");
            }
            TxnStatus::Active => {}
        }

        let mut assigned: FxHashMap<InstanceId, ObjectId> = FxHashMap::default();
        for entry in entries {
            if let Some(oid) = &entry.oid {
                assigned.insert(entry.instance, oid.clone());
                continue;
            }
            if entry.op != FlushOp::Insert {
                continue;
            }
            let strategy = match self.db.metadata().descriptor(entry.type_name.as_str()) {
                Ok(d) => d.identity(),
                Err(e) => {
                    outcome.failures.push(FlushFailure {
                        instance: Some(entry.instance),
                        error: e,
                    });
                    continue;
                }
            };
            if let Some(oid) = self.assign_identity(&entry.type_name, strategy) {
                outcome.assigned.push((entry.instance, oid.clone()));
                assigned.insert(entry.instance, oid);
            }
        }

        let delay = self.faults.flush_delay();
        for entry in entries {
            if outcome.failed(entry.instance) {
                continue;
            }
            if self.cancel.load(Ordering::SeqCst) {
                outcome.failures.push(FlushFailure {
                    instance: Some(entry.instance),
                    error: Error::store("flush cancelled").with_failed(entry.instance),
                });
                continue;
            }
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
            let Some(oid) = assigned.get(&entry.instance).cloned() else {
                outcome.failures.push(FlushFailure {
                    instance: Some(entry.instance),
                    error: Error::user(format!(
                        "{} of type {} has no identity",
                        entry.instance, entry.type_name
                    ))
                    .with_failed(entry.instance),
                });
                continue;
            };
            if let Err(error) = self.flush_entry(&mut txn, entry, oid, &assigned, &mut outcome) {
                debug!(target: "persista::store", instance = %entry.instance, %error, "Flush entry failed");
                outcome.failures.push(FlushFailure {
                    instance: Some(entry.instance),
                    error,
                });
            }
        }
        outcome
    }

    fn assign_object_id(&self, request: &AssignRequest) -> Result<Option<ObjectId>> {
        match request.strategy {
            IdentityStrategy::Application => Err(Error::user(format!(
                "type {} uses application identity; its id comes from primary key fields",
                request.type_name
            ))),
            // generated by the insert itself
            IdentityStrategy::Identity => Ok(None),
            strategy => Ok(self.assign_identity(&request.type_name, strategy)),
        }
    }

    fn assign_field(
        &self,
        type_name: &TypeName,
        field: usize,
        _pre_flush: bool,
    ) -> Result<Option<FieldValue>> {
        let descriptor = self.db.metadata().descriptor(type_name.as_str())?;
        let Some(fd) = descriptor.field(field) else {
            return Err(Error::user(format!("{} has no field {}", type_name, field)));
        };
        if !fd.generated {
            return Err(Error::user(format!(
                "field {}.{} is not generated",
                type_name, fd.name
            )));
        }
        let seq = format!("{}.{}", type_name, fd.name);
        Ok(Some(FieldValue::Int(self.db.next_sequence(&seq))))
    }

    fn exists(&self, oid: &ObjectId) -> Result<bool> {
        let txn = self.txn.lock();
        Ok(self.visible(&txn, oid).is_some())
    }

    fn sync_version(&self, oid: &ObjectId, version: Option<Version>) -> Result<bool> {
        let txn = self.txn.lock();
        Ok(self.visible(&txn, oid).map(|r| r.version) == version)
    }

    fn cancel_all(&self) -> Result<bool> {
        if self.in_flight.load(Ordering::SeqCst) == 0 {
            return Ok(false);
        }
        self.cancel.store(true, Ordering::SeqCst);
        info!(target: "persista::store", "Cancelling in-flight flush");
        Ok(true)
    }

    fn close(&self) -> Result<()> {
        self.txn.lock().reset();
        Ok(())
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persista_core::{
        ErrorKind, FieldDescriptor, FieldSet, LockLevel, StaticRepository, TypeDescriptor,
    };

    fn repo() -> Arc<StaticRepository> {
        let repo = StaticRepository::new()
            .with(
                TypeDescriptor::builder("Item")
                    .field(FieldDescriptor::new("id").primary_key())
                    .field(FieldDescriptor::new("name"))
                    .build()
                    .unwrap(),
            )
            .with(
                TypeDescriptor::builder("Event")
                    .identity(IdentityStrategy::Identity)
                    .field(FieldDescriptor::new("id").primary_key())
                    .field(FieldDescriptor::new("seq").generated())
                    .build()
                    .unwrap(),
            );
        Arc::new(repo)
    }

    fn store() -> MemoryStore {
        MemoryDatabase::new(repo()).connect()
    }

    fn item(n: i64) -> ObjectId {
        ObjectId::new("Item", IdKey::Long(n))
    }

    fn insert(instance: u64, oid: Option<ObjectId>, ty: &str, values: Vec<(usize, FieldValue)>) -> FlushEntry {
        FlushEntry {
            instance: InstanceId::new(instance),
            oid,
            type_name: TypeName::new(ty),
            op: FlushOp::Insert,
            values,
            version: None,
            check_version: false,
            update_version: false,
        }
    }

    fn load(store: &MemoryStore, oid: ObjectId) -> Option<LoadedState> {
        store
            .load(&LoadRequest {
                instance: InstanceId::new(1),
                oid,
                fields: FieldSet::full(2),
                lock_level: LockLevel::None,
                fetch_groups: Vec::new(),
            })
            .unwrap()
    }

    #[test]
    fn test_writes_visible_only_after_commit() {
        let store = store();
        let other = store.database().connect();
        store.begin().unwrap();
        let outcome = store.flush(&[insert(1, Some(item(1)), "Item", vec![(1, "a".into())])]);
        assert!(outcome.is_success());
        assert!(load(&store, item(1)).is_some());
        assert!(load(&other, item(1)).is_none());
        store.commit().unwrap();
        assert_eq!(load(&other, item(1)).unwrap().values[1].1, FieldValue::from("a"));
    }

    #[test]
    fn test_rollback_discards() {
        let store = store();
        store.begin().unwrap();
        store.flush(&[insert(1, Some(item(1)), "Item", vec![])]);
        store.rollback().unwrap();
        assert!(store.database().is_empty());
        assert_eq!(store.pending_writes(), 0);
    }

    #[test]
    fn test_optimistic_defers_datastore_transaction() {
        let store = store();
        store.begin_optimistic().unwrap();
        assert!(!store.in_datastore_transaction());
        store.flush(&[insert(1, Some(item(1)), "Item", vec![])]);
        assert!(store.in_datastore_transaction());
        store.commit().unwrap();
        assert!(!store.in_datastore_transaction());
    }

    #[test]
    fn test_flush_without_transaction_fails_whole_batch() {
        let store = store();
        let outcome = store.flush(&[insert(1, Some(item(1)), "Item", vec![])]);
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].instance.is_none());
    }

    #[test]
    fn test_identity_assigned_at_insert_and_refs_resolved() {
        let store = store();
        store.begin().unwrap();
        let event = insert(7, None, "Event", vec![]);
        let referrer = insert(
            8,
            Some(item(1)),
            "Item",
            vec![(1, FieldValue::Ref(InstanceId::new(7)))],
        );
        let outcome = store.flush(&[referrer, event]);
        assert!(outcome.is_success(), "{:?}", outcome.failures);
        assert_eq!(outcome.assigned.len(), 1);
        let (instance, oid) = &outcome.assigned[0];
        assert_eq!(*instance, InstanceId::new(7));
        assert_eq!(outcome.generated.len(), 1);
        let row = load(&store, item(1)).unwrap();
        assert_eq!(row.values[1].1, FieldValue::ObjectRef(oid.clone()));
    }

    #[test]
    fn test_unresolved_reference_fails_entry() {
        let store = store();
        store.begin().unwrap();
        let outcome = store.flush(&[insert(
            1,
            Some(item(1)),
            "Item",
            vec![(1, FieldValue::Ref(InstanceId::new(99)))],
        )]);
        assert!(outcome.failed(InstanceId::new(1)));
    }

    #[test]
    fn test_stale_update_is_optimistic_and_others_succeed() {
        let store = store();
        let db = Arc::clone(store.database());
        let v = db.put(item(1), vec![(1, "a".into())]);
        db.put(item(2), vec![(1, "b".into())]);
        db.touch(&item(1));

        store.begin().unwrap();
        let update = |instance, oid| FlushEntry {
            instance: InstanceId::new(instance),
            oid: Some(oid),
            type_name: TypeName::new("Item"),
            op: FlushOp::Update,
            values: vec![(1, "z".into())],
            version: Some(v),
            check_version: true,
            update_version: false,
        };
        let outcome = store.flush(&[update(1, item(1)), update(2, item(2))]);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].error.kind(), ErrorKind::Optimistic);
        assert!(outcome.failed(InstanceId::new(1)));
        assert_eq!(outcome.versions.len(), 1);
    }

    #[test]
    fn test_first_committer_wins() {
        let store = store();
        let db = Arc::clone(store.database());
        db.put(item(1), vec![(1, "a".into())]);
        store.begin().unwrap();
        let outcome = store.flush(&[FlushEntry {
            instance: InstanceId::new(1),
            oid: Some(item(1)),
            type_name: TypeName::new("Item"),
            op: FlushOp::Update,
            values: vec![(1, "mine".into())],
            version: None,
            check_version: false,
            update_version: false,
        }]);
        assert!(outcome.is_success());
        db.touch(&item(1));
        let err = store.commit().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Optimistic);
        assert_eq!(db.get(&item(1)).unwrap().get(1), FieldValue::from("a"));
    }

    #[test]
    fn test_assign_object_id_by_strategy() {
        let store = store();
        let req = |strategy| AssignRequest {
            instance: InstanceId::new(1),
            type_name: TypeName::new("Event"),
            strategy,
            pre_flush: false,
        };
        assert!(store.assign_object_id(&req(IdentityStrategy::Identity)).unwrap().is_none());
        let a = store.assign_object_id(&req(IdentityStrategy::Sequence)).unwrap().unwrap();
        let b = store.assign_object_id(&req(IdentityStrategy::Sequence)).unwrap().unwrap();
        assert_ne!(a, b);
        assert!(matches!(
            store.assign_object_id(&req(IdentityStrategy::Uuid)).unwrap().unwrap().key(),
            IdKey::Uuid(_)
        ));
        assert!(store.assign_object_id(&req(IdentityStrategy::Application)).is_err());
    }

    #[test]
    fn test_assign_field_only_for_generated() {
        let store = store();
        let event = TypeName::new("Event");
        assert_eq!(
            store.assign_field(&event, 1, true).unwrap(),
            Some(FieldValue::Int(1))
        );
        assert!(store.assign_field(&event, 0, true).is_err());
    }

    #[test]
    fn test_cancel_without_flush_is_noop() {
        let store = store();
        assert!(!store.cancel_all().unwrap());
    }

    #[test]
    fn test_sync_version_and_exists() {
        let store = store();
        let v = store.database().put(item(3), vec![]);
        assert!(store.exists(&item(3)).unwrap());
        assert!(store.sync_version(&item(3), Some(v)).unwrap());
        assert!(!store.sync_version(&item(3), Some(v.next())).unwrap());
        assert!(!store.exists(&item(4)).unwrap());
    }
}
