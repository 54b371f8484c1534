//! Shared committed table
//!
//! # Design
//!
//! - DashMap: sharded, lock-free reads of committed rows
//! - Commit lock: validation and application of one connection's writes
//!   happen under a single mutex, so first-committer-wins is exact
//! - Sequences: per-key counters used for datastore identities and
//!   generated field values

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use persista_core::{FieldValue, MetadataRepository, ObjectId, TypeName, Version};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::store::MemoryStore;

/// One stored row
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    /// Type of the stored instance
    pub type_name: TypeName,
    /// Field values by declared index
    pub values: BTreeMap<usize, FieldValue>,
    /// Version token
    pub version: Version,
}

impl StoredRow {
    /// New row at the initial version
    pub fn new(type_name: TypeName, values: impl IntoIterator<Item = (usize, FieldValue)>) -> Self {
        StoredRow {
            type_name,
            values: values.into_iter().collect(),
            version: Version::initial(),
        }
    }

    /// Value of one field, `Null` when never written
    pub fn get(&self, field: usize) -> FieldValue {
        self.values.get(&field).cloned().unwrap_or_default()
    }
}

/// The committed state shared by every [`MemoryStore`] connection
pub struct MemoryDatabase {
    metadata: Arc<dyn MetadataRepository>,
    rows: DashMap<ObjectId, StoredRow>,
    sequences: DashMap<String, i64>,
    commit_lock: Mutex<()>,
    commits: AtomicU64,
}

impl MemoryDatabase {
    /// Empty database over the given metadata
    pub fn new(metadata: Arc<dyn MetadataRepository>) -> Arc<Self> {
        Arc::new(MemoryDatabase {
            metadata,
            rows: DashMap::new(),
            sequences: DashMap::new(),
            commit_lock: Mutex::new(()),
            commits: AtomicU64::new(0),
        })
    }

    /// Open a connection
    pub fn connect(self: &Arc<Self>) -> MemoryStore {
        MemoryStore::new(Arc::clone(self))
    }

    /// Metadata the database was created with
    pub fn metadata(&self) -> &Arc<dyn MetadataRepository> {
        &self.metadata
    }

    /// Committed row, if any
    pub fn get(&self, oid: &ObjectId) -> Option<StoredRow> {
        self.rows.get(oid).map(|r| r.value().clone())
    }

    /// Committed version, if the row exists
    pub fn version_of(&self, oid: &ObjectId) -> Option<Version> {
        self.rows.get(oid).map(|r| r.version)
    }

    /// Whether a committed row exists
    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.rows.contains_key(oid)
    }

    /// Number of committed rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether no rows are committed
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of successful commits that wrote something
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Write a committed row directly, outside any transaction
    ///
    /// Returns the version of the written row. Used to seed data and to
    /// simulate a concurrent writer.
    pub fn put(
        &self,
        oid: ObjectId,
        values: impl IntoIterator<Item = (usize, FieldValue)>,
    ) -> Version {
        let _guard = self.commit_lock.lock();
        match self.rows.entry(oid) {
            Entry::Occupied(mut e) => {
                let row = e.get_mut();
                row.values.extend(values);
                row.version = row.version.next();
                row.version
            }
            Entry::Vacant(e) => {
                let row = StoredRow::new(e.key().type_name().clone(), values);
                let version = row.version;
                e.insert(row);
                version
            }
        }
    }

    /// Advance the version of a committed row, as a concurrent update would
    pub fn touch(&self, oid: &ObjectId) -> Option<Version> {
        let _guard = self.commit_lock.lock();
        self.rows.get_mut(oid).map(|mut r| {
            r.version = r.version.next();
            r.version
        })
    }

    /// Remove a committed row directly, as a concurrent delete would
    pub fn remove(&self, oid: &ObjectId) -> Option<StoredRow> {
        let _guard = self.commit_lock.lock();
        self.rows.remove(oid).map(|(_, row)| row)
    }

    /// Next value of the named sequence, starting at 1
    pub fn next_sequence(&self, name: &str) -> i64 {
        let mut entry = self.sequences.entry(name.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub(crate) fn lock_commits(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }

    /// Apply validated writes; caller holds the commit lock
    pub(crate) fn apply(&self, writes: impl IntoIterator<Item = (ObjectId, Option<StoredRow>)>) {
        let mut any = false;
        for (oid, row) in writes {
            any = true;
            match row {
                Some(row) => {
                    self.rows.insert(oid, row);
                }
                None => {
                    self.rows.remove(&oid);
                }
            }
        }
        if any {
            self.commits.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("rows", &self.rows.len())
            .field("commits", &self.commit_count())
            .finish()
    }
}
