//! Managed instances
//!
//! A [`ManagedInstance`] is the per-object bookkeeping the session keeps:
//! lifecycle state, field values, and three bit sets over the declared
//! fields.
//!
//! ```text
//! loaded   fields whose value is present
//! dirty    fields changed in the current transaction      (dirty ⊆ loaded)
//! flushed  dirty fields already written by a flush        (flushed ⊆ dirty)
//! ```
//!
//! Rollback support comes in two layers. [`SavedFields`] is the
//! pre-transaction image, filled lazily one field at a time before the field
//! is first changed. [`InstanceSnapshot`] is a full copy taken for a
//! savepoint.
//!
//! Methods here only touch the instance itself. Anything that involves other
//! instances, the store or listeners goes through the session.

use persista_core::{
    FieldSet, FieldValue, InstanceId, ObjectId, TypeDescriptor, TypeName, Version,
};
use persista_lifecycle::PersistentState;
use std::sync::Arc;

use crate::config::RestoreState;

/// Pre-transaction image of an instance
#[derive(Debug, Clone, PartialEq)]
pub struct SavedFields {
    policy: RestoreState,
    loaded: FieldSet,
    values: Vec<Option<FieldValue>>,
    unrestorable: FieldSet,
    version: Option<Version>,
}

impl SavedFields {
    /// Fields that were loaded when the image was taken
    pub fn loaded(&self) -> &FieldSet {
        &self.loaded
    }

    /// Whether `field` has a saved value
    pub fn is_saved(&self, field: usize) -> bool {
        self.values.get(field).map_or(false, Option::is_some)
    }
}

/// Owner of an embedded instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    /// Owning instance
    pub instance: InstanceId,
    /// Field of the owner holding the embedded value
    pub field: usize,
}

/// Full copy of an instance taken by a savepoint
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceSnapshot {
    state: PersistentState,
    oid: Option<ObjectId>,
    values: Vec<FieldValue>,
    loaded: FieldSet,
    dirty: FieldSet,
    flushed: FieldSet,
    version: Option<Version>,
    saved: Option<SavedFields>,
    flags: InstanceFlags,
}

impl InstanceSnapshot {
    /// State at snapshot time
    pub fn state(&self) -> PersistentState {
        self.state
    }

    /// Field values at snapshot time
    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }
}

/// Per-instance flags that live for one transaction at most
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct InstanceFlags {
    /// A flush wrote this instance in the current transaction
    pub flushed: bool,
    /// Pre-flush work already ran in the current flush
    pub pre_flushed: bool,
    /// A load is in progress
    pub loading: bool,
    /// Dependent that lost its last reference
    pub dereferenced: bool,
    /// Explicit version-check override
    pub version_check: Option<bool>,
    /// Bump the version at flush even without field changes
    pub version_update: bool,
}

/// Per-object bookkeeping owned by a session
#[derive(Debug, Clone)]
pub struct ManagedInstance {
    id: InstanceId,
    descriptor: Arc<TypeDescriptor>,
    state: PersistentState,
    oid: Option<ObjectId>,
    values: Vec<FieldValue>,
    loaded: FieldSet,
    dirty: FieldSet,
    flushed: FieldSet,
    version: Option<Version>,
    saved: Option<SavedFields>,
    owner: Option<Owner>,
    pub(crate) flags: InstanceFlags,
}

impl ManagedInstance {
    /// Transient instance with every field present and null
    pub fn transient(id: InstanceId, descriptor: Arc<TypeDescriptor>) -> Self {
        let n = descriptor.field_count();
        ManagedInstance {
            id,
            state: PersistentState::Transient,
            oid: None,
            values: vec![FieldValue::Null; n],
            loaded: FieldSet::full(n),
            dirty: FieldSet::new(),
            flushed: FieldSet::new(),
            version: None,
            saved: None,
            owner: None,
            flags: InstanceFlags::default(),
            descriptor,
        }
    }

    /// Hollow instance standing for a stored object
    ///
    /// Only the primary key and non-persistent fields count as loaded.
    pub fn hollow(id: InstanceId, descriptor: Arc<TypeDescriptor>, oid: ObjectId) -> Self {
        let mut inst = Self::transient(id, descriptor);
        inst.loaded = inst.descriptor.inherently_loaded().clone();
        inst.fill_key(&oid);
        inst.oid = Some(oid);
        inst.state = PersistentState::Hollow;
        inst
    }

    /// Embedded instance owned by a field of another instance
    pub fn embedded(
        id: InstanceId,
        descriptor: Arc<TypeDescriptor>,
        owner: Owner,
        state: PersistentState,
    ) -> Self {
        let mut inst = Self::transient(id, descriptor);
        inst.owner = Some(owner);
        inst.state = state;
        inst
    }

    /// Copy the key parts of `oid` into the primary key fields
    fn fill_key(&mut self, oid: &ObjectId) {
        let pk: Vec<usize> = self.descriptor.pk_fields().iter().collect();
        let parts = match oid.key() {
            persista_core::IdKey::Composite(parts) => parts.clone(),
            single => vec![single.clone()],
        };
        if parts.len() != pk.len() {
            return;
        }
        for (index, part) in pk.into_iter().zip(parts) {
            self.values[index] = match part {
                persista_core::IdKey::Long(n) => FieldValue::Int(n),
                persista_core::IdKey::Text(s) => FieldValue::Text(s),
                _ => continue,
            };
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Session-local id
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Type metadata
    pub fn descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.descriptor
    }

    /// Type name
    pub fn type_name(&self) -> &TypeName {
        self.descriptor.name()
    }

    /// Lifecycle state
    pub fn state(&self) -> PersistentState {
        self.state
    }

    /// Durable id, once assigned
    pub fn oid(&self) -> Option<&ObjectId> {
        self.oid.as_ref()
    }

    /// Version loaded or last written
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// Owner, for embedded instances
    pub fn owner(&self) -> Option<Owner> {
        self.owner
    }

    /// Current value of a field, loaded or not
    pub fn value(&self, field: usize) -> &FieldValue {
        self.values.get(field).unwrap_or(&FieldValue::Null)
    }

    /// Every field value
    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    /// Loaded fields
    pub fn loaded(&self) -> &FieldSet {
        &self.loaded
    }

    /// Fields changed in this transaction
    pub fn dirty(&self) -> &FieldSet {
        &self.dirty
    }

    /// Dirty fields already written
    pub fn flushed_fields(&self) -> &FieldSet {
        &self.flushed
    }

    /// Dirty fields not yet written
    pub fn unflushed_dirty(&self) -> FieldSet {
        self.dirty.difference(&self.flushed)
    }

    /// Whether `field` is loaded
    pub fn is_loaded(&self, field: usize) -> bool {
        self.loaded.contains(field)
    }

    /// Whether a flush wrote this instance in the current transaction
    pub fn is_flushed(&self) -> bool {
        self.flags.flushed
    }

    /// Whether the instance lost its last reference as a dependent
    pub fn is_dereferenced(&self) -> bool {
        self.flags.dereferenced
    }

    /// Pre-transaction image, when one is kept
    pub fn saved(&self) -> Option<&SavedFields> {
        self.saved.as_ref()
    }

    // =========================================================================
    // Mutation (crate only; the session enforces the lifecycle)
    // =========================================================================

    pub(crate) fn set_state(&mut self, state: PersistentState) {
        self.state = state;
    }

    pub(crate) fn set_oid(&mut self, oid: Option<ObjectId>) {
        self.oid = oid;
    }

    /// Take `oid` as identity and copy its key into the primary key fields
    pub(crate) fn assign_key(&mut self, oid: ObjectId) {
        self.fill_key(&oid);
        self.oid = Some(oid);
    }

    pub(crate) fn set_version(&mut self, version: Option<Version>) {
        self.version = version;
    }

    /// Store a value that came from the store or the datastore
    pub(crate) fn set_loaded_value(&mut self, field: usize, value: FieldValue) {
        if field < self.values.len() {
            self.values[field] = value;
            self.loaded.insert(field);
        }
    }

    /// Store a value without any tracking
    pub(crate) fn set_untracked(&mut self, field: usize, value: FieldValue) {
        self.set_loaded_value(field, value);
    }

    /// Record a change: the value, and the field as loaded and dirty
    ///
    /// A previously flushed change becomes unflushed again.
    pub(crate) fn write(&mut self, field: usize, value: FieldValue) {
        if field >= self.values.len() {
            return;
        }
        self.values[field] = value;
        self.loaded.insert(field);
        self.dirty.insert(field);
        self.flushed.remove(field);
    }

    /// Mark a loaded field dirty without changing it
    pub(crate) fn touch(&mut self, field: usize) {
        if self.loaded.contains(field) {
            self.dirty.insert(field);
            self.flushed.remove(field);
        }
    }

    /// Forget the values of `fields`; inherently loaded fields stay
    pub(crate) fn unload(&mut self, fields: &FieldSet) {
        let inherent = self.descriptor.inherently_loaded().clone();
        for field in fields.iter() {
            if inherent.contains(field) || field >= self.values.len() {
                continue;
            }
            self.values[field] = FieldValue::Null;
            self.loaded.remove(field);
            self.dirty.remove(field);
            self.flushed.remove(field);
        }
    }

    /// Back to hollow: only inherently loaded fields remain, no version
    pub(crate) fn clear_fields(&mut self) {
        let loaded = self.loaded.clone();
        self.unload(&loaded);
        self.dirty.clear();
        self.flushed.clear();
        self.version = None;
    }

    /// Everything written so far counts as flushed
    pub(crate) fn mark_flushed(&mut self) {
        self.flushed.union_with(&self.dirty);
        self.flags.flushed = true;
        self.flags.pre_flushed = false;
        self.flags.version_update = false;
    }

    /// Transaction over: nothing is dirty any more
    pub(crate) fn end_transaction(&mut self) {
        self.dirty.clear();
        self.flushed.clear();
        let dereferenced = self.flags.dereferenced && self.state.is_persistent();
        self.flags = InstanceFlags {
            dereferenced,
            ..InstanceFlags::default()
        };
        if !self.state.is_persistent() {
            self.flags.dereferenced = false;
        }
    }

    // =========================================================================
    // Saved image
    // =========================================================================

    /// Start a new pre-transaction image
    ///
    /// Values are saved lazily by [`save_field`](Self::save_field).
    pub(crate) fn save_fields(&mut self, policy: RestoreState) {
        if policy == RestoreState::None {
            self.saved = None;
            return;
        }
        self.saved = Some(SavedFields {
            policy,
            loaded: self.loaded.clone(),
            values: vec![None; self.values.len()],
            unrestorable: FieldSet::new(),
            version: self.version,
        });
    }

    /// Save the current value of `field` unless already saved
    ///
    /// Mutable containers are only saved under [`RestoreState::All`]; under
    /// `Immutable` they are unloaded on restore instead.
    pub(crate) fn save_field(&mut self, field: usize) {
        let Some(saved) = self.saved.as_mut() else {
            return;
        };
        if !saved.loaded.contains(field) || saved.is_saved(field) {
            return;
        }
        let value = &self.values[field];
        if saved.policy == RestoreState::All || !value.is_second_class() {
            saved.values[field] = Some(value.clone());
        } else {
            saved.unrestorable.insert(field);
        }
    }

    /// Put back the pre-transaction image
    ///
    /// Saved values come back; fields loaded since the image was taken, and
    /// containers that could not be saved, are unloaded. Without an image
    /// the instance is cleared.
    pub(crate) fn restore_fields(&mut self) {
        let Some(saved) = self.saved.take() else {
            self.clear_fields();
            return;
        };
        let mut unload = FieldSet::new();
        for field in 0..self.values.len() {
            if let Some(Some(value)) = saved.values.get(field) {
                self.values[field] = value.clone();
                self.loaded.insert(field);
            } else if saved.unrestorable.contains(field)
                || (self.loaded.contains(field) && !saved.loaded.contains(field))
            {
                unload.insert(field);
            }
        }
        self.unload(&unload);
        self.dirty.clear();
        self.flushed.clear();
        self.version = saved.version;
    }

    pub(crate) fn clear_saved(&mut self) {
        self.saved = None;
    }

    /// Point references to `target` at `with`, saved image included
    pub(crate) fn replace_refs(&mut self, target: InstanceId, with: &FieldValue) {
        for value in &mut self.values {
            value.replace_ref(target, with);
        }
        if let Some(saved) = self.saved.as_mut() {
            for value in saved.values.iter_mut().flatten() {
                value.replace_ref(target, with);
            }
        }
    }

    // =========================================================================
    // Savepoint snapshots
    // =========================================================================

    /// Full copy for a savepoint
    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            state: self.state,
            oid: self.oid.clone(),
            values: self.values.clone(),
            loaded: self.loaded.clone(),
            dirty: self.dirty.clone(),
            flushed: self.flushed.clone(),
            version: self.version,
            saved: self.saved.clone(),
            flags: self.flags,
        }
    }

    /// Become exactly the snapshot
    pub(crate) fn restore_snapshot(&mut self, snapshot: InstanceSnapshot) {
        self.state = snapshot.state;
        self.oid = snapshot.oid;
        self.values = snapshot.values;
        self.loaded = snapshot.loaded;
        self.dirty = snapshot.dirty;
        self.flushed = snapshot.flushed;
        self.version = snapshot.version;
        self.saved = snapshot.saved;
        self.flags = InstanceFlags {
            loading: false,
            pre_flushed: false,
            ..snapshot.flags
        };
    }
}
