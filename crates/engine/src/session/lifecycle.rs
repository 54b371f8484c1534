//! Instance operations: persist, delete, refresh, evict, lock, find, embed
//!
//! Each `_all` variant processes every argument and reports failures
//! together: one failure is returned as is, several become a user error
//! with the individual causes nested. A fatal failure stops the batch.

use persista_core::{
    AssignRequest, CascadeMode, Error, ErrorKind, FieldKind, FieldValue, IdentityStrategy, InstanceId,
    LockLevel, ObjectId, Result,
};
use persista_lifecycle::{PersistentState, StateEvent};
use tracing::debug;

use super::{FlushReason, Session};
use crate::events::LifecycleEventType;
use crate::instance::ManagedInstance;
use crate::policy::{OpAction, OpKind};

impl Session {
    /// Consult the operation callbacks for `id`
    pub(super) fn consult(&self, op: OpKind, id: InstanceId) -> Result<OpAction> {
        let state = self.instance(id)?.state();
        Ok(self.op_callbacks.process_argument(op, id, state))
    }

    /// Run `each` over `ids`, aggregating failures
    fn for_all(
        &mut self,
        ids: &[InstanceId],
        what: &str,
        mut each: impl FnMut(&mut Self, InstanceId) -> Result<()>,
    ) -> Result<()> {
        let mut errors = Vec::new();
        for &id in ids {
            if let Err(e) = each(self, id) {
                if e.is_fatal() {
                    return Err(e);
                }
                errors.push(e);
            }
        }
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            n => {
                let mut aggregate = Error::user(format!("{} of {} {} operations failed", n, ids.len(), what));
                for e in &errors {
                    for failed in e.failed() {
                        aggregate = aggregate.with_failed(*failed);
                    }
                }
                Err(aggregate.with_nested(errors))
            }
        }
    }

    // =========================================================================
    // Creation and lookup
    // =========================================================================

    /// New transient instance of `type_name`
    ///
    /// # Errors
    ///
    /// Returns a user error for an unknown type.
    pub fn new_instance(&mut self, type_name: &str) -> Result<InstanceId> {
        self.operation(false, |s| {
            let desc = s.descriptor(type_name)?;
            let id = s.allocate();
            s.instances.insert(id, ManagedInstance::transient(id, desc));
            Ok(id)
        })
    }

    /// New transient instance with some fields set
    pub fn new_instance_with(&mut self, type_name: &str, values: &[(&str, FieldValue)]) -> Result<InstanceId> {
        let id = self.new_instance(type_name)?;
        for (name, value) in values {
            self.set_field(id, name, value.clone())?;
        }
        Ok(id)
    }

    /// Instance for `oid`, from the cache or the store
    ///
    /// Returns `None` when the object does not exist or is deleted in this
    /// session.
    ///
    /// # Errors
    ///
    /// Returns `NoTransaction` when non-transactional reads are disabled and
    /// no transaction is active, or the store's error.
    pub fn find(&mut self, oid: &ObjectId) -> Result<Option<InstanceId>> {
        self.operation(true, |s| s.find_internal(oid))
    }

    pub(super) fn find_internal(&mut self, oid: &ObjectId) -> Result<Option<InstanceId>> {
        if let Some(id) = self.cache.get(oid) {
            let state = self.instance(id)?.state();
            if state.is_deleted() {
                return Ok(None);
            }
            if state.is_persistent() && !state.is_new() {
                self.assert_read_operation()?;
                self.transition(id, self.read_event())?;
            }
            return Ok(Some(id));
        }
        self.assert_read_operation()?;

        let desc = self.descriptor(oid.type_name().as_str())?;
        let id = self.allocate();
        self.instances
            .insert(id, ManagedInstance::hollow(id, desc, oid.clone()));
        self.cache.insert(oid.clone(), id)?;

        let found = match self.load_fields(id, None, false) {
            Ok(true) => true,
            Ok(false) => self.store.exists(oid)?,
            Err(e) if e.kind() == ErrorKind::ObjectNotFound => false,
            Err(e) => {
                self.discard(id, oid);
                return Err(e);
            }
        };
        if !found {
            self.discard(id, oid);
            return Ok(None);
        }
        self.transition(id, self.read_event())?;
        Ok(Some(id))
    }

    fn discard(&mut self, id: InstanceId, oid: &ObjectId) {
        self.cache.remove(oid, id);
        self.instances.remove(&id);
        self.locks.release(id);
    }

    /// Whether `oid` exists
    ///
    /// Unless `ignore_changes` is set, unflushed changes are flushed first so
    /// the store sees them.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` when that flush is needed while savepoints are
    /// set and the savepoint store cannot survive it.
    pub fn exists(&mut self, oid: &ObjectId) -> Result<bool> {
        self.operation(true, |s| {
            if let Some(id) = s.cache.get(oid) {
                let state = s.instance(id)?.state();
                if state.is_deleted() {
                    return Ok(false);
                }
                if state.is_new() {
                    return Ok(true);
                }
            }
            if s.status.active && !s.config.ignore_changes && s.status.flush_required {
                s.flush_internal(FlushReason::Incremental)?;
            }
            s.store.exists(oid)
        })
    }

    /// Create an embedded instance held by field `field` of `owner`
    ///
    /// Any embedded instance the field held before is dropped.
    ///
    /// # Errors
    ///
    /// Returns a user error when the field is not an embedded field.
    pub fn embed(&mut self, owner: InstanceId, field: &str) -> Result<InstanceId> {
        self.operation(true, |s| {
            let index = s.instance(owner)?.descriptor().field_index(field)?;
            s.embed_internal(owner, index)
        })
    }

    pub(super) fn embed_internal(&mut self, owner: InstanceId, index: usize) -> Result<InstanceId> {
        let (desc, owner_state) = {
            let inst = self.instance(owner)?;
            (inst.descriptor().clone(), inst.state())
        };
        let Some(fd) = desc.field(index) else {
            return Err(Error::user(format!("{} has no field {}", desc.name(), index)));
        };
        let FieldKind::Embedded(target) = &fd.kind else {
            return Err(Error::user(format!(
                "{}.{} is not an embedded field",
                desc.name(),
                fd.name
            )));
        };
        let state = match (owner_state.is_persistent(), self.status.active) {
            (true, true) => PersistentState::ENew,
            (true, false) => PersistentState::ENonTrans,
            (false, _) => PersistentState::ECopy,
        };
        if let Some(previous) = self.embedded_child(owner, index)? {
            self.force_state(previous, PersistentState::Transient)?;
            self.forget(previous)?;
        }
        let child = self.new_embedded(owner, index, target.as_str(), state)?;
        if state == PersistentState::ENew {
            let policy = self.config.restore_state;
            self.instance_mut(child)?.save_fields(policy);
            self.set_dirty(child)?;
        }
        self.set_field_internal(owner, index, FieldValue::Embedded(child), true)?;
        Ok(child)
    }

    // =========================================================================
    // Persist
    // =========================================================================

    /// Make `id` persistent
    ///
    /// Inside a transaction the instance becomes new; outside one it waits
    /// for the next transaction. Relations with immediate persist cascade
    /// follow provisionally.
    ///
    /// # Errors
    ///
    /// Fails for detached instances, embedded-only types, writes outside a
    /// transaction when disabled, and duplicate application identities.
    pub fn persist(&mut self, id: InstanceId) -> Result<()> {
        self.operation(true, |s| s.persist_internal(id, true))
    }

    /// Persist several instances
    pub fn persist_all(&mut self, ids: &[InstanceId]) -> Result<()> {
        self.operation(true, |s| s.for_all(ids, "persist", |s, id| s.persist_internal(id, true)))
    }

    pub(super) fn persist_internal(&mut self, id: InstanceId, explicit: bool) -> Result<()> {
        if !self.operating.insert(id) {
            if explicit && self.instance(id)?.state().is_provisional() {
                self.transition(id, StateEvent::Persist { explicit: true })?;
            }
            return Ok(());
        }
        let action = self.consult(OpKind::Persist, id)?;
        if !action.runs() {
            return Ok(());
        }
        let (state, desc) = {
            let inst = self.instance(id)?;
            (inst.state(), inst.descriptor().clone())
        };
        if state == PersistentState::Detached {
            return Err(Error::user(format!("{} is detached; attach it instead", id)).with_failed(id));
        }
        if desc.is_embedded_only() || state.is_embedded() {
            return Err(Error::user(format!(
                "{} is embedded-only and cannot be persisted on its own",
                desc.name()
            ))
            .with_failed(id));
        }
        self.assert_write_operation()?;

        if state.is_persistent() {
            self.transition(id, StateEvent::Persist { explicit })?;
        } else {
            self.fire(LifecycleEventType::BeforePersist, id)?;
            let app_id = match desc.identity() {
                IdentityStrategy::Application => {
                    let oid = desc.application_id(self.instance(id)?.values()).ok_or_else(|| {
                        Error::user(format!(
                            "{} uses application identity but its primary key is not set",
                            id
                        ))
                        .with_failed(id)
                    })?;
                    if let Some(existing) = self.cache.get(&oid) {
                        if existing != id {
                            return Err(Error::exists(format!(
                                "{} has the same identity as managed instance {}",
                                id, existing
                            ))
                            .with_failed(id));
                        }
                    }
                    Some(oid)
                }
                _ => None,
            };
            self.transition(id, StateEvent::Persist { explicit })?;
            match app_id {
                Some(oid) => self.set_object_id(id, oid)?,
                None => self.assign_object_id(id, false)?,
            }
            self.adopt_embedded(id)?;
        }

        if action.cascades() {
            for fd in desc.fields().iter().filter(|f| f.kind.is_relation()) {
                if fd.cascade.persist != CascadeMode::Immediate {
                    continue;
                }
                for target in self.targets(id, fd.index)? {
                    let target_state = self.instance(target)?.state();
                    if !target_state.is_persistent() && target_state != PersistentState::Detached {
                        self.persist_internal(target, false)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Embedded copies held by a newly persistent owner become managed
    fn adopt_embedded(&mut self, owner: InstanceId) -> Result<()> {
        let desc = self.instance(owner)?.descriptor().clone();
        for fd in desc.fields() {
            let Some(child) = self.embedded_child(owner, fd.index)? else {
                continue;
            };
            if self.instance(child)?.state() != PersistentState::ECopy {
                continue;
            }
            if self.status.active {
                self.force_state(child, PersistentState::ENew)?;
                let policy = self.config.restore_state;
                self.instance_mut(child)?.save_fields(policy);
                self.set_dirty(child)?;
            } else {
                self.force_state(child, PersistentState::ENonTrans)?;
            }
            self.adopt_embedded(child)?;
        }
        Ok(())
    }

    pub(super) fn set_object_id(&mut self, id: InstanceId, oid: ObjectId) -> Result<()> {
        self.cache.insert(oid.clone(), id)?;
        self.instance_mut(id)?.assign_key(oid);
        Ok(())
    }

    /// Make sure persistent instance `id` has a durable id
    ///
    /// Types whose ids the store generates at insert only get one from a
    /// flush; with `flush` set, one runs when a transaction is active and
    /// savepoints allow it. Returns whether the instance has an id now.
    ///
    /// # Errors
    ///
    /// Returns the flush failure when the flush runs and fails.
    pub fn ensure_object_id(&mut self, id: InstanceId, flush: bool) -> Result<bool> {
        self.operation(true, |s| {
            let state = s.instance(id)?.state();
            if s.instance(id)?.oid().is_some() {
                return Ok(true);
            }
            if !state.is_persistent() || state.is_embedded() || state.is_deleted() {
                return Ok(false);
            }
            s.assign_object_id(id, false)?;
            if s.instance(id)?.oid().is_some() {
                return Ok(true);
            }
            if !flush || !s.status.active || !s.incremental_flush_allowed() {
                return Ok(false);
            }
            s.flush_internal(FlushReason::Incremental)?;
            Ok(s.instance(id)?.oid().is_some())
        })
    }

    /// Ask the store for a durable id
    ///
    /// Identity-column types get theirs at insert, so `None` is not an
    /// error.
    pub(super) fn assign_object_id(&mut self, id: InstanceId, pre_flush: bool) -> Result<()> {
        let desc = self.instance(id)?.descriptor().clone();
        let oid = match desc.identity() {
            IdentityStrategy::Application => desc.application_id(self.instance(id)?.values()),
            strategy => self.store.assign_object_id(&AssignRequest {
                instance: id,
                type_name: desc.name().clone(),
                strategy,
                pre_flush,
            })?,
        };
        match oid {
            Some(oid) => self.set_object_id(id, oid),
            None => {
                debug!(target: "persista::session", instance = %id, "Identity deferred to insert");
                Ok(())
            }
        }
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Delete `id`
    ///
    /// # Errors
    ///
    /// Fails for instances that are not persistent, detached instances, and
    /// writes outside a transaction when disabled.
    pub fn delete(&mut self, id: InstanceId) -> Result<()> {
        self.operation(true, |s| s.delete_internal(id))
    }

    /// Delete several instances
    pub fn delete_all(&mut self, ids: &[InstanceId]) -> Result<()> {
        self.operation(true, |s| s.for_all(ids, "delete", |s, id| s.delete_internal(id)))
    }

    pub(super) fn delete_internal(&mut self, id: InstanceId) -> Result<()> {
        if !self.operating.insert(id) {
            return Ok(());
        }
        if !self.consult(OpKind::Delete, id)?.runs() {
            return Ok(());
        }
        let state = self.instance(id)?.state();
        if state == PersistentState::Detached {
            return Err(Error::user(format!("{} is detached; attach it before deleting", id)).with_failed(id));
        }
        if !state.is_persistent() && !state.is_embedded() {
            return Err(Error::user(format!("{} is not persistent", id)).with_failed(id));
        }
        self.assert_write_operation()?;
        self.transition(id, StateEvent::Delete)?;
        Ok(())
    }

    // =========================================================================
    // Release, evict
    // =========================================================================

    /// Stop managing `id`
    ///
    /// A released persistent instance leaves the session; its handle is no
    /// longer valid afterwards.
    pub fn release(&mut self, id: InstanceId) -> Result<()> {
        self.operation(true, |s| s.release_internal(id))
    }

    /// Release several instances
    pub fn release_all(&mut self, ids: &[InstanceId]) -> Result<()> {
        self.operation(true, |s| s.for_all(ids, "release", |s, id| s.release_internal(id)))
    }

    fn release_internal(&mut self, id: InstanceId) -> Result<()> {
        if !self.consult(OpKind::Release, id)?.runs() {
            return Ok(());
        }
        let prev = self.instance(id)?.state();
        let next = self.transition(id, StateEvent::Release)?;
        if next == PersistentState::Transient && prev != PersistentState::Transient {
            self.drop_instance(id)?;
        }
        Ok(())
    }

    /// Drop the field data of a clean instance
    pub fn evict(&mut self, id: InstanceId) -> Result<()> {
        self.operation(true, |s| s.evict_internal(id))
    }

    /// Evict several instances
    pub fn evict_all(&mut self, ids: &[InstanceId]) -> Result<()> {
        self.operation(true, |s| s.for_all(ids, "evict", |s, id| s.evict_internal(id)))
    }

    fn evict_internal(&mut self, id: InstanceId) -> Result<()> {
        if !self.consult(OpKind::Evict, id)?.runs() {
            return Ok(());
        }
        if self.instance(id)?.state().is_dirty() {
            debug!(target: "persista::session", instance = %id, "Dirty instance not evicted");
            return Ok(());
        }
        self.transition(id, StateEvent::Evict)?;
        Ok(())
    }

    // =========================================================================
    // Refresh
    // =========================================================================

    /// Reload `id` from the store, discarding unflushed changes
    ///
    /// New instances are left alone.
    ///
    /// # Errors
    ///
    /// Returns an invalid-state error for deleted instances and
    /// `ObjectNotFound` when the row is gone.
    pub fn refresh(&mut self, id: InstanceId) -> Result<()> {
        self.operation(true, |s| s.refresh_internal(id))
    }

    /// Refresh several instances
    pub fn refresh_all(&mut self, ids: &[InstanceId]) -> Result<()> {
        self.operation(true, |s| s.for_all(ids, "refresh", |s, id| s.refresh_internal(id)))
    }

    fn refresh_internal(&mut self, id: InstanceId) -> Result<()> {
        if !self.operating.insert(id) {
            return Ok(());
        }
        let action = self.consult(OpKind::Refresh, id)?;
        if !action.runs() {
            return Ok(());
        }
        let state = self.instance(id)?.state();
        if !state.is_persistent() {
            return Err(Error::user(format!("{} is not persistent", id)).with_failed(id));
        }
        if state.is_new() {
            return Ok(());
        }
        if state.is_deleted() {
            return Err(Error::invalid_state(format!("{} is deleted and cannot be refreshed", id)).with_failed(id));
        }
        self.assert_read_operation()?;

        let fetch_fields = self.fetch.fetch_fields(self.instance(id)?.descriptor());
        let fields = {
            let inst = self.instance_mut(id)?;
            let mut fields = inst.loaded().clone();
            inst.clear_fields();
            fields.union_with(&fetch_fields);
            fields.intersect_with(inst.descriptor().persistent_fields());
            fields.difference_with(inst.loaded());
            fields
        };
        self.load_field_set(id, fields, false)?;
        self.locks.refresh_lock(id)?;
        self.transition(id, self.refresh_event())?;
        self.fire(LifecycleEventType::AfterRefresh, id)?;

        if action.cascades() {
            let desc = self.instance(id)?.descriptor().clone();
            for fd in desc.fields().iter().filter(|f| f.kind.is_relation()) {
                if fd.cascade.refresh == CascadeMode::None {
                    continue;
                }
                for target in self.targets(id, fd.index)? {
                    let s = self.instance(target)?.state();
                    if s.is_persistent() && !s.is_new() && !s.is_deleted() {
                        self.refresh_internal(target)?;
                    }
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Transactional membership and locks
    // =========================================================================

    /// Enlist `id` in the active transaction
    ///
    /// With `update_version` the flush bumps its version even when no field
    /// changed.
    pub fn transactional(&mut self, id: InstanceId, update_version: bool) -> Result<()> {
        self.operation(true, |s| s.transactional_internal(id, update_version))
    }

    /// Enlist several instances
    pub fn transactional_all(&mut self, ids: &[InstanceId], update_version: bool) -> Result<()> {
        self.operation(true, |s| {
            s.for_all(ids, "transactional", |s, id| s.transactional_internal(id, update_version))
        })
    }

    fn transactional_internal(&mut self, id: InstanceId, update_version: bool) -> Result<()> {
        self.assert_active_transaction()?;
        if !self.consult(OpKind::Transactional, id)?.runs() {
            return Ok(());
        }
        let state = self.transition(id, StateEvent::Transactional)?;
        if update_version && state.is_persistent() && !state.is_new() {
            self.instance_mut(id)?.flags.version_update = true;
            self.add_dirty(id);
        }
        Ok(())
    }

    /// Remove `id` from the active transaction
    pub fn nontransactional(&mut self, id: InstanceId) -> Result<()> {
        self.operation(true, |s| s.nontransactional_internal(id))
    }

    /// Remove several instances from the active transaction
    pub fn nontransactional_all(&mut self, ids: &[InstanceId]) -> Result<()> {
        self.operation(true, |s| s.for_all(ids, "nontransactional", |s, id| s.nontransactional_internal(id)))
    }

    fn nontransactional_internal(&mut self, id: InstanceId) -> Result<()> {
        if !self.consult(OpKind::Nontransactional, id)?.runs() {
            return Ok(());
        }
        self.transition(id, StateEvent::Nontransactional)?;
        Ok(())
    }

    /// Lock `id` at `level`
    ///
    /// Pessimistic transactions take a datastore lock. Optimistic ones
    /// verify the version at flush instead, and a write lock also bumps it.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` (retryable) when the lock is not granted in
    /// time.
    pub fn lock(&mut self, id: InstanceId, level: LockLevel) -> Result<()> {
        self.operation(true, |s| s.lock_internal(id, level))
    }

    /// Lock several instances
    pub fn lock_all(&mut self, ids: &[InstanceId], level: LockLevel) -> Result<()> {
        self.operation(true, |s| s.for_all(ids, "lock", |s, id| s.lock_internal(id, level)))
    }

    fn lock_internal(&mut self, id: InstanceId, level: LockLevel) -> Result<()> {
        self.assert_active_transaction()?;
        if !self.consult(OpKind::Lock, id)?.runs() {
            return Ok(());
        }
        let state = self.instance(id)?.state();
        if !state.is_persistent() || state.is_new() || state.is_deleted() {
            return Ok(());
        }
        if self.config.optimistic {
            let inst = self.instance_mut(id)?;
            match level {
                LockLevel::Write => {
                    inst.flags.version_check = Some(true);
                    inst.flags.version_update = true;
                }
                LockLevel::Read => inst.flags.version_check = Some(true),
                LockLevel::None => {}
            }
        } else {
            self.lock_instance(id, level)?;
        }
        self.transition(id, StateEvent::Transactional)?;
        if self.instance(id)?.flags.version_update {
            self.add_dirty(id);
        }
        Ok(())
    }
}
