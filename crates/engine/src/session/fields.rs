//! Field reads, writes and loads

use persista_core::{
    Error, FieldKind, FieldSet, FieldValue, InstanceId, LoadRequest, LoadedState, LockLevel,
    ObjectId, Result, UpdateStrategy,
};
use persista_lifecycle::PersistentState;
use tracing::debug;

use super::Session;
use crate::events::LifecycleEventType;
use crate::instance::{ManagedInstance, Owner};

impl Session {
    // =========================================================================
    // Reads
    // =========================================================================

    /// Value of field `name` of `id`, loading it if needed
    ///
    /// Reading enlists a persistent instance in the active transaction.
    ///
    /// # Errors
    ///
    /// Returns a user error for an unknown field, `NoTransaction` when
    /// non-transactional reads are disabled, or the store's error when the
    /// load fails.
    pub fn get_field(&mut self, id: InstanceId, name: &str) -> Result<FieldValue> {
        self.operation(true, |s| {
            let field = s.instance(id)?.descriptor().field_index(name)?;
            s.get_field_internal(id, field)
        })
    }

    pub(super) fn get_field_internal(&mut self, id: InstanceId, field: usize) -> Result<FieldValue> {
        let (state, loaded) = {
            let inst = self.instance(id)?;
            (inst.state(), inst.is_loaded(field))
        };
        if state == PersistentState::Detached {
            return if loaded {
                Ok(self.instance(id)?.value(field).clone())
            } else {
                Err(Error::invalid_state(format!(
                    "field {} of detached instance {} was not loaded",
                    field, id
                )))
            };
        }
        if state.is_persistent() {
            self.assert_read_operation()?;
            self.transition(id, self.read_event())?;
        }
        if !self.instance(id)?.is_loaded(field) {
            self.load_fields(id, Some(field), false)?;
        }
        Ok(self.instance(id)?.value(field).clone())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Set field `name` of `id`
    ///
    /// # Errors
    ///
    /// Fails for detached instances, primary key changes once identity is
    /// assigned, restricted fields of stored instances, and writes outside a
    /// transaction when those are disabled.
    pub fn set_field(&mut self, id: InstanceId, name: &str, value: impl Into<FieldValue>) -> Result<()> {
        let value = value.into();
        self.operation(true, |s| {
            let field = s.instance(id)?.descriptor().field_index(name)?;
            s.set_field_internal(id, field, value, false)
        })
    }

    /// The single mutation path
    ///
    /// `force` skips the equality short-circuit.
    pub(super) fn set_field_internal(
        &mut self,
        id: InstanceId,
        field: usize,
        value: FieldValue,
        force: bool,
    ) -> Result<()> {
        let (state, desc, owner) = {
            let inst = self.instance(id)?;
            (inst.state(), inst.descriptor().clone(), inst.owner())
        };
        let fd = desc
            .field(field)
            .ok_or_else(|| Error::user(format!("{} has no field {}", desc.name(), field)))?;

        match state {
            PersistentState::Detached => {
                return Err(Error::user(format!(
                    "{} is detached; change its detached copy and attach it",
                    id
                ))
                .with_failed(id));
            }
            PersistentState::Transient | PersistentState::TLoaded | PersistentState::ECopy => {
                self.instance_mut(id)?.set_untracked(field, value);
                return Ok(());
            }
            _ => {}
        }

        {
            let inst = self.instance(id)?;
            if fd.primary_key && inst.oid().is_some() && inst.value(field) != &value {
                return Err(Error::invalid_state(format!(
                    "primary key field {}.{} of {} cannot change once its identity is assigned",
                    desc.name(),
                    fd.name,
                    id
                ))
                .with_failed(id));
            }
        }
        let stored = state.is_persistent() && !state.is_new();
        match fd.update_strategy {
            UpdateStrategy::Restrict if stored => {
                return Err(Error::invalid_state(format!(
                    "field {}.{} cannot change after insert",
                    desc.name(),
                    fd.name
                ))
                .with_failed(id));
            }
            UpdateStrategy::Ignore if stored => {
                self.instance_mut(id)?.set_untracked(field, value);
                return Ok(());
            }
            _ => {}
        }
        if state.is_persistent() || state.is_embedded() {
            self.assert_write_operation()?;
        }

        if let Some(owner) = owner {
            self.dirty_owner(owner)?;
        }

        let loaded = self.instance(id)?.is_loaded(field);
        if !force && loaded && !value.is_second_class() && self.instance(id)?.value(field) == &value {
            return Ok(());
        }
        if !loaded && state.is_persistent() {
            self.load_fields(id, Some(field), true)?;
        }
        if self.status.active && !self.config.optimistic && state.is_persistent() {
            self.lock_instance(id, self.fetch.write_lock_level())?;
        }

        let (first, refirst) = {
            let inst = self.instance(id)?;
            let first = !inst.state().is_dirty();
            let refirst = !first && inst.is_flushed() && inst.unflushed_dirty().is_empty();
            (first, refirst)
        };
        if first {
            self.fire(LifecycleEventType::BeforeDirty, id)?;
        } else if refirst {
            self.fire(LifecycleEventType::BeforeDirtyFlushed, id)?;
        }
        self.transition(id, self.write_event())?;

        let old = {
            let inst = self.instance_mut(id)?;
            let old = inst.value(field).clone();
            inst.save_field(field);
            inst.write(field, value.clone());
            old
        };
        self.set_dirty(id)?;
        if first {
            self.fire(LifecycleEventType::AfterDirty, id)?;
        } else if refirst {
            self.fire(LifecycleEventType::AfterDirtyFlushed, id)?;
        }
        if fd.is_dependent() {
            self.track_dependents(&old, &value)?;
        }
        Ok(())
    }

    /// Mark the owner field of an embedded instance dirty
    fn dirty_owner(&mut self, owner: Owner) -> Result<()> {
        let value = self.instance(owner.instance)?.value(owner.field).clone();
        self.set_field_internal(owner.instance, owner.field, value, true)
    }

    /// Take a datastore lock on `id` when `level` locks
    pub(super) fn lock_instance(&mut self, id: InstanceId, level: LockLevel) -> Result<()> {
        if !level.is_locking() || self.locks.lock_level(id) >= level {
            return Ok(());
        }
        let oid = self.instance(id)?.oid().cloned();
        self.locks
            .lock(id, oid.as_ref(), level, self.fetch.lock_timeout_ms())
            .map_err(|e| e.with_failed(id))
    }

    // =========================================================================
    // Loads
    // =========================================================================

    /// Fields a load of `id` brings in
    ///
    /// The default fetch group comes first when it is not loaded yet, then
    /// the load fetch group of `field`, then `field` itself.
    fn fields_to_load(&self, inst: &ManagedInstance, field: Option<usize>) -> FieldSet {
        let desc = inst.descriptor();
        let unloaded = desc.persistent_fields().difference(inst.loaded());
        let mut want = self.fetch.fetch_fields(desc).intersection(&unloaded);
        if let Some(field) = field {
            if let Some(group) = desc.field(field).and_then(|f| f.load_fetch_group.as_deref()) {
                want.union_with(&desc.fetch_group_fields(group).intersection(&unloaded));
            }
            if unloaded.contains(field) {
                want.insert(field);
            }
        }
        want
    }

    /// Load unloaded fields of `id`
    ///
    /// Returns whether anything was loaded. Instances with nothing in the
    /// store (transient, new and unflushed, deleted) are skipped unless
    /// `for_write` is set.
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotFound` when the row is gone.
    pub(super) fn load_fields(&mut self, id: InstanceId, field: Option<usize>, for_write: bool) -> Result<bool> {
        let fields = {
            let inst = self.instance(id)?;
            let state = inst.state();
            if inst.flags.loading || inst.oid().is_none() {
                return Ok(false);
            }
            let live = state.is_persistent()
                && !(state.is_new() && !inst.is_flushed())
                && !state.is_deleted();
            if !live && !for_write {
                return Ok(false);
            }
            self.fields_to_load(inst, field)
        };
        self.load_field_set(id, fields, for_write)
    }

    /// Load exactly `fields` of `id`
    pub(super) fn load_field_set(&mut self, id: InstanceId, fields: FieldSet, for_write: bool) -> Result<bool> {
        if fields.is_empty() {
            return Ok(false);
        }
        let level = self.load_lock_level(for_write);
        let request = self.load_request(id, fields, level)?;
        self.lock_instance(id, level)?;

        self.instance_mut(id)?.flags.loading = true;
        let loaded = self.store.load(&request);
        self.instance_mut(id)?.flags.loading = false;

        match loaded.map_err(|e| e.with_failed(id))? {
            Some(state) => {
                self.apply_loaded(id, state)?;
                Ok(true)
            }
            None => Err(Error::not_found(
                format!("{} no longer exists in the store", id),
                vec![request.oid],
            )),
        }
    }

    pub(super) fn load_lock_level(&self, for_write: bool) -> LockLevel {
        if !self.status.active || self.config.optimistic {
            return LockLevel::None;
        }
        if for_write {
            self.fetch.write_lock_level()
        } else {
            self.fetch.read_lock_level()
        }
    }

    pub(super) fn load_request(&self, id: InstanceId, fields: FieldSet, lock_level: LockLevel) -> Result<LoadRequest> {
        let oid = self
            .instance(id)?
            .oid()
            .cloned()
            .ok_or_else(|| Error::invalid_state(format!("{} has no identity to load by", id)))?;
        Ok(LoadRequest {
            instance: id,
            oid,
            fields,
            lock_level,
            fetch_groups: self.fetch.groups().map(str::to_string).collect(),
        })
    }

    /// Copy store values into `id`
    pub(super) fn apply_loaded(&mut self, id: InstanceId, state: LoadedState) -> Result<()> {
        for (field, value) in state.values {
            if self.instance(id)?.is_loaded(field) {
                continue;
            }
            let value = self.import_value(id, field, value)?;
            self.instance_mut(id)?.set_loaded_value(field, value);
        }
        let inst = self.instance_mut(id)?;
        if inst.version().is_none() {
            inst.set_version(state.version);
        }
        if !self.savepoints.is_empty() {
            self.savepoint_cache.insert(id);
        }
        debug!(target: "persista::instance", instance = %id, "Fields loaded");
        self.fire(LifecycleEventType::AfterLoad, id)
    }

    /// Translate a store value into session terms
    fn import_value(&mut self, id: InstanceId, field: usize, value: FieldValue) -> Result<FieldValue> {
        Ok(match value {
            FieldValue::ObjectRef(oid) => FieldValue::Ref(self.hollow_for(oid)?),
            FieldValue::List(items) => FieldValue::List(
                items
                    .into_iter()
                    .map(|v| self.import_value(id, field, v))
                    .collect::<Result<_>>()?,
            ),
            FieldValue::Map(entries) => FieldValue::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((k, self.import_value(id, field, v)?)))
                    .collect::<Result<_>>()?,
            ),
            FieldValue::Record(values) => {
                let desc = self.instance(id)?.descriptor().clone();
                let Some(FieldKind::Embedded(target)) = desc.field(field).map(|f| f.kind.clone()) else {
                    return Ok(FieldValue::Record(values));
                };
                let child = self.new_embedded(id, field, target.as_str(), PersistentState::ENonTrans)?;
                for (index, value) in values.into_iter().enumerate() {
                    let value = self.import_value(child, index, value)?;
                    self.instance_mut(child)?.set_loaded_value(index, value);
                }
                FieldValue::Embedded(child)
            }
            other => other,
        })
    }

    /// Instance managing `oid`, creating a hollow one if needed
    pub(super) fn hollow_for(&mut self, oid: ObjectId) -> Result<InstanceId> {
        if let Some(id) = self.cache.get(&oid) {
            return Ok(id);
        }
        let desc = self.descriptor(oid.type_name().as_str())?;
        let id = self.allocate();
        self.instances
            .insert(id, ManagedInstance::hollow(id, desc, oid.clone()));
        self.cache.insert(oid, id)?;
        Ok(id)
    }

    /// New embedded instance owned by field `field` of `owner`
    pub(super) fn new_embedded(
        &mut self,
        owner: InstanceId,
        field: usize,
        type_name: &str,
        state: PersistentState,
    ) -> Result<InstanceId> {
        let desc = self.descriptor(type_name)?;
        let id = self.allocate();
        let inst = ManagedInstance::embedded(
            id,
            desc,
            Owner {
                instance: owner,
                field,
            },
            state,
        );
        self.instances.insert(id, inst);
        Ok(id)
    }

    /// Translate a session value into store terms
    ///
    /// References to instances with an identity become `ObjectRef`;
    /// references to instances whose identity the flush itself assigns stay
    /// as `Ref` for the store to resolve. Embedded instances become records.
    pub(super) fn export_value(&self, value: &FieldValue) -> Result<FieldValue> {
        Ok(match value {
            FieldValue::Ref(target) => match self.instance(*target)?.oid() {
                Some(oid) => FieldValue::ObjectRef(oid.clone()),
                None => FieldValue::Ref(*target),
            },
            FieldValue::List(items) => FieldValue::List(
                items.iter().map(|v| self.export_value(v)).collect::<Result<_>>()?,
            ),
            FieldValue::Map(entries) => FieldValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.export_value(v)?)))
                    .collect::<Result<_>>()?,
            ),
            FieldValue::Embedded(child) => {
                let inst = self.instance(*child)?;
                FieldValue::Record(
                    inst.values()
                        .iter()
                        .map(|v| self.export_value(v))
                        .collect::<Result<_>>()?,
                )
            }
            other => other.clone(),
        })
    }

    // =========================================================================
    // Retrieve
    // =========================================================================

    /// Load the fetch groups of `id`, or every persistent field when `full`
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotFound` when the row is gone.
    pub fn retrieve(&mut self, id: InstanceId, full: bool) -> Result<()> {
        self.retrieve_all(&[id], full)
    }

    /// Retrieve several instances, batching store round trips by the fetch
    /// batch size
    ///
    /// # Errors
    ///
    /// Returns one `ObjectNotFound` naming every missing row.
    pub fn retrieve_all(&mut self, ids: &[InstanceId], full: bool) -> Result<()> {
        self.operation(true, |s| s.retrieve_all_internal(ids, full))
    }

    fn retrieve_all_internal(&mut self, ids: &[InstanceId], full: bool) -> Result<()> {
        let mut requests = Vec::new();
        for &id in ids {
            let action = self.consult(crate::policy::OpKind::Retrieve, id)?;
            if !action.runs() {
                continue;
            }
            let state = self.instance(id)?.state();
            if !state.is_persistent() || state.is_deleted() {
                continue;
            }
            if state.is_new() && !self.instance(id)?.is_flushed() {
                continue;
            }
            self.assert_read_operation()?;
            self.transition(id, self.read_event())?;
            let inst = self.instance(id)?;
            let fields = if full {
                inst.descriptor().persistent_fields().difference(inst.loaded())
            } else {
                self.fields_to_load(inst, None)
            };
            if fields.is_empty() {
                continue;
            }
            let level = self.load_lock_level(false);
            self.lock_instance(id, level)?;
            requests.push(self.load_request(id, fields, level)?);
        }
        if requests.is_empty() {
            return Ok(());
        }

        let batch = match self.fetch.fetch_batch_size() {
            n if n > 0 => n as usize,
            _ => requests.len(),
        };
        let mut missing = Vec::new();
        for chunk in requests.chunks(batch) {
            for (id, loaded) in self.store.load_all(chunk)? {
                match loaded {
                    Some(state) => self.apply_loaded(id, state)?,
                    None => missing.extend(self.instance(id)?.oid().cloned()),
                }
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::not_found(
                format!("{} instances no longer exist in the store", missing.len()),
                missing,
            ))
        }
    }
}
