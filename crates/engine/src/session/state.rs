//! Running transitions and carrying out their effects

use persista_core::{CascadeMode, Error, FieldValue, InstanceId, LockLevel, Result};
use persista_lifecycle::{Effect, PersistentState, StateEvent, TransitionContext};
use smallvec::SmallVec;
use tracing::debug;

use super::Session;
use crate::events::LifecycleEventType;

/// Targets of one relation field; usually a handful
pub(super) type Targets = SmallVec<[InstanceId; 8]>;

impl Session {
    /// Event for a field read in the current transaction mode
    pub(super) fn read_event(&self) -> StateEvent {
        match (self.status.active, self.config.optimistic) {
            (false, _) => StateEvent::BeforeNontransactionalRead,
            (true, true) => StateEvent::BeforeOptimisticRead,
            (true, false) => StateEvent::BeforeRead,
        }
    }

    /// Event for a field write in the current transaction mode
    pub(super) fn write_event(&self) -> StateEvent {
        match (self.status.active, self.config.optimistic) {
            (false, _) => StateEvent::BeforeNontransactionalWrite,
            (true, true) => StateEvent::BeforeOptimisticWrite,
            (true, false) => StateEvent::BeforeWrite,
        }
    }

    /// Event after a refresh in the current transaction mode
    pub(super) fn refresh_event(&self) -> StateEvent {
        match (self.status.active, self.config.optimistic) {
            (false, _) => StateEvent::AfterNontransactionalRefresh,
            (true, true) => StateEvent::AfterOptimisticRefresh,
            (true, false) => StateEvent::AfterRefresh,
        }
    }

    /// Apply `event` to `id`
    ///
    /// Effects listed before the state change run against the old state,
    /// the rest against the new one.
    pub(super) fn transition(&mut self, id: InstanceId, event: StateEvent) -> Result<PersistentState> {
        let (prev, ctx) = {
            let inst = self.instance(id)?;
            let ctx = TransitionContext {
                active: self.status.active,
                flushed: inst.flags.flushed,
            };
            (inst.state(), ctx)
        };
        let t = prev
            .transition(event, ctx)
            .map_err(|e| Error::from(e).with_failed(id))?;

        for effect in t.before_state_change() {
            self.apply_effect(id, *effect)?;
        }
        let changed = t.changes_state(prev);
        if changed {
            self.instance_mut(id)?.set_state(t.next);
            debug!(target: "persista::instance", instance = %id, from = %prev, to = %t.next, ?event, "State change");
        }
        for effect in t.after_state_change() {
            self.apply_effect(id, *effect)?;
        }
        if changed {
            self.after_state_change(id, prev, t.next)?;
        }
        Ok(t.next)
    }

    /// Set a state without consulting the table
    ///
    /// Only used where the table has no event: detaching and savepoint
    /// restores.
    pub(super) fn force_state(&mut self, id: InstanceId, state: PersistentState) -> Result<()> {
        let inst = self.instance_mut(id)?;
        let prev = inst.state();
        inst.set_state(state);
        debug!(target: "persista::instance", instance = %id, from = %prev, to = %state, "State forced");
        Ok(())
    }

    fn after_state_change(
        &mut self,
        id: InstanceId,
        prev: PersistentState,
        next: PersistentState,
    ) -> Result<()> {
        if next.is_transactional() && !next.is_dirty() {
            self.txset.add_clean(id);
        }
        if !self.savepoints.is_empty() {
            self.savepoint_cache.insert(id);
        }
        if next == PersistentState::Transient && prev != PersistentState::Transient {
            self.forget(id)?;
        }
        Ok(())
    }

    /// Stop managing `id`: uncache, release locks, drop bookkeeping
    pub(super) fn forget(&mut self, id: InstanceId) -> Result<()> {
        let inst = self.instance_mut(id)?;
        let oid = inst.oid().cloned();
        inst.set_oid(None);
        inst.set_version(None);
        inst.flags = Default::default();
        if let Some(oid) = oid {
            self.cache.remove(&oid, id);
        }
        self.locks.release(id);
        self.txset.remove(id);
        self.pending.remove(&id);
        self.deref.remove(&id);
        self.deref_additions.remove(&id);
        Ok(())
    }

    /// Remove `id`, and the embedded instances it owns, from the session
    ///
    /// For instances that left management for good: released, detached, or
    /// deleted by a committed transaction. Remaining references to it become
    /// `ObjectRef`s by its durable id, or `Null` when it never had one.
    pub(super) fn drop_instance(&mut self, id: InstanceId) -> Result<()> {
        if !self.instances.contains_key(&id) {
            return Ok(());
        }
        self.forget(id)?;
        self.savepoint_cache.remove(&id);
        let Some(inst) = self.instances.remove(&id) else {
            return Ok(());
        };
        let children: Vec<InstanceId> = inst
            .values()
            .iter()
            .filter_map(|v| match v {
                FieldValue::Embedded(child) => Some(*child),
                _ => None,
            })
            .collect();
        let replacement = inst
            .oid()
            .cloned()
            .map_or(FieldValue::Null, FieldValue::ObjectRef);
        for other in self.instances.values_mut() {
            other.replace_refs(id, &replacement);
        }
        for child in children {
            self.drop_instance(child)?;
        }
        debug!(target: "persista::instance", instance = %id, "Dropped");
        Ok(())
    }

    fn apply_effect(&mut self, id: InstanceId, effect: Effect) -> Result<()> {
        match effect {
            Effect::SaveFields => {
                let policy = self.config.restore_state;
                self.instance_mut(id)?.save_fields(policy);
            }
            Effect::RestoreFields => self.instance_mut(id)?.restore_fields(),
            Effect::ClearSavedFields => self.instance_mut(id)?.clear_saved(),
            Effect::ClearFields => {
                self.fire(LifecycleEventType::BeforeClear, id)?;
                self.instance_mut(id)?.clear_fields();
                self.fire(LifecycleEventType::AfterClear, id)?;
            }
            Effect::PreDelete => self.pre_delete(id)?,
            Effect::PreFlush { logical } => self.pre_flush_instance(id, logical)?,
            Effect::Enlist => {
                if self.instance(id)?.state().is_dirty() {
                    self.add_dirty(id);
                } else {
                    self.txset.add_clean(id);
                    self.evict_overflow()?;
                }
            }
            Effect::Delist => {
                self.txset.remove(id);
            }
            Effect::EnlistPending => {
                self.pending.insert(id);
            }
            Effect::DelistPending => {
                self.pending.remove(&id);
            }
            Effect::MarkDirty { .. } => self.set_dirty(id)?,
            Effect::FireAfterPersist => self.fire(LifecycleEventType::AfterPersist, id)?,
            Effect::FireAfterDelete => self.fire(LifecycleEventType::AfterDelete, id)?,
        }
        Ok(())
    }

    pub(super) fn add_dirty(&mut self, id: InstanceId) {
        self.txset.add_dirty(id);
        if self.status.flushing {
            self.trans_additions.insert(id);
            if let Some(inst) = self.instances.get_mut(&id) {
                inst.flags.pre_flushed = false;
            }
        }
    }

    /// Record that `id` changed
    pub(super) fn set_dirty(&mut self, id: InstanceId) -> Result<()> {
        let inst = self.instance(id)?;
        let state = inst.state();
        let type_name = inst.type_name().clone();
        if state.is_persistent() {
            self.status.flush_required = true;
            if state.is_new() {
                self.persisted_types.insert(type_name);
            } else if state.is_deleted() {
                self.deleted_types.insert(type_name);
            } else {
                self.updated_types.insert(type_name);
            }
        }
        if !self.savepoints.is_empty() {
            self.savepoint_cache.insert(id);
        }
        if state.is_transactional() {
            self.add_dirty(id);
        }
        Ok(())
    }

    /// Demote the oldest clean instances beyond the configured capacity
    ///
    /// Instances holding a lock or a pending version check stay.
    fn evict_overflow(&mut self) -> Result<()> {
        if self.status.flushing || self.status.completing {
            return Ok(());
        }
        for id in self.txset.overflow() {
            let Some(inst) = self.instances.get(&id) else {
                continue;
            };
            let evictable = inst.state() == PersistentState::PClean
                && inst.flags.version_check.is_none()
                && !inst.flags.version_update
                && !self.operating.contains(&id)
                && self.locks.lock_level(id) == LockLevel::None;
            if evictable {
                debug!(target: "persista::session", instance = %id, "Clean instance demoted over capacity");
                self.transition(id, StateEvent::Nontransactional)?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Relations
    // =========================================================================

    /// Instances referenced by field `field` of `id`
    pub(super) fn targets(&self, id: InstanceId, field: usize) -> Result<Targets> {
        Ok(self.instance(id)?.value(field).referenced().into_iter().collect())
    }

    /// Embedded instance held by field `field` of `id`
    pub(super) fn embedded_child(&self, id: InstanceId, field: usize) -> Result<Option<InstanceId>> {
        Ok(self.instance(id)?.value(field).as_embedded())
    }

    /// Pre-delete work: event, cascades, embedded children
    fn pre_delete(&mut self, id: InstanceId) -> Result<()> {
        self.fire(LifecycleEventType::BeforeDelete, id)?;
        let desc = self.instance(id)?.descriptor().clone();
        for fd in desc.fields() {
            let cascades = fd.kind.is_relation() && fd.cascade.delete != CascadeMode::None;
            let embedded = matches!(fd.kind, persista_core::FieldKind::Embedded(_));
            if !cascades && !embedded {
                continue;
            }
            let inst = self.instance(id)?;
            if !inst.is_loaded(fd.index) && inst.state().is_persistent() && inst.oid().is_some() {
                self.load_fields(id, Some(fd.index), true)?;
            }
            if embedded {
                if let Some(child) = self.embedded_child(id, fd.index)? {
                    let state = self.instance(child)?.state();
                    if state.is_embedded() && !state.is_deleted() {
                        self.transition(child, StateEvent::Delete)?;
                    }
                }
                continue;
            }
            for target in self.targets(id, fd.index)? {
                let state = self.instance(target)?.state();
                if state.is_persistent() && !state.is_deleted() {
                    self.delete_internal(target)?;
                }
            }
        }
        Ok(())
    }

    /// Pre-flush work for one instance
    fn pre_flush_instance(&mut self, id: InstanceId, logical: bool) -> Result<()> {
        let (state, pre_flushed) = {
            let inst = self.instance(id)?;
            (inst.state(), inst.flags.pre_flushed)
        };
        if pre_flushed {
            return Ok(());
        }
        if state.is_persistent() {
            self.fire(LifecycleEventType::BeforeStore, id)?;
            if state.is_dirty() && !state.is_new() && !state.is_deleted() {
                self.fire(LifecycleEventType::BeforeUpdate, id)?;
            }
        }
        self.instance_mut(id)?.flags.pre_flushed = true;

        if !logical && state.is_persistent() {
            if self.instance(id)?.oid().is_none() {
                self.assign_object_id(id, true)?;
            }
            if state.is_new() && !state.is_deleted() {
                self.assign_generated_fields(id)?;
            }
        }
        if !state.is_deleted() {
            self.check_reachable(id)?;
        }
        Ok(())
    }

    /// Fill null generated fields of a new instance
    fn assign_generated_fields(&mut self, id: InstanceId) -> Result<()> {
        let desc = self.instance(id)?.descriptor().clone();
        for fd in desc.fields().iter().filter(|f| f.generated) {
            if !self.instance(id)?.value(fd.index).is_null() {
                continue;
            }
            if let Some(value) = self.store.assign_field(desc.name(), fd.index, true)? {
                let inst = self.instance_mut(id)?;
                inst.save_field(fd.index);
                inst.write(fd.index, value);
            }
        }
        Ok(())
    }

    /// Persistence by reachability from `id`
    fn check_reachable(&mut self, id: InstanceId) -> Result<()> {
        let desc = self.instance(id)?.descriptor().clone();
        for fd in desc.fields().iter().filter(|f| f.kind.is_relation()) {
            if !self.instance(id)?.is_loaded(fd.index) {
                continue;
            }
            for target in self.targets(id, fd.index)? {
                let (state, dereferenced) = {
                    let t = self.instance(target)?;
                    (t.state(), t.is_dereferenced())
                };
                if state.is_deleted() {
                    return Err(Error::user(format!(
                        "{}.{} of {} references deleted instance {}",
                        desc.name(),
                        fd.name,
                        id,
                        target
                    ))
                    .with_failed(target));
                }
                if !state.is_persistent() {
                    if state.is_embedded() {
                        continue;
                    }
                    if fd.cascade.persist == CascadeMode::None {
                        return Err(Error::invalid_state(format!(
                            "{}.{} of {} references unmanaged instance {} and does not cascade persist",
                            desc.name(),
                            fd.name,
                            id,
                            target
                        ))
                        .with_failed(target));
                    }
                    self.persist_internal(target, true)?;
                    continue;
                }
                if state.is_provisional() {
                    self.transition(target, StateEvent::Nonprovisional)?;
                }
                if dereferenced {
                    self.remove_dereferenced_dependent(target)?;
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Dereferenced dependents
    // =========================================================================

    /// Record that dependent `id` lost its owning reference
    pub(super) fn add_dereferenced_dependent(&mut self, id: InstanceId) -> Result<()> {
        let inst = self.instance_mut(id)?;
        if !inst.state().is_persistent() || inst.state().is_deleted() {
            return Ok(());
        }
        inst.flags.dereferenced = true;
        if self.status.deref_deleting {
            self.deref_additions.insert(id);
        } else {
            self.deref.insert(id);
        }
        debug!(target: "persista::session", instance = %id, "Dependent dereferenced");
        Ok(())
    }

    /// `id` is referenced again
    ///
    /// # Errors
    ///
    /// Returns a fatal invalid-state error when `id` was never recorded as
    /// dereferenced.
    pub(super) fn remove_dereferenced_dependent(&mut self, id: InstanceId) -> Result<()> {
        let removed = self.deref.remove(&id) | self.deref_additions.remove(&id);
        if !removed {
            return Err(Error::invalid_state(format!(
                "{} is not a dereferenced dependent",
                id
            ))
            .with_failed(id)
            .into_fatal());
        }
        self.instance_mut(id)?.flags.dereferenced = false;
        Ok(())
    }

    /// Delete every dereferenced dependent, including ones dereferenced by
    /// those deletes
    pub(super) fn delete_dereferenced(&mut self) -> Result<()> {
        if self.deref.is_empty() {
            return Ok(());
        }
        self.status.deref_deleting = true;
        let result = self.delete_dereferenced_loop();
        self.status.deref_deleting = false;
        result
    }

    fn delete_dereferenced_loop(&mut self) -> Result<()> {
        let mut work: Vec<InstanceId> = std::mem::take(&mut self.deref).into_iter().collect();
        while !work.is_empty() {
            for id in work {
                let state = self.instance(id)?.state();
                if state.is_persistent() && !state.is_deleted() {
                    debug!(target: "persista::flush", instance = %id, "Deleting dereferenced dependent");
                    self.delete_internal(id)?;
                }
                if let Some(inst) = self.instances.get_mut(&id) {
                    inst.flags.dereferenced = false;
                }
            }
            work = std::mem::take(&mut self.deref_additions).into_iter().collect();
        }
        Ok(())
    }

    /// Track dependents dropped by replacing `old` with `new` in a field
    pub(super) fn track_dependents(&mut self, old: &FieldValue, new: &FieldValue) -> Result<()> {
        let kept = new.referenced();
        for target in old.referenced() {
            if !kept.contains(&target) {
                self.add_dereferenced_dependent(target)?;
            }
        }
        for target in kept {
            if self.instance(target)?.is_dereferenced() {
                self.remove_dereferenced_dependent(target)?;
            }
        }
        Ok(())
    }
}
