//! Detach and attach

use persista_core::{Error, FieldKind, FieldValue, InstanceId, Result};
use persista_lifecycle::PersistentState;
use tracing::debug;

use super::{FlushReason, Session};
use crate::config::DetachState;
use crate::detach::DetachedInstance;
use crate::events::LifecycleEventType;
use crate::instance::ManagedInstance;
use crate::policy::OpKind;

impl Session {
    /// Copy `id` out of the session
    ///
    /// The managed instance becomes `Detached`: it leaves the transaction
    /// and the cache, and later lookups of its id load a fresh instance.
    /// Unflushed changes are flushed first. Related instances are not
    /// detached with it.
    ///
    /// # Errors
    ///
    /// Returns a user error for deleted or already detached instances.
    pub fn detach(&mut self, id: InstanceId) -> Result<DetachedInstance> {
        self.operation(true, |s| s.detach_internal(id))
    }

    /// Detach several instances
    pub fn detach_all(&mut self, ids: &[InstanceId]) -> Result<Vec<DetachedInstance>> {
        self.operation(true, |s| ids.iter().map(|&id| s.detach_internal(id)).collect())
    }

    fn detach_internal(&mut self, id: InstanceId) -> Result<DetachedInstance> {
        let run = self.consult(OpKind::Detach, id)?.runs();
        let state = self.instance(id)?.state();
        if state == PersistentState::Detached {
            return Err(Error::user(format!("{} is already detached", id)).with_failed(id));
        }
        if !run || !state.is_persistent() || state.is_embedded() {
            return self.detached_copy(id);
        }
        if state.is_deleted() {
            return Err(Error::user(format!("{} is deleted and cannot be detached", id)).with_failed(id));
        }
        if state.is_dirty() && self.status.active {
            self.flush_internal(FlushReason::Incremental)?;
        }

        self.fire(LifecycleEventType::BeforeDetach, id)?;
        match self.config.detach_state {
            DetachState::Loaded => {}
            DetachState::FetchGroups => {
                self.load_fields(id, None, false)?;
            }
            DetachState::All => {
                let missing = {
                    let inst = self.instance(id)?;
                    inst.descriptor().persistent_fields().difference(inst.loaded())
                };
                let live = {
                    let inst = self.instance(id)?;
                    inst.oid().is_some() && !(inst.state().is_new() && !inst.is_flushed())
                };
                if live {
                    self.load_field_set(id, missing, false)?;
                }
            }
        }
        let copy = self.detached_copy(id)?;

        let oid = self.instance(id)?.oid().cloned();
        if let Some(oid) = &oid {
            self.cache.remove(oid, id);
        }
        self.txset.remove(id);
        self.pending.remove(&id);
        self.deref.remove(&id);
        self.locks.release(id);
        {
            let inst = self.instance_mut(id)?;
            inst.clear_saved();
            inst.end_transaction();
        }
        self.force_state(id, PersistentState::Detached)?;
        debug!(target: "persista::session", instance = %id, "Detached");
        let fired = self.fire(LifecycleEventType::AfterDetach, id);
        self.drop_instance(id)?;
        fired.map(|()| copy)
    }

    /// Build the detached form of `id` from its loaded fields
    fn detached_copy(&self, id: InstanceId) -> Result<DetachedInstance> {
        let inst = self.instance(id)?;
        let values = (0..inst.descriptor().field_count())
            .map(|f| {
                if inst.is_loaded(f) {
                    self.detached_value(inst.value(f)).map(Some)
                } else {
                    Ok(None)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(DetachedInstance::from_parts(
            inst.descriptor().clone(),
            inst.oid().cloned(),
            inst.version(),
            values,
        ))
    }

    /// References by durable id, embedded values as records
    fn detached_value(&self, value: &FieldValue) -> Result<FieldValue> {
        Ok(match value {
            FieldValue::Ref(target) => match self.instance(*target)?.oid() {
                Some(oid) => FieldValue::ObjectRef(oid.clone()),
                None => FieldValue::Null,
            },
            FieldValue::List(items) => FieldValue::List(
                items.iter().map(|v| self.detached_value(v)).collect::<Result<_>>()?,
            ),
            FieldValue::Map(entries) => FieldValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.detached_value(v)?)))
                    .collect::<Result<_>>()?,
            ),
            FieldValue::Embedded(child) => FieldValue::Record(
                self.instance(*child)?
                    .values()
                    .iter()
                    .map(|v| self.detached_value(v))
                    .collect::<Result<_>>()?,
            ),
            other => other.clone(),
        })
    }

    /// Detach every persistent instance the session manages
    pub(super) fn auto_detach_all(&mut self) -> Result<()> {
        let ids: Vec<InstanceId> = self
            .instance_ids()
            .into_iter()
            .filter(|id| {
                self.instances.get(id).map_or(false, |inst| {
                    let state = inst.state();
                    state.is_persistent() && !state.is_embedded() && !state.is_deleted()
                })
            })
            .collect();
        if ids.is_empty() {
            return Ok(());
        }
        debug!(target: "persista::session", count = ids.len(), "Auto-detaching");
        for id in ids {
            self.detach_internal(id)?;
        }
        Ok(())
    }

    // =========================================================================
    // Attach
    // =========================================================================

    /// Merge a detached copy back into the session
    ///
    /// A copy with an identity is matched to the stored object and its
    /// changed fields are applied; a copy without one is persisted as new.
    ///
    /// # Errors
    ///
    /// Returns an optimistic error when the stored object changed or was
    /// deleted since the copy was made.
    pub fn attach(&mut self, detached: &DetachedInstance) -> Result<InstanceId> {
        self.operation(true, |s| s.attach_internal(detached))
    }

    fn attach_internal(&mut self, detached: &DetachedInstance) -> Result<InstanceId> {
        self.assert_write_operation()?;
        let existing = match detached.oid() {
            Some(oid) => self.find_internal(oid)?,
            None => None,
        };

        let Some(id) = existing else {
            if let (Some(oid), Some(_)) = (detached.oid(), detached.version()) {
                return Err(Error::optimistic(format!(
                    "{} was deleted since it was detached",
                    oid
                )));
            }
            return self.attach_new(detached);
        };

        if self.consult(OpKind::Attach, id)?.runs() {
            if let (Some(copy), Some(current)) = (detached.version(), self.instance(id)?.version()) {
                if copy != current {
                    return Err(Error::optimistic(format!(
                        "{} changed since it was detached",
                        id
                    ))
                    .with_failed(id));
                }
            }
            self.fire(LifecycleEventType::BeforeAttach, id)?;
            let pk = self.instance(id)?.descriptor().pk_fields().clone();
            for field in detached.dirty().iter() {
                if pk.contains(field) {
                    continue;
                }
                if let Some(value) = detached.value_at(field) {
                    self.attach_field(id, field, value)?;
                }
            }
            self.fire(LifecycleEventType::AfterAttach, id)?;
        }
        Ok(id)
    }

    /// Copy without a stored counterpart: becomes a new persistent instance
    fn attach_new(&mut self, detached: &DetachedInstance) -> Result<InstanceId> {
        let id = self.allocate();
        self.instances
            .insert(id, ManagedInstance::transient(id, detached.descriptor().clone()));
        self.fire(LifecycleEventType::BeforeAttach, id)?;
        for field in detached.loaded().iter() {
            if let Some(value) = detached.value_at(field) {
                self.attach_field(id, field, value)?;
            }
        }
        self.persist_internal(id, true)?;
        self.fire(LifecycleEventType::AfterAttach, id)?;
        Ok(id)
    }

    fn attach_field(&mut self, id: InstanceId, field: usize, value: &FieldValue) -> Result<()> {
        let kind = self
            .instance(id)?
            .descriptor()
            .field(field)
            .map(|f| f.kind.clone());
        if let (Some(FieldKind::Embedded(_)), FieldValue::Record(values)) = (&kind, value) {
            let child = self.embed_internal(id, field)?;
            for (index, v) in values.iter().enumerate() {
                let v = self.attached_value(v)?;
                self.instance_mut(child)?.set_untracked(index, v);
            }
            return Ok(());
        }
        let value = self.attached_value(value)?;
        self.set_field_internal(id, field, value, false)
    }

    /// Durable-id references become instances of this session
    fn attached_value(&mut self, value: &FieldValue) -> Result<FieldValue> {
        Ok(match value {
            FieldValue::ObjectRef(oid) => FieldValue::Ref(self.hollow_for(oid.clone())?),
            FieldValue::List(items) => FieldValue::List(
                items
                    .iter()
                    .map(|v| self.attached_value(v))
                    .collect::<Result<_>>()?,
            ),
            FieldValue::Map(entries) => FieldValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.attached_value(v)?)))
                    .collect::<Result<_>>()?,
            ),
            other => other.clone(),
        })
    }
}
