//! Detached copies
//!
//! A [`DetachedInstance`] is a plain copy of a managed instance that lives
//! outside any session. References are held by durable id
//! ([`FieldValue::ObjectRef`]) and embedded values as records, so the copy
//! carries no session handles. Changes made to it are tracked per field and
//! merged back by [`Session::attach`](crate::Session::attach).

use persista_core::{Error, FieldSet, FieldValue, ObjectId, Result, TypeDescriptor, TypeName, Version};
use std::sync::Arc;

/// Copy of an instance made by `detach`
#[derive(Debug, Clone)]
pub struct DetachedInstance {
    descriptor: Arc<TypeDescriptor>,
    oid: Option<ObjectId>,
    version: Option<Version>,
    values: Vec<Option<FieldValue>>,
    dirty: FieldSet,
}

impl DetachedInstance {
    /// Empty copy of type `descriptor`, as for an object never stored
    pub fn new(descriptor: Arc<TypeDescriptor>) -> Self {
        let n = descriptor.field_count();
        DetachedInstance {
            descriptor,
            oid: None,
            version: None,
            values: vec![None; n],
            dirty: FieldSet::new(),
        }
    }

    pub(crate) fn from_parts(
        descriptor: Arc<TypeDescriptor>,
        oid: Option<ObjectId>,
        version: Option<Version>,
        values: Vec<Option<FieldValue>>,
    ) -> Self {
        DetachedInstance {
            descriptor,
            oid,
            version,
            values,
            dirty: FieldSet::new(),
        }
    }

    /// Type metadata
    pub fn descriptor(&self) -> &Arc<TypeDescriptor> {
        &self.descriptor
    }

    /// Type name
    pub fn type_name(&self) -> &TypeName {
        self.descriptor.name()
    }

    /// Durable id the copy was made from
    pub fn oid(&self) -> Option<&ObjectId> {
        self.oid.as_ref()
    }

    /// Version the copy was made at
    pub fn version(&self) -> Option<Version> {
        self.version
    }

    /// Whether field `name` was copied
    pub fn is_loaded(&self, name: &str) -> bool {
        self.descriptor
            .field_index(name)
            .map_or(false, |i| self.values[i].is_some())
    }

    /// Value of field `name`
    ///
    /// # Errors
    ///
    /// Returns a user error for an unknown field and an invalid-state error
    /// for a field that was not copied.
    pub fn get(&self, name: &str) -> Result<&FieldValue> {
        let index = self.descriptor.field_index(name)?;
        self.values[index].as_ref().ok_or_else(|| {
            Error::invalid_state(format!(
                "field {}.{} was not loaded when the instance was detached",
                self.descriptor.name(),
                name
            ))
        })
    }

    /// Change field `name`
    ///
    /// # Errors
    ///
    /// Returns a user error for an unknown field and an invalid-state error
    /// when changing the primary key of a copy that has an identity.
    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) -> Result<()> {
        let index = self.descriptor.field_index(name)?;
        let value = value.into();
        let pk = self.descriptor.field(index).map_or(false, |f| f.primary_key);
        if pk && self.oid.is_some() && self.values[index].as_ref() != Some(&value) {
            return Err(Error::invalid_state(format!(
                "primary key field {}.{} of a detached copy cannot change",
                self.descriptor.name(),
                name
            )));
        }
        self.values[index] = Some(value);
        self.dirty.insert(index);
        Ok(())
    }

    /// Fields present in the copy
    pub fn loaded(&self) -> FieldSet {
        self.values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_ref().map(|_| i))
            .collect()
    }

    /// Fields changed since the copy was made
    pub fn dirty(&self) -> &FieldSet {
        &self.dirty
    }

    pub(crate) fn value_at(&self, index: usize) -> Option<&FieldValue> {
        self.values.get(index).and_then(Option::as_ref)
    }
}

/// Copies are equal when they are of the same type and hold the same
/// identity, version, values and changes
impl PartialEq for DetachedInstance {
    fn eq(&self, other: &Self) -> bool {
        self.descriptor.name() == other.descriptor.name()
            && self.oid == other.oid
            && self.version == other.version
            && self.values == other.values
            && self.dirty == other.dirty
    }
}
