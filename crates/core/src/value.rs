//! Field values
//!
//! [`FieldValue`] is the value held by one declared field of a managed
//! instance. Two families of variants exist:
//!
//! - session-side references: `Ref` and `Embedded` point at other managed
//!   instances by their session-local [`InstanceId`]
//! - store-side references: `ObjectRef` and `Record` are what the storage
//!   collaborator sees; the session translates in both directions
//!
//! ## Equality
//!
//! Different variants are never equal. Floats use IEEE-754 equality
//! (`NaN != NaN`), so a NaN write is never short-circuited as a no-op.

use crate::id::{InstanceId, ObjectId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Value of a single field
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum FieldValue {
    /// No value
    #[default]
    Null,
    /// Boolean
    Bool(bool),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit float
    Float(f64),
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Ordered collection
    List(Vec<FieldValue>),
    /// String-keyed map
    Map(BTreeMap<String, FieldValue>),
    /// Reference to another managed instance in the same session
    Ref(InstanceId),
    /// Embedded value object owned by this field
    Embedded(InstanceId),
    /// Store-side reference to another persistent object
    ObjectRef(ObjectId),
    /// Store-side embedded value, one entry per embedded field
    Record(Vec<FieldValue>),
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        use FieldValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Text(a), Text(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (List(a), List(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            (Ref(a), Ref(b)) => a == b,
            (Embedded(a), Embedded(b)) => a == b,
            (ObjectRef(a), ObjectRef(b)) => a == b,
            (Record(a), Record(b)) => a == b,
            _ => false,
        }
    }
}

impl FieldValue {
    /// Get the variant name as a string
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Null => "Null",
            FieldValue::Bool(_) => "Bool",
            FieldValue::Int(_) => "Int",
            FieldValue::Float(_) => "Float",
            FieldValue::Text(_) => "Text",
            FieldValue::Bytes(_) => "Bytes",
            FieldValue::List(_) => "List",
            FieldValue::Map(_) => "Map",
            FieldValue::Ref(_) => "Ref",
            FieldValue::Embedded(_) => "Embedded",
            FieldValue::ObjectRef(_) => "ObjectRef",
            FieldValue::Record(_) => "Record",
        }
    }

    /// Check if this is a null value
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Whether the value is a mutable container (second-class object)
    ///
    /// Containers can be mutated in place, so an equal-looking write is not
    /// proof that nothing changed.
    pub fn is_second_class(&self) -> bool {
        matches!(
            self,
            FieldValue::List(_) | FieldValue::Map(_) | FieldValue::Bytes(_)
        )
    }

    /// Get as bool if this is a Bool value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Get as i64 if this is an Int value
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as f64 if this is a Float value
    pub fn as_float(&self) -> Option<f64> {
        match self {
            FieldValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Get as &str if this is a Text value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get the target if this is a Ref value
    pub fn as_ref_id(&self) -> Option<InstanceId> {
        match self {
            FieldValue::Ref(id) => Some(*id),
            _ => None,
        }
    }

    /// Get the embedded instance if this is an Embedded value
    pub fn as_embedded(&self) -> Option<InstanceId> {
        match self {
            FieldValue::Embedded(id) => Some(*id),
            _ => None,
        }
    }

    /// Every managed instance referenced by this value, containers included
    ///
    /// Embedded instances are not references and are not returned.
    pub fn referenced(&self) -> Vec<InstanceId> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    /// Replace every `Ref(target)`, inside containers too, with `with`
    ///
    /// Returns whether anything was replaced.
    pub fn replace_ref(&mut self, target: InstanceId, with: &FieldValue) -> bool {
        match self {
            FieldValue::Ref(id) if *id == target => {
                *self = with.clone();
                true
            }
            FieldValue::List(items) => items
                .iter_mut()
                .fold(false, |hit, v| v.replace_ref(target, with) | hit),
            FieldValue::Map(entries) => entries
                .values_mut()
                .fold(false, |hit, v| v.replace_ref(target, with) | hit),
            _ => false,
        }
    }

    fn collect_refs(&self, out: &mut Vec<InstanceId>) {
        match self {
            FieldValue::Ref(id) => out.push(*id),
            FieldValue::List(items) => items.iter().for_each(|v| v.collect_refs(out)),
            FieldValue::Map(entries) => entries.values().for_each(|v| v.collect_refs(out)),
            _ => {}
        }
    }
}

// ============================================================================
// From implementations for ergonomic API usage
// ============================================================================

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Int(i)
    }
}

impl From<i32> for FieldValue {
    fn from(i: i32) -> Self {
        FieldValue::Int(i64::from(i))
    }
}

impl From<f64> for FieldValue {
    fn from(f: f64) -> Self {
        FieldValue::Float(f)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(b: Vec<u8>) -> Self {
        FieldValue::Bytes(b)
    }
}

impl From<InstanceId> for FieldValue {
    fn from(id: InstanceId) -> Self {
        FieldValue::Ref(id)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(FieldValue::Null)
    }
}
