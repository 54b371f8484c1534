//! Identity types
//!
//! Two identities exist for every managed instance:
//! - [`InstanceId`]: session-local, allocated when the session first meets
//!   the instance, stable for the lifetime of the managed instance
//! - [`ObjectId`]: durable identity, possibly unknown until flush when the
//!   store generates keys

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Session-local identity of a managed instance
///
/// Also used as the handle callers hold for a domain object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(u64);

impl InstanceId {
    /// Wrap a raw id
    pub const fn new(raw: u64) -> Self {
        InstanceId(raw)
    }

    /// Raw numeric value
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sm:{}", self.0)
    }
}

/// Name of a persistent type
///
/// Cheap to clone; the name is shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeName(Arc<str>);

impl TypeName {
    /// Create a type name
    pub fn new(name: &str) -> Self {
        TypeName(Arc::from(name))
    }

    /// Borrow the name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TypeName {
    fn from(s: &str) -> Self {
        TypeName::new(s)
    }
}

impl From<String> for TypeName {
    fn from(s: String) -> Self {
        TypeName(Arc::from(s))
    }
}

impl AsRef<str> for TypeName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for TypeName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for TypeName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(TypeName::from)
    }
}

/// Key part of a durable identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IdKey {
    /// Numeric key (sequences, identity columns, numeric primary keys)
    Long(i64),
    /// Textual key
    Text(String),
    /// UUID key
    Uuid(Uuid),
    /// Compound primary key, one part per primary-key field in declaration order
    Composite(Vec<IdKey>),
}

impl IdKey {
    /// A fresh random UUID key
    pub fn random_uuid() -> Self {
        IdKey::Uuid(Uuid::new_v4())
    }
}

impl fmt::Display for IdKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdKey::Long(n) => write!(f, "{}", n),
            IdKey::Text(s) => f.write_str(s),
            IdKey::Uuid(u) => write!(f, "{}", u),
            IdKey::Composite(parts) => {
                f.write_str("(")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", part)?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Durable identity of a persistent object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    type_name: TypeName,
    key: IdKey,
}

impl ObjectId {
    /// Create an object id
    pub fn new(type_name: impl Into<TypeName>, key: IdKey) -> Self {
        ObjectId {
            type_name: type_name.into(),
            key,
        }
    }

    /// Type the id belongs to
    pub fn type_name(&self) -> &TypeName {
        &self.type_name
    }

    /// Key part
    pub fn key(&self) -> &IdKey {
        &self.key
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.type_name, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_display() {
        let oid = ObjectId::new("Order", IdKey::Long(42));
        assert_eq!(oid.to_string(), "Order#42");

        let oid = ObjectId::new(
            "Line",
            IdKey::Composite(vec![IdKey::Long(1), IdKey::Text("a".into())]),
        );
        assert_eq!(oid.to_string(), "Line#(1,a)");
    }

    #[test]
    fn test_object_id_equality_includes_type() {
        let a = ObjectId::new("A", IdKey::Long(1));
        let b = ObjectId::new("B", IdKey::Long(1));
        assert_ne!(a, b);
        assert_eq!(a, ObjectId::new("A", IdKey::Long(1)));
    }

    #[test]
    fn test_type_name_serde() {
        let name = TypeName::new("Customer");
        let json = serde_json::to_string(&name).unwrap();
        assert_eq!(json, "\"Customer\"");
        let back: TypeName = serde_json::from_str(&json).unwrap();
        assert_eq!(back, name);
    }

    #[test]
    fn test_random_uuid_keys_differ() {
        assert_ne!(IdKey::random_uuid(), IdKey::random_uuid());
    }
}
