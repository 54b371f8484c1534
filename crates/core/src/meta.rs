//! Type and field descriptors
//!
//! Metadata is consumed read-only by the kernel. A [`MetadataRepository`]
//! hands out shared [`TypeDescriptor`]s; [`StaticRepository`] is the in-memory
//! implementation used by applications that declare their types in code.
//!
//! ## Fetch groups
//!
//! Every field belongs to zero or more named fetch groups. Fields flagged
//! `default_fetch` form the default fetch group, loaded whenever any
//! unloaded field of the instance is first touched. A field may also name a
//! *load fetch group*: the group loaded alongside it when it is loaded or
//! dirtied on its own.

use crate::error::{Error, Result};
use crate::fields::FieldSet;
use crate::id::{IdKey, ObjectId, TypeName};
use crate::value::FieldValue;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::HashSet;
use std::sync::Arc;

/// Name of the default fetch group
pub const DEFAULT_FETCH_GROUP: &str = "default";

/// Shape of a field's value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// Scalar or container of scalars
    Basic,
    /// Single reference to another persistent type
    Reference(TypeName),
    /// Collection of references to another persistent type
    ReferenceList(TypeName),
    /// Embedded value object of the named embeddable type
    Embedded(TypeName),
}

impl FieldKind {
    /// Whether the field refers to other persistent instances
    pub fn is_relation(&self) -> bool {
        matches!(self, FieldKind::Reference(_) | FieldKind::ReferenceList(_))
    }
}

/// How an operation propagates through a relation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CascadeMode {
    /// Never cascade
    #[default]
    None,
    /// Cascade as part of the operation itself
    Immediate,
    /// Cascade implicitly: persistence by reachability at flush for persist,
    /// dependent deletion on dereference for delete
    Auto,
}

/// Cascade policy of one relation field
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cascade {
    /// persist propagation
    pub persist: CascadeMode,
    /// delete propagation
    pub delete: CascadeMode,
    /// refresh propagation
    pub refresh: CascadeMode,
    /// detach propagation
    pub detach: CascadeMode,
    /// attach propagation
    pub attach: CascadeMode,
}

/// What happens when a persistent field is written after the instance
/// has been stored
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdateStrategy {
    /// Writes are tracked normally
    #[default]
    Allow,
    /// Writes fail with an invalid-state error
    Restrict,
    /// Writes are accepted in memory but never flushed
    Ignore,
}

/// How the kernel manages a field
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Management {
    /// Stored and tracked
    #[default]
    Persistent,
    /// Tracked for rollback but never stored
    Transactional,
    /// Ignored by the kernel
    Unmanaged,
}

/// How durable identities are produced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdentityStrategy {
    /// Built from the primary-key field values
    #[default]
    Application,
    /// Drawn from a store sequence on request
    Sequence,
    /// Random UUID on request
    Uuid,
    /// Only known once the row has been inserted
    Identity,
}

/// Descriptor of one declared field
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    /// Position in the owning type
    pub index: usize,
    /// Field name
    pub name: String,
    /// Value shape
    pub kind: FieldKind,
    /// Part of the primary key
    pub primary_key: bool,
    /// Holds the version token
    pub version: bool,
    /// Member of the default fetch group
    pub default_fetch: bool,
    /// Named fetch groups this field belongs to
    pub fetch_groups: Vec<String>,
    /// Group to load together with this field
    pub load_fetch_group: Option<String>,
    /// Cascade policy (relations only)
    pub cascade: Cascade,
    /// Post-insert write policy
    pub update_strategy: UpdateStrategy,
    /// Management mode
    pub management: Management,
    /// Value generated by the store when left null
    pub generated: bool,
}

impl FieldDescriptor {
    /// A basic persistent field in the default fetch group
    pub fn new(name: &str) -> Self {
        FieldDescriptor {
            index: 0,
            name: name.to_string(),
            kind: FieldKind::Basic,
            primary_key: false,
            version: false,
            default_fetch: true,
            fetch_groups: Vec::new(),
            load_fetch_group: None,
            cascade: Cascade::default(),
            update_strategy: UpdateStrategy::Allow,
            management: Management::Persistent,
            generated: false,
        }
    }

    /// Mark as primary-key field
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Mark as version field
    pub fn version(mut self) -> Self {
        self.version = true;
        self
    }

    /// Remove from the default fetch group
    pub fn lazy(mut self) -> Self {
        self.default_fetch = false;
        self
    }

    /// Add to a named fetch group
    pub fn in_group(mut self, group: &str) -> Self {
        self.fetch_groups.push(group.to_string());
        self
    }

    /// Load the named group whenever this field is loaded alone
    pub fn load_fetch_group(mut self, group: &str) -> Self {
        self.load_fetch_group = Some(group.to_string());
        self
    }

    /// Single reference to `target`; relations are lazy by default
    pub fn reference(mut self, target: &str) -> Self {
        self.kind = FieldKind::Reference(TypeName::new(target));
        self.default_fetch = false;
        self
    }

    /// Collection of references to `target`; relations are lazy by default
    pub fn reference_list(mut self, target: &str) -> Self {
        self.kind = FieldKind::ReferenceList(TypeName::new(target));
        self.default_fetch = false;
        self
    }

    /// Embedded value of embeddable type `target`
    pub fn embedded(mut self, target: &str) -> Self {
        self.kind = FieldKind::Embedded(TypeName::new(target));
        self
    }

    /// Set the persist cascade
    pub fn cascade_persist(mut self, mode: CascadeMode) -> Self {
        self.cascade.persist = mode;
        self
    }

    /// Set the delete cascade
    pub fn cascade_delete(mut self, mode: CascadeMode) -> Self {
        self.cascade.delete = mode;
        self
    }

    /// Set the refresh cascade
    pub fn cascade_refresh(mut self, mode: CascadeMode) -> Self {
        self.cascade.refresh = mode;
        self
    }

    /// Set the detach cascade
    pub fn cascade_detach(mut self, mode: CascadeMode) -> Self {
        self.cascade.detach = mode;
        self
    }

    /// Set the attach cascade
    pub fn cascade_attach(mut self, mode: CascadeMode) -> Self {
        self.cascade.attach = mode;
        self
    }

    /// Cascade every operation immediately
    pub fn cascade_all(mut self) -> Self {
        self.cascade = Cascade {
            persist: CascadeMode::Immediate,
            delete: CascadeMode::Immediate,
            refresh: CascadeMode::Immediate,
            detach: CascadeMode::Immediate,
            attach: CascadeMode::Immediate,
        };
        self
    }

    /// Referenced instances are deleted when dereferenced
    pub fn dependent(mut self) -> Self {
        self.cascade.delete = CascadeMode::Auto;
        self
    }

    /// Set the post-insert write policy
    pub fn update_strategy(mut self, strategy: UpdateStrategy) -> Self {
        self.update_strategy = strategy;
        self
    }

    /// Track for rollback but never store
    pub fn transactional(mut self) -> Self {
        self.management = Management::Transactional;
        self
    }

    /// Ignore entirely
    pub fn unmanaged(mut self) -> Self {
        self.management = Management::Unmanaged;
        self
    }

    /// Let the store generate the value when it is null at flush
    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    /// Whether the field is stored
    pub fn is_persistent(&self) -> bool {
        self.management == Management::Persistent
    }

    /// Whether delete propagates on dereference
    pub fn is_dependent(&self) -> bool {
        self.cascade.delete == CascadeMode::Auto
    }
}

/// Descriptor of one persistent or embeddable type
#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    name: TypeName,
    fields: Vec<FieldDescriptor>,
    identity: IdentityStrategy,
    embedded_only: bool,
    detachable: bool,
    pk: FieldSet,
    dfg: FieldSet,
    persistent: FieldSet,
    inherent: FieldSet,
    version_field: Option<usize>,
}

impl TypeDescriptor {
    /// Start building a descriptor
    pub fn builder(name: &str) -> TypeDescriptorBuilder {
        TypeDescriptorBuilder {
            name: TypeName::new(name),
            fields: Vec::new(),
            identity: IdentityStrategy::Application,
            embedded_only: false,
            detachable: true,
        }
    }

    /// Type name
    pub fn name(&self) -> &TypeName {
        &self.name
    }

    /// Declared fields in index order
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Number of declared fields
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Field at `index`
    pub fn field(&self, index: usize) -> Option<&FieldDescriptor> {
        self.fields.get(index)
    }

    /// Field named `name`
    pub fn field_by_name(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Index of the field named `name`
    pub fn field_index(&self, name: &str) -> Result<usize> {
        self.field_by_name(name).map(|f| f.index).ok_or_else(|| {
            Error::user(format!("Type '{}' has no field '{}'", self.name, name))
        })
    }

    /// Identity strategy
    pub fn identity(&self) -> IdentityStrategy {
        self.identity
    }

    /// Whether instances only exist embedded in an owner
    pub fn is_embedded_only(&self) -> bool {
        self.embedded_only
    }

    /// Whether instances may be detached
    pub fn is_detachable(&self) -> bool {
        self.detachable
    }

    /// Primary-key fields
    pub fn pk_fields(&self) -> &FieldSet {
        &self.pk
    }

    /// Default fetch group
    pub fn default_fetch_fields(&self) -> &FieldSet {
        &self.dfg
    }

    /// Stored fields
    pub fn persistent_fields(&self) -> &FieldSet {
        &self.persistent
    }

    /// Fields loaded by construction: primary keys and non-persistent fields
    pub fn inherently_loaded(&self) -> &FieldSet {
        &self.inherent
    }

    /// Version field, if declared
    pub fn version_field(&self) -> Option<usize> {
        self.version_field
    }

    /// Fields in the named group; the default group name resolves to the
    /// default fetch group
    pub fn fetch_group_fields(&self, group: &str) -> FieldSet {
        if group == DEFAULT_FETCH_GROUP {
            return self.dfg.clone();
        }
        self.fields
            .iter()
            .filter(|f| f.fetch_groups.iter().any(|g| g == group))
            .map(|f| f.index)
            .collect()
    }

    /// Build an application identity from primary-key values
    ///
    /// Returns `None` when any primary-key value is null or of a type that
    /// cannot form a key.
    pub fn application_id(&self, values: &[FieldValue]) -> Option<ObjectId> {
        let mut parts = Vec::with_capacity(self.pk.len());
        for index in self.pk.iter() {
            let part = match values.get(index)? {
                FieldValue::Int(n) => IdKey::Long(*n),
                FieldValue::Text(s) => IdKey::Text(s.clone()),
                _ => return None,
            };
            parts.push(part);
        }
        let key = match parts.len() {
            0 => return None,
            1 => parts.pop()?,
            _ => IdKey::Composite(parts),
        };
        Some(ObjectId::new(self.name.clone(), key))
    }
}

/// Builder for [`TypeDescriptor`]
#[derive(Debug)]
pub struct TypeDescriptorBuilder {
    name: TypeName,
    fields: Vec<FieldDescriptor>,
    identity: IdentityStrategy,
    embedded_only: bool,
    detachable: bool,
}

impl TypeDescriptorBuilder {
    /// Declare the next field; its index is its declaration position
    pub fn field(mut self, mut field: FieldDescriptor) -> Self {
        field.index = self.fields.len();
        self.fields.push(field);
        self
    }

    /// Set the identity strategy
    pub fn identity(mut self, strategy: IdentityStrategy) -> Self {
        self.identity = strategy;
        self
    }

    /// Mark as embeddable-only
    pub fn embedded_only(mut self) -> Self {
        self.embedded_only = true;
        self
    }

    /// Set whether instances may be detached
    pub fn detachable(mut self, detachable: bool) -> Self {
        self.detachable = detachable;
        self
    }

    /// Validate and build
    ///
    /// # Errors
    ///
    /// Fails on duplicate field names, more than one version field, a
    /// non-basic primary-key or version field, or application identity
    /// without primary-key fields.
    pub fn build(self) -> Result<TypeDescriptor> {
        let mut names = HashSet::new();
        let mut pk = FieldSet::new();
        let mut dfg = FieldSet::new();
        let mut persistent = FieldSet::new();
        let mut inherent = FieldSet::new();
        let mut version_field = None;

        for f in &self.fields {
            if !names.insert(f.name.as_str()) {
                return Err(Error::user(format!(
                    "Type '{}' declares field '{}' twice",
                    self.name, f.name
                )));
            }
            if (f.primary_key || f.version) && f.kind != FieldKind::Basic {
                return Err(Error::user(format!(
                    "Field '{}.{}' must be basic to be a key or version",
                    self.name, f.name
                )));
            }
            if f.version {
                if version_field.is_some() {
                    return Err(Error::user(format!(
                        "Type '{}' declares more than one version field",
                        self.name
                    )));
                }
                version_field = Some(f.index);
            }
            if f.primary_key {
                pk.insert(f.index);
                inherent.insert(f.index);
            }
            if f.is_persistent() {
                persistent.insert(f.index);
                if f.default_fetch && !f.primary_key {
                    dfg.insert(f.index);
                }
            } else {
                inherent.insert(f.index);
            }
        }

        if self.identity == IdentityStrategy::Application && pk.is_empty() && !self.embedded_only
        {
            return Err(Error::user(format!(
                "Type '{}' uses application identity but declares no primary key",
                self.name
            )));
        }

        Ok(TypeDescriptor {
            name: self.name,
            fields: self.fields,
            identity: self.identity,
            embedded_only: self.embedded_only,
            detachable: self.detachable,
            pk,
            dfg,
            persistent,
            inherent,
            version_field,
        })
    }
}

/// Read-only descriptor service
pub trait MetadataRepository: Send + Sync {
    /// Descriptor of the named type
    ///
    /// # Errors
    ///
    /// Returns a user error when the type is unknown.
    fn descriptor(&self, type_name: &str) -> Result<Arc<TypeDescriptor>>;

    /// Names of every known type
    fn type_names(&self) -> Vec<TypeName>;
}

/// In-memory metadata repository
#[derive(Debug, Default)]
pub struct StaticRepository {
    types: RwLock<FxHashMap<TypeName, Arc<TypeDescriptor>>>,
}

impl StaticRepository {
    /// Empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor, replacing any previous one of the same name
    pub fn register(&self, descriptor: TypeDescriptor) -> Arc<TypeDescriptor> {
        let descriptor = Arc::new(descriptor);
        self.types
            .write()
            .insert(descriptor.name().clone(), Arc::clone(&descriptor));
        descriptor
    }

    /// Builder-style registration
    pub fn with(self, descriptor: TypeDescriptor) -> Self {
        self.register(descriptor);
        self
    }
}

impl MetadataRepository for StaticRepository {
    fn descriptor(&self, type_name: &str) -> Result<Arc<TypeDescriptor>> {
        self.types
            .read()
            .get(&TypeName::new(type_name))
            .cloned()
            .ok_or_else(|| Error::user(format!("No metadata for type '{}'", type_name)))
    }

    fn type_names(&self) -> Vec<TypeName> {
        let mut names: Vec<_> = self.types.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_type() -> TypeDescriptor {
        TypeDescriptor::builder("Order")
            .field(FieldDescriptor::new("id").primary_key())
            .field(FieldDescriptor::new("version").version())
            .field(FieldDescriptor::new("status"))
            .field(FieldDescriptor::new("notes").lazy().in_group("detail"))
            .field(FieldDescriptor::new("customer").reference("Customer"))
            .field(FieldDescriptor::new("scratch").unmanaged())
            .build()
            .unwrap()
    }

    #[test]
    fn test_indexes_follow_declaration_order() {
        let t = order_type();
        assert_eq!(t.field_index("id").unwrap(), 0);
        assert_eq!(t.field_index("customer").unwrap(), 4);
        assert!(t.field_index("missing").is_err());
    }

    #[test]
    fn test_derived_sets() {
        let t = order_type();
        assert_eq!(t.pk_fields().iter().collect::<Vec<_>>(), vec![0]);
        // relations and lazy fields stay out of the default group
        assert_eq!(t.default_fetch_fields().iter().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(t.inherently_loaded().iter().collect::<Vec<_>>(), vec![0, 5]);
        assert_eq!(t.version_field(), Some(1));
        assert_eq!(
            t.fetch_group_fields("detail").iter().collect::<Vec<_>>(),
            vec![3]
        );
        assert_eq!(t.fetch_group_fields(DEFAULT_FETCH_GROUP), *t.default_fetch_fields());
    }

    #[test]
    fn test_application_id() {
        let t = order_type();
        let values = vec![FieldValue::Int(9), FieldValue::Null];
        let oid = t.application_id(&values).unwrap();
        assert_eq!(oid, ObjectId::new("Order", IdKey::Long(9)));
        assert!(t.application_id(&[FieldValue::Null]).is_none());
    }

    #[test]
    fn test_composite_application_id() {
        let t = TypeDescriptor::builder("Line")
            .field(FieldDescriptor::new("order").primary_key())
            .field(FieldDescriptor::new("pos").primary_key())
            .build()
            .unwrap();
        let oid = t
            .application_id(&[FieldValue::Int(1), FieldValue::Text("a".into())])
            .unwrap();
        assert_eq!(
            oid.key(),
            &IdKey::Composite(vec![IdKey::Long(1), IdKey::Text("a".into())])
        );
    }

    #[test]
    fn test_build_rejects_invalid() {
        let dup = TypeDescriptor::builder("T")
            .field(FieldDescriptor::new("a").primary_key())
            .field(FieldDescriptor::new("a"))
            .build();
        assert!(dup.is_err());

        let no_pk = TypeDescriptor::builder("T")
            .field(FieldDescriptor::new("a"))
            .build();
        assert!(no_pk.is_err());

        let two_versions = TypeDescriptor::builder("T")
            .identity(IdentityStrategy::Sequence)
            .field(FieldDescriptor::new("a").version())
            .field(FieldDescriptor::new("b").version())
            .build();
        assert!(two_versions.is_err());
    }

    #[test]
    fn test_repository_lookup() {
        let repo = StaticRepository::new().with(order_type());
        assert_eq!(repo.descriptor("Order").unwrap().field_count(), 6);
        assert!(repo.descriptor("Nope").is_err());
        assert_eq!(repo.type_names(), vec![TypeName::new("Order")]);
    }
}
