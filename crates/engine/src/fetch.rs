//! Fetch configuration
//!
//! Decides which fields a load brings in and which locks it takes. Hints are
//! string-keyed for callers that configure sessions from outside (query
//! strings, property files); each known key maps to a [`FetchHint`] through a
//! table built once, and unknown keys are kept verbatim.

use once_cell::sync::Lazy;
use persista_core::{
    Error, FieldSet, FieldValue, LockLevel, Result, TypeDescriptor, DEFAULT_FETCH_GROUP,
};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};

/// Known fetch hints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchHint {
    /// Activate a fetch group
    FetchGroup,
    /// Deactivate a fetch group
    RemoveFetchGroup,
    /// Back to the default group only
    ResetFetchGroups,
    /// Add an explicit `Type.field`
    Field,
    /// Lock wait in milliseconds
    LockTimeout,
    /// Lock taken by reads
    ReadLockLevel,
    /// Lock taken by writes
    WriteLockLevel,
    /// Rows per store round trip
    FetchBatchSize,
}

static HINTS: Lazy<FxHashMap<&'static str, FetchHint>> = Lazy::new(|| {
    [
        ("persista.FetchGroup", FetchHint::FetchGroup),
        ("persista.RemoveFetchGroup", FetchHint::RemoveFetchGroup),
        ("persista.ResetFetchGroups", FetchHint::ResetFetchGroups),
        ("persista.FetchPlan.Field", FetchHint::Field),
        ("persista.LockTimeout", FetchHint::LockTimeout),
        ("persista.ReadLockLevel", FetchHint::ReadLockLevel),
        ("persista.WriteLockLevel", FetchHint::WriteLockLevel),
        ("persista.FetchBatchSize", FetchHint::FetchBatchSize),
    ]
    .into_iter()
    .collect()
});

impl FetchHint {
    /// Hint registered under `key`
    pub fn lookup(key: &str) -> Option<FetchHint> {
        HINTS.get(key).copied()
    }
}

/// Fields and locks used when loading
#[derive(Debug, Clone, PartialEq)]
pub struct FetchConfiguration {
    groups: BTreeSet<String>,
    fields: BTreeSet<String>,
    fetch_batch_size: i32,
    lock_timeout_ms: i64,
    read_lock_level: LockLevel,
    write_lock_level: LockLevel,
    hints: BTreeMap<String, FieldValue>,
}

impl Default for FetchConfiguration {
    fn default() -> Self {
        let mut groups = BTreeSet::new();
        groups.insert(DEFAULT_FETCH_GROUP.to_string());
        Self {
            groups,
            fields: BTreeSet::new(),
            fetch_batch_size: -1,
            lock_timeout_ms: -1,
            read_lock_level: LockLevel::None,
            write_lock_level: LockLevel::None,
            hints: BTreeMap::new(),
        }
    }
}

impl FetchConfiguration {
    /// Default group only, no locks
    pub fn new() -> Self {
        Self::default()
    }

    /// Active fetch groups
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(String::as_str)
    }

    /// Whether `group` is active
    pub fn has_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }

    /// Activate a group
    pub fn add_group(&mut self, group: &str) -> &mut Self {
        self.groups.insert(group.to_string());
        self
    }

    /// Deactivate a group
    pub fn remove_group(&mut self, group: &str) -> &mut Self {
        self.groups.remove(group);
        self
    }

    /// Deactivate every group, the default one included
    pub fn clear_groups(&mut self) -> &mut Self {
        self.groups.clear();
        self
    }

    /// Back to the default group only
    pub fn reset_groups(&mut self) -> &mut Self {
        self.groups.clear();
        self.groups.insert(DEFAULT_FETCH_GROUP.to_string());
        self
    }

    /// Always fetch `Type.field`
    pub fn add_field(&mut self, qualified: &str) -> &mut Self {
        self.fields.insert(qualified.to_string());
        self
    }

    /// Stop fetching `Type.field` explicitly
    pub fn remove_field(&mut self, qualified: &str) -> &mut Self {
        self.fields.remove(qualified);
        self
    }

    /// Rows per round trip
    pub fn fetch_batch_size(&self) -> i32 {
        self.fetch_batch_size
    }

    /// Lock wait in milliseconds
    pub fn lock_timeout_ms(&self) -> i64 {
        self.lock_timeout_ms
    }

    /// Set the lock wait
    pub fn set_lock_timeout_ms(&mut self, timeout_ms: i64) -> &mut Self {
        self.lock_timeout_ms = timeout_ms;
        self
    }

    /// Lock taken by reads
    pub fn read_lock_level(&self) -> LockLevel {
        self.read_lock_level
    }

    /// Set the read lock level
    pub fn set_read_lock_level(&mut self, level: LockLevel) -> &mut Self {
        self.read_lock_level = level;
        self
    }

    /// Lock taken by writes
    pub fn write_lock_level(&self) -> LockLevel {
        self.write_lock_level
    }

    /// Set the write lock level
    pub fn set_write_lock_level(&mut self, level: LockLevel) -> &mut Self {
        self.write_lock_level = level;
        self
    }

    /// Unrecognised hint stored under `key`
    pub fn hint(&self, key: &str) -> Option<&FieldValue> {
        self.hints.get(key)
    }

    /// Apply a hint by name.
    ///
    /// # Errors
    ///
    /// Returns a user error when a known hint gets a value of the wrong
    /// shape. Unknown keys are stored and never fail.
    pub fn set_hint(&mut self, key: &str, value: FieldValue) -> Result<()> {
        match FetchHint::lookup(key) {
            Some(hint) => self.apply(hint, key, value),
            None => {
                self.hints.insert(key.to_string(), value);
                Ok(())
            }
        }
    }

    fn apply(&mut self, hint: FetchHint, key: &str, value: FieldValue) -> Result<()> {
        let bad = |expected: &str| {
            Error::user(format!(
                "Hint '{}' expects {}, got {}",
                key,
                expected,
                value.type_name()
            ))
        };
        match hint {
            FetchHint::FetchGroup => {
                let group = value.as_str().ok_or_else(|| bad("a group name"))?;
                self.add_group(group);
            }
            FetchHint::RemoveFetchGroup => {
                let group = value.as_str().ok_or_else(|| bad("a group name"))?;
                self.remove_group(group);
            }
            FetchHint::ResetFetchGroups => {
                if value.as_bool().ok_or_else(|| bad("a boolean"))? {
                    self.reset_groups();
                }
            }
            FetchHint::Field => {
                let field = value.as_str().ok_or_else(|| bad("Type.field"))?;
                if !field.contains('.') {
                    return Err(bad("Type.field"));
                }
                self.add_field(field);
            }
            FetchHint::FetchBatchSize => {
                let size = value.as_int().ok_or_else(|| bad("an integer"))?;
                self.fetch_batch_size = i32::try_from(size).map_err(|_| bad("a 32-bit integer"))?;
            }
            FetchHint::LockTimeout => {
                self.lock_timeout_ms = value.as_int().ok_or_else(|| bad("milliseconds"))?;
            }
            FetchHint::ReadLockLevel | FetchHint::WriteLockLevel => {
                let level = value
                    .as_str()
                    .ok_or_else(|| bad("a lock level"))?
                    .parse::<LockLevel>()
                    .map_err(Error::user)?;
                if hint == FetchHint::ReadLockLevel {
                    self.read_lock_level = level;
                } else {
                    self.write_lock_level = level;
                }
            }
        }
        Ok(())
    }

    /// Whether a load of `desc` should include `field`
    pub fn requires_fetch(&self, desc: &TypeDescriptor, field: usize) -> bool {
        let Some(fd) = desc.field(field) else {
            return false;
        };
        if !fd.is_persistent() {
            return false;
        }
        if self.has_group(DEFAULT_FETCH_GROUP) && desc.default_fetch_fields().contains(field) {
            return true;
        }
        if fd.fetch_groups.iter().any(|g| self.groups.contains(g)) {
            return true;
        }
        self.fields.contains(&format!("{}.{}", desc.name(), fd.name))
    }

    /// Every field of `desc` this configuration fetches
    pub fn fetch_fields(&self, desc: &TypeDescriptor) -> FieldSet {
        (0..desc.field_count())
            .filter(|i| self.requires_fetch(desc, *i))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persista_core::FieldDescriptor;

    fn order() -> TypeDescriptor {
        TypeDescriptor::builder("Order")
            .field(FieldDescriptor::new("id").primary_key())
            .field(FieldDescriptor::new("status"))
            .field(FieldDescriptor::new("notes").lazy().in_group("detail"))
            .field(FieldDescriptor::new("audit").lazy())
            .field(FieldDescriptor::new("cache").unmanaged())
            .build()
            .unwrap()
    }

    #[test]
    fn test_default_group_only() {
        let fetch = FetchConfiguration::new();
        let fields = fetch.fetch_fields(&order());
        assert_eq!(fields.iter().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_groups_and_explicit_fields() {
        let mut fetch = FetchConfiguration::new();
        fetch.add_group("detail").add_field("Order.audit");
        assert_eq!(
            fetch.fetch_fields(&order()).iter().collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        fetch.clear_groups();
        assert_eq!(fetch.fetch_fields(&order()).iter().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn test_hint_dispatch() {
        let mut fetch = FetchConfiguration::new();
        fetch.set_hint("persista.FetchGroup", "detail".into()).unwrap();
        fetch.set_hint("persista.LockTimeout", 250i64.into()).unwrap();
        fetch.set_hint("persista.ReadLockLevel", "write".into()).unwrap();
        assert!(fetch.has_group("detail"));
        assert_eq!(fetch.lock_timeout_ms(), 250);
        assert_eq!(fetch.read_lock_level(), LockLevel::Write);

        fetch.set_hint("persista.ResetFetchGroups", true.into()).unwrap();
        assert!(!fetch.has_group("detail"));
        assert!(fetch.has_group(DEFAULT_FETCH_GROUP));
    }

    #[test]
    fn test_bad_hint_values_rejected() {
        let mut fetch = FetchConfiguration::new();
        assert!(fetch.set_hint("persista.LockTimeout", "soon".into()).is_err());
        assert!(fetch.set_hint("persista.ReadLockLevel", "exclusive".into()).is_err());
        assert!(fetch.set_hint("persista.FetchPlan.Field", "audit".into()).is_err());
    }

    #[test]
    fn test_unknown_hint_kept() {
        let mut fetch = FetchConfiguration::new();
        fetch.set_hint("vendor.QueryCache", true.into()).unwrap();
        assert_eq!(fetch.hint("vendor.QueryCache"), Some(&FieldValue::Bool(true)));

        // relations are never traversed on load, so depth is not interpreted
        fetch.set_hint("persista.MaxFetchDepth", 3i64.into()).unwrap();
        assert_eq!(FetchHint::lookup("persista.MaxFetchDepth"), None);
        assert_eq!(fetch.hint("persista.MaxFetchDepth"), Some(&FieldValue::Int(3)));
    }
}
