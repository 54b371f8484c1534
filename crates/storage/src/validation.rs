//! Write validation
//!
//! Two checks guard every write:
//! - At flush, a versioned write compares the version the session loaded
//!   with the version currently visible to the connection
//! - At commit, every row the connection wrote must still carry the
//!   committed version it had when the connection first wrote it
//!   (first-committer-wins)
//!
//! Conflicts are accumulated, never short-circuited, so a caller sees every
//! failed object at once.

use persista_core::{Error, InstanceId, ObjectId, Version};
use std::fmt;

/// Types of conflicts that can occur during validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictType {
    /// Version seen by the writer differs from the stored one
    VersionConflict {
        /// Row with the conflict
        oid: ObjectId,
        /// Version the writer expected
        expected: Option<Version>,
        /// Version found
        current: Version,
    },

    /// The row was removed by someone else
    MissingRow {
        /// Row that disappeared
        oid: ObjectId,
    },

    /// An insert collides with an existing row
    DuplicateRow {
        /// Row that already exists
        oid: ObjectId,
    },
}

impl ConflictType {
    /// Row the conflict is about
    pub fn oid(&self) -> &ObjectId {
        match self {
            ConflictType::VersionConflict { oid, .. }
            | ConflictType::MissingRow { oid }
            | ConflictType::DuplicateRow { oid } => oid,
        }
    }

    /// Convert into the kernel error, attributing it to `instance`
    ///
    /// Version conflicts and vanished rows are optimistic failures; a
    /// duplicate insert is an identity clash.
    pub fn into_error(self, instance: Option<InstanceId>) -> Error {
        let message = self.to_string();
        let err = match self {
            ConflictType::DuplicateRow { .. } => Error::exists(message),
            _ => Error::optimistic(message),
        };
        match instance {
            Some(id) => err.with_failed(id),
            None => err,
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictType::VersionConflict {
                oid,
                expected: Some(expected),
                current,
            } => write!(f, "{} expected version {} but found {}", oid, expected, current),
            ConflictType::VersionConflict {
                oid,
                expected: None,
                current,
            } => write!(f, "{} has unexpected version {}", oid, current),
            ConflictType::MissingRow { oid } => write!(f, "{} no longer exists", oid),
            ConflictType::DuplicateRow { oid } => write!(f, "{} already exists", oid),
        }
    }
}

/// Result of validation
///
/// Accumulates all conflicts found. A write proceeds only if is_valid()
/// returns true.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// All conflicts detected
    pub conflicts: Vec<ConflictType>,
}

impl ValidationResult {
    /// Create a successful validation result (no conflicts)
    pub fn ok() -> Self {
        ValidationResult {
            conflicts: Vec::new(),
        }
    }

    /// Create a validation result with a single conflict
    pub fn conflict(conflict: ConflictType) -> Self {
        ValidationResult {
            conflicts: vec![conflict],
        }
    }

    /// Check if validation passed (no conflicts)
    pub fn is_valid(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Merge another validation result into this one
    pub fn merge(&mut self, other: ValidationResult) {
        self.conflicts.extend(other.conflicts);
    }

    /// Get the number of conflicts
    pub fn conflict_count(&self) -> usize {
        self.conflicts.len()
    }

    /// Collapse into one optimistic error naming every conflicting row
    pub fn into_error(self) -> Option<Error> {
        if self.conflicts.is_empty() {
            return None;
        }
        let message = format!("{} conflicting row(s)", self.conflicts.len());
        let nested = self
            .conflicts
            .into_iter()
            .map(|c| c.into_error(None))
            .collect();
        Some(Error::optimistic(message).with_nested(nested))
    }
}

/// Check a versioned write against the row currently visible
///
/// `current` is `None` when the row does not exist. Unchecked writes still
/// fail on a missing row, since there is nothing to update.
pub fn validate_write(
    oid: &ObjectId,
    current: Option<Version>,
    expected: Option<Version>,
    check_version: bool,
) -> ValidationResult {
    let Some(current) = current else {
        return ValidationResult::conflict(ConflictType::MissingRow { oid: oid.clone() });
    };
    if check_version && expected != Some(current) {
        return ValidationResult::conflict(ConflictType::VersionConflict {
            oid: oid.clone(),
            expected,
            current,
        });
    }
    ValidationResult::ok()
}

/// Check that an insert does not collide with a visible row
pub fn validate_insert(oid: &ObjectId, current: Option<Version>) -> ValidationResult {
    match current {
        Some(_) => ValidationResult::conflict(ConflictType::DuplicateRow { oid: oid.clone() }),
        None => ValidationResult::ok(),
    }
}

/// First-committer-wins check for one written row
///
/// `base` is the committed version observed when the connection first
/// wrote the row (`None` if the row did not exist then); `committed` is the
/// committed version now.
pub fn validate_commit(
    oid: &ObjectId,
    base: Option<Version>,
    committed: Option<Version>,
) -> ValidationResult {
    match (base, committed) {
        (None, None) => ValidationResult::ok(),
        (None, Some(_)) => ValidationResult::conflict(ConflictType::DuplicateRow { oid: oid.clone() }),
        (Some(_), None) => ValidationResult::conflict(ConflictType::MissingRow { oid: oid.clone() }),
        (Some(b), Some(c)) if b == c => ValidationResult::ok(),
        (Some(b), Some(c)) => ValidationResult::conflict(ConflictType::VersionConflict {
            oid: oid.clone(),
            expected: Some(b),
            current: c,
        }),
    }
}
