//! Lock levels
//!
//! Levels are totally ordered: `None < Read < Write`. A request for a level
//! at or below the level already held is a no-op for the lock manager.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Datastore lock level
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LockLevel {
    /// No lock
    #[default]
    None,
    /// Shared lock
    Read,
    /// Exclusive lock
    Write,
}

impl LockLevel {
    /// Whether this level actually locks anything
    pub fn is_locking(self) -> bool {
        self != LockLevel::None
    }
}

impl fmt::Display for LockLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LockLevel::None => "none",
            LockLevel::Read => "read",
            LockLevel::Write => "write",
        })
    }
}

impl FromStr for LockLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(LockLevel::None),
            "read" => Ok(LockLevel::Read),
            "write" => Ok(LockLevel::Write),
            other => Err(format!(
                "Invalid lock level '{}'. Expected \"none\", \"read\" or \"write\".",
                other
            )),
        }
    }
}
