//! Version tokens
//!
//! A version is an opaque concurrency token. The store hands one out with
//! every load and every successful write; the session sends it back at flush
//! so the store can detect concurrent modification.
//!
//! ## Comparison
//!
//! Versions are comparable **within the same variant only**.
//! Cross-variant comparison returns `None` from `partial_cmp`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Optimistic concurrency token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Version {
    /// Per-object counter, incremented on every write
    Counter(u64),
    /// Wall-clock microseconds of the last write
    Timestamp(i64),
}

impl Version {
    /// First counter version
    pub const fn initial() -> Self {
        Version::Counter(1)
    }

    /// Timestamp version for the current instant
    pub fn now() -> Self {
        Version::Timestamp(chrono::Utc::now().timestamp_micros())
    }

    /// The version following this one
    ///
    /// Timestamps never go backwards even if the clock does.
    pub fn next(&self) -> Self {
        match self {
            Version::Counter(n) => Version::Counter(n.saturating_add(1)),
            Version::Timestamp(t) => {
                let now = chrono::Utc::now().timestamp_micros();
                Version::Timestamp(now.max(t.saturating_add(1)))
            }
        }
    }

    /// Whether this is a counter version
    pub const fn is_counter(&self) -> bool {
        matches!(self, Version::Counter(_))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Version::Counter(a), Version::Counter(b)) => Some(a.cmp(b)),
            (Version::Timestamp(a), Version::Timestamp(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Version::Counter(n) => write!(f, "v{}", n),
            Version::Timestamp(t) => write!(f, "t{}", t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_next() {
        assert_eq!(Version::initial().next(), Version::Counter(2));
        assert_eq!(Version::Counter(u64::MAX).next(), Version::Counter(u64::MAX));
    }

    #[test]
    fn test_timestamp_next_is_monotonic() {
        let far_future = Version::Timestamp(i64::MAX - 10);
        let next = far_future.next();
        assert!(next > far_future);
    }

    #[test]
    fn test_cross_variant_incomparable() {
        assert_eq!(Version::Counter(1).partial_cmp(&Version::Timestamp(1)), None);
        assert!(Version::Counter(1) < Version::Counter(2));
    }
}
