//! Error types for the persistence kernel
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! ## Taxonomy
//!
//! - **User**: caller misuse (closed session, duplicate savepoint name, identity clash)
//! - **InvalidState**: illegal lifecycle transition or session state
//! - **NoTransaction**: the operation requires an active transaction
//! - **Optimistic**: version conflicts detected at flush, aggregated per batch
//! - **Store**: wrapped failures from the storage collaborator
//! - **LockTimeout**: lock acquisition timed out, retryable
//! - **Callback**: listener failures escalated by the callback mode
//! - **Internal**: a broken kernel invariant, always fatal
//!
//! An error is *fatal* when the transaction it occurred in can no longer commit.
//! Aggregates keep every nested cause and are fatal if any child is fatal.

use crate::id::{InstanceId, ObjectId};
use thiserror::Error;

/// Result type alias for persista operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Caller misuse
    User,
    /// Illegal lifecycle transition or session state
    InvalidState,
    /// No active transaction where one was required
    NoTransaction,
    /// Object id unknown to the store
    ObjectNotFound,
    /// Object id already in use
    ObjectExists,
    /// Version conflict
    Optimistic,
    /// Storage collaborator failure
    Store,
    /// Lock acquisition timed out
    LockTimeout,
    /// Listener failure
    Callback,
    /// Operation not supported by a collaborator
    Unsupported,
    /// Kernel invariant violated
    Internal,
}

/// Error types for the persistence kernel
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Caller misuse
    #[error("{message}")]
    User {
        /// Human readable description
        message: String,
        /// Whether the enclosing transaction must roll back
        fatal: bool,
        /// Instances the error refers to
        failed: Vec<InstanceId>,
        /// Nested causes (batch operations)
        nested: Vec<Error>,
    },

    /// Illegal lifecycle transition or session state
    #[error("Invalid state: {message}")]
    InvalidState {
        /// Human readable description
        message: String,
        /// Whether the enclosing transaction must roll back
        fatal: bool,
        /// Instances the error refers to
        failed: Vec<InstanceId>,
    },

    /// The operation requires an active transaction
    #[error("No active transaction: {0}")]
    NoTransaction(String),

    /// One or more object ids do not exist in the store
    #[error("Object not found: {message}")]
    ObjectNotFound {
        /// Human readable description
        message: String,
        /// The ids that could not be found
        ids: Vec<ObjectId>,
    },

    /// An object with the same id is already managed or stored
    #[error("Object already exists: {message}")]
    ObjectExists {
        /// Human readable description
        message: String,
        /// Instances the error refers to
        failed: Vec<InstanceId>,
    },

    /// Version conflict detected while flushing
    #[error("Optimistic lock conflict: {message}")]
    Optimistic {
        /// Human readable description
        message: String,
        /// Every instance whose write conflicted
        failed: Vec<InstanceId>,
        /// Per-instance causes
        nested: Vec<Error>,
    },

    /// Storage collaborator failure
    #[error("Store error: {message}")]
    Store {
        /// Human readable description
        message: String,
        /// Whether the enclosing transaction must roll back
        fatal: bool,
        /// Instances the error refers to
        failed: Vec<InstanceId>,
        /// Nested causes
        nested: Vec<Error>,
    },

    /// Lock acquisition did not complete within the timeout
    #[error("Lock timeout after {timeout_ms}ms: {message}")]
    LockTimeout {
        /// Human readable description
        message: String,
        /// Timeout that elapsed, -1 for none
        timeout_ms: i64,
        /// Instances the error refers to
        failed: Vec<InstanceId>,
    },

    /// A lifecycle or transaction listener failed
    #[error("Callback failed: {message}")]
    Callback {
        /// Human readable description
        message: String,
        /// Whether the enclosing transaction must roll back
        fatal: bool,
        /// Listener failures
        nested: Vec<Error>,
    },

    /// A collaborator does not support the requested operation
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// A kernel invariant was violated
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Non-fatal user error
    pub fn user(message: impl Into<String>) -> Self {
        Error::User {
            message: message.into(),
            fatal: false,
            failed: Vec::new(),
            nested: Vec::new(),
        }
    }

    /// Non-fatal invalid-state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Error::InvalidState {
            message: message.into(),
            fatal: false,
            failed: Vec::new(),
        }
    }

    /// No-transaction error
    pub fn no_transaction(message: impl Into<String>) -> Self {
        Error::NoTransaction(message.into())
    }

    /// Object-not-found error for the given ids
    pub fn not_found(message: impl Into<String>, ids: Vec<ObjectId>) -> Self {
        Error::ObjectNotFound {
            message: message.into(),
            ids,
        }
    }

    /// Object-exists error
    pub fn exists(message: impl Into<String>) -> Self {
        Error::ObjectExists {
            message: message.into(),
            failed: Vec::new(),
        }
    }

    /// Single optimistic conflict
    pub fn optimistic(message: impl Into<String>) -> Self {
        Error::Optimistic {
            message: message.into(),
            failed: Vec::new(),
            nested: Vec::new(),
        }
    }

    /// Non-fatal store error
    pub fn store(message: impl Into<String>) -> Self {
        Error::Store {
            message: message.into(),
            fatal: false,
            failed: Vec::new(),
            nested: Vec::new(),
        }
    }

    /// Lock timeout error
    pub fn lock_timeout(message: impl Into<String>, timeout_ms: i64) -> Self {
        Error::LockTimeout {
            message: message.into(),
            timeout_ms,
            failed: Vec::new(),
        }
    }

    /// Non-fatal callback error
    pub fn callback(message: impl Into<String>) -> Self {
        Error::Callback {
            message: message.into(),
            fatal: false,
            nested: Vec::new(),
        }
    }

    /// Unsupported-operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Error::Unsupported(message.into())
    }

    /// Internal error, always fatal
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }

    // =========================================================================
    // Builders
    // =========================================================================

    /// Record an instance this error refers to
    ///
    /// Variants without a failed-object list are returned unchanged.
    pub fn with_failed(mut self, instance: InstanceId) -> Self {
        match &mut self {
            Error::User { failed, .. }
            | Error::InvalidState { failed, .. }
            | Error::ObjectExists { failed, .. }
            | Error::Optimistic { failed, .. }
            | Error::Store { failed, .. }
            | Error::LockTimeout { failed, .. } => {
                if !failed.contains(&instance) {
                    failed.push(instance);
                }
            }
            _ => {}
        }
        self
    }

    /// Attach nested causes
    ///
    /// Variants without a nested list are returned unchanged.
    pub fn with_nested(mut self, causes: Vec<Error>) -> Self {
        match &mut self {
            Error::User { nested, .. }
            | Error::Optimistic { nested, .. }
            | Error::Store { nested, .. }
            | Error::Callback { nested, .. } => nested.extend(causes),
            _ => {}
        }
        self
    }

    /// Mark this error fatal
    ///
    /// Variants that cannot carry the flag are wrapped in a fatal store error,
    /// except `Internal` which is fatal already and `LockTimeout` which stays
    /// retryable.
    pub fn into_fatal(self) -> Self {
        match self {
            Error::User {
                message,
                failed,
                nested,
                ..
            } => Error::User {
                message,
                fatal: true,
                failed,
                nested,
            },
            Error::InvalidState {
                message, failed, ..
            } => Error::InvalidState {
                message,
                fatal: true,
                failed,
            },
            Error::Store {
                message,
                failed,
                nested,
                ..
            } => Error::Store {
                message,
                fatal: true,
                failed,
                nested,
            },
            Error::Callback {
                message, nested, ..
            } => Error::Callback {
                message,
                fatal: true,
                nested,
            },
            Error::Internal(message) => Error::Internal(message),
            timeout @ Error::LockTimeout { .. } => timeout,
            other => {
                let message = other.to_string();
                let failed = other.failed().to_vec();
                Error::Store {
                    message,
                    fatal: true,
                    failed,
                    nested: vec![other],
                }
            }
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::User { .. } => ErrorKind::User,
            Error::InvalidState { .. } => ErrorKind::InvalidState,
            Error::NoTransaction(_) => ErrorKind::NoTransaction,
            Error::ObjectNotFound { .. } => ErrorKind::ObjectNotFound,
            Error::ObjectExists { .. } => ErrorKind::ObjectExists,
            Error::Optimistic { .. } => ErrorKind::Optimistic,
            Error::Store { .. } => ErrorKind::Store,
            Error::LockTimeout { .. } => ErrorKind::LockTimeout,
            Error::Callback { .. } => ErrorKind::Callback,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the transaction this error occurred in must roll back
    pub fn is_fatal(&self) -> bool {
        let own = match self {
            Error::User { fatal, .. }
            | Error::InvalidState { fatal, .. }
            | Error::Store { fatal, .. }
            | Error::Callback { fatal, .. } => *fatal,
            Error::Internal(_) => true,
            _ => false,
        };
        own || self.nested().iter().any(Error::is_fatal)
    }

    /// Whether retrying the unit of work may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Optimistic { .. } | Error::LockTimeout { .. })
    }

    /// Instances this error refers to
    pub fn failed(&self) -> &[InstanceId] {
        match self {
            Error::User { failed, .. }
            | Error::InvalidState { failed, .. }
            | Error::ObjectExists { failed, .. }
            | Error::Optimistic { failed, .. }
            | Error::Store { failed, .. }
            | Error::LockTimeout { failed, .. } => failed,
            _ => &[],
        }
    }

    /// Nested causes
    pub fn nested(&self) -> &[Error] {
        match self {
            Error::User { nested, .. }
            | Error::Optimistic { nested, .. }
            | Error::Store { nested, .. }
            | Error::Callback { nested, .. } => nested,
            _ => &[],
        }
    }

    /// The message without the variant prefix
    pub fn message(&self) -> &str {
        match self {
            Error::User { message, .. }
            | Error::InvalidState { message, .. }
            | Error::ObjectNotFound { message, .. }
            | Error::ObjectExists { message, .. }
            | Error::Optimistic { message, .. }
            | Error::Store { message, .. }
            | Error::LockTimeout { message, .. }
            | Error::Callback { message, .. } => message,
            Error::NoTransaction(message)
            | Error::Unsupported(message)
            | Error::Internal(message) => message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{IdKey, ObjectId};

    #[test]
    fn test_error_display_invalid_state() {
        let err = Error::invalid_state("non-trans-write");
        let msg = err.to_string();
        assert!(msg.contains("Invalid state"));
        assert!(msg.contains("non-trans-write"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_error_display_lock_timeout() {
        let err = Error::lock_timeout("Order#7", 250);
        let msg = err.to_string();
        assert!(msg.contains("250ms"));
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_error_display_not_found() {
        let oid = ObjectId::new("Order", IdKey::Long(7));
        let err = Error::not_found("missing", vec![oid.clone()]);
        assert!(err.to_string().contains("Object not found"));
        match err {
            Error::ObjectNotFound { ids, .. } => assert_eq!(ids, vec![oid]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_internal_is_always_fatal() {
        assert!(Error::internal("multi-threaded-access").is_fatal());
    }

    #[test]
    fn test_into_fatal_keeps_kind_where_possible() {
        let err = Error::invalid_state("x").into_fatal();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(err.is_fatal());

        let err = Error::user("dup").into_fatal();
        assert_eq!(err.kind(), ErrorKind::User);
        assert!(err.is_fatal());
    }

    #[test]
    fn test_into_fatal_keeps_lock_timeout_retryable() {
        let err = Error::lock_timeout("Order#7", 250).into_fatal();
        assert_eq!(err.kind(), ErrorKind::LockTimeout);
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_into_fatal_wraps_optimistic() {
        let err = Error::optimistic("stale").into_fatal();
        assert_eq!(err.kind(), ErrorKind::Store);
        assert!(err.is_fatal());
        assert_eq!(err.nested().len(), 1);
        assert_eq!(err.nested()[0].kind(), ErrorKind::Optimistic);
    }

    #[test]
    fn test_aggregate_fatal_if_any_child_fatal() {
        let agg = Error::store("batch").with_nested(vec![
            Error::user("a"),
            Error::invalid_state("b").into_fatal(),
        ]);
        assert!(agg.is_fatal());

        let agg = Error::store("batch").with_nested(vec![Error::user("a"), Error::user("b")]);
        assert!(!agg.is_fatal());
    }

    #[test]
    fn test_with_failed_deduplicates() {
        let id = InstanceId::new(3);
        let err = Error::optimistic("x").with_failed(id).with_failed(id);
        assert_eq!(err.failed(), &[id]);
    }

    #[test]
    fn test_message_strips_prefix() {
        assert_eq!(Error::store("disk full").message(), "disk full");
        assert_eq!(Error::no_transaction("flush").message(), "flush");
    }
}
