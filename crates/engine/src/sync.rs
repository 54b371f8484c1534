//! Externally managed transactions
//!
//! In managed mode the session does not own transaction boundaries. Commit
//! and rollback go through an [`ExternalTransaction`], and the session runs
//! its completion work (flush, then per-instance transitions) around it.

use persista_core::Result;

/// How a transaction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Changes are durable
    Committed,
    /// Changes were discarded
    RolledBack,
}

/// Transaction owned by an outside coordinator
pub trait ExternalTransaction: Send + Sync {
    /// Start a transaction
    fn begin(&self) -> Result<()>;

    /// Commit the running transaction
    fn commit(&self) -> Result<()>;

    /// Roll back the running transaction
    fn rollback(&self) -> Result<()>;

    /// Forbid commit
    fn set_rollback_only(&self);

    /// Whether a transaction is running
    fn is_active(&self) -> bool;
}
