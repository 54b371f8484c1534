//! Lifecycle and transaction events
//!
//! Listeners receive the session itself, so a listener may call back into it
//! (persist a related instance from a `BeforeStore` hook, for example).
//! Events raised by those calls are delivered right away to every listener,
//! the calling one included.
//!
//! Failures are handled per [`CallbackModes`], built from the configured
//! [`CallbackMode`] list.

use persista_core::{Error, InstanceId, Result, TypeName};
use std::sync::Arc;
use tracing::warn;

use crate::config::CallbackMode;
use crate::session::Session;

/// Kinds of per-instance events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEventType {
    /// Before a transient instance becomes persistent
    BeforePersist,
    /// After an instance became persistent
    AfterPersist,
    /// After the insert reached the store
    AfterPersistPerformed,
    /// Before an instance is deleted
    BeforeDelete,
    /// After an instance was marked deleted
    AfterDelete,
    /// After the delete reached the store
    AfterDeletePerformed,
    /// Before an instance is written by a flush
    BeforeStore,
    /// After an instance was written by a flush
    AfterStore,
    /// Before field values are discarded
    BeforeClear,
    /// After field values were discarded
    AfterClear,
    /// Before the first change in a transaction
    BeforeDirty,
    /// After the first change in a transaction
    AfterDirty,
    /// Before the first change since the last flush
    BeforeDirtyFlushed,
    /// After the first change since the last flush
    AfterDirtyFlushed,
    /// After fields were loaded from the store
    AfterLoad,
    /// After a refresh
    AfterRefresh,
    /// Before an update is flushed
    BeforeUpdate,
    /// After the update reached the store
    AfterUpdatePerformed,
    /// Before detaching
    BeforeDetach,
    /// After detaching
    AfterDetach,
    /// Before attaching
    BeforeAttach,
    /// After attaching
    AfterAttach,
}

/// Event about one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    /// What happened
    pub kind: LifecycleEventType,
    /// Instance concerned
    pub instance: InstanceId,
    /// Its type
    pub type_name: TypeName,
}

/// Kinds of transaction events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionEventType {
    /// A transaction began
    AfterBegin,
    /// A flush is starting
    BeforeFlush,
    /// A flush completed
    AfterFlush,
    /// Commit is starting; listeners may still change instances
    BeforeCommit,
    /// The store committed
    AfterCommit,
    /// The store rolled back
    AfterRollback,
    /// Every instance has taken its post-transaction state
    AfterStateTransitions,
    /// Commit fully finished
    AfterCommitComplete,
    /// Rollback fully finished
    AfterRollbackComplete,
}

/// Event about the transaction as a whole
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionEvent {
    /// What happened
    pub kind: TransactionEventType,
    /// Instances enlisted when the event fired
    pub instances: Vec<InstanceId>,
}

/// Receives lifecycle events
///
/// Listeners are re-entrant: work a listener does on the session fires
/// further events, and those reach every listener again, including the one
/// still running. State a listener keeps needs its own interior mutability.
pub trait LifecycleListener: Send + Sync {
    /// Handle one event
    fn on_event(&self, session: &mut Session, event: &LifecycleEvent) -> Result<()>;
}

impl<F> LifecycleListener for F
where
    F: Fn(&mut Session, &LifecycleEvent) -> Result<()> + Send + Sync,
{
    fn on_event(&self, session: &mut Session, event: &LifecycleEvent) -> Result<()> {
        self(session, event)
    }
}

/// Receives transaction events
pub trait TransactionListener: Send + Sync {
    /// Handle one event
    fn on_event(&self, session: &mut Session, event: &TransactionEvent) -> Result<()>;
}

impl<F> TransactionListener for F
where
    F: Fn(&mut Session, &TransactionEvent) -> Result<()> + Send + Sync,
{
    fn on_event(&self, session: &mut Session, event: &TransactionEvent) -> Result<()> {
        self(session, event)
    }
}

/// Registered lifecycle listener
pub type SharedLifecycleListener = Arc<dyn LifecycleListener>;

/// Registered transaction listener
pub type SharedTransactionListener = Arc<dyn TransactionListener>;

/// Listener failure handling, as a flag set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallbackModes {
    /// Swallow failures
    pub ignore: bool,
    /// Log failures at warn
    pub log: bool,
    /// Return failures to the caller
    pub rethrow: bool,
    /// Mark the transaction rollback-only
    pub rollback: bool,
    /// Stop after the first failure
    pub fail_fast: bool,
}

impl CallbackModes {
    /// Flag set from the configured list
    pub fn from_modes(modes: &[CallbackMode]) -> Self {
        let mut out = CallbackModes::default();
        for mode in modes {
            match mode {
                CallbackMode::Ignore => out.ignore = true,
                CallbackMode::Log => out.log = true,
                CallbackMode::Rethrow => out.rethrow = true,
                CallbackMode::Rollback => out.rollback = true,
                CallbackMode::FailFast => out.fail_fast = true,
            }
        }
        out
    }

    /// What to do with the failures of one dispatch
    ///
    /// Returns the error to raise, if any, and whether the transaction must
    /// be marked rollback-only.
    pub fn resolve(&self, what: &str, errors: Vec<Error>) -> (Option<Error>, bool) {
        if errors.is_empty() {
            return (None, false);
        }
        if self.log {
            for error in &errors {
                warn!(target: "persista::events", event = what, %error, "Listener failed");
            }
        }
        let rethrow = self.rethrow && !self.ignore;
        let err = match errors.len() {
            1 if rethrow => errors.into_iter().next().map(wrap_single),
            n if rethrow => {
                Some(Error::callback(format!("{} listeners failed on {}", n, what)).with_nested(errors))
            }
            _ => None,
        };
        (err, self.rollback)
    }
}

fn wrap_single(error: Error) -> Error {
    match error {
        e @ Error::Callback { .. } => e,
        other => Error::callback(other.to_string()).with_nested(vec![other]),
    }
}
