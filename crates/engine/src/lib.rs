//! Session engine for persista
//!
//! This crate ties the lower layers together:
//! - Session: managed instances, the identity cache, operation bracketing
//! - Transactions: begin/flush/commit/rollback, managed mode, savepoints
//! - Detach/attach of instance copies
//! - Listeners, fetch configuration and session configuration
//!
//! The engine is the only component that knows about:
//! - How lifecycle transitions turn into cache and transactional-set changes
//! - When to call the store and the lock manager

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod config;
pub mod detach;
pub mod events;
pub mod fetch;
pub mod instance;
pub mod metrics;
pub mod policy;
pub mod savepoint;
pub mod session;
pub mod sync;
pub mod transactional;

pub use config::{AutoDetach, CallbackMode, DetachState, RestoreState, SessionConfig};
pub use detach::DetachedInstance;
pub use events::{
    CallbackModes, LifecycleEvent, LifecycleEventType, LifecycleListener, SharedLifecycleListener,
    SharedTransactionListener, TransactionEvent, TransactionEventType, TransactionListener,
};
pub use fetch::{FetchConfiguration, FetchHint};
pub use instance::{InstanceSnapshot, ManagedInstance};
pub use metrics::MetricsSnapshot;
pub use policy::{OpAction, OpCallbacks, OpKind, VersionCheckContext, VersionCheckPolicy};
pub use savepoint::{MemorySavepoints, SavepointStore};
pub use session::{CancelHandle, FlushReason, Session, SessionBuilder, SharedSession};
pub use sync::{CompletionStatus, ExternalTransaction};
