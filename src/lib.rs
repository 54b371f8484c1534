//! Persista - transactional object persistence kernel
//!
//! Persista manages in-memory instances of persistent types on behalf of an
//! application: it tracks their lifecycle state, which fields are loaded and
//! dirty, flushes changes to a store and coordinates commit, rollback and
//! savepoints.
//!
//! # Quick Start
//!
//! ```ignore
//! use persista::{
//!     FieldDescriptor, LockTable, MemoryDatabase, Session, SessionConfig, StaticRepository,
//!     TypeDescriptor,
//! };
//! use std::sync::Arc;
//!
//! let repo = Arc::new(StaticRepository::new().with(
//!     TypeDescriptor::builder("Person")
//!         .field(FieldDescriptor::new("id").primary_key())
//!         .field(FieldDescriptor::new("name"))
//!         .build()?,
//! ));
//! let db = MemoryDatabase::new(repo.clone());
//! let locks = LockTable::new();
//! let mut session = Session::builder(repo, Arc::new(db.connect()), Arc::new(locks.manager()))
//!     .config(SessionConfig::default())
//!     .build()?;
//!
//! let ada = session.new_instance_with("Person", &[("id", 1i64.into()), ("name", "Ada".into())])?;
//! session.begin()?;
//! session.persist(ada)?;
//! session.commit()?;
//! ```
//!
//! # Architecture
//!
//! - `persista-core`: identities, values, metadata, collaborator traits, errors
//! - `persista-lifecycle`: the lifecycle state machine
//! - `persista-storage`: in-memory store and lock manager
//! - `persista-engine`: the session
//!
//! The layers are re-exported here; applications normally need nothing else.

pub use persista_core::{
    AssignRequest, Cascade, CascadeMode, Error, ErrorKind, FieldDescriptor, FieldKind, FieldSet,
    FieldValue, FlushEntry, FlushFailure, FlushOp, FlushOutcome, IdKey, IdentityStrategy,
    InstanceId, LoadRequest, LoadedState, LockLevel, LockManager, Management, MetadataRepository,
    ObjectId, Result, StaticRepository, StoreManager, TypeDescriptor, TypeDescriptorBuilder,
    TypeName, UpdateStrategy, Version, DEFAULT_FETCH_GROUP,
};
pub use persista_engine::{
    AutoDetach, CallbackMode, CancelHandle, CompletionStatus, DetachState, DetachedInstance,
    ExternalTransaction, FetchConfiguration, FetchHint, LifecycleEvent, LifecycleEventType,
    ManagedInstance, MetricsSnapshot, OpAction, OpCallbacks, OpKind, RestoreState, Session,
    SessionBuilder, SessionConfig, SharedSession, TransactionEvent, TransactionEventType,
    VersionCheckPolicy,
};
pub use persista_engine::config::CONFIG_FILE_NAME;
pub use persista_lifecycle::{PersistentState, StateEvent};
pub use persista_storage::{
    Fault, FaultInjector, LockTable, MemoryDatabase, MemoryLockManager, MemoryStore,
    NoLockManager,
};
