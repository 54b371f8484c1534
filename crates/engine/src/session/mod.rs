//! The session (broker)
//!
//! A [`Session`] owns every [`ManagedInstance`] it creates, identified by
//! [`InstanceId`] handles, and coordinates them against one
//! [`StoreManager`] connection.
//!
//! # Structure
//!
//! | Module | Concern |
//! |--------|---------|
//! | `state` | running transitions and carrying out their effects |
//! | `fields` | field reads, writes and loads |
//! | `lifecycle` | persist, delete, refresh, evict, lock, find, embed |
//! | `flush` | fixed-point pre-flush passes and the store flush |
//! | `transaction` | begin, commit, rollback, completion |
//! | `savepoints` | savepoint set/release/rollback |
//! | `detach` | detach, attach, auto-detach |
//!
//! # Operations
//!
//! Every public operation runs between [`begin_operation`] and
//! [`end_operation`]. Nesting is counted; the outermost end clears the set
//! of instances the operation has visited (which stops cascades going round
//! cycles) and runs non-transactional auto-detach.
//!
//! # Threads
//!
//! A `Session` is `Send` and is driven by one thread at a time. With
//! `multithreaded` configured, [`Session::into_shared`] wraps it in a mutex
//! that every call goes through. The only path that bypasses the session is
//! [`CancelHandle::cancel_all`], which goes straight to the store.
//!
//! [`begin_operation`]: Session::begin_operation
//! [`end_operation`]: Session::end_operation

mod detach;
mod fields;
mod flush;
mod lifecycle;
mod savepoints;
mod state;
mod transaction;

pub use flush::FlushReason;

use parking_lot::{Mutex, MutexGuard};
use persista_core::{
    Error, InstanceId, LockManager, MetadataRepository, ObjectId, Result, StoreManager,
    TypeDescriptor, TypeName,
};
use persista_lifecycle::PersistentState;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::InstanceCache;
use crate::config::{AutoDetach, CallbackMode, DetachState, RestoreState, SessionConfig};
use crate::events::{
    CallbackModes, LifecycleEvent, LifecycleEventType, LifecycleListener,
    SharedLifecycleListener, SharedTransactionListener, TransactionEvent, TransactionEventType,
    TransactionListener,
};
use crate::fetch::FetchConfiguration;
use crate::instance::ManagedInstance;
use crate::metrics::{MetricsSnapshot, SessionMetrics};
use crate::policy::{DefaultOpCallbacks, DefaultVersionCheck, OpCallbacks, VersionCheckPolicy};
use crate::savepoint::{MemorySavepoints, SavepointStore};
use crate::sync::ExternalTransaction;
use crate::transactional::TransactionalSet;

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`Session`]
pub struct SessionBuilder {
    metadata: Arc<dyn MetadataRepository>,
    store: Arc<dyn StoreManager>,
    locks: Arc<dyn LockManager>,
    config: SessionConfig,
    external: Option<Arc<dyn ExternalTransaction>>,
    op_callbacks: Arc<dyn OpCallbacks>,
    version_policy: Arc<dyn VersionCheckPolicy>,
    savepoints: Box<dyn SavepointStore>,
}

impl SessionBuilder {
    /// Use `config` instead of the defaults
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Coordinator for managed mode
    pub fn external(mut self, external: Arc<dyn ExternalTransaction>) -> Self {
        self.external = Some(external);
        self
    }

    /// Operation interception policy
    pub fn op_callbacks(mut self, callbacks: Arc<dyn OpCallbacks>) -> Self {
        self.op_callbacks = callbacks;
        self
    }

    /// Version check policy
    pub fn version_policy(mut self, policy: Arc<dyn VersionCheckPolicy>) -> Self {
        self.version_policy = policy;
        self
    }

    /// Savepoint storage
    pub fn savepoints(mut self, savepoints: Box<dyn SavepointStore>) -> Self {
        self.savepoints = savepoints;
        self
    }

    /// Validate the configuration and open the session
    ///
    /// # Errors
    ///
    /// Returns a user error when the configuration is inconsistent, or when
    /// managed mode is configured without an external transaction.
    pub fn build(self) -> Result<Session> {
        self.config.validate()?;
        if self.config.managed && self.external.is_none() {
            return Err(Error::user(
                "managed sessions need an external transaction coordinator",
            ));
        }
        let lifecycle_modes = CallbackModes::from_modes(&self.config.lifecycle_callback_mode);
        let transaction_modes = CallbackModes::from_modes(&self.config.transaction_callback_mode);
        info!(
            target: "persista::session",
            optimistic = self.config.optimistic,
            managed = self.config.managed,
            "Session opened"
        );
        Ok(Session {
            txset: TransactionalSet::with_clean_capacity(self.config.clean_capacity),
            config: self.config,
            metadata: self.metadata,
            store: self.store,
            locks: self.locks,
            external: self.external,
            op_callbacks: self.op_callbacks,
            version_policy: self.version_policy,
            savepoints: self.savepoints,
            instances: FxHashMap::default(),
            next_id: 0,
            cache: InstanceCache::new(),
            fetch: FetchConfiguration::new(),
            pending: BTreeSet::new(),
            deref: BTreeSet::new(),
            deref_additions: BTreeSet::new(),
            trans_additions: BTreeSet::new(),
            savepoint_cache: BTreeSet::new(),
            operating: FxHashSet::default(),
            op_depth: 0,
            status: TxnStatus::default(),
            rollback_cause: None,
            closed: false,
            persisted_types: BTreeSet::new(),
            updated_types: BTreeSet::new(),
            deleted_types: BTreeSet::new(),
            lifecycle_listeners: Vec::new(),
            transaction_listeners: Vec::new(),
            lifecycle_modes,
            transaction_modes,
            metrics: Arc::new(SessionMetrics::new()),
        })
    }
}

// ============================================================================
// Session
// ============================================================================

/// Transaction status flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct TxnStatus {
    active: bool,
    store_active: bool,
    flushing: bool,
    deref_deleting: bool,
    rollback_only: bool,
    flush_required: bool,
    flushed: bool,
    completing: bool,
}

/// Unit of work over managed instances
pub struct Session {
    config: SessionConfig,
    metadata: Arc<dyn MetadataRepository>,
    store: Arc<dyn StoreManager>,
    locks: Arc<dyn LockManager>,
    external: Option<Arc<dyn ExternalTransaction>>,
    op_callbacks: Arc<dyn OpCallbacks>,
    version_policy: Arc<dyn VersionCheckPolicy>,
    savepoints: Box<dyn SavepointStore>,

    instances: FxHashMap<InstanceId, ManagedInstance>,
    next_id: u64,
    cache: InstanceCache,
    fetch: FetchConfiguration,
    txset: TransactionalSet,
    /// Pending-transactional instances, enlisted at the next begin
    pending: BTreeSet<InstanceId>,
    /// Dependents that lost their last reference
    deref: BTreeSet<InstanceId>,
    deref_additions: BTreeSet<InstanceId>,
    /// Instances dirtied while a flush runs
    trans_additions: BTreeSet<InstanceId>,
    /// Instances touched since the last savepoint
    savepoint_cache: BTreeSet<InstanceId>,
    /// Instances the current outermost operation already visited
    operating: FxHashSet<InstanceId>,
    op_depth: u32,

    status: TxnStatus,
    rollback_cause: Option<Error>,
    closed: bool,

    persisted_types: BTreeSet<TypeName>,
    updated_types: BTreeSet<TypeName>,
    deleted_types: BTreeSet<TypeName>,

    lifecycle_listeners: Vec<SharedLifecycleListener>,
    transaction_listeners: Vec<SharedTransactionListener>,
    lifecycle_modes: CallbackModes,
    transaction_modes: CallbackModes,
    metrics: Arc<SessionMetrics>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("instances", &self.instances.len())
            .field("active", &self.status.active)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Start building a session over `store`, with `locks` for datastore
    /// locking and `metadata` for type descriptors
    pub fn builder(
        metadata: Arc<dyn MetadataRepository>,
        store: Arc<dyn StoreManager>,
        locks: Arc<dyn LockManager>,
    ) -> SessionBuilder {
        SessionBuilder {
            metadata,
            store,
            locks,
            config: SessionConfig::default(),
            external: None,
            op_callbacks: Arc::new(DefaultOpCallbacks),
            version_policy: Arc::new(DefaultVersionCheck),
            savepoints: Box::new(MemorySavepoints::new()),
        }
    }

    // =========================================================================
    // Operation bracketing
    // =========================================================================

    /// Enter an operation
    ///
    /// # Errors
    ///
    /// Returns a fatal invalid-state error once the session is closed.
    pub fn begin_operation(&mut self) -> Result<()> {
        self.enter(false)
    }

    /// Leave an operation
    ///
    /// # Errors
    ///
    /// Returns an internal error when called more often than
    /// [`begin_operation`](Self::begin_operation).
    pub fn end_operation(&mut self) -> Result<()> {
        if self.op_depth == 0 {
            return Err(Error::internal("end_operation without a matching begin_operation"));
        }
        self.op_depth -= 1;
        if self.op_depth > 0 {
            return Ok(());
        }
        self.operating.clear();
        if !self.status.active && self.config.auto_detaches_on(AutoDetach::NontxRead) {
            self.op_depth += 1;
            let detached = self.auto_detach_all();
            self.op_depth -= 1;
            detached?;
        }
        Ok(())
    }

    /// `strict` operations also fail while the transaction is rollback-only
    fn enter(&mut self, strict: bool) -> Result<()> {
        if self.closed {
            return Err(Error::invalid_state("the session is closed").into_fatal());
        }
        if self.op_depth == 0 {
            self.sync_with_managed()?;
        }
        if strict && self.status.active && self.status.rollback_only {
            return Err(self.rollback_only_error());
        }
        self.op_depth += 1;
        Ok(())
    }

    /// Run `body` as one operation
    fn operation<T>(&mut self, strict: bool, body: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.enter(strict)?;
        let out = body(self);
        let end = self.end_operation();
        let value = out?;
        end?;
        Ok(value)
    }

    /// Join a running managed transaction
    fn sync_with_managed(&mut self) -> Result<()> {
        if !self.config.sync_with_managed_transactions || self.status.active {
            return Ok(());
        }
        let joined = self.external.as_ref().map_or(false, |e| e.is_active());
        if joined {
            debug!(target: "persista::txn", "Joining managed transaction");
            self.begin_internal(false)?;
        }
        Ok(())
    }

    fn rollback_only_error(&self) -> Error {
        let cause = self
            .rollback_cause
            .as_ref()
            .map(|c| format!(": {}", c))
            .unwrap_or_default();
        Error::invalid_state(format!("the transaction is marked rollback-only{}", cause))
    }

    // =========================================================================
    // Assertions
    // =========================================================================

    fn assert_active_transaction(&self) -> Result<()> {
        if !self.status.active {
            return Err(Error::no_transaction("this operation needs an active transaction"));
        }
        if self.status.rollback_only {
            return Err(self.rollback_only_error());
        }
        Ok(())
    }

    fn assert_write_operation(&self) -> Result<()> {
        if !self.status.active && !self.config.nontransactional_write {
            return Err(Error::no_transaction(
                "writes outside a transaction are disabled (nontransactional_write = false)",
            ));
        }
        Ok(())
    }

    fn assert_read_operation(&self) -> Result<()> {
        if !self.status.active && !self.config.nontransactional_read {
            return Err(Error::no_transaction(
                "reads outside a transaction are disabled (nontransactional_read = false)",
            ));
        }
        Ok(())
    }

    // =========================================================================
    // Instance arena
    // =========================================================================

    fn allocate(&mut self) -> InstanceId {
        self.next_id += 1;
        InstanceId::new(self.next_id)
    }

    fn instance(&self, id: InstanceId) -> Result<&ManagedInstance> {
        self.instances
            .get(&id)
            .ok_or_else(|| Error::user(format!("{} is not an instance of this session", id)))
    }

    fn instance_mut(&mut self, id: InstanceId) -> Result<&mut ManagedInstance> {
        self.instances
            .get_mut(&id)
            .ok_or_else(|| Error::user(format!("{} is not an instance of this session", id)))
    }

    fn descriptor(&self, type_name: &str) -> Result<Arc<TypeDescriptor>> {
        self.metadata.descriptor(type_name)
    }

    /// Managed instance behind `id`
    pub fn get(&self, id: InstanceId) -> Option<&ManagedInstance> {
        self.instances.get(&id)
    }

    /// Lifecycle state of `id`
    ///
    /// # Errors
    ///
    /// Returns a user error for a handle this session did not create.
    pub fn state(&self, id: InstanceId) -> Result<PersistentState> {
        Ok(self.instance(id)?.state())
    }

    /// Durable id of `id`, once assigned
    pub fn object_id(&self, id: InstanceId) -> Result<Option<ObjectId>> {
        Ok(self.instance(id)?.oid().cloned())
    }

    /// Whether `id` is managed: persistent, transactional or pending
    pub fn contains(&self, id: InstanceId) -> bool {
        self.instances.get(&id).map_or(false, |inst| {
            let state = inst.state();
            state.is_persistent() || state.is_transactional() || state.is_pending_transactional()
        })
    }

    /// Instance managing `oid`, if it is cached
    pub fn cached(&self, oid: &ObjectId) -> Option<InstanceId> {
        self.cache.get(oid)
    }

    /// Instances enlisted in the current transaction, dirty first
    pub fn transactional_instances(&self) -> Vec<InstanceId> {
        self.txset.copy()
    }

    /// Dirty enlisted instances
    pub fn dirty_instances(&self) -> Vec<InstanceId> {
        self.txset.copy_dirty()
    }

    /// Instances waiting for the next transaction
    pub fn pending_instances(&self) -> Vec<InstanceId> {
        self.pending.iter().copied().collect()
    }

    /// Every instance handle, in creation order
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        let mut ids: Vec<_> = self.instances.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Types with instances persisted in this transaction
    pub fn persisted_types(&self) -> Vec<TypeName> {
        self.persisted_types.iter().cloned().collect()
    }

    /// Types with instances updated in this transaction
    pub fn updated_types(&self) -> Vec<TypeName> {
        self.updated_types.iter().cloned().collect()
    }

    /// Types with instances deleted in this transaction
    pub fn deleted_types(&self) -> Vec<TypeName> {
        self.deleted_types.iter().cloned().collect()
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Current configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Fetch configuration used by loads
    pub fn fetch(&self) -> &FetchConfiguration {
        &self.fetch
    }

    /// Mutable fetch configuration
    pub fn fetch_mut(&mut self) -> &mut FetchConfiguration {
        &mut self.fetch
    }

    /// Switch between optimistic and pessimistic transactions
    ///
    /// # Errors
    ///
    /// Returns an invalid-state error while a transaction is active.
    pub fn set_optimistic(&mut self, optimistic: bool) -> Result<()> {
        if self.status.active {
            return Err(Error::invalid_state(
                "optimistic mode cannot change while a transaction is active",
            ));
        }
        self.config.optimistic = optimistic;
        Ok(())
    }

    /// Keep field values after commit
    pub fn set_retain_state(&mut self, retain: bool) {
        self.config.retain_state = retain;
    }

    /// What rollback restores
    pub fn set_restore_state(&mut self, restore: RestoreState) {
        self.config.restore_state = restore;
    }

    /// Allow reads outside a transaction
    pub fn set_nontransactional_read(&mut self, allow: bool) {
        self.config.nontransactional_read = allow;
    }

    /// Allow writes outside a transaction
    pub fn set_nontransactional_write(&mut self, allow: bool) {
        self.config.nontransactional_write = allow;
    }

    /// Events that detach everything
    ///
    /// # Errors
    ///
    /// Returns a user error when `none` is combined with other events.
    pub fn set_auto_detach(&mut self, events: Vec<AutoDetach>) -> Result<()> {
        let mut next = self.config.clone();
        next.auto_detach = events;
        next.validate()?;
        self.config = next;
        Ok(())
    }

    /// Which fields detach copies
    pub fn set_detach_state(&mut self, state: DetachState) {
        self.config.detach_state = state;
    }

    /// Let `exists` ignore unflushed changes
    pub fn set_ignore_changes(&mut self, ignore: bool) {
        self.config.ignore_changes = ignore;
    }

    /// Failure handling for lifecycle listeners
    ///
    /// # Errors
    ///
    /// Returns a user error for contradictory modes.
    pub fn set_lifecycle_callback_mode(&mut self, modes: Vec<CallbackMode>) -> Result<()> {
        let mut next = self.config.clone();
        next.lifecycle_callback_mode = modes;
        next.validate()?;
        self.lifecycle_modes = CallbackModes::from_modes(&next.lifecycle_callback_mode);
        self.config = next;
        Ok(())
    }

    /// Failure handling for transaction listeners
    ///
    /// # Errors
    ///
    /// Returns a user error for contradictory modes.
    pub fn set_transaction_callback_mode(&mut self, modes: Vec<CallbackMode>) -> Result<()> {
        let mut next = self.config.clone();
        next.transaction_callback_mode = modes;
        next.validate()?;
        self.transaction_modes = CallbackModes::from_modes(&next.transaction_callback_mode);
        self.config = next;
        Ok(())
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    /// Register a lifecycle listener
    pub fn add_lifecycle_listener<L>(&mut self, listener: L) -> SharedLifecycleListener
    where
        L: LifecycleListener + 'static,
    {
        let shared: SharedLifecycleListener = Arc::new(listener);
        self.lifecycle_listeners.push(shared.clone());
        shared
    }

    /// Unregister a lifecycle listener
    pub fn remove_lifecycle_listener(&mut self, listener: &SharedLifecycleListener) -> bool {
        let before = self.lifecycle_listeners.len();
        self.lifecycle_listeners.retain(|l| !Arc::ptr_eq(l, listener));
        before != self.lifecycle_listeners.len()
    }

    /// Register a transaction listener
    pub fn add_transaction_listener<L>(&mut self, listener: L) -> SharedTransactionListener
    where
        L: TransactionListener + 'static,
    {
        let shared: SharedTransactionListener = Arc::new(listener);
        self.transaction_listeners.push(shared.clone());
        shared
    }

    /// Unregister a transaction listener
    pub fn remove_transaction_listener(&mut self, listener: &SharedTransactionListener) -> bool {
        let before = self.transaction_listeners.len();
        self.transaction_listeners.retain(|l| !Arc::ptr_eq(l, listener));
        before != self.transaction_listeners.len()
    }

    /// Deliver a lifecycle event
    ///
    /// Listeners registered while the event is being delivered first see
    /// the next event.
    fn fire(&mut self, kind: LifecycleEventType, id: InstanceId) -> Result<()> {
        if self.lifecycle_listeners.is_empty() {
            return Ok(());
        }
        let event = LifecycleEvent {
            kind,
            instance: id,
            type_name: self.instance(id)?.type_name().clone(),
        };
        let modes = self.lifecycle_modes;
        let mut errors = Vec::new();
        for listener in self.lifecycle_listeners.clone() {
            if let Err(e) = listener.on_event(self, &event) {
                errors.push(e);
                if modes.fail_fast {
                    break;
                }
            }
        }
        self.resolve_callbacks(modes, &format!("{:?}", kind), errors)
    }

    /// Deliver a transaction event
    fn fire_transaction(&mut self, kind: TransactionEventType) -> Result<()> {
        if self.transaction_listeners.is_empty() {
            return Ok(());
        }
        let event = TransactionEvent {
            kind,
            instances: self.txset.copy(),
        };
        let modes = self.transaction_modes;
        let mut errors = Vec::new();
        for listener in self.transaction_listeners.clone() {
            if let Err(e) = listener.on_event(self, &event) {
                errors.push(e);
                if modes.fail_fast {
                    break;
                }
            }
        }
        self.resolve_callbacks(modes, &format!("{:?}", kind), errors)
    }

    fn resolve_callbacks(&mut self, modes: CallbackModes, what: &str, errors: Vec<Error>) -> Result<()> {
        let cause = errors.first().cloned();
        let (error, rollback) = modes.resolve(what, errors);
        if rollback && self.status.active {
            if let Some(cause) = cause {
                self.mark_rollback_only(cause);
            }
        }
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Cancel, close, shared access
    // =========================================================================

    /// Handle that can cancel in-flight store work from another thread
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            store: self.store.clone(),
        }
    }

    /// Ask the store to abandon in-flight work
    pub fn cancel_all(&self) -> Result<bool> {
        self.store.cancel_all()
    }

    /// Counters
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Whether [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the session
    ///
    /// Later operations fail with a fatal invalid-state error.
    ///
    /// # Errors
    ///
    /// Returns an invalid-state error while a transaction is active.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.status.active {
            return Err(Error::invalid_state(
                "cannot close a session with an active transaction",
            ));
        }
        self.op_depth += 1;
        let detached = if self.config.auto_detaches_on(AutoDetach::Close) {
            self.auto_detach_all()
        } else {
            Ok(())
        };
        self.op_depth -= 1;
        detached?;
        if self.config.evict_from_cache_on_close {
            self.cache.clear();
        }
        self.savepoints.clear();
        self.savepoint_cache.clear();
        self.locks.close();
        self.store.close()?;
        self.closed = true;
        info!(target: "persista::session", instances = self.instances.len(), "Session closed");
        Ok(())
    }

    /// Wrap the session for use from several threads
    ///
    /// # Errors
    ///
    /// Returns a user error unless `multithreaded` is configured.
    pub fn into_shared(self) -> Result<SharedSession> {
        if !self.config.multithreaded {
            return Err(Error::user(
                "sharing a session across threads needs multithreaded = true",
            ));
        }
        let cancel = self.cancel_handle();
        Ok(SharedSession {
            inner: Arc::new(Mutex::new(self)),
            cancel,
        })
    }
}

/// Cancels in-flight store work without the session lock
#[derive(Clone)]
pub struct CancelHandle {
    store: Arc<dyn StoreManager>,
}

impl CancelHandle {
    /// Ask the store to abandon in-flight work
    ///
    /// Returns whether anything was in flight.
    pub fn cancel_all(&self) -> Result<bool> {
        self.store.cancel_all()
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle").finish_non_exhaustive()
    }
}

/// A session behind a mutex, for multithreaded use
#[derive(Clone)]
pub struct SharedSession {
    inner: Arc<Mutex<Session>>,
    cancel: CancelHandle,
}

impl SharedSession {
    /// Run `f` with the session locked
    pub fn with<T>(&self, f: impl FnOnce(&mut Session) -> T) -> T {
        f(&mut self.inner.lock())
    }

    /// Lock the session
    pub fn lock(&self) -> MutexGuard<'_, Session> {
        self.inner.lock()
    }

    /// Cancel in-flight store work; never takes the session lock
    pub fn cancel_all(&self) -> Result<bool> {
        self.cancel.cancel_all()
    }

    /// Detached cancel handle
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

impl std::fmt::Debug for SharedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSession").finish_non_exhaustive()
    }
}
