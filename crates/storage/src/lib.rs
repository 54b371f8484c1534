//! Reference collaborators for persista
//!
//! This crate implements the storage and lock contracts of `persista-core`
//! entirely in memory:
//! - MemoryDatabase: the shared, committed table (DashMap keyed by ObjectId)
//! - MemoryStore: one connection; buffers a datastore transaction and
//!   validates it first-committer-wins at commit
//! - LockTable / MemoryLockManager: per-object read/write locks with
//!   millisecond timeouts, shared between connections
//! - NoLockManager: accepts every lock request and holds nothing
//! - FaultInjector: scripted failures and delays for tests
//!
//! # Transactions
//!
//! `begin` starts a datastore transaction immediately. `begin_optimistic`
//! defers it until the first flush; committing an optimistic transaction
//! that never flushed touches nothing.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod database;
pub mod faults;
pub mod lock;
pub mod store;
pub mod validation;

pub use database::{MemoryDatabase, StoredRow};
pub use faults::{Fault, FaultInjector};
pub use lock::{LockTable, MemoryLockManager, NoLockManager};
pub use store::{MemoryStore, StoreStats, StoreStatsSnapshot};
pub use validation::{ConflictType, ValidationResult};
