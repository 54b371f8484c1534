//! Persista Comprehensive Test Suite
//!
//! End-to-end coverage of the facade: sessions over the in-memory store,
//! several sessions sharing one database, configuration files and injected
//! store faults.
//!
//! ## Modules
//!
//! - `workflows`: multi-session visibility, identity, embedded values
//! - `config_files`: sessions configured from `persista.toml`
//! - `store_faults`: begin, load, flush and commit failures
//! - `model`: random transactions checked against a simple model
//!
//! ## Running Tests
//!
//! ```bash
//! # Run the whole suite
//! cargo test --test persista_comprehensive
//!
//! # Run one module
//! cargo test --test persista_comprehensive store_faults::
//!
//! # Run with log output
//! RUST_LOG=persista=debug cargo test --test persista_comprehensive -- --nocapture
//! ```

use std::sync::Arc;

use persista::{
    FieldDescriptor, FieldValue, IdKey, IdentityStrategy, LockTable, MemoryDatabase, MemoryStore,
    ObjectId, Session, SessionConfig, StaticRepository, TypeDescriptor,
};

pub mod config_files;
pub mod model;
pub mod store_faults;
pub mod workflows;

// =============================================================================
// SHARED TEST UTILITIES
// =============================================================================

/// Field indexes of `Account`
pub const OWNER: usize = 1;
pub const BALANCE: usize = 2;

/// Install a log subscriber once; later calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Types used across the suite
pub fn catalog() -> Arc<StaticRepository> {
    Arc::new(
        StaticRepository::new()
            .with(
                TypeDescriptor::builder("Account")
                    .field(FieldDescriptor::new("id").primary_key())
                    .field(FieldDescriptor::new("owner"))
                    .field(FieldDescriptor::new("balance"))
                    .field(FieldDescriptor::new("branch").reference("Branch"))
                    .field(FieldDescriptor::new("contact").embedded("Contact"))
                    .build()
                    .expect("Account descriptor"),
            )
            .with(
                TypeDescriptor::builder("Branch")
                    .identity(IdentityStrategy::Sequence)
                    .field(FieldDescriptor::new("id").primary_key())
                    .field(FieldDescriptor::new("city"))
                    .build()
                    .expect("Branch descriptor"),
            )
            .with(
                TypeDescriptor::builder("Contact")
                    .embedded_only()
                    .field(FieldDescriptor::new("email"))
                    .field(FieldDescriptor::new("phone"))
                    .build()
                    .expect("Contact descriptor"),
            ),
    )
}

/// One database and lock table, any number of sessions
pub struct Harness {
    pub repo: Arc<StaticRepository>,
    pub db: Arc<MemoryDatabase>,
    pub locks: Arc<LockTable>,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let repo = catalog();
        let db = MemoryDatabase::new(repo.clone());
        Harness {
            repo,
            db,
            locks: LockTable::new(),
        }
    }

    /// Session with its own store connection
    pub fn session(&self, config: SessionConfig) -> Session {
        self.session_with_store(config).0
    }

    /// Session plus the connection it uses, for stats and fault injection
    pub fn session_with_store(&self, config: SessionConfig) -> (Session, Arc<MemoryStore>) {
        let store = Arc::new(self.db.connect());
        let session = Session::builder(
            self.repo.clone(),
            store.clone(),
            Arc::new(self.locks.manager()),
        )
        .config(config)
        .build()
        .expect("session");
        (session, store)
    }

    /// Store an account directly, bypassing any session
    pub fn seed_account(&self, n: i64, owner: &str, balance: i64) -> ObjectId {
        let oid = account(n);
        self.db.put(
            oid.clone(),
            [
                (0, FieldValue::Int(n)),
                (OWNER, FieldValue::from(owner)),
                (BALANCE, FieldValue::Int(balance)),
            ],
        );
        oid
    }

    /// Committed balance of account `n`
    pub fn balance(&self, n: i64) -> Option<FieldValue> {
        self.db.get(&account(n)).map(|row| row.get(BALANCE))
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

pub fn account(n: i64) -> ObjectId {
    ObjectId::new("Account", IdKey::Long(n))
}
