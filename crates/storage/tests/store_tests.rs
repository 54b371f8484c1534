//! Integration tests for persista-storage
//!
//! These tests exercise the reference collaborators across threads:
//!
//! 1. **Isolation** - connections see each other's writes only after commit
//! 2. **Cancellation** - cancel_all() from a watchdog aborts a slow flush
//! 3. **Locking** - blocked lock requests wake up on release
//!
//! ```bash
//! cargo test -p persista-storage --test store_tests
//! ```

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use persista_core::{
    ErrorKind, FieldDescriptor, FieldValue, FlushEntry, FlushOp, IdKey, InstanceId, LockLevel,
    LockManager, ObjectId, StaticRepository, StoreManager, TypeDescriptor, TypeName,
};
use persista_storage::{Fault, LockTable, MemoryDatabase, MemoryStore};

// ============================================================================
// Test Helpers
// ============================================================================

fn database() -> Arc<MemoryDatabase> {
    let repo = StaticRepository::new().with(
        TypeDescriptor::builder("Account")
            .field(FieldDescriptor::new("id").primary_key())
            .field(FieldDescriptor::new("balance"))
            .build()
            .unwrap(),
    );
    MemoryDatabase::new(Arc::new(repo))
}

fn account(n: i64) -> ObjectId {
    ObjectId::new("Account", IdKey::Long(n))
}

fn insert(n: i64) -> FlushEntry {
    FlushEntry {
        instance: InstanceId::new(n as u64),
        oid: Some(account(n)),
        type_name: TypeName::new("Account"),
        op: FlushOp::Insert,
        values: vec![(0, FieldValue::Int(n)), (1, FieldValue::Int(100))],
        version: None,
        check_version: false,
        update_version: false,
    }
}

// ============================================================================
// SECTION 1: Isolation
// ============================================================================

mod isolation {
    use super::*;

    #[test]
    fn concurrent_inserts_of_same_row_one_wins() {
        let db = database();
        let a = db.connect();
        let b = db.connect();
        a.begin().unwrap();
        b.begin().unwrap();
        assert!(a.flush(&[insert(1)]).is_success());
        assert!(b.flush(&[insert(1)]).is_success());
        a.commit().unwrap();
        let err = b.commit().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Optimistic);
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn commit_failure_leaves_connection_reusable() {
        let db = database();
        let store = db.connect();
        store.begin().unwrap();
        store.flush(&[insert(1)]);
        store.faults().fail_next_commit(Fault::Store);
        assert_eq!(store.commit().unwrap_err().kind(), ErrorKind::Store);
        assert!(db.is_empty());

        store.begin().unwrap();
        store.flush(&[insert(1)]);
        store.commit().unwrap();
        assert_eq!(db.len(), 1);
        assert_eq!(store.stats().commits, 1);
    }

    #[test]
    fn injected_flush_fault_fails_only_that_entry() {
        let db = database();
        let store = db.connect();
        store.faults().fail_flush(account(2), Fault::Optimistic);
        store.begin().unwrap();
        let outcome = store.flush(&[insert(1), insert(2), insert(3)]);
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failed(InstanceId::new(2)));
        assert_eq!(outcome.versions.len(), 2);
        assert_eq!(store.last_flush().len(), 3);
    }
}

// ============================================================================
// SECTION 2: Cancellation
// ============================================================================

mod cancellation {
    use super::*;

    #[test]
    fn watchdog_cancels_slow_flush() {
        let db = database();
        let store = Arc::new(db.connect());
        store.faults().delay_flush(Duration::from_millis(20));
        store.begin().unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let watchdog = {
            let store: Arc<dyn StoreManager> = Arc::clone(&store) as Arc<dyn StoreManager>;
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let deadline = Instant::now() + Duration::from_secs(5);
                while Instant::now() < deadline {
                    if store.cancel_all().unwrap() {
                        return true;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                false
            })
        };

        let entries: Vec<FlushEntry> = (1..=50).map(insert).collect();
        barrier.wait();
        let outcome = store.flush(&entries);
        assert!(watchdog.join().unwrap());
        assert!(!outcome.is_success());
        assert!(outcome
            .failures
            .iter()
            .all(|f| f.error.message().contains("cancelled")));
        assert!(outcome.failures.len() < 50);
    }

    #[test]
    fn cancel_flag_does_not_leak_into_next_flush() {
        let db = database();
        let store: MemoryStore = db.connect();
        store.begin().unwrap();
        assert!(!store.cancel_all().unwrap());
        assert!(store.flush(&[insert(1)]).is_success());
    }
}

// ============================================================================
// SECTION 3: Locking
// ============================================================================

mod locking {
    use super::*;

    #[test]
    fn blocked_writer_wakes_on_release() {
        let table = LockTable::new();
        let holder = table.manager();
        holder
            .lock(InstanceId::new(1), Some(&account(1)), LockLevel::Write, -1)
            .unwrap();

        let waiter = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                let m = table.manager();
                let started = Instant::now();
                m.lock(InstanceId::new(9), Some(&account(1)), LockLevel::Write, -1)
                    .unwrap();
                started.elapsed()
            })
        };

        thread::sleep(Duration::from_millis(30));
        holder.release(InstanceId::new(1));
        let waited = waiter.join().unwrap();
        assert!(waited >= Duration::from_millis(20));
    }

    #[test]
    fn timeout_is_bounded() {
        let table = LockTable::new();
        let holder = table.manager();
        holder
            .lock(InstanceId::new(1), Some(&account(1)), LockLevel::Read, 0)
            .unwrap();
        let other = table.manager();
        let started = Instant::now();
        let err = other
            .lock(InstanceId::new(2), Some(&account(1)), LockLevel::Write, 50)
            .unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(err.kind(), ErrorKind::LockTimeout);
    }
}
