//! Multi-session concurrency tests
//!
//! Sessions sharing one database and one lock table:
//!
//! 1. **Pessimistic** - datastore locks, timeouts, blocked waiters
//! 2. **Optimistic** - first committer wins
//! 3. **Shared** - a session used from several threads, flush cancellation
//!
//! ```bash
//! cargo test -p persista-engine --test concurrency_tests
//! ```

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use persista_core::{
    ErrorKind, FieldDescriptor, FieldValue, IdKey, ObjectId, StaticRepository, TypeDescriptor,
};
use persista_engine::{Session, SessionConfig};
use persista_lifecycle::PersistentState;
use persista_storage::{LockTable, MemoryDatabase};

// ============================================================================
// Test Helpers
// ============================================================================

#[derive(Clone)]
struct Shared {
    repo: Arc<StaticRepository>,
    db: Arc<MemoryDatabase>,
    locks: Arc<LockTable>,
}

impl Shared {
    fn new() -> Self {
        let repo = Arc::new(
            StaticRepository::new().with(
                TypeDescriptor::builder("Person")
                    .field(FieldDescriptor::new("id").primary_key())
                    .field(FieldDescriptor::new("name"))
                    .field(FieldDescriptor::new("age"))
                    .build()
                    .unwrap(),
            ),
        );
        let db = MemoryDatabase::new(repo.clone());
        Shared {
            repo,
            db,
            locks: LockTable::new(),
        }
    }

    fn session(&self, config: SessionConfig) -> Session {
        Session::builder(
            self.repo.clone(),
            Arc::new(self.db.connect()),
            Arc::new(self.locks.manager()),
        )
        .config(config)
        .build()
        .unwrap()
    }

    fn seed(&self, n: i64, age: i64) -> ObjectId {
        let oid = ObjectId::new("Person", IdKey::Long(n));
        self.db.put(
            oid.clone(),
            [
                (0, FieldValue::Int(n)),
                (1, FieldValue::from("p")),
                (2, FieldValue::Int(age)),
            ],
        );
        oid
    }
}

fn pessimistic(timeout_ms: i64) -> SessionConfig {
    SessionConfig {
        optimistic: false,
        lock_timeout_ms: timeout_ms,
        ..SessionConfig::default()
    }
}

// ============================================================================
// SECTION 1: Pessimistic
// ============================================================================

mod pessimistic_locking {
    use super::*;

    #[test]
    fn conflicting_reader_times_out() {
        let shared = Shared::new();
        let oid = shared.seed(1, 30);
        let mut s1 = shared.session(pessimistic(50));
        let mut s2 = shared.session(pessimistic(50));

        s1.begin().unwrap();
        let p1 = s1.find(&oid).unwrap().unwrap();
        s1.set_field(p1, "age", 40i64).unwrap();
        assert!(shared.locks.is_write_locked(&oid));

        s2.begin().unwrap();
        let err = s2.find(&oid).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockTimeout);
        assert!(!err.is_fatal());
        assert!(s2.cached(&oid).is_none());

        s1.commit().unwrap();
        assert!(!shared.locks.is_locked(&oid));

        let p2 = s2.find(&oid).unwrap().unwrap();
        assert_eq!(s2.get_field(p2, "age").unwrap(), FieldValue::Int(40));
        s2.commit().unwrap();
    }

    #[test]
    fn blocked_reader_proceeds_after_commit() {
        let shared = Shared::new();
        let oid = shared.seed(1, 30);
        let mut s1 = shared.session(pessimistic(-1));

        s1.begin().unwrap();
        let p1 = s1.find(&oid).unwrap().unwrap();
        s1.set_field(p1, "age", 40i64).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let reader = {
            let shared = shared.clone();
            let barrier = barrier.clone();
            let oid = oid.clone();
            thread::spawn(move || {
                let mut s2 = shared.session(pessimistic(-1));
                s2.begin().unwrap();
                barrier.wait();
                let p2 = s2.find(&oid).unwrap().unwrap();
                let age = s2.get_field(p2, "age").unwrap();
                s2.commit().unwrap();
                age
            })
        };

        barrier.wait();
        thread::sleep(Duration::from_millis(50));
        s1.commit().unwrap();

        assert_eq!(reader.join().unwrap(), FieldValue::Int(40));
    }

    #[test]
    fn rollback_releases_locks() {
        let shared = Shared::new();
        let oid = shared.seed(1, 30);
        let mut s1 = shared.session(pessimistic(50));

        s1.begin().unwrap();
        let p1 = s1.find(&oid).unwrap().unwrap();
        s1.set_field(p1, "age", 40i64).unwrap();
        s1.rollback().unwrap();
        assert!(!shared.locks.is_locked(&oid));
        assert_eq!(shared.db.get(&oid).unwrap().get(2), FieldValue::Int(30));
    }
}

// ============================================================================
// SECTION 2: Optimistic
// ============================================================================

mod optimistic_locking {
    use super::*;

    #[test]
    fn first_committer_wins() {
        let shared = Shared::new();
        let oid = shared.seed(1, 30);
        let mut s1 = shared.session(SessionConfig::default());
        let mut s2 = shared.session(SessionConfig::default());

        s1.begin().unwrap();
        s2.begin().unwrap();
        let p1 = s1.find(&oid).unwrap().unwrap();
        let p2 = s2.find(&oid).unwrap().unwrap();
        s1.set_field(p1, "age", 41i64).unwrap();
        s2.set_field(p2, "age", 42i64).unwrap();

        s1.commit().unwrap();
        let err = s2.commit().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Optimistic);
        assert_eq!(err.failed(), &[p2]);
        assert!(!s2.is_active());
        assert_eq!(s2.metrics().rolled_back, 1);

        assert_eq!(shared.db.get(&oid).unwrap().get(2), FieldValue::Int(41));
    }

    #[test]
    fn refreshed_loser_can_retry() {
        let shared = Shared::new();
        let oid = shared.seed(1, 30);
        let mut s1 = shared.session(SessionConfig::default());
        let mut s2 = shared.session(SessionConfig::default());

        s2.begin().unwrap();
        let p2 = s2.find(&oid).unwrap().unwrap();

        s1.begin().unwrap();
        let p1 = s1.find(&oid).unwrap().unwrap();
        s1.set_field(p1, "age", 41i64).unwrap();
        s1.commit().unwrap();

        s2.refresh(p2).unwrap();
        s2.set_field(p2, "age", 42i64).unwrap();
        s2.commit().unwrap();
        assert_eq!(shared.db.get(&oid).unwrap().get(2), FieldValue::Int(42));
    }

    #[test]
    fn read_lock_detects_concurrent_update() {
        let shared = Shared::new();
        let oid = shared.seed(1, 30);
        let mut s1 = shared.session(SessionConfig::default());

        s1.begin().unwrap();
        let p1 = s1.find(&oid).unwrap().unwrap();
        s1.lock(p1, persista_core::LockLevel::Read).unwrap();
        shared.db.touch(&oid);

        let err = s1.commit().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Optimistic);
        assert_eq!(s1.state(p1).unwrap(), PersistentState::PNonTrans);
    }
}

// ============================================================================
// SECTION 3: Shared
// ============================================================================

mod shared_session {
    use super::*;

    #[test]
    fn sharing_requires_multithreaded() {
        let shared = Shared::new();
        let session = shared.session(SessionConfig::default());
        let err = session.into_shared().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::User);
    }

    #[test]
    fn threads_take_turns() {
        let shared = Shared::new();
        let config = SessionConfig {
            multithreaded: true,
            ..SessionConfig::default()
        };
        let session = shared.session(config).into_shared().unwrap();
        session.with(|s| s.begin()).unwrap();

        let workers: Vec<_> = (0..4i64)
            .map(|t| {
                let session = session.clone();
                thread::spawn(move || {
                    for i in 0..5i64 {
                        let n = t * 10 + i;
                        session
                            .with(|s| {
                                let id = s.new_instance_with("Person", &[("id", n.into())])?;
                                s.persist(id)
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        session.with(|s| s.commit()).unwrap();
        assert_eq!(shared.db.len(), 20);
    }

    #[test]
    fn watchdog_cancels_slow_flush() {
        let shared = Shared::new();
        let config = SessionConfig {
            multithreaded: true,
            ..SessionConfig::default()
        };
        let store = Arc::new(shared.db.connect());
        store.faults().delay_flush(Duration::from_millis(100));
        let session = Session::builder(
            shared.repo.clone(),
            store.clone(),
            Arc::new(shared.locks.manager()),
        )
        .config(config)
        .build()
        .unwrap()
        .into_shared()
        .unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let worker = {
            let session = session.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                session
                    .with(|s| {
                        s.begin()?;
                        for n in 1..=5i64 {
                            let id = s.new_instance_with("Person", &[("id", n.into())])?;
                            s.persist(id)?;
                        }
                        Ok::<_, persista_core::Error>(())
                    })
                    .unwrap();
                barrier.wait();
                session.with(|s| s.flush())
            })
        };

        barrier.wait();
        thread::sleep(Duration::from_millis(50));
        assert!(session.cancel_all().unwrap());

        let err = worker.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Store);
        assert!(err.is_fatal());

        session.with(|s| {
            assert!(s.is_rollback_only());
            s.rollback().unwrap();
            assert_eq!(s.metrics().flush_failures, 1);
        });
        assert!(shared.db.is_empty());
    }
}
