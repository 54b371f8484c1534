//! Store Fault Tests
//!
//! Failures injected into the in-memory store:
//! - A failed begin leaves no transaction behind
//! - Load failures do not leave half-built instances in the cache
//! - Flush failures mark the transaction rollback-only and aggregate per batch
//! - A failed store commit rolls the session back

use crate::*;
use persista::{ErrorKind, Fault, InstanceId, PersistentState};

fn new_accounts(s: &mut Session, ids: &[i64]) -> Vec<InstanceId> {
    ids.iter()
        .map(|&n| {
            let a = s
                .new_instance_with("Account", &[("id", n.into()), ("balance", 0i64.into())])
                .unwrap();
            s.persist(a).unwrap();
            a
        })
        .collect()
}

// =============================================================================
// BEGIN AND LOAD
// =============================================================================

#[test]
fn test_failed_begin_is_fatal_and_clean() {
    let h = Harness::new();
    let (mut s, store) = h.session_with_store(SessionConfig::default());
    store.faults().fail_next_begin(Fault::Store);

    let err = s.begin().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Store);
    assert!(err.is_fatal());
    assert!(!s.is_active());

    s.begin().unwrap();
    assert!(s.is_active());
}

#[test]
fn test_failed_load_is_not_cached() {
    let h = Harness::new();
    let oid = h.seed_account(1, "ada", 100);
    let (mut s, store) = h.session_with_store(SessionConfig::default());
    store.faults().fail_load(oid.clone(), Fault::Store);

    assert_eq!(s.find(&oid).unwrap_err().kind(), ErrorKind::Store);
    assert!(s.cached(&oid).is_none());
    assert!(s.instance_ids().is_empty());

    store.faults().clear();
    let a = s.find(&oid).unwrap().unwrap();
    assert_eq!(s.get_field(a, "owner").unwrap(), FieldValue::from("ada"));
}

// =============================================================================
// FLUSH
// =============================================================================

#[test]
fn test_single_store_failure_marks_rollback_only() {
    let h = Harness::new();
    let (mut s, store) = h.session_with_store(SessionConfig::default());
    store.faults().fail_flush(account(2), Fault::Store);

    s.begin().unwrap();
    let ids = new_accounts(&mut s, &[1, 2]);
    let err = s.flush().unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Store);
    assert!(err.is_fatal());
    assert_eq!(err.failed(), &[ids[1]]);
    assert!(s.get(ids[0]).unwrap().is_flushed());
    assert!(!s.get(ids[1]).unwrap().is_flushed());
    assert!(s.is_rollback_only());
    assert_eq!(s.metrics().flush_failures, 1);

    assert_eq!(s.persist(ids[0]).unwrap_err().kind(), ErrorKind::InvalidState);
    s.rollback().unwrap();
    assert!(h.db.is_empty());
    assert_eq!(s.state(ids[0]).unwrap(), PersistentState::Transient);
}

#[test]
fn test_mostly_optimistic_batch_is_optimistic() {
    let h = Harness::new();
    let (mut s, store) = h.session_with_store(SessionConfig::default());
    store.faults().fail_flush(account(1), Fault::Optimistic);
    store.faults().fail_flush(account(2), Fault::Optimistic);
    store.faults().fail_flush(account(3), Fault::Store);

    s.begin().unwrap();
    let ids = new_accounts(&mut s, &[1, 2, 3, 4]);
    let err = s.flush().unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Optimistic);
    let mut failed = err.failed().to_vec();
    failed.sort();
    assert_eq!(failed, ids[..3].to_vec());
    assert_eq!(err.nested().len(), 3);
    assert!(s.get(ids[3]).unwrap().is_flushed());
    s.rollback().unwrap();
}

#[test]
fn test_evenly_split_batch_is_store_failure() {
    let h = Harness::new();
    let (mut s, store) = h.session_with_store(SessionConfig::default());
    store.faults().fail_flush(account(1), Fault::Optimistic);
    store.faults().fail_flush(account(2), Fault::Store);

    s.begin().unwrap();
    new_accounts(&mut s, &[1, 2]);
    let err = s.flush().unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Store);
    assert!(err.is_fatal());
    assert_eq!(err.failed().len(), 2);
    s.rollback().unwrap();
}

#[test]
fn test_lock_timeout_during_flush_is_retryable() {
    let h = Harness::new();
    let (mut s, store) = h.session_with_store(SessionConfig::default());
    store.faults().fail_flush(account(1), Fault::LockTimeout);

    s.begin().unwrap();
    new_accounts(&mut s, &[1]);
    let err = s.commit().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockTimeout);
    assert!(err.is_retryable());
    assert!(!s.is_active());

    store.faults().clear();
    s.begin().unwrap();
    let retry = new_accounts(&mut s, &[1]);
    s.commit().unwrap();
    assert_eq!(s.state(retry[0]).unwrap(), PersistentState::PNonTrans);
    assert_eq!(h.balance(1), Some(FieldValue::Int(0)));
}

// =============================================================================
// COMMIT
// =============================================================================

#[test]
fn test_failed_store_commit_rolls_back() {
    let h = Harness::new();
    let (mut s, store) = h.session_with_store(SessionConfig::default());
    store.faults().fail_next_commit(Fault::Store);

    s.begin().unwrap();
    let ids = new_accounts(&mut s, &[1]);
    let err = s.commit().unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Store);
    assert!(!s.is_active());
    assert!(h.db.is_empty());
    assert_eq!(s.state(ids[0]).unwrap(), PersistentState::Transient);
    assert_eq!(store.stats().commits, 0);
    assert_eq!(s.metrics().rolled_back, 1);
}
