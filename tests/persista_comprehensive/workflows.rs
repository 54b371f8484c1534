//! Workflow Tests
//!
//! Several sessions over one database:
//! - Committed work becomes visible to other sessions, uncommitted work does not
//! - Each session keeps its own identity map
//! - References and embedded values survive a round trip through the store
//! - Listener events bracket the store work

use crate::*;
use parking_lot::Mutex;
use persista::{
    IdKey, InstanceId, LifecycleEvent, LifecycleEventType, PersistentState, Result,
};

// =============================================================================
// VISIBILITY
// =============================================================================

#[test]
fn test_commit_publishes_to_other_sessions() {
    let h = Harness::new();
    let mut writer = h.session(SessionConfig::default());
    let mut reader = h.session(SessionConfig::default());

    let a = writer
        .new_instance_with(
            "Account",
            &[("id", 1i64.into()), ("owner", "ada".into()), ("balance", 10i64.into())],
        )
        .unwrap();
    writer.begin().unwrap();
    writer.persist(a).unwrap();
    writer.flush().unwrap();

    assert!(reader.find(&account(1)).unwrap().is_none());
    assert!(h.balance(1).is_none());

    writer.commit().unwrap();
    let r = reader.find(&account(1)).unwrap().unwrap();
    assert_eq!(reader.get_field(r, "balance").unwrap(), FieldValue::Int(10));
}

#[test]
fn test_rolled_back_transfer_leaves_balances() {
    let h = Harness::new();
    h.seed_account(1, "ada", 100);
    h.seed_account(2, "bob", 0);
    let mut s = h.session(SessionConfig::default());

    s.begin().unwrap();
    let from = s.find(&account(1)).unwrap().unwrap();
    let to = s.find(&account(2)).unwrap().unwrap();
    s.set_field(from, "balance", 60i64).unwrap();
    s.set_field(to, "balance", 40i64).unwrap();
    s.flush().unwrap();
    s.rollback().unwrap();

    assert_eq!(h.balance(1), Some(FieldValue::Int(100)));
    assert_eq!(h.balance(2), Some(FieldValue::Int(0)));
    assert_eq!(s.get_field(from, "balance").unwrap(), FieldValue::Int(100));
    assert_eq!(s.metrics().rolled_back, 1);
}

#[test]
fn test_commit_and_resume_keeps_transaction_open() {
    let h = Harness::new();
    h.seed_account(1, "ada", 100);
    let mut s = h.session(SessionConfig::default());

    s.begin().unwrap();
    let a = s.find(&account(1)).unwrap().unwrap();
    s.set_field(a, "balance", 90i64).unwrap();
    s.commit_and_resume().unwrap();
    assert!(s.is_active());
    assert_eq!(h.balance(1), Some(FieldValue::Int(90)));

    s.set_field(a, "balance", 80i64).unwrap();
    s.rollback_and_resume().unwrap();
    assert!(s.is_active());
    assert_eq!(h.balance(1), Some(FieldValue::Int(90)));
    s.commit().unwrap();
    assert_eq!(s.metrics().begun, 3);
}

// =============================================================================
// IDENTITY
// =============================================================================

#[test]
fn test_identity_map_is_per_session() {
    let h = Harness::new();
    h.seed_account(1, "ada", 100);
    let mut s1 = h.session(SessionConfig::default());
    let mut s2 = h.session(SessionConfig::default());

    let a1 = s1.find(&account(1)).unwrap().unwrap();
    let again = s1.find(&account(1)).unwrap().unwrap();
    let a2 = s2.find(&account(1)).unwrap().unwrap();

    assert_eq!(a1, again);
    assert_eq!(s1.cached(&account(1)), Some(a1));
    assert_eq!(s2.cached(&account(1)), Some(a2));
    assert_eq!(s1.object_id(a1).unwrap(), s2.object_id(a2).unwrap());
}

#[test]
fn test_sequence_identities_are_distinct() {
    let h = Harness::new();
    let mut s = h.session(SessionConfig::default());

    let b1 = s.new_instance_with("Branch", &[("city", "Oslo".into())]).unwrap();
    let b2 = s.new_instance_with("Branch", &[("city", "Rome".into())]).unwrap();
    s.begin().unwrap();
    s.persist_all(&[b1, b2]).unwrap();
    s.commit().unwrap();

    let o1 = s.object_id(b1).unwrap().unwrap();
    let o2 = s.object_id(b2).unwrap().unwrap();
    assert_ne!(o1, o2);
    assert!(matches!(o1.key(), IdKey::Long(_)));
    assert!(h.db.contains(&o1) && h.db.contains(&o2));
}

// =============================================================================
// RELATIONS
// =============================================================================

#[test]
fn test_reference_resolves_in_fresh_session() {
    let h = Harness::new();
    let mut s = h.session(SessionConfig::default());

    let branch = s.new_instance_with("Branch", &[("city", "Oslo".into())]).unwrap();
    let a = s
        .new_instance_with("Account", &[("id", 1i64.into()), ("branch", branch.into())])
        .unwrap();
    s.begin().unwrap();
    s.persist_all(&[branch, a]).unwrap();
    s.commit().unwrap();

    let mut other = h.session(SessionConfig::default());
    let a2 = other.find(&account(1)).unwrap().unwrap();
    let FieldValue::Ref(b2) = other.get_field(a2, "branch").unwrap() else {
        panic!("branch should resolve to a managed instance");
    };
    assert_eq!(other.state(b2).unwrap(), PersistentState::Hollow);
    assert_eq!(other.get_field(b2, "city").unwrap(), FieldValue::from("Oslo"));
    assert_eq!(other.object_id(b2).unwrap(), s.object_id(branch).unwrap());
}

#[test]
fn test_embedded_contact_round_trip() {
    let h = Harness::new();
    let mut s = h.session(SessionConfig::default());

    let a = s.new_instance_with("Account", &[("id", 1i64.into())]).unwrap();
    let contact = s.embed(a, "contact").unwrap();
    s.set_field(contact, "email", "ada@example.com").unwrap();
    s.begin().unwrap();
    s.persist(a).unwrap();
    assert_eq!(s.state(contact).unwrap(), PersistentState::ENew);
    s.commit().unwrap();

    let mut other = h.session(SessionConfig::default());
    let a2 = other.find(&account(1)).unwrap().unwrap();
    let FieldValue::Embedded(c2) = other.get_field(a2, "contact").unwrap() else {
        panic!("contact should be embedded");
    };
    assert_eq!(
        other.get_field(c2, "email").unwrap(),
        FieldValue::from("ada@example.com")
    );

    other.begin().unwrap();
    other.set_field(c2, "phone", "555").unwrap();
    assert_eq!(other.state(a2).unwrap(), PersistentState::PDirty);
    other.commit().unwrap();

    let FieldValue::Record(values) = h.db.get(&account(1)).unwrap().get(4) else {
        panic!("contact should be stored as a record");
    };
    assert_eq!(values[1], FieldValue::from("555"));
}

// =============================================================================
// EVENTS
// =============================================================================

#[test]
fn test_store_events_bracket_the_flush() {
    let h = Harness::new();
    let mut s = h.session(SessionConfig::default());
    let seen: Arc<Mutex<Vec<(LifecycleEventType, InstanceId)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    s.add_lifecycle_listener(move |_: &mut Session, e: &LifecycleEvent| -> Result<()> {
        sink.lock().push((e.kind, e.instance));
        Ok(())
    });

    let a = s.new_instance_with("Account", &[("id", 1i64.into())]).unwrap();
    s.begin().unwrap();
    s.persist(a).unwrap();
    s.commit().unwrap();

    let kinds: Vec<LifecycleEventType> = seen.lock().iter().map(|(k, _)| *k).collect();
    let at = |kind| kinds.iter().position(|k| *k == kind).unwrap();
    assert!(at(LifecycleEventType::BeforePersist) < at(LifecycleEventType::AfterPersist));
    assert!(at(LifecycleEventType::AfterPersist) < at(LifecycleEventType::BeforeStore));
    assert!(at(LifecycleEventType::BeforeStore) < at(LifecycleEventType::AfterStore));
    assert!(at(LifecycleEventType::AfterStore) < at(LifecycleEventType::AfterPersistPerformed));
    assert!(seen.lock().iter().all(|(_, id)| *id == a));
}
