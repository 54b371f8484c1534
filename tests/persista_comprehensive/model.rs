//! Model Tests
//!
//! Random sequences of transactions over a handful of accounts, each
//! committed or rolled back, compared against a plain map after every step.

use crate::*;
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Writes of one transaction: account -> new balance, `None` deletes
type Writes = BTreeMap<i64, Option<i64>>;

fn transaction() -> impl Strategy<Value = (Writes, bool)> {
    (
        proptest::collection::btree_map(1..4i64, proptest::option::of(0..100i64), 0..3),
        any::<bool>(),
    )
}

fn apply(s: &mut Session, writes: &Writes) -> persista::Result<()> {
    for (&n, balance) in writes {
        let found = s.find(&account(n))?;
        match (found, balance) {
            (Some(id), Some(b)) => s.set_field(id, "balance", *b)?,
            (None, Some(b)) => {
                let id = s.new_instance_with(
                    "Account",
                    &[("id", n.into()), ("balance", (*b).into())],
                )?;
                s.persist(id)?;
            }
            (Some(id), None) => s.delete(id)?,
            (None, None) => {}
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn committed_state_matches_model(txns in proptest::collection::vec(transaction(), 1..8)) {
        let h = Harness::new();
        let mut s = h.session(SessionConfig::default());
        let mut model: BTreeMap<i64, i64> = BTreeMap::new();

        for (writes, commit) in txns {
            s.begin().unwrap();
            apply(&mut s, &writes).unwrap();
            if commit {
                s.commit().unwrap();
                for (n, balance) in &writes {
                    match balance {
                        Some(b) => { model.insert(*n, *b); }
                        None => { model.remove(n); }
                    }
                }
            } else {
                s.rollback().unwrap();
            }

            for n in 1..4i64 {
                prop_assert_eq!(h.balance(n), model.get(&n).map(|b| FieldValue::Int(*b)));
            }
            prop_assert!(!s.is_active());
            prop_assert!(s.transactional_instances().is_empty());
        }
    }
}
