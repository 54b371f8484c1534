//! Transition table tests for persista-lifecycle
//!
//! These tests walk the table as a whole rather than one entry at a time:
//!
//! 1. **Totality** - every (state, event) pair either moves or is refused
//! 2. **Enlistment** - effects keep the transactional set consistent
//! 3. **Scenarios** - realistic event sequences end in the right state
//!
//! ```bash
//! cargo test -p persista-lifecycle --test transition_tests
//! ```

use persista_lifecycle::{Effect, PersistentState, StateEvent, TransitionContext};
use proptest::prelude::*;

use PersistentState::*;

// ============================================================================
// Test Helpers
// ============================================================================

const EVENTS: [StateEvent; 24] = [
    StateEvent::Persist { explicit: true },
    StateEvent::Persist { explicit: false },
    StateEvent::Delete,
    StateEvent::Commit,
    StateEvent::CommitRetain,
    StateEvent::Rollback,
    StateEvent::RollbackRestore,
    StateEvent::BeforeRead,
    StateEvent::BeforeOptimisticRead,
    StateEvent::BeforeNontransactionalRead,
    StateEvent::BeforeWrite,
    StateEvent::BeforeOptimisticWrite,
    StateEvent::BeforeNontransactionalWrite,
    StateEvent::Transactional,
    StateEvent::Nontransactional,
    StateEvent::Evict,
    StateEvent::Release,
    StateEvent::Flush,
    StateEvent::Nonprovisional,
    StateEvent::AfterRefresh,
    StateEvent::AfterOptimisticRefresh,
    StateEvent::AfterNontransactionalRefresh,
    StateEvent::BeforeFlush { logical: true },
    StateEvent::BeforeFlush { logical: false },
];

const COMPLETIONS: [StateEvent; 4] = [
    StateEvent::Commit,
    StateEvent::CommitRetain,
    StateEvent::Rollback,
    StateEvent::RollbackRestore,
];

fn ctx(active: bool, flushed: bool) -> TransitionContext {
    TransitionContext { active, flushed }
}

/// Apply a sequence, panicking on refusal
fn run(start: PersistentState, events: &[StateEvent], active: bool) -> PersistentState {
    events.iter().fold(start, |state, event| {
        state
            .transition(*event, ctx(active, false))
            .unwrap_or_else(|e| panic!("{}", e))
            .next
    })
}

fn state_strategy() -> impl Strategy<Value = PersistentState> {
    (0..PersistentState::ALL.len()).prop_map(|i| PersistentState::ALL[i])
}

fn event_strategy() -> impl Strategy<Value = StateEvent> {
    (0..EVENTS.len()).prop_map(|i| EVENTS[i])
}

// ============================================================================
// SECTION 1: Totality
// ============================================================================

mod totality {
    use super::*;

    #[test]
    fn every_pair_is_decided() {
        for state in PersistentState::ALL {
            for event in EVENTS {
                for active in [true, false] {
                    for flushed in [true, false] {
                        match state.transition(event, ctx(active, flushed)) {
                            Ok(t) => assert!(PersistentState::ALL.contains(&t.next)),
                            Err(e) => {
                                assert_eq!(e.state, state);
                                assert_eq!(e.event, event);
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn completion_never_leaves_deleted_or_new_states() {
        for state in PersistentState::ALL {
            // pending instances wait for the next transaction
            if state.is_pending_transactional() {
                continue;
            }
            for event in COMPLETIONS {
                let next = state.transition(event, ctx(true, false)).unwrap().next;
                assert!(
                    !next.is_deleted() && !next.is_new(),
                    "{} --{:?}--> {}",
                    state,
                    event,
                    next
                );
                assert!(!next.is_dirty() || next == state, "{} stays dirty", state);
            }
        }
    }

    #[test]
    fn detached_refuses_persist_and_delete() {
        assert!(Detached
            .transition(StateEvent::Persist { explicit: true }, ctx(true, false))
            .is_err());
        assert!(Detached
            .transition(StateEvent::Delete, ctx(true, false))
            .is_err());
        for event in [StateEvent::Commit, StateEvent::Evict, StateEvent::BeforeRead] {
            let t = Detached.transition(event, ctx(true, false)).unwrap();
            assert_eq!(t.next, Detached);
        }
    }

    proptest! {
        #[test]
        fn transition_is_deterministic(
            state in state_strategy(),
            event in event_strategy(),
            active in any::<bool>(),
            flushed in any::<bool>(),
        ) {
            let a = state.transition(event, ctx(active, flushed));
            let b = state.transition(event, ctx(active, flushed));
            prop_assert_eq!(a, b);
        }
    }
}

// ============================================================================
// SECTION 2: Enlistment effects
// ============================================================================

mod enlistment {
    use super::*;

    proptest! {
        /// Following only the effects, membership in the transactional set
        /// always matches the flag of the state.
        #[test]
        fn effects_track_transactional_flag(
            start in state_strategy(),
            events in prop::collection::vec(event_strategy(), 1..30),
            active in any::<bool>(),
        ) {
            let mut state = start;
            let mut enlisted = start.is_transactional();
            let mut pending = start.is_pending_transactional();
            for event in events {
                let Ok(t) = state.transition(event, ctx(active, false)) else {
                    continue;
                };
                for effect in &t.effects {
                    match effect {
                        Effect::Enlist => enlisted = true,
                        Effect::Delist => enlisted = false,
                        Effect::EnlistPending => pending = true,
                        Effect::DelistPending => pending = false,
                        _ => {}
                    }
                }
                state = t.next;
                prop_assert_eq!(enlisted, state.is_transactional(), "state {}", state);
                prop_assert_eq!(pending, state.is_pending_transactional(), "state {}", state);
            }
        }

        /// Saved fields exist exactly while enlisted.
        #[test]
        fn saved_image_lives_while_enlisted(
            events in prop::collection::vec(event_strategy(), 1..30),
        ) {
            let mut state = Transient;
            let mut saved = false;
            for event in events {
                let Ok(t) = state.transition(event, ctx(true, false)) else {
                    continue;
                };
                for effect in &t.effects {
                    match effect {
                        Effect::SaveFields => saved = true,
                        Effect::ClearSavedFields => saved = false,
                        Effect::RestoreFields => prop_assert!(saved, "restore without image"),
                        _ => {}
                    }
                }
                state = t.next;
                prop_assert_eq!(saved, state.is_transactional(), "state {}", state);
            }
        }
    }

    #[test]
    fn after_persist_fires_once_per_persist() {
        let t = Transient
            .transition(StateEvent::Persist { explicit: false }, ctx(true, false))
            .unwrap();
        assert!(t.effects.contains(&Effect::FireAfterPersist));
        let t = t
            .next
            .transition(StateEvent::Persist { explicit: true }, ctx(true, false))
            .unwrap();
        assert_eq!(t.next, PNew);
        assert!(!t.effects.contains(&Effect::FireAfterPersist));
    }
}

// ============================================================================
// SECTION 3: Scenarios
// ============================================================================

mod scenarios {
    use super::*;

    #[test]
    fn persist_then_commit_retaining_values() {
        let state = run(
            Transient,
            &[StateEvent::Persist { explicit: true }, StateEvent::CommitRetain],
            true,
        );
        assert_eq!(state, PNonTrans);
    }

    #[test]
    fn read_write_commit() {
        let state = run(
            Hollow,
            &[
                StateEvent::BeforeRead,
                StateEvent::BeforeWrite,
                StateEvent::BeforeFlush { logical: false },
                StateEvent::Flush,
                StateEvent::Commit,
            ],
            true,
        );
        assert_eq!(state, Hollow);
    }

    #[test]
    fn delete_flush_rollback_restores() {
        let state = run(
            PClean,
            &[
                StateEvent::Delete,
                StateEvent::Flush,
                StateEvent::RollbackRestore,
            ],
            true,
        );
        assert_eq!(state, PNonTrans);
    }

    #[test]
    fn persist_delete_persist_again() {
        let state = run(
            Transient,
            &[
                StateEvent::Persist { explicit: true },
                StateEvent::Delete,
                StateEvent::Persist { explicit: true },
            ],
            true,
        );
        assert_eq!(state, PNew);
    }

    #[test]
    fn nontransactional_changes_join_next_transaction() {
        let state = run(
            PNonTrans,
            &[StateEvent::BeforeNontransactionalWrite],
            false,
        );
        assert_eq!(state, PNonTransDirty);
        let state = run(state, &[StateEvent::Transactional, StateEvent::Commit], true);
        assert_eq!(state, Hollow);
    }

    #[test]
    fn transient_transactional_rollback_keeps_tracking() {
        let t = TDirty
            .transition(StateEvent::RollbackRestore, ctx(true, false))
            .unwrap();
        assert_eq!(t.next, TClean);
        assert_eq!(
            &t.effects[..],
            &[
                Effect::RestoreFields,
                Effect::ClearSavedFields,
                Effect::SaveFields
            ]
        );
    }

    #[test]
    fn flushed_new_then_deleted() {
        let t = PNew
            .transition(StateEvent::Delete, ctx(true, true))
            .unwrap();
        assert_eq!(t.next, PNewFlushedDeleted);
        assert!(t.effects.contains(&Effect::MarkDirty { first: true }));
        let state = run(
            t.next,
            &[StateEvent::Flush, StateEvent::Commit],
            true,
        );
        assert_eq!(state, Transient);
    }
}
