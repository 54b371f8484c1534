//! Transition table
//!
//! [`PersistentState::transition`] maps `(state, event, context)` to the next
//! state and the list of [`Effect`]s the managed instance must carry out.
//!
//! Effects come from two places:
//! 1. the table itself (field snapshots, clearing, pre-delete, pre-flush)
//! 2. the difference between the old and new state flags (enlistment,
//!    dirty marking, after-persist and after-delete events)
//!
//! Explicit effects are listed first, derived effects after them, so a
//! restore always happens before the saved image is discarded.
//!
//! Events that have no meaning for a state leave it unchanged. Events that
//! are meaningful but illegal return a [`StateError`].

use crate::error::StateError;
use crate::state::PersistentState;
use smallvec::SmallVec;

/// Something that happens to a managed instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateEvent {
    /// Make persistent; `explicit` is false for implicit cascades
    Persist {
        /// User-invoked rather than cascaded
        explicit: bool,
    },
    /// Schedule for deletion
    Delete,
    /// Transaction committed, values discarded
    Commit,
    /// Transaction committed, values retained
    CommitRetain,
    /// Transaction rolled back, values discarded
    Rollback,
    /// Transaction rolled back, values restored from the saved image
    RollbackRestore,
    /// Field read inside a pessimistic transaction
    BeforeRead,
    /// Field read inside an optimistic transaction
    BeforeOptimisticRead,
    /// Field read outside any transaction
    BeforeNontransactionalRead,
    /// Field write inside a pessimistic transaction
    BeforeWrite,
    /// Field write inside an optimistic transaction
    BeforeOptimisticWrite,
    /// Field write outside any transaction
    BeforeNontransactionalWrite,
    /// Enlist in the transaction
    Transactional,
    /// Leave the transaction
    Nontransactional,
    /// Drop field data
    Evict,
    /// Stop managing
    Release,
    /// Changes were written to the store
    Flush,
    /// A provisional persist was confirmed by reachability
    Nonprovisional,
    /// Refreshed inside a pessimistic transaction
    AfterRefresh,
    /// Refreshed inside an optimistic transaction
    AfterOptimisticRefresh,
    /// Refreshed outside any transaction
    AfterNontransactionalRefresh,
    /// About to flush; `logical` flushes never reach the store
    BeforeFlush {
        /// Logical flush
        logical: bool,
    },
}

/// Instance and session facts a transition may depend on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionContext {
    /// A transaction is active
    pub active: bool,
    /// The instance has been flushed in this transaction
    pub flushed: bool,
}

impl TransitionContext {
    /// Context inside an active transaction
    pub fn active() -> Self {
        TransitionContext {
            active: true,
            flushed: false,
        }
    }

    /// Same context with the flushed flag set
    pub fn flushed(mut self, flushed: bool) -> Self {
        self.flushed = flushed;
        self
    }
}

/// Work a transition asks the caller to perform, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Effect {
    /// Snapshot current field values as the pre-transaction image
    SaveFields,
    /// Put the pre-transaction image back
    RestoreFields,
    /// Discard the pre-transaction image
    ClearSavedFields,
    /// Unload every non-key field
    ClearFields,
    /// Run pre-delete work (before-delete event, cascades)
    PreDelete,
    /// Run pre-flush work (before-store event, id assignment, reachability)
    PreFlush {
        /// Logical flush
        logical: bool,
    },
    /// Add to the transactional set
    Enlist,
    /// Remove from the transactional set
    Delist,
    /// Add to the pending-transactional set
    EnlistPending,
    /// Remove from the pending-transactional set
    DelistPending,
    /// Record the instance as dirty in the session
    MarkDirty {
        /// First change of the instance in this transaction (or since flush)
        first: bool,
    },
    /// Fire the after-persist event
    FireAfterPersist,
    /// Fire the after-delete event
    FireAfterDelete,
}

/// Effect list; short enough to stay inline
pub type Effects = SmallVec<[Effect; 6]>;

/// Outcome of a legal transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State after the transition
    pub next: PersistentState,
    /// Work to perform
    pub effects: Effects,
    /// Number of leading effects that run before the state changes
    prelude: usize,
}

impl Transition {
    /// Whether the state changes
    pub fn changes_state(&self, from: PersistentState) -> bool {
        self.next != from
    }

    /// Effects to run while the instance is still in its old state
    pub fn before_state_change(&self) -> &[Effect] {
        &self.effects[..self.prelude]
    }

    /// Effects to run once the instance is in `next`
    pub fn after_state_change(&self) -> &[Effect] {
        &self.effects[self.prelude..]
    }
}

fn new_state(ctx: TransitionContext, explicit: bool) -> PersistentState {
    match (ctx.active, explicit) {
        (false, _) => PersistentState::PNonTransNew,
        (true, true) => PersistentState::PNew,
        (true, false) => PersistentState::PNewProvisional,
    }
}

fn deleted_state(ctx: TransitionContext) -> PersistentState {
    if ctx.active {
        PersistentState::PDeleted
    } else {
        PersistentState::PNonTransDeleted
    }
}

impl PersistentState {
    /// Apply `event` to this state
    ///
    /// Pure: the same inputs always produce the same output.
    ///
    /// # Errors
    ///
    /// Returns a [`StateError`] when the event is illegal for the state.
    pub fn transition(
        self,
        event: StateEvent,
        ctx: TransitionContext,
    ) -> Result<Transition, StateError> {
        let (next, explicit) = self.table(event, ctx)?;
        let mut effects = Effects::new();
        effects.extend_from_slice(explicit);
        derive_effects(self, next, ctx, &mut effects);
        Ok(Transition {
            next,
            effects,
            prelude: explicit.len(),
        })
    }

    /// The table proper: next state and explicit effects
    fn table(
        self,
        event: StateEvent,
        ctx: TransitionContext,
    ) -> Result<(PersistentState, &'static [Effect]), StateError> {
        use Effect::*;
        use PersistentState::*;
        use StateEvent as E;

        const NONE: &[Effect] = &[];
        const CLEAR: &[Effect] = &[ClearFields];
        const RESTORE: &[Effect] = &[RestoreFields];
        const PRE_DELETE: &[Effect] = &[PreDelete];
        const PRE_FLUSH: &[Effect] = &[PreFlush { logical: false }];
        const PRE_FLUSH_LOGICAL: &[Effect] = &[PreFlush { logical: true }];
        const RESET: &[Effect] = &[ClearSavedFields, SaveFields];
        const RESTORE_RESET: &[Effect] = &[RestoreFields, ClearSavedFields, SaveFields];

        let err = |reason| Err(StateError::new(self, event, reason));
        let pre_flush = |logical: bool| if logical { PRE_FLUSH_LOGICAL } else { PRE_FLUSH };

        let out = match (self, event) {
            // ----------------------------------------------------------------
            // Transient family
            // ----------------------------------------------------------------
            (Transient | TLoaded, E::Persist { explicit }) => (new_state(ctx, explicit), NONE),
            (Transient | TLoaded, E::Transactional) => (TClean, NONE),
            (TLoaded, E::Release | E::Nontransactional) => (Transient, NONE),
            (Transient | TLoaded, _) => (self, NONE),

            (TClean | TDirty, E::Persist { explicit }) => (new_state(ctx, explicit), NONE),
            (TClean | TDirty, E::Delete) => return err("instance is not persistent"),
            (TClean, E::BeforeWrite | E::BeforeOptimisticWrite) => (TDirty, NONE),
            (TClean, E::Nontransactional | E::Release) => (Transient, NONE),
            (TClean | TDirty, E::Commit | E::CommitRetain | E::Rollback) => (TClean, RESET),
            (TClean | TDirty, E::RollbackRestore) => (TClean, RESTORE_RESET),
            (TDirty, E::Nontransactional) => return err("instance has uncommitted changes"),
            (TDirty, E::Release) => return err("instance has uncommitted changes"),
            (TClean | TDirty, _) => (self, NONE),

            // ----------------------------------------------------------------
            // New instances
            // ----------------------------------------------------------------
            (PNew, E::Commit) => (Hollow, CLEAR),
            (PNew, E::CommitRetain) => (PNonTrans, NONE),
            (PNew, E::Rollback) => (Transient, NONE),
            (PNew, E::RollbackRestore) => (Transient, RESTORE),
            (PNew, E::Delete) if ctx.flushed => (PNewFlushedDeleted, PRE_DELETE),
            (PNew, E::Delete) => (PNewDeleted, PRE_DELETE),
            (PNew, E::BeforeFlush { logical }) => (PNew, pre_flush(logical)),
            (PNew, E::Nontransactional) => return err("new instances cannot leave the transaction"),
            (PNew, E::Release) => return err("new instances cannot be released"),
            (PNew, _) => (self, NONE),

            (PNewProvisional, E::Persist { explicit: true } | E::Nonprovisional) => (PNew, NONE),
            (PNewProvisional, E::BeforeFlush { logical: false }) => (Transient, NONE),
            (PNewProvisional, E::Commit | E::CommitRetain | E::Rollback | E::Release) => {
                (Transient, NONE)
            }
            (PNewProvisional, E::RollbackRestore) => (Transient, RESTORE),
            (PNewProvisional, E::Delete) => (Transient, NONE),
            (PNewProvisional, E::Nontransactional) => {
                return err("new instances cannot leave the transaction")
            }
            (PNewProvisional, _) => (self, NONE),

            (PNonTransNew, E::Transactional) => (PNew, NONE),
            (PNonTransNew, E::Delete | E::Release) => (Transient, NONE),
            (PNonTransNew, _) => (self, NONE),

            // ----------------------------------------------------------------
            // Persistent, enlisted
            // ----------------------------------------------------------------
            (PClean | PDirty, E::Commit) => (Hollow, CLEAR),
            (PClean | PDirty, E::CommitRetain) => (PNonTrans, NONE),
            (PClean | PDirty, E::Rollback) => (Hollow, CLEAR),
            (PClean | PDirty, E::RollbackRestore) => (PNonTrans, RESTORE),
            (PClean | PDirty, E::Delete) => (PDeleted, PRE_DELETE),

            (PClean, E::BeforeWrite | E::BeforeOptimisticWrite) => (PDirty, NONE),
            (PClean, E::Nontransactional) => (PNonTrans, NONE),
            (PClean, E::Evict) => (Hollow, CLEAR),
            (PClean, E::Release) => (Transient, NONE),
            (PClean, E::AfterNontransactionalRefresh) => (PNonTrans, NONE),
            (PClean, _) => (self, NONE),

            (PDirty, E::BeforeFlush { logical }) => (PDirty, pre_flush(logical)),
            (PDirty, E::AfterRefresh | E::AfterOptimisticRefresh) => (PClean, NONE),
            (PDirty, E::AfterNontransactionalRefresh) => (PNonTrans, NONE),
            (PDirty, E::Nontransactional) => return err("instance has uncommitted changes"),
            (PDirty, E::Release) => return err("instance has uncommitted changes"),
            (PDirty, _) => (self, NONE),

            // ----------------------------------------------------------------
            // Persistent, not enlisted
            // ----------------------------------------------------------------
            (PNonTrans, E::BeforeRead) => (PClean, CLEAR),
            (PNonTrans, E::BeforeOptimisticRead | E::Transactional) => (PClean, NONE),
            (PNonTrans | Hollow, E::BeforeWrite | E::BeforeOptimisticWrite) => (PDirty, NONE),
            (PNonTrans | Hollow, E::BeforeNontransactionalWrite) => (PNonTransDirty, NONE),
            (PNonTrans | Hollow, E::Delete) => (deleted_state(ctx), PRE_DELETE),
            (PNonTrans, E::Evict) => (Hollow, CLEAR),
            (PNonTrans | Hollow, E::Release) => (Transient, NONE),
            (PNonTrans, E::AfterRefresh) => (PClean, NONE),
            (PNonTrans, _) => (self, NONE),

            (Hollow, E::BeforeRead | E::BeforeOptimisticRead | E::Transactional) => (PClean, NONE),
            (Hollow, E::BeforeNontransactionalRead) => (PNonTrans, NONE),
            (Hollow, E::AfterRefresh) => (PClean, NONE),
            (Hollow, E::AfterOptimisticRefresh | E::AfterNontransactionalRefresh) => {
                (PNonTrans, NONE)
            }
            (Hollow, _) => (self, NONE),

            (PNonTransDirty, E::Transactional | E::BeforeWrite | E::BeforeOptimisticWrite) => {
                (PDirty, NONE)
            }
            (PNonTransDirty, E::Delete) => (deleted_state(ctx), PRE_DELETE),
            (PNonTransDirty, E::AfterNontransactionalRefresh) => (PNonTrans, NONE),
            (PNonTransDirty, E::Release) => return err("instance has unflushed changes"),
            (PNonTransDirty, _) => (self, NONE),

            (PNonTransDeleted, E::Transactional) => (PDeleted, NONE),
            (PNonTransDeleted, E::Persist { .. }) => (PNonTrans, NONE),
            (PNonTransDeleted, E::Release) => return err("instance is scheduled for deletion"),
            (
                PNonTransDeleted,
                E::BeforeWrite | E::BeforeOptimisticWrite | E::BeforeNontransactionalWrite,
            ) => return err("deleted instances cannot be modified"),
            (PNonTransDeleted, _) => (self, NONE),

            // ----------------------------------------------------------------
            // Deleted
            // ----------------------------------------------------------------
            (PDeleted | PDeletedFlushed, E::Commit | E::CommitRetain) => (Transient, NONE),
            (PDeleted | PDeletedFlushed, E::Rollback) => (Hollow, CLEAR),
            (PDeleted | PDeletedFlushed, E::RollbackRestore) => (PNonTrans, RESTORE),
            (PDeleted, E::Flush) => (PDeletedFlushed, NONE),
            (PDeleted, E::Persist { .. }) => (PDirty, NONE),
            (PDeleted, E::BeforeFlush { logical }) => (PDeleted, pre_flush(logical)),

            (
                PNewDeleted | PNewFlushedDeleted | PNewFlushedDeletedFlushed,
                E::Commit | E::CommitRetain | E::Rollback,
            ) => (Transient, NONE),
            (
                PNewDeleted | PNewFlushedDeleted | PNewFlushedDeletedFlushed,
                E::RollbackRestore,
            ) => (Transient, RESTORE),
            (PNewDeleted | PNewFlushedDeleted, E::Persist { .. }) => (PNew, NONE),
            (PNewFlushedDeleted, E::Flush) => (PNewFlushedDeletedFlushed, NONE),
            (PNewFlushedDeleted, E::BeforeFlush { logical }) => {
                (PNewFlushedDeleted, pre_flush(logical))
            }

            (
                PDeleted
                | PDeletedFlushed
                | PNewDeleted
                | PNewFlushedDeleted
                | PNewFlushedDeletedFlushed,
                E::BeforeWrite | E::BeforeOptimisticWrite | E::BeforeNontransactionalWrite,
            ) => return err("deleted instances cannot be modified"),
            (
                PDeleted
                | PDeletedFlushed
                | PNewDeleted
                | PNewFlushedDeleted
                | PNewFlushedDeletedFlushed,
                E::Release | E::Nontransactional,
            ) => return err("instance is scheduled for deletion"),
            (
                PDeleted
                | PDeletedFlushed
                | PNewDeleted
                | PNewFlushedDeleted
                | PNewFlushedDeletedFlushed,
                _,
            ) => (self, NONE),

            // ----------------------------------------------------------------
            // Embedded
            // ----------------------------------------------------------------
            (ECopy, _) => (self, NONE),

            (ENew, E::Commit | E::CommitRetain) => (ENonTrans, NONE),
            (ENew, E::Rollback | E::Release) => (Transient, NONE),
            (ENew, E::RollbackRestore) => (Transient, RESTORE),
            (ENew, E::Delete) => (Transient, PRE_DELETE),
            (ENew, E::BeforeFlush { logical }) => (ENew, pre_flush(logical)),
            (ENew, E::Nontransactional) => return err("new instances cannot leave the transaction"),
            (ENew, _) => (self, NONE),

            (EClean | EDirty, E::Commit | E::CommitRetain | E::Rollback) => (ENonTrans, NONE),
            (EClean | EDirty, E::RollbackRestore) => (ENonTrans, RESTORE),
            (EClean | EDirty, E::Delete) => (EDeleted, PRE_DELETE),
            (EClean, E::BeforeWrite | E::BeforeOptimisticWrite) => (EDirty, NONE),
            (EClean, E::Nontransactional) => (ENonTrans, NONE),
            (EClean, E::Release) => (Transient, NONE),
            (EClean, _) => (self, NONE),
            (EDirty, E::BeforeFlush { logical }) => (EDirty, pre_flush(logical)),
            (EDirty, E::Nontransactional | E::Release) => {
                return err("instance has uncommitted changes")
            }
            (EDirty, _) => (self, NONE),

            (EDeleted, E::Commit | E::CommitRetain) => (Transient, NONE),
            (EDeleted, E::Rollback) => (ENonTrans, NONE),
            (EDeleted, E::RollbackRestore) => (ENonTrans, RESTORE),
            (EDeleted, E::Persist { .. }) => (EDirty, NONE),
            (
                EDeleted,
                E::BeforeWrite | E::BeforeOptimisticWrite | E::BeforeNontransactionalWrite,
            ) => return err("deleted instances cannot be modified"),
            (EDeleted, _) => (self, NONE),

            (
                ENonTrans,
                E::BeforeRead | E::BeforeOptimisticRead | E::Transactional,
            ) => (EClean, NONE),
            (ENonTrans, E::BeforeWrite | E::BeforeOptimisticWrite) => (EDirty, NONE),
            (ENonTrans, E::Delete) if ctx.active => (EDeleted, PRE_DELETE),
            (ENonTrans, E::Delete | E::Release) => (Transient, NONE),
            (ENonTrans, _) => (self, NONE),

            // ----------------------------------------------------------------
            // Detached
            // ----------------------------------------------------------------
            (Detached, E::Persist { .. }) => return err("detached instances must be attached"),
            (Detached, E::Delete) => return err("detached instances must be attached"),
            (Detached, _) => (self, NONE),
        };
        Ok(out)
    }
}

/// Effects implied by the flag change between `prev` and `next`
fn derive_effects(
    prev: PersistentState,
    next: PersistentState,
    ctx: TransitionContext,
    out: &mut Effects,
) {
    if prev == next {
        return;
    }

    if next.is_transactional() {
        if !prev.is_transactional() {
            out.push(Effect::Enlist);
            out.push(Effect::SaveFields);
        }
        if prev.is_pending_transactional() {
            out.push(Effect::DelistPending);
        }
        if next.is_deleted() != prev.is_deleted() {
            out.push(Effect::MarkDirty {
                first: !prev.is_dirty() || ctx.flushed,
            });
        } else if next.is_dirty() && !prev.is_dirty() {
            out.push(Effect::MarkDirty { first: true });
        }
    } else {
        if prev.is_transactional() {
            out.push(Effect::Delist);
            out.push(Effect::ClearSavedFields);
        }
        if next.is_pending_transactional() && !prev.is_pending_transactional() {
            out.push(Effect::EnlistPending);
        } else if prev.is_pending_transactional() && !next.is_pending_transactional() {
            out.push(Effect::DelistPending);
        }
    }

    if next.is_new() && next.is_persistent() && !prev.is_new() {
        out.push(Effect::FireAfterPersist);
    }
    if next.is_deleted() && !prev.is_deleted() {
        out.push(Effect::FireAfterDelete);
    }
}
