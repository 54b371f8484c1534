//! Transaction boundaries
//!
//! Local transactions run the completion sequence directly. In managed
//! mode the external coordinator owns the outcome; [`before_completion`]
//! and [`after_completion`] are the hooks it (or `commit`/`rollback`)
//! drives.
//!
//! [`before_completion`]: Session::before_completion
//! [`after_completion`]: Session::after_completion

use persista_core::{Error, LockLevel, Result};
use persista_lifecycle::{PersistentState, StateEvent};
use tracing::{info, warn};

use super::{FlushReason, Session, TxnStatus};
use crate::config::{AutoDetach, RestoreState};
use crate::events::TransactionEventType;
use crate::sync::CompletionStatus;

impl Session {
    /// Whether a transaction is active
    pub fn is_active(&self) -> bool {
        self.status.active
    }

    /// Whether a datastore transaction is running (always true for
    /// pessimistic transactions, true after the first flush for optimistic
    /// ones)
    pub fn is_store_active(&self) -> bool {
        self.status.store_active
    }

    /// Begin a transaction
    ///
    /// Pending-transactional instances join it.
    ///
    /// # Errors
    ///
    /// Returns an invalid-state error when a transaction is already active,
    /// and a fatal store error when the datastore refuses to start one.
    pub fn begin(&mut self) -> Result<()> {
        self.operation(false, |s| s.begin_internal(true))
    }

    /// `explicit` begins also start the external transaction in managed
    /// mode; implicit ones join the one already running.
    pub(super) fn begin_internal(&mut self, explicit: bool) -> Result<()> {
        if self.status.active {
            return Err(Error::invalid_state("a transaction is already active"));
        }
        let external = if self.config.managed { self.external.clone() } else { None };
        if explicit {
            if let Some(ext) = &external {
                ext.begin()?;
            }
        }
        let started = if self.config.optimistic {
            self.store.begin_optimistic()
        } else {
            self.store.begin()
        };
        if let Err(e) = started {
            if explicit {
                if let Some(ext) = &external {
                    if let Err(re) = ext.rollback() {
                        warn!(target: "persista::txn", error = %re, "External rollback after failed begin");
                    }
                }
            }
            return Err(e.into_fatal());
        }
        self.locks.begin_transaction();
        self.status = TxnStatus {
            active: true,
            store_active: !self.config.optimistic,
            ..TxnStatus::default()
        };
        self.rollback_cause = None;
        self.fetch
            .set_read_lock_level(self.config.read_lock_level)
            .set_write_lock_level(self.config.write_lock_level)
            .set_lock_timeout_ms(self.config.lock_timeout_ms);
        self.txset.clear();
        self.txset.set_clean_capacity(self.config.clean_capacity);

        let pending: Vec<_> = std::mem::take(&mut self.pending).into_iter().collect();
        for id in pending {
            let Some(state) = self.instances.get(&id).map(|inst| inst.state()) else {
                continue;
            };
            if state.is_pending_transactional() {
                let next = self.transition(id, StateEvent::Transactional)?;
                if next.is_dirty() {
                    self.set_dirty(id)?;
                }
            } else if matches!(state, PersistentState::TClean | PersistentState::TDirty) {
                let policy = self.config.restore_state;
                self.instance_mut(id)?.save_fields(policy);
                self.txset.add_clean(id);
            }
        }

        self.metrics.record_begin();
        info!(
            target: "persista::txn",
            optimistic = self.config.optimistic,
            enlisted = self.txset.size(),
            "Transaction started"
        );
        self.fire_transaction(TransactionEventType::AfterBegin)
    }

    /// Commit the active transaction
    ///
    /// Changes are flushed, the store commits, and every enlisted instance
    /// takes its post-commit state. Any failure rolls the transaction back.
    ///
    /// # Errors
    ///
    /// Returns an invalid-state error without an active transaction, a fatal
    /// store error (with the cause nested) when the transaction was marked
    /// rollback-only, or the failure that forced the rollback.
    pub fn commit(&mut self) -> Result<()> {
        self.operation(false, |s| s.commit_internal())
    }

    fn commit_internal(&mut self) -> Result<()> {
        if !self.status.active {
            return Err(Error::invalid_state("no transaction is active to commit"));
        }
        if self.status.rollback_only {
            let cause = self.rollback_cause.clone();
            self.rollback_internal()?;
            let e = Error::store("the transaction was marked rollback-only and has been rolled back");
            let e = match cause {
                Some(cause) => e.with_nested(vec![cause]),
                None => e,
            };
            return Err(e.into_fatal());
        }

        if let Err(e) = self.before_completion_internal() {
            self.abort(&e);
            return Err(e);
        }
        if self.config.managed {
            if let Some(ext) = self.external.clone() {
                if let Err(e) = ext.commit() {
                    self.abort(&e);
                    return Err(e);
                }
            }
        }
        if let Err(e) = self.store.commit() {
            warn!(target: "persista::txn", error = %e, "Store commit failed");
            if let Err(ce) = self.after_completion_internal(CompletionStatus::RolledBack) {
                warn!(target: "persista::txn", error = %ce, "Completion after failed commit");
            }
            return Err(e);
        }
        self.after_completion_internal(CompletionStatus::Committed)
    }

    /// Roll back after `cause`, logging secondary failures
    fn abort(&mut self, cause: &Error) {
        warn!(target: "persista::txn", error = %cause, "Rolling back after failure");
        if let Err(e) = self.rollback_store() {
            warn!(target: "persista::txn", error = %e, "Store rollback failed");
        }
        if self.config.managed {
            if let Some(ext) = self.external.clone() {
                if let Err(e) = ext.rollback() {
                    warn!(target: "persista::txn", error = %e, "External rollback failed");
                }
            }
        }
        if let Err(e) = self.after_completion_internal(CompletionStatus::RolledBack) {
            warn!(target: "persista::txn", error = %e, "Completion after rollback failed");
        }
    }

    fn rollback_store(&self) -> Result<()> {
        if self.config.optimistic && !self.status.store_active {
            self.store.rollback_optimistic()
        } else {
            self.store.rollback()
        }
    }

    /// Roll back the active transaction
    ///
    /// # Errors
    ///
    /// Returns an invalid-state error without an active transaction.
    /// Failures of the store or the external coordinator are reported after
    /// the instances have been rolled back.
    pub fn rollback(&mut self) -> Result<()> {
        self.operation(false, |s| s.rollback_internal())
    }

    fn rollback_internal(&mut self) -> Result<()> {
        if !self.status.active {
            return Err(Error::invalid_state("no transaction is active to roll back"));
        }
        let store = self.rollback_store();
        let external = match (&self.external, self.config.managed) {
            (Some(ext), true) => ext.rollback(),
            _ => Ok(()),
        };
        let completion = self.after_completion_internal(CompletionStatus::RolledBack);
        store.and(external).and(completion)
    }

    /// Commit, then begin a new transaction
    pub fn commit_and_resume(&mut self) -> Result<()> {
        self.commit()?;
        self.begin()
    }

    /// Roll back, then begin a new transaction
    pub fn rollback_and_resume(&mut self) -> Result<()> {
        self.rollback()?;
        self.begin()
    }

    /// Pre-commit work: `BeforeCommit` listeners, then the commit flush
    pub fn before_completion(&mut self) -> Result<()> {
        self.operation(false, |s| s.before_completion_internal())
    }

    fn before_completion_internal(&mut self) -> Result<()> {
        if !self.status.active {
            return Err(Error::invalid_state("no transaction is completing"));
        }
        if self.status.rollback_only {
            return Err(self.rollback_only_error());
        }
        self.fire_transaction(TransactionEventType::BeforeCommit)?;
        self.flush_internal(FlushReason::Commit)
    }

    /// End-of-transaction work after the store decided `status`
    ///
    /// Every enlisted instance transitions, locks are released, savepoints
    /// dropped and the transaction state reset. Work continues past
    /// individual failures; the first one is returned.
    pub fn after_completion(&mut self, status: CompletionStatus) -> Result<()> {
        self.operation(false, |s| s.after_completion_internal(status))
    }

    fn after_completion_internal(&mut self, status: CompletionStatus) -> Result<()> {
        if !self.status.active {
            return Err(Error::invalid_state("no transaction is completing"));
        }
        self.status.completing = true;
        let mut first: Option<Error> = None;
        let note = |r: Result<()>, first: &mut Option<Error>| {
            if let Err(e) = r {
                warn!(target: "persista::txn", error = %e, "Completion step failed");
                first.get_or_insert(e);
            }
        };

        let (kind, event) = match status {
            CompletionStatus::Committed => (
                TransactionEventType::AfterCommit,
                if self.config.retain_state { StateEvent::CommitRetain } else { StateEvent::Commit },
            ),
            CompletionStatus::RolledBack => (
                TransactionEventType::AfterRollback,
                if self.config.restore_state != RestoreState::None {
                    StateEvent::RollbackRestore
                } else {
                    StateEvent::Rollback
                },
            ),
        };
        let r = self.fire_transaction(kind);
        note(r, &mut first);

        self.locks.end_transaction();
        let ids = self.txset.copy();
        let mut deleted = Vec::new();
        for &id in &ids {
            let Some(prev) = self.instances.get(&id).map(|inst| inst.state()) else {
                continue;
            };
            match self.transition(id, event) {
                Ok(PersistentState::Transient)
                    if prev.is_deleted() && status == CompletionStatus::Committed =>
                {
                    deleted.push(id);
                }
                Ok(_) => {}
                Err(e) => note(Err(e), &mut first),
            }
        }
        for id in deleted {
            let r = self.drop_instance(id);
            note(r, &mut first);
        }
        for &id in &ids {
            let Some(inst) = self.instances.get_mut(&id) else {
                continue;
            };
            inst.end_transaction();
            if inst.state().is_transactional() {
                self.pending.insert(id);
            }
        }

        self.txset.clear();
        self.savepoints.clear();
        self.savepoint_cache.clear();
        self.deref.clear();
        self.deref_additions.clear();
        self.trans_additions.clear();
        self.persisted_types.clear();
        self.updated_types.clear();
        self.deleted_types.clear();
        self.status = TxnStatus::default();
        self.rollback_cause = None;
        self.fetch
            .set_read_lock_level(LockLevel::None)
            .set_write_lock_level(LockLevel::None);

        let r = self.fire_transaction(TransactionEventType::AfterStateTransitions);
        note(r, &mut first);
        let (complete, detach_on) = match status {
            CompletionStatus::Committed => {
                self.metrics.record_commit();
                (TransactionEventType::AfterCommitComplete, AutoDetach::Commit)
            }
            CompletionStatus::RolledBack => {
                self.metrics.record_rollback();
                (TransactionEventType::AfterRollbackComplete, AutoDetach::Rollback)
            }
        };
        let r = self.fire_transaction(complete);
        note(r, &mut first);
        if self.config.auto_detaches_on(detach_on) {
            let r = self.auto_detach_all();
            note(r, &mut first);
        }
        info!(target: "persista::txn", ?status, instances = ids.len(), "Transaction completed");

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Rollback-only
    // =========================================================================

    /// Forbid commit of the active transaction
    ///
    /// # Errors
    ///
    /// Returns `NoTransaction` without an active transaction.
    pub fn set_rollback_only(&mut self, cause: Error) -> Result<()> {
        if !self.status.active {
            return Err(Error::no_transaction("no transaction to mark rollback-only"));
        }
        self.mark_rollback_only(cause);
        Ok(())
    }

    /// Whether the active transaction can only roll back
    pub fn is_rollback_only(&self) -> bool {
        self.status.active && self.status.rollback_only
    }

    /// What made the transaction rollback-only
    pub fn rollback_cause(&self) -> Option<&Error> {
        self.rollback_cause.as_ref()
    }

    pub(super) fn mark_rollback_only(&mut self, cause: Error) {
        if !self.status.active {
            return;
        }
        if !self.status.rollback_only {
            warn!(target: "persista::txn", cause = %cause, "Transaction marked rollback-only");
            self.rollback_cause = Some(cause);
        }
        self.status.rollback_only = true;
        if self.config.managed {
            if let Some(ext) = &self.external {
                ext.set_rollback_only();
            }
        }
    }
}
