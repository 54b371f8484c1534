//! Flush: pre-flush passes to a fixed point, then one bulk store write
//!
//! ```text
//! BeforeFlush event
//!   └─ pre-flush pass over the transactional set ──┐
//!        non-provisional first, then provisional   │ repeat while the pass
//!        delete dereferenced dependents            │ dirtied more instances
//!   └───────────────────────────────────────────────┘
//! build entries (insert / update / delete), version checks
//! StoreManager::flush
//! apply identities, versions, generated values; Flush transitions
//! AfterFlush event
//! ```

use persista_core::{
    Error, ErrorKind, FieldSet, FieldValue, FlushEntry, FlushFailure, FlushOp, FlushOutcome,
    InstanceId, ObjectId, Result, UpdateStrategy, Version,
};
use persista_lifecycle::{PersistentState, StateEvent};
use tracing::{debug, error, warn};

use super::Session;
use crate::events::{LifecycleEventType, TransactionEventType};
use crate::policy::VersionCheckContext;

/// Why a flush runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Explicit or implicit flush inside a transaction
    Incremental,
    /// Flush at commit
    Commit,
    /// Write then roll back the datastore work, to validate changes
    RollbackCheck,
    /// Pre-flush work only; nothing reaches the store
    Logical,
}

/// Clean instance whose version must still match the store
struct VersionSync {
    instance: InstanceId,
    oid: ObjectId,
    version: Option<Version>,
}

impl Session {
    /// Write pending changes to the store
    ///
    /// # Errors
    ///
    /// Returns `NoTransaction` without an active transaction, `Unsupported`
    /// while savepoints are set and the savepoint store cannot survive a
    /// flush, and the aggregated flush failure otherwise. Any failure other
    /// than an optimistic one is fatal and marks the transaction
    /// rollback-only.
    pub fn flush(&mut self) -> Result<()> {
        self.operation(true, |s| {
            s.assert_active_transaction()?;
            s.flush_internal(FlushReason::Incremental)
        })
    }

    /// Run the pre-flush passes without writing anything
    ///
    /// Reachability is settled, provisional instances are resolved and
    /// dereferenced dependents are deleted.
    pub fn pre_flush(&mut self) -> Result<()> {
        self.operation(true, |s| {
            s.assert_active_transaction()?;
            s.flush_internal(FlushReason::Logical)
        })
    }

    /// Check pending changes against the store
    ///
    /// With a datastore transaction already running this is an ordinary
    /// flush. Otherwise the changes are written and the datastore work
    /// rolled back straight away, leaving the session's instances untouched.
    pub fn validate_changes(&mut self) -> Result<()> {
        self.operation(true, |s| {
            s.assert_active_transaction()?;
            let reason = if s.status.store_active {
                FlushReason::Incremental
            } else {
                FlushReason::RollbackCheck
            };
            s.flush_internal(reason)
        })
    }

    /// Whether changes may reach the store before commit
    ///
    /// Savepoint snapshots cannot undo rows already written unless the
    /// savepoint store supports incremental flush.
    pub(super) fn incremental_flush_allowed(&self) -> bool {
        self.savepoints.is_empty() || self.savepoints.supports_incremental_flush()
    }

    /// Every flush goes through here, explicit or implicit
    pub(super) fn flush_internal(&mut self, reason: FlushReason) -> Result<()> {
        if reason == FlushReason::Incremental && !self.incremental_flush_allowed() {
            return Err(Error::unsupported(
                "flushing while savepoints are set needs a savepoint store that supports incremental flush",
            ));
        }
        if self.status.flushing {
            return Err(Error::invalid_state("flush called while a flush is running").into_fatal());
        }
        self.status.flushing = true;
        let result = self.flush_body(reason);
        self.status.flushing = false;
        self.trans_additions.clear();
        for inst in self.instances.values_mut() {
            inst.flags.pre_flushed = false;
        }

        if reason == FlushReason::Logical {
            return result;
        }
        self.metrics.record_flush(result.is_ok());
        match result {
            Ok(()) => {
                if reason != FlushReason::RollbackCheck {
                    self.status.flushed = true;
                }
                Ok(())
            }
            Err(e) if reason == FlushReason::RollbackCheck => Err(e),
            Err(e) => {
                self.mark_rollback_only(e.clone());
                if e.kind() == ErrorKind::Optimistic {
                    Err(e)
                } else {
                    Err(e.into_fatal())
                }
            }
        }
    }

    fn flush_body(&mut self, reason: FlushReason) -> Result<()> {
        let logical = reason == FlushReason::Logical;
        if !logical {
            self.fire_transaction(TransactionEventType::BeforeFlush)?;
        }
        self.pre_flush_pass(logical)?;
        if logical {
            return Ok(());
        }

        let (entries, syncs) = self.flush_entries()?;
        if entries.is_empty() && syncs.is_empty() {
            self.status.flush_required = false;
            return self.fire_transaction(TransactionEventType::AfterFlush);
        }
        debug!(target: "persista::flush", entries = entries.len(), syncs = syncs.len(), ?reason, "Flushing");

        let mut failures = self.sync_versions(&syncs)?;
        let outcome = self.store.flush(&entries);
        failures.extend(outcome.failures.iter().cloned());
        self.status.store_active = true;

        if reason == FlushReason::RollbackCheck {
            self.store.rollback()?;
            self.store.begin_optimistic()?;
            self.status.store_active = false;
            return match self.flush_error(&failures) {
                Some(e) => Err(e),
                None => Ok(()),
            };
        }

        self.apply_outcome(&entries, outcome, &failures)?;
        if let Some(e) = self.flush_error(&failures) {
            return Err(e);
        }
        self.fire_transaction(TransactionEventType::AfterFlush)
    }

    /// Pre-flush every transactional instance until nothing new turns up
    fn pre_flush_pass(&mut self, logical: bool) -> Result<()> {
        let mut work = self.txset.copy();
        loop {
            let (provisional, settled): (Vec<_>, Vec<_>) = work.into_iter().partition(|id| {
                self.instances
                    .get(id)
                    .map_or(false, |inst| inst.state().is_provisional())
            });
            for id in settled.into_iter().chain(provisional) {
                if !self.instances.contains_key(&id) {
                    continue;
                }
                self.transition(id, StateEvent::BeforeFlush { logical })?;
            }
            self.delete_dereferenced()?;
            if self.trans_additions.is_empty() {
                return Ok(());
            }
            work = std::mem::take(&mut self.trans_additions).into_iter().collect();
        }
    }

    /// Entries for the store, plus clean instances needing a version sync
    fn flush_entries(&self) -> Result<(Vec<FlushEntry>, Vec<VersionSync>)> {
        let mut ids = self.txset.copy();
        if !self.config.order_dirty_objects {
            ids.sort();
        }
        let mut entries = Vec::new();
        let mut syncs = Vec::new();
        for id in ids {
            let inst = self.instance(id)?;
            let state = inst.state();
            if state.is_embedded() || !state.is_persistent() {
                continue;
            }
            let check_version = self.version_policy.requires_check(&VersionCheckContext {
                state,
                flushed: inst.is_flushed(),
                explicit: inst.flags.version_check,
                optimistic: self.config.optimistic,
                non_optimistic_version_check: self.config.non_optimistic_version_check,
            });
            let desc = inst.descriptor();

            let (op, fields) = if state.is_deleted() {
                match state {
                    PersistentState::PDeleted | PersistentState::PNewFlushedDeleted => {
                        (FlushOp::Delete, FieldSet::new())
                    }
                    _ => continue,
                }
            } else if state.is_new() && !inst.is_flushed() {
                (FlushOp::Insert, inst.loaded().intersection(desc.persistent_fields()))
            } else {
                let mut fields = inst.unflushed_dirty().intersection(desc.persistent_fields());
                for fd in desc.fields() {
                    if fd.update_strategy == UpdateStrategy::Ignore {
                        fields.remove(fd.index);
                    }
                }
                if fields.is_empty() && !inst.flags.version_update {
                    if check_version && !state.is_dirty() {
                        if let Some(oid) = inst.oid() {
                            syncs.push(VersionSync {
                                instance: id,
                                oid: oid.clone(),
                                version: inst.version(),
                            });
                        }
                    }
                    continue;
                }
                (FlushOp::Update, fields)
            };

            let values = fields
                .iter()
                .map(|f| Ok((f, self.export_value(inst.value(f))?)))
                .collect::<Result<Vec<(usize, FieldValue)>>>()?;
            entries.push(FlushEntry {
                instance: id,
                oid: inst.oid().cloned(),
                type_name: inst.type_name().clone(),
                op,
                values,
                version: inst.version(),
                check_version,
                update_version: inst.flags.version_update,
            });
        }
        Ok((entries, syncs))
    }

    fn sync_versions(&self, syncs: &[VersionSync]) -> Result<Vec<FlushFailure>> {
        let mut failures = Vec::new();
        for sync in syncs {
            if !self.store.sync_version(&sync.oid, sync.version)? {
                failures.push(FlushFailure {
                    instance: Some(sync.instance),
                    error: Error::optimistic(format!(
                        "{} ({}) was changed by another transaction",
                        sync.instance, sync.oid
                    ))
                    .with_failed(sync.instance),
                });
            }
        }
        Ok(failures)
    }

    fn apply_outcome(
        &mut self,
        entries: &[FlushEntry],
        outcome: FlushOutcome,
        failures: &[FlushFailure],
    ) -> Result<()> {
        let failed = |id: InstanceId| failures.iter().any(|f| f.instance == Some(id));

        for (id, oid) in outcome.assigned {
            self.set_object_id(id, oid)?;
        }
        for (id, version) in outcome.versions {
            self.instance_mut(id)?.set_version(Some(version));
        }
        for (id, field, value) in outcome.generated {
            self.instance_mut(id)?.set_loaded_value(field, value);
        }

        for id in self.txset.copy_dirty() {
            if failed(id) {
                continue;
            }
            if let Some(inst) = self.instances.get_mut(&id) {
                inst.mark_flushed();
            }
        }
        for entry in entries {
            if failed(entry.instance) {
                continue;
            }
            self.fire(LifecycleEventType::AfterStore, entry.instance)?;
            let performed = match entry.op {
                FlushOp::Insert => LifecycleEventType::AfterPersistPerformed,
                FlushOp::Update => LifecycleEventType::AfterUpdatePerformed,
                FlushOp::Delete => LifecycleEventType::AfterDeletePerformed,
            };
            self.fire(performed, entry.instance)?;
            self.transition(entry.instance, StateEvent::Flush)?;
        }

        self.txset.flushed();
        for failure in failures {
            if let Some(id) = failure.instance {
                if self.instances.contains_key(&id) {
                    self.txset.add_dirty(id);
                }
            }
        }
        self.status.flush_required = failures.iter().any(|f| f.instance.is_some());
        Ok(())
    }

    /// One error for the whole flush
    ///
    /// A single failure is returned as is. When most failures are
    /// optimistic the aggregate is optimistic too; otherwise it is a fatal
    /// store error naming the first failed object.
    fn flush_error(&self, failures: &[FlushFailure]) -> Option<Error> {
        match failures {
            [] => None,
            [single] => {
                let e = match single.instance {
                    Some(id) => single.error.clone().with_failed(id),
                    None => single.error.clone(),
                };
                error!(target: "persista::flush", error = %e, "Flush failed");
                Some(e)
            }
            many => {
                let optimistic = many
                    .iter()
                    .filter(|f| f.error.kind() == ErrorKind::Optimistic)
                    .count();
                let mut aggregate = if optimistic * 2 > many.len() {
                    if self.config.suppress_batch_ole_logging {
                        warn!(target: "persista::flush", failures = many.len(), "Optimistic failures in flush");
                    } else {
                        for f in many {
                            warn!(target: "persista::flush", error = %f.error, "Optimistic failure");
                        }
                    }
                    Error::optimistic(format!(
                        "{} of the flushed instances were changed by another transaction",
                        many.len()
                    ))
                } else {
                    let first = many
                        .iter()
                        .find_map(|f| f.instance)
                        .and_then(|id| self.instances.get(&id))
                        .and_then(|inst| inst.oid().map(ToString::to_string))
                        .unwrap_or_else(|| "unknown".to_string());
                    error!(target: "persista::flush", failures = many.len(), first = %first, "Flush failed");
                    Error::store(format!(
                        "{} flushed instances failed; first failed object: {}",
                        many.len(),
                        first
                    ))
                };
                for id in many.iter().filter_map(|f| f.instance) {
                    aggregate = aggregate.with_failed(id);
                }
                let nested = if self.config.suppress_batch_ole_logging && optimistic * 2 > many.len() {
                    Vec::new()
                } else {
                    many.iter().map(|f| f.error.clone()).collect()
                };
                Some(aggregate.with_nested(nested))
            }
        }
    }
}
