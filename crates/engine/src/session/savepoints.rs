//! Savepoints within a transaction

use persista_core::{Error, InstanceId, Result};
use persista_lifecycle::StateEvent;
use tracing::info;

use super::{FlushReason, Session};
use crate::config::RestoreState;

impl Session {
    /// Names of the active savepoints, oldest first
    pub fn savepoint_names(&self) -> Vec<String> {
        self.savepoints.names()
    }

    /// Set a savepoint called `name`
    ///
    /// # Errors
    ///
    /// Returns a user error when the name is taken, and `Unsupported` when
    /// the transaction already flushed and the savepoint store cannot
    /// survive incremental flushes.
    pub fn set_savepoint(&mut self, name: &str) -> Result<()> {
        self.operation(true, |s| {
            s.assert_active_transaction()?;
            if s.savepoints.contains(name) {
                return Err(Error::user(format!("savepoint '{}' already exists", name)));
            }
            if s.status.flushed && !s.savepoints.supports_incremental_flush() {
                return Err(Error::unsupported(
                    "savepoints after a flush need a savepoint store that supports incremental flush",
                ));
            }
            if s.config.savepoint_pre_flush {
                s.flush_internal(FlushReason::Logical)?;
            }
            let ids: Vec<InstanceId> = if s.savepoints.is_empty() {
                s.txset.copy()
            } else {
                s.savepoint_cache.iter().copied().collect()
            };
            let snapshots = ids
                .into_iter()
                .filter_map(|id| s.instances.get(&id).map(|inst| (id, inst.snapshot())))
                .collect();
            s.savepoints.save(name, snapshots)?;
            s.savepoint_cache.clear();
            Ok(())
        })
    }

    /// Drop savepoint `name` and every later one, keeping the changes
    pub fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.operation(true, |s| {
            s.assert_active_transaction()?;
            s.savepoints.release(name)?;
            s.savepoint_cache = s.txset.copy().into_iter().collect();
            Ok(())
        })
    }

    /// Drop the newest savepoint, keeping the changes
    pub fn release_last_savepoint(&mut self) -> Result<()> {
        let name = self.last_savepoint()?;
        self.release_savepoint(&name)
    }

    /// Undo everything since savepoint `name` was set
    ///
    /// Instances recorded by the savepoint get back exactly the fields and
    /// state they had; instances enlisted since then roll back as if the
    /// transaction ended. Later savepoints are dropped.
    pub fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        self.operation(true, |s| {
            s.assert_active_transaction()?;
            s.rollback_to_savepoint_internal(name)
        })
    }

    /// Undo everything since the newest savepoint
    pub fn rollback_to_last_savepoint(&mut self) -> Result<()> {
        let name = self.last_savepoint()?;
        self.rollback_to_savepoint(&name)
    }

    fn last_savepoint(&self) -> Result<String> {
        self.savepoints
            .names()
            .pop()
            .ok_or_else(|| Error::user("no savepoint is set"))
    }

    fn rollback_to_savepoint_internal(&mut self, name: &str) -> Result<()> {
        let mut restored = self.savepoints.rollback(name)?;
        let event = if self.config.restore_state == RestoreState::None {
            StateEvent::Rollback
        } else {
            StateEvent::RollbackRestore
        };

        let current = self.txset.copy();
        for &id in &current {
            if restored.contains_key(&id) || !self.instances.contains_key(&id) {
                continue;
            }
            self.transition(id, event)?;
        }

        let mut ids: Vec<InstanceId> = restored.keys().copied().collect();
        ids.sort();
        for &id in &ids {
            let Some(snapshot) = restored.remove(&id) else {
                continue;
            };
            let Some(inst) = self.instances.get_mut(&id) else {
                continue;
            };
            let before = inst.oid().cloned();
            inst.restore_snapshot(snapshot);
            let after = inst.oid().cloned();
            if before != after {
                if let Some(oid) = before {
                    self.cache.remove(&oid, id);
                }
                if let Some(oid) = after {
                    self.cache.insert(oid, id)?;
                }
            }
        }

        self.txset.clear();
        self.deref.clear();
        let mut candidates = current;
        candidates.extend(ids);
        candidates.sort();
        candidates.dedup();
        let mut dirty = false;
        for id in candidates {
            let Some(inst) = self.instances.get(&id) else {
                continue;
            };
            let state = inst.state();
            if inst.is_dereferenced() && state.is_persistent() && !state.is_deleted() {
                self.deref.insert(id);
            }
            if state.is_transactional() {
                if state.is_dirty() {
                    self.txset.add_dirty(id);
                    dirty = true;
                } else {
                    self.txset.add_clean(id);
                }
                self.pending.remove(&id);
            } else if state.is_pending_transactional() {
                self.pending.insert(id);
            }
        }
        self.status.flush_required = dirty;
        self.savepoint_cache = self.txset.copy().into_iter().collect();
        self.metrics.record_savepoint_rollback();
        info!(target: "persista::savepoint", name, enlisted = self.txset.size(), "Rolled back to savepoint");
        Ok(())
    }
}
