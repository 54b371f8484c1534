//! Pluggable session policies
//!
//! - [`OpCallbacks`]: lets a facade veto or narrow persist/delete/... calls
//!   per instance before the session acts on them
//! - [`VersionCheckPolicy`]: decides whether a flushed instance carries a
//!   version check

use persista_core::InstanceId;
use persista_lifecycle::PersistentState;

/// Session operations that consult [`OpCallbacks`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// persist / persist_all
    Persist,
    /// delete / delete_all
    Delete,
    /// refresh / refresh_all
    Refresh,
    /// retrieve / retrieve_all
    Retrieve,
    /// evict / evict_all
    Evict,
    /// release / release_all
    Release,
    /// detach / detach_all
    Detach,
    /// attach
    Attach,
    /// transactional / transactional_all
    Transactional,
    /// nontransactional / nontransactional_all
    Nontransactional,
    /// lock / lock_all
    Lock,
}

bitflags::bitflags! {
    /// What to do with one argument
    ///
    /// The empty set skips the instance entirely.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpAction: u8 {
        /// Apply the operation
        const RUN = 0x01;
        /// Follow cascades from the instance
        const CASCADE = 0x02;
    }
}

impl OpAction {
    /// Whether the operation runs
    pub fn runs(self) -> bool {
        self.contains(Self::RUN)
    }

    /// Whether cascades are followed
    pub fn cascades(self) -> bool {
        self.contains(Self::CASCADE)
    }
}

impl Default for OpAction {
    fn default() -> Self {
        OpAction::RUN | OpAction::CASCADE
    }
}

/// Intercepts operation arguments
pub trait OpCallbacks: Send + Sync {
    /// Action for `instance`, currently in `state`
    fn process_argument(&self, op: OpKind, instance: InstanceId, state: PersistentState) -> OpAction;
}

/// Runs and cascades everything
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultOpCallbacks;

impl OpCallbacks for DefaultOpCallbacks {
    fn process_argument(&self, _op: OpKind, _instance: InstanceId, _state: PersistentState) -> OpAction {
        OpAction::default()
    }
}

/// Inputs to a version-check decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionCheckContext {
    /// Instance state at flush time
    pub state: PersistentState,
    /// Whether the instance was already flushed in this transaction
    pub flushed: bool,
    /// Per-instance override set by `lock` or `transactional`
    pub explicit: Option<bool>,
    /// Whether the transaction is optimistic
    pub optimistic: bool,
    /// Check versions in pessimistic transactions too
    pub non_optimistic_version_check: bool,
}

/// Decides whether a flush entry carries a version check
pub trait VersionCheckPolicy: Send + Sync {
    /// Whether to check
    fn requires_check(&self, ctx: &VersionCheckContext) -> bool;
}

/// Explicit flag first; pessimistic transactions skip the check unless
/// configured otherwise; then the state decides
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultVersionCheck;

impl VersionCheckPolicy for DefaultVersionCheck {
    fn requires_check(&self, ctx: &VersionCheckContext) -> bool {
        if let Some(explicit) = ctx.explicit {
            return explicit;
        }
        if !ctx.optimistic && !ctx.non_optimistic_version_check {
            return false;
        }
        ctx.state.is_version_check_required(ctx.flushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(state: PersistentState) -> VersionCheckContext {
        VersionCheckContext {
            state,
            flushed: false,
            explicit: None,
            optimistic: true,
            non_optimistic_version_check: false,
        }
    }

    #[test]
    fn test_op_action_bits() {
        let all = OpAction::default();
        assert!(all.runs() && all.cascades());
        assert!(!OpAction::RUN.cascades());
        assert!(!OpAction::empty().runs());
        assert!(OpAction::CASCADE.cascades() && !OpAction::CASCADE.runs());
        assert_eq!(OpAction::from_bits(0x04), None);
        assert!(DefaultOpCallbacks
            .process_argument(OpKind::Persist, InstanceId::new(1), PersistentState::Transient)
            .cascades());
    }

    #[test]
    fn test_default_version_check() {
        let policy = DefaultVersionCheck;
        assert!(policy.requires_check(&ctx(PersistentState::PDirty)));
        assert!(!policy.requires_check(&ctx(PersistentState::PNew)));
        assert!(!policy.requires_check(&VersionCheckContext {
            flushed: true,
            ..ctx(PersistentState::PDirty)
        }));
    }

    #[test]
    fn test_pessimistic_skips_unless_configured() {
        let policy = DefaultVersionCheck;
        let pessimistic = VersionCheckContext {
            optimistic: false,
            ..ctx(PersistentState::PDirty)
        };
        assert!(!policy.requires_check(&pessimistic));
        assert!(policy.requires_check(&VersionCheckContext {
            non_optimistic_version_check: true,
            ..pessimistic
        }));
    }

    #[test]
    fn test_explicit_flag_wins() {
        let policy = DefaultVersionCheck;
        assert!(policy.requires_check(&VersionCheckContext {
            explicit: Some(true),
            ..ctx(PersistentState::PClean)
        }));
        assert!(!policy.requires_check(&VersionCheckContext {
            explicit: Some(false),
            ..ctx(PersistentState::PDirty)
        }));
    }
}
