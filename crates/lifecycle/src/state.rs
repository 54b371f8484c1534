//! Lifecycle states
//!
//! Every managed instance is in exactly one [`PersistentState`]. The flags
//! below are the only properties of a state the rest of the kernel looks at.
//!
//! | State | trans | pers | new | del | dirty | pending | prov |
//! |---|---|---|---|---|---|---|---|
//! | Transient, TLoaded, ECopy, Detached | | | | | | | |
//! | TClean | x | | | | | | |
//! | TDirty | x | | | | x | | |
//! | PNew | x | x | x | | x | | |
//! | PNewProvisional | x | x | x | | x | | x |
//! | PNonTransNew | | x | x | | x | x | |
//! | PClean, EClean | x | x | | | | | |
//! | PDirty, EDirty | x | x | | | x | | |
//! | PNonTrans, Hollow, ENonTrans | | x | | | | | |
//! | PNonTransDirty | | x | | | x | x | |
//! | PNonTransDeleted | | x | | x | x | x | |
//! | PDeleted, PDeletedFlushed, EDeleted | x | x | | x | x | | |
//! | PNewDeleted, PNewFlushedDeleted, PNewFlushedDeletedFlushed | x | x | x | x | x | | |
//! | ENew | x | x | x | | x | | |

use std::fmt;

/// Lifecycle state of a managed instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistentState {
    /// Not managed, or no longer managed
    Transient,
    /// Transient but enlisted for rollback tracking, unchanged
    TClean,
    /// Transient, enlisted, changed
    TDirty,
    /// Transient, temporarily managed while an operation cascades through it
    TLoaded,
    /// Persisted in the current transaction
    PNew,
    /// Persisted implicitly by cascade; dropped at flush unless still reachable
    PNewProvisional,
    /// Persisted outside a transaction; joins the next one
    PNonTransNew,
    /// Persistent, enlisted, unchanged
    PClean,
    /// Persistent, enlisted, changed
    PDirty,
    /// Persistent, values loaded, not enlisted
    PNonTrans,
    /// Persistent, changed outside a transaction; joins the next one
    PNonTransDirty,
    /// Persistent, deleted outside a transaction; joins the next one
    PNonTransDeleted,
    /// Persistent, identity known, no field data
    Hollow,
    /// Persistent, deleted in the current transaction
    PDeleted,
    /// Persisted then deleted in the same transaction, never flushed
    PNewDeleted,
    /// Deleted and the delete has been flushed
    PDeletedFlushed,
    /// Persisted and flushed, then deleted
    PNewFlushedDeleted,
    /// Persisted and flushed, then deleted and the delete flushed
    PNewFlushedDeletedFlushed,
    /// Embedded copy, not tracked
    ECopy,
    /// Embedded in a new owner
    ENew,
    /// Embedded, enlisted, unchanged
    EClean,
    /// Embedded, enlisted, changed
    EDirty,
    /// Embedded, deleted with its owner
    EDeleted,
    /// Embedded, not enlisted
    ENonTrans,
    /// Copied out of the session; no longer managed
    Detached,
}

impl PersistentState {
    /// Every state, for exhaustive checks
    pub const ALL: [PersistentState; 25] = [
        PersistentState::Transient,
        PersistentState::TClean,
        PersistentState::TDirty,
        PersistentState::TLoaded,
        PersistentState::PNew,
        PersistentState::PNewProvisional,
        PersistentState::PNonTransNew,
        PersistentState::PClean,
        PersistentState::PDirty,
        PersistentState::PNonTrans,
        PersistentState::PNonTransDirty,
        PersistentState::PNonTransDeleted,
        PersistentState::Hollow,
        PersistentState::PDeleted,
        PersistentState::PNewDeleted,
        PersistentState::PDeletedFlushed,
        PersistentState::PNewFlushedDeleted,
        PersistentState::PNewFlushedDeletedFlushed,
        PersistentState::ECopy,
        PersistentState::ENew,
        PersistentState::EClean,
        PersistentState::EDirty,
        PersistentState::EDeleted,
        PersistentState::ENonTrans,
        PersistentState::Detached,
    ];

    /// Whether instances in this state belong to the transactional set
    pub const fn is_transactional(self) -> bool {
        use PersistentState::*;
        matches!(
            self,
            TClean
                | TDirty
                | PNew
                | PNewProvisional
                | PClean
                | PDirty
                | PDeleted
                | PNewDeleted
                | PDeletedFlushed
                | PNewFlushedDeleted
                | PNewFlushedDeletedFlushed
                | ENew
                | EClean
                | EDirty
                | EDeleted
        )
    }

    /// Whether the instance has (or will have) a row in the store
    pub const fn is_persistent(self) -> bool {
        use PersistentState::*;
        matches!(
            self,
            PNew | PNewProvisional
                | PNonTransNew
                | PClean
                | PDirty
                | PNonTrans
                | PNonTransDirty
                | PNonTransDeleted
                | Hollow
                | PDeleted
                | PNewDeleted
                | PDeletedFlushed
                | PNewFlushedDeleted
                | PNewFlushedDeletedFlushed
                | ENew
                | EClean
                | EDirty
                | EDeleted
                | ENonTrans
        )
    }

    /// Whether the instance was persisted in the current unit of work
    pub const fn is_new(self) -> bool {
        use PersistentState::*;
        matches!(
            self,
            PNew | PNewProvisional
                | PNonTransNew
                | PNewDeleted
                | PNewFlushedDeleted
                | PNewFlushedDeletedFlushed
                | ENew
        )
    }

    /// Whether the instance is scheduled for deletion
    pub const fn is_deleted(self) -> bool {
        use PersistentState::*;
        matches!(
            self,
            PNonTransDeleted
                | PDeleted
                | PNewDeleted
                | PDeletedFlushed
                | PNewFlushedDeleted
                | PNewFlushedDeletedFlushed
                | EDeleted
        )
    }

    /// Whether the instance has changes to write
    pub const fn is_dirty(self) -> bool {
        use PersistentState::*;
        matches!(
            self,
            TDirty
                | PNew
                | PNewProvisional
                | PNonTransNew
                | PDirty
                | PNonTransDirty
                | PNonTransDeleted
                | PDeleted
                | PNewDeleted
                | PDeletedFlushed
                | PNewFlushedDeleted
                | PNewFlushedDeletedFlushed
                | ENew
                | EDirty
                | EDeleted
        )
    }

    /// Whether the instance joins the transactional set at the next begin
    pub const fn is_pending_transactional(self) -> bool {
        use PersistentState::*;
        matches!(self, PNonTransNew | PNonTransDirty | PNonTransDeleted)
    }

    /// Whether the instance was persisted provisionally
    pub const fn is_provisional(self) -> bool {
        matches!(self, PersistentState::PNewProvisional)
    }

    /// Whether the instance is embedded in an owner
    pub const fn is_embedded(self) -> bool {
        use PersistentState::*;
        matches!(self, ECopy | ENew | EClean | EDirty | EDeleted | ENonTrans)
    }

    /// Default answer to "does flushing this instance need a version check"
    ///
    /// Changed or deleted persistent rows are checked the first time they
    /// are flushed in a transaction; later flushes already hold the row.
    pub const fn is_version_check_required(self, flushed: bool) -> bool {
        use PersistentState::*;
        match self {
            PDirty | PDeleted => !flushed,
            _ => false,
        }
    }

    /// State name
    pub const fn name(self) -> &'static str {
        use PersistentState::*;
        match self {
            Transient => "Transient",
            TClean => "TClean",
            TDirty => "TDirty",
            TLoaded => "TLoaded",
            PNew => "PNew",
            PNewProvisional => "PNewProvisional",
            PNonTransNew => "PNonTransNew",
            PClean => "PClean",
            PDirty => "PDirty",
            PNonTrans => "PNonTrans",
            PNonTransDirty => "PNonTransDirty",
            PNonTransDeleted => "PNonTransDeleted",
            Hollow => "Hollow",
            PDeleted => "PDeleted",
            PNewDeleted => "PNewDeleted",
            PDeletedFlushed => "PDeletedFlushed",
            PNewFlushedDeleted => "PNewFlushedDeleted",
            PNewFlushedDeletedFlushed => "PNewFlushedDeletedFlushed",
            ECopy => "ECopy",
            ENew => "ENew",
            EClean => "EClean",
            EDirty => "EDirty",
            EDeleted => "EDeleted",
            ENonTrans => "ENonTrans",
            Detached => "Detached",
        }
    }
}

impl fmt::Display for PersistentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
