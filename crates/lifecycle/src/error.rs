//! Illegal transition errors

use crate::state::PersistentState;
use crate::transition::StateEvent;
use thiserror::Error;

/// A transition that is not legal for the current state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot apply {event:?} to an instance in state {state}: {reason}")]
pub struct StateError {
    /// State the instance was in
    pub state: PersistentState,
    /// Event that was refused
    pub event: StateEvent,
    /// Why the event is refused
    pub reason: &'static str,
}

impl StateError {
    pub(crate) fn new(state: PersistentState, event: StateEvent, reason: &'static str) -> Self {
        StateError {
            state,
            event,
            reason,
        }
    }
}

impl From<StateError> for persista_core::Error {
    fn from(e: StateError) -> Self {
        persista_core::Error::invalid_state(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persista_core::ErrorKind;

    #[test]
    fn test_converts_to_invalid_state() {
        let err = StateError::new(PersistentState::PDirty, StateEvent::Release, "dirty");
        let core: persista_core::Error = err.into();
        assert_eq!(core.kind(), ErrorKind::InvalidState);
        assert!(core.to_string().contains("PDirty"));
        assert!(!core.is_fatal());
    }
}
