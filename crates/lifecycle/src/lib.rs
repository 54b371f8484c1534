//! Lifecycle state machine for managed instances
//!
//! This crate is pure logic, no I/O:
//! - [`PersistentState`]: the closed set of lifecycle states and their flags
//! - [`StateEvent`]: everything that can happen to an instance
//! - [`PersistentState::transition`]: the transition table, returning the
//!   next state plus the [`Effect`]s the caller must carry out
//!
//! States hold no data. The effect list is the only channel through which a
//! transition asks for work (enlistment, field snapshots, events).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod state;
pub mod transition;

pub use error::StateError;
pub use state::PersistentState;
pub use transition::{Effect, Effects, StateEvent, Transition, TransitionContext};
