//! # Cadence Core
//!
//! Hierarchical, concurrent state machines driven by a tick loop.
//!
//! This crate contains:
//! - State lifecycle (start / wait / interrupt / tick) and transitions
//! - Composite operators: Sequential, Selector, Parallel, AtLeastOne,
//!   RandomPick
//! - The rate-driven [`Machine`] runner and its debug snapshots
//! - A small library of stock behaviors
//!
//! This crate does NOT care about:
//! - What the behaviors actually do
//! - Where board data comes from or goes
//! - How debug snapshots are displayed

mod composites;

pub mod debug;
pub mod error;
pub mod library;
pub mod machine;
pub mod state;
pub mod status;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::debug::{render_snapshot, SnapshotObserver, StateSnapshot};
    pub use crate::error::{Fault, MachineError};
    pub use crate::library::{
        BoardToFlowBehavior, FlowToBoardBehavior, IdleBehavior, SetFlowBehavior, TraceBehavior,
        WaitBehavior,
    };
    pub use crate::machine::{Machine, MachineConfig};
    pub use crate::state::{Behavior, State, StateContext, TransitionCond};
    pub use crate::status::StateStatus;
    pub use cadence_board::Board;
}

// Re-export key types at crate root
pub use cadence_board::Board;
pub use debug::{SnapshotObserver, StateSnapshot};
pub use error::{Fault, MachineError};
pub use machine::{Machine, MachineConfig};
pub use state::{Behavior, State, StateContext, TransitionCond};
pub use status::StateStatus;
