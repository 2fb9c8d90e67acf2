//! Transition conditions
//!
//! Transitions are `(condition, target)` pairs evaluated in insertion
//! order on every tick; the first matching condition fires. Built-in
//! conditions are enum variants so they stay inspectable; arbitrary
//! predicates go through [`TransitionCond::Custom`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cadence_board::Board;

use crate::state::State;
use crate::status::StateStatus;

/// Predicate deciding whether a transition fires.
#[derive(Clone)]
pub enum TransitionCond {
    /// Fires when the state's status is `Success`.
    OnSuccess,
    /// Fires when the state's status is `Failed`.
    OnFailed,
    /// Fires when the activation task has finished, regardless of its
    /// outcome. With `ignore_fault = false`, an `Exception` outcome does
    /// not fire (the fault is left for the parent to surface).
    OnComplete {
        /// Also fire on `Exception` outcomes.
        ignore_fault: bool,
    },
    /// Fires once the given duration has passed since the state last
    /// started.
    AfterElapsed(Duration),
    /// Arbitrary caller-supplied predicate over the state and the board.
    Custom(Arc<dyn Fn(&State, &Board) -> bool + Send + Sync>),
}

impl TransitionCond {
    pub(crate) fn check(&self, state: &State, board: &Board) -> bool {
        match self {
            Self::OnSuccess => state.check_status(StateStatus::Success),
            Self::OnFailed => state.check_status(StateStatus::Failed),
            Self::OnComplete { ignore_fault } => {
                !state.is_alive()
                    && (*ignore_fault || !state.check_status(StateStatus::Exception))
            }
            Self::AfterElapsed(duration) => state
                .elapsed_since_start()
                .is_some_and(|elapsed| elapsed > *duration),
            Self::Custom(predicate) => predicate(state, board),
        }
    }
}

impl fmt::Debug for TransitionCond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OnSuccess => f.write_str("OnSuccess"),
            Self::OnFailed => f.write_str("OnFailed"),
            Self::OnComplete { ignore_fault } => f
                .debug_struct("OnComplete")
                .field("ignore_fault", ignore_fault)
                .finish(),
            Self::AfterElapsed(duration) => {
                f.debug_tuple("AfterElapsed").field(duration).finish()
            }
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// One entry in a state's ordered transition list.
pub(crate) struct Transition {
    pub(crate) when: TransitionCond,
    pub(crate) target: Arc<State>,
}
