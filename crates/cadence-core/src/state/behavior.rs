//! Behavior trait and execution context
//!
//! A [`Behavior`] is the user-supplied body of a leaf state. It runs on the
//! state's activation task and must poll its context's interrupt signal to
//! stay responsive to cooperative cancellation.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cadence_board::Board;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::state::lock;
use crate::status::StateStatus;

/// Body of a leaf state.
///
/// Returning `Err` marks the state `Exception` and captures the error as
/// its fault; the returned status is stored verbatim otherwise. Long-running
/// implementations should check [`StateContext::is_interrupted`] (or await
/// [`StateContext::interrupted`]) at every natural pause point.
#[async_trait]
pub trait Behavior: Send + Sync {
    /// Execute the behavior for one activation of its state.
    async fn execute(&self, ctx: &StateContext) -> anyhow::Result<StateStatus>;
}

/// Data passed between sequentially connected states.
#[derive(Debug, Default)]
pub(crate) struct FlowSlots {
    pub(crate) flow_in: Value,
    pub(crate) flow_out: Value,
}

/// Execution context handed to a [`Behavior`] for one activation.
///
/// Carries the shared board, the flow payload handed over by the previous
/// state, and the cancellation token for this activation.
#[derive(Clone)]
pub struct StateContext {
    state_name: String,
    board: Board,
    cancel: CancellationToken,
    flow: Arc<Mutex<FlowSlots>>,
}

impl StateContext {
    pub(crate) fn new(
        state_name: String,
        board: Board,
        cancel: CancellationToken,
        flow: Arc<Mutex<FlowSlots>>,
    ) -> Self {
        Self {
            state_name,
            board,
            cancel,
            flow,
        }
    }

    /// Name of the state this activation belongs to.
    pub fn state_name(&self) -> &str {
        &self.state_name
    }

    /// The shared blackboard.
    pub fn board(&self) -> &Board {
        &self.board
    }

    /// Copy of the payload handed over when this state was started.
    pub fn flow_in(&self) -> Value {
        lock(&self.flow).flow_in.clone()
    }

    /// Set the payload handed to the next state on transition.
    pub fn set_flow_out(&self, value: Value) {
        lock(&self.flow).flow_out = value;
    }

    /// Whether an interrupt has been requested for this activation.
    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes when an interrupt is requested. Intended for use inside
    /// `tokio::select!` alongside the behavior's own waiting.
    pub async fn interrupted(&self) {
        self.cancel.cancelled().await;
    }
}

impl std::fmt::Debug for StateContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateContext")
            .field("state_name", &self.state_name)
            .field("interrupted", &self.is_interrupted())
            .finish_non_exhaustive()
    }
}
