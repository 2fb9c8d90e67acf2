//! Ordered child execution: Sequential and Selector
//!
//! Both operators run their children one at a time, in list order, on the
//! composite's own activation task, forwarding the flow payload from one
//! child to the next. They differ only in what short-circuits the walk:
//! Sequential stops on the first non-success, Selector stops on the first
//! success.

use std::sync::Arc;

use cadence_board::Board;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::state::State;
use crate::status::StateStatus;

/// Short-circuit policy for a chain of children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChainMode {
    /// Sequential: every child must succeed; the first non-success ends
    /// the chain with that status.
    AllSucceed,
    /// Selector: the first success ends the chain; failures accumulate
    /// and forward their flow to the next child.
    FirstSuccess,
}

pub(crate) struct Chain {
    pub(crate) children: Vec<Arc<State>>,
    pub(crate) mode: ChainMode,
    /// Child currently being driven. Guarded so that a concurrent
    /// interrupt or tick never observes a half-switched pointer.
    pub(crate) current: Mutex<Option<Arc<State>>>,
}

impl Chain {
    pub(crate) fn new(children: Vec<Arc<State>>, mode: ChainMode) -> Self {
        Self {
            children,
            mode,
            current: Mutex::new(None),
        }
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self.mode {
            ChainMode::AllSucceed => "sequential",
            ChainMode::FirstSuccess => "selector",
        }
    }

    /// Stop the currently driven child, if any. Tolerates being called
    /// before the first child has started.
    pub(crate) async fn interrupt_current(&self, timeout: Option<std::time::Duration>) -> bool {
        let current = self.current.lock().await.clone();
        match current {
            Some(child) => child.interrupt(timeout).await,
            None => true,
        }
    }

    /// Tick the currently driven child so that transition graphs embedded
    /// inside a sequence keep being evaluated every machine cycle.
    pub(crate) async fn tick_current(&self, board: &Board) {
        let guard = self.current.lock().await;
        if let Some(child) = guard.clone() {
            child.tick(board).await;
        }
    }
}

/// Drive the chain for one activation of its composite.
pub(crate) async fn run(
    state: &Arc<State>,
    chain: &Chain,
    board: &Board,
    cancel: &CancellationToken,
) -> StateStatus {
    let mut flow = state.flow_in();

    for child in &chain.children {
        {
            let mut current = chain.current.lock().await;
            // Re-check under the lock so an interrupt that just stopped the
            // previous child cannot race us into starting the next one.
            if cancel.is_cancelled() {
                return StateStatus::Interrupted;
            }
            *current = Some(Arc::clone(child));
            child.start(board, flow.clone()).await;
        }
        child.wait(None).await;

        if cancel.is_cancelled() {
            return StateStatus::Interrupted;
        }

        let status = child.status();
        if status == StateStatus::Exception {
            state.adopt_child_fault(child);
            return StateStatus::Exception;
        }

        match chain.mode {
            ChainMode::AllSucceed => {
                if status != StateStatus::Success {
                    return status;
                }
                flow = child.flow_out();
            }
            ChainMode::FirstSuccess => match status {
                StateStatus::Success => {
                    state.set_flow_out(child.flow_out());
                    return StateStatus::Success;
                }
                StateStatus::Failed => {
                    flow = child.flow_out();
                }
                other => return other,
            },
        }
    }

    match chain.mode {
        ChainMode::AllSucceed => {
            // All children succeeded; the last flow value becomes ours.
            state.set_flow_out(flow);
            StateStatus::Success
        }
        // Every child failed and no flow_out is produced.
        ChainMode::FirstSuccess => StateStatus::Failed,
    }
}
