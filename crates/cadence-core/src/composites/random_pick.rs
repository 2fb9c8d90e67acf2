//! Random child selection
//!
//! Each activation uniformly picks one child, runs only that child, and
//! forwards its status and flow as the composite's own. The picked
//! reference is guarded by a lock because an interrupt can race its
//! clearing once the child completes.

use std::sync::Arc;
use std::time::Duration;

use cadence_board::Board;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::state::State;
use crate::status::StateStatus;

pub(crate) struct RandomPick {
    pub(crate) children: Vec<Arc<State>>,
    pub(crate) picked: Mutex<Option<Arc<State>>>,
}

impl RandomPick {
    pub(crate) fn new(children: Vec<Arc<State>>) -> Self {
        Self {
            children,
            picked: Mutex::new(None),
        }
    }

    pub(crate) async fn interrupt_picked(&self, timeout: Option<Duration>) -> bool {
        let picked = self.picked.lock().await.clone();
        match picked {
            Some(child) => child.interrupt(timeout).await,
            None => true,
        }
    }
}

pub(crate) async fn run(
    state: &Arc<State>,
    pick: &RandomPick,
    board: &Board,
    cancel: &CancellationToken,
) -> StateStatus {
    let picked = {
        let mut guard = pick.picked.lock().await;
        if cancel.is_cancelled() {
            return StateStatus::Interrupted;
        }
        let Some(child) = pick.children.choose(&mut rand::thread_rng()).cloned() else {
            state.record_fault(anyhow::anyhow!(
                "random pick state '{}' has no children",
                state.name()
            ));
            return StateStatus::Exception;
        };
        *guard = Some(Arc::clone(&child));
        // Start while still holding the lock: an interrupt arriving now
        // blocks on the lock and then stops a properly started child
        // instead of missing it.
        child.start(board, state.flow_in()).await;
        child
    };

    picked.wait(None).await;

    state.set_flow_out(picked.flow_out());
    let status = picked.status();
    if status == StateStatus::Exception {
        state.adopt_child_fault(&picked);
    }
    *pick.picked.lock().await = None;
    status
}
