//! Concurrent child execution: Parallel and AtLeastOne
//!
//! All children start at once, each on its own task. The composite's own
//! task blocks on a completion gate; actual per-child progress is only
//! observed in `tick` (driven externally every machine cycle), which
//! raises the gate as soon as the completion criterion is met. The
//! supervisor then force-interrupts every still-running child, successes
//! included, so no child outlives its parent, and reduces the child
//! statuses to its own result.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use cadence_board::Board;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::state::{lock, State};
use crate::status::StateStatus;

/// Completion and reduction policy for a parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParallelPolicy {
    /// Plain parallel: completes early on any failure; succeeds only if
    /// every child succeeded.
    AllSucceed,
    /// At-least-one: completes early on any success; succeeds if at least
    /// one child succeeded.
    AnySucceeds,
}

impl ParallelPolicy {
    /// Whether this (non-running, non-exception) child's outcome should
    /// raise the completion gate early.
    fn completes_on(self, child: &State) -> bool {
        match self {
            Self::AllSucceed => child.check_status(StateStatus::Failed),
            Self::AnySucceeds => child.check_status(StateStatus::Success),
        }
    }

    fn reduce(self, children: &[Arc<State>]) -> StateStatus {
        let success = match self {
            Self::AllSucceed => children
                .iter()
                .all(|child| child.check_status(StateStatus::Success)),
            Self::AnySucceeds => children
                .iter()
                .any(|child| child.check_status(StateStatus::Success)),
        };
        if success {
            StateStatus::Success
        } else {
            StateStatus::Failed
        }
    }
}

pub(crate) struct Parallel {
    pub(crate) children: Vec<Arc<State>>,
    pub(crate) policy: ParallelPolicy,
    /// Completion gate for the current activation; replaced on every
    /// start so a stale raise from a previous activation cannot leak in.
    gate: Mutex<watch::Sender<bool>>,
    child_faulted: AtomicBool,
}

impl Parallel {
    pub(crate) fn new(children: Vec<Arc<State>>, policy: ParallelPolicy) -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            children,
            policy,
            gate: Mutex::new(gate),
            child_faulted: AtomicBool::new(false),
        }
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self.policy {
            ParallelPolicy::AllSucceed => "parallel",
            ParallelPolicy::AnySucceeds => "at_least_one",
        }
    }

    /// Fresh gate for a new activation. Called from `start` before the
    /// supervising task spawns, so an interrupt arriving any time after
    /// `start` raises the gate the supervisor actually waits on.
    pub(crate) fn reset(&self) {
        let (gate, _) = watch::channel(false);
        *lock(&self.gate) = gate;
        self.child_faulted.store(false, Ordering::SeqCst);
    }

    pub(crate) fn raise_gate(&self) {
        lock(&self.gate).send_replace(true);
    }

    async fn gate_raised(&self) {
        let mut gate = lock(&self.gate).subscribe();
        // A closed gate means the activation was torn down; treat as raised.
        let _ = gate.wait_for(|raised| *raised).await;
    }

    fn flag_child_fault(&self) {
        self.child_faulted.store(true, Ordering::SeqCst);
    }

    fn child_faulted(&self) -> bool {
        self.child_faulted.load(Ordering::SeqCst)
    }

    /// Signal every child first (so they stop concurrently), then wait for
    /// each to exit. Safe to call when no child has been started yet.
    pub(crate) async fn interrupt_children(&self, timeout: Option<Duration>) -> bool {
        for child in &self.children {
            child.signal_interrupt();
        }
        for child in &self.children {
            if !child.interrupt(timeout).await {
                return false;
            }
        }
        true
    }

    /// Observe child progress for one machine cycle: tick running
    /// children, and raise the completion gate on the first child that
    /// satisfies the completion criterion, faults, or when none is left
    /// running.
    pub(crate) async fn tick_children(&self, state: &Arc<State>, board: &Board) {
        let mut any_running = false;
        for child in &self.children {
            if child.check_status(StateStatus::Running) {
                any_running = true;
                child.tick(board).await;
            } else if child.check_status(StateStatus::Exception) {
                state.adopt_child_fault(child);
                self.flag_child_fault();
                self.raise_gate();
            } else if self.policy.completes_on(child) {
                self.raise_gate();
            }
        }
        if !any_running {
            self.raise_gate();
        }
    }
}

/// Supervise the group for one activation of its composite.
pub(crate) async fn run(
    state: &Arc<State>,
    parallel: &Parallel,
    board: &Board,
    cancel: &CancellationToken,
) -> StateStatus {
    // Interrupted before any child was started.
    if cancel.is_cancelled() {
        return StateStatus::Interrupted;
    }

    for child in &parallel.children {
        child.start(board, Value::Null).await;
    }

    parallel.gate_raised().await;

    if cancel.is_cancelled() {
        return StateStatus::Interrupted;
    }

    if parallel.child_faulted() {
        for child in &parallel.children {
            if child.check_status(StateStatus::Running) {
                child.interrupt(None).await;
            } else if child.check_status(StateStatus::Exception) {
                state.adopt_child_fault(child);
            }
        }
        return StateStatus::Exception;
    }

    // The completion criterion fired; stop the stragglers (successes
    // included) before reducing, so none outlives this composite.
    for child in &parallel.children {
        if child.check_status(StateStatus::Running) && !child.interrupt(None).await {
            tracing::error!(
                state = %state.name(),
                child = %child.name(),
                "child refused to stop during parallel completion; zombie task likely"
            );
        }
    }

    parallel.policy.reduce(&parallel.children)
}
