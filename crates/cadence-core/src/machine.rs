//! Rate-driven machine over a transition graph
//!
//! A machine wraps a root state and repeatedly ticks the currently active
//! state at a fixed rate until it reaches an end state, a fault surfaces,
//! or the machine is interrupted. A machine is itself a state, so machines
//! nest inside other machines (or composites) like any other child.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadence_board::Board;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::debug::{render_snapshot, SnapshotObserver, StateSnapshot};
use crate::error::MachineError;
use crate::state::{lock, State};
use crate::status::StateStatus;

/// Configuration for a [`Machine`].
#[derive(Clone)]
pub struct MachineConfig {
    /// Tick rate in cycles per second.
    pub rate: f64,
    /// Names of states that terminate the machine once they finish.
    pub end_states: Vec<String>,
    /// Emit a status snapshot every cycle.
    pub debug: bool,
    /// Sink for per-cycle snapshots; only consulted when `debug` is set.
    pub observer: Option<Arc<dyn SnapshotObserver>>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            rate: 1.0,
            end_states: Vec::new(),
            debug: false,
            observer: None,
        }
    }
}

impl std::fmt::Debug for MachineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineConfig")
            .field("rate", &self.rate)
            .field("end_states", &self.end_states)
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

pub(crate) struct MachineCore {
    pub(crate) root: Arc<State>,
    /// Currently active state of the transition graph. Updated only by
    /// `update`; readers clone the pointer under the lock.
    pub(crate) current: Mutex<Arc<State>>,
    pub(crate) end_states: HashSet<String>,
    pub(crate) period: Duration,
    pub(crate) debug: bool,
    pub(crate) observer: Option<Arc<dyn SnapshotObserver>>,
}

impl MachineCore {
    pub(crate) fn current(&self) -> Arc<State> {
        Arc::clone(&lock(&self.current))
    }

    /// End condition: the active state's name is in the end set and its
    /// activation has fully finished (not merely been transitioned to).
    pub(crate) fn is_end(&self) -> bool {
        let current = self.current();
        !current.is_alive() && self.end_states.contains(current.name())
    }

    /// One tick cycle: move `current` through its transition evaluation.
    /// `wait_for_current` blocks until the active state completes first;
    /// used for deterministic single-stepping.
    pub(crate) async fn update(&self, board: &Board, wait_for_current: bool) {
        let current = self.current();
        if wait_for_current {
            current.wait(None).await;
        }
        let next = current.tick(board).await;
        *lock(&self.current) = next;
    }

    pub(crate) async fn interrupt_current(&self, timeout: Option<Duration>) -> bool {
        self.current().interrupt(timeout).await
    }
}

/// The machine's driving loop; runs on the machine state's own activation
/// task unless the machine was started in manual mode.
pub(crate) async fn run_loop(
    state: &Arc<State>,
    core: &MachineCore,
    board: &Board,
    cancel: &CancellationToken,
) -> StateStatus {
    loop {
        if cancel.is_cancelled() {
            return StateStatus::Interrupted;
        }
        let cycle_start = Instant::now();

        core.update(board, false).await;

        if core.debug {
            let snapshot = state.snapshot();
            if let Some(observer) = &core.observer {
                observer.on_snapshot(&snapshot);
            }
            tracing::debug!(
                machine = %state.name(),
                snapshot = %render_snapshot(&snapshot).join("\n"),
                "machine cycle"
            );
        }

        if core.is_end() {
            return StateStatus::Success;
        }
        let current = core.current();
        if current.check_status(StateStatus::Exception) {
            state.adopt_child_fault(&current);
            return StateStatus::Exception;
        }

        let elapsed = cycle_start.elapsed();
        match core.period.checked_sub(elapsed) {
            Some(remaining) => {
                tokio::select! {
                    () = tokio::time::sleep(remaining) => {}
                    () = cancel.cancelled() => return StateStatus::Interrupted,
                }
            }
            None => {
                tracing::warn!(
                    machine = %state.name(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    period_ms = core.period.as_millis() as u64,
                    "machine cycle overran its tick period"
                );
            }
        }
    }
}

/// A composable, rate-driven state machine.
///
/// `Machine` is a thin handle around a machine-kind [`State`]; use
/// [`Machine::state`] to wire a machine as a child or transition target of
/// another graph.
#[derive(Clone)]
pub struct Machine {
    state: Arc<State>,
}

impl Machine {
    /// Build a machine named `name` driving the graph rooted at `root`.
    pub fn new(name: impl Into<String>, root: Arc<State>, config: MachineConfig) -> Self {
        let rate = if config.rate > 0.0 { config.rate } else { 1.0 };
        let core = MachineCore {
            current: Mutex::new(Arc::clone(&root)),
            root,
            end_states: config.end_states.into_iter().collect(),
            period: Duration::from_secs_f64(1.0 / rate),
            debug: config.debug,
            observer: config.observer,
        };
        Self {
            state: State::new_machine(name.into(), core),
        }
    }

    /// The machine as a plain state, for nesting inside a parent graph.
    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    /// Consume the handle, returning the underlying state.
    pub fn into_state(self) -> Arc<State> {
        self.state
    }

    /// Start the machine: the root becomes the active state and the
    /// driving loop spawns on its own task.
    pub async fn start(&self, board: &Board, flow_in: Value) {
        self.state.start(board, flow_in).await;
    }

    /// Start without spawning the driving loop; the caller drives
    /// [`Machine::update`] directly. Used for deterministic stepping.
    pub async fn start_manual(&self, board: &Board, flow_in: Value) {
        self.state.begin_manual_activation(flow_in);
        let core = self.state.machine_core();
        let root = Arc::clone(&core.root);
        *lock(&core.current) = Arc::clone(&root);
        root.start(board, self.state.flow_in()).await;
    }

    /// Perform one tick cycle by hand.
    pub async fn update(&self, board: &Board) {
        self.state.machine_core().update(board, false).await;
    }

    /// Wait for the active state to finish, then perform one tick cycle.
    pub async fn update_and_wait(&self, board: &Board) {
        self.state.machine_core().update(board, true).await;
    }

    /// Whether the machine has reached one of its end states.
    pub fn is_end(&self) -> bool {
        self.state.machine_core().is_end()
    }

    /// The currently active state of the graph.
    pub fn current(&self) -> Arc<State> {
        self.state.machine_core().current()
    }

    /// Run to completion on the given board.
    ///
    /// Blocks until the machine reaches a terminal state. Returns the
    /// terminal status, or [`MachineError::Faulted`] if a fault surfaced;
    /// the full [`crate::Fault`] stays inspectable via [`Machine::fault`].
    pub async fn run(&self, board: &Board) -> Result<StateStatus, MachineError> {
        self.run_with(board, Value::Null).await
    }

    /// Like [`Machine::run`], passing an initial flow payload to the root.
    pub async fn run_with(
        &self,
        board: &Board,
        flow_in: Value,
    ) -> Result<StateStatus, MachineError> {
        self.start(board, flow_in).await;
        self.state.wait(None).await;
        let status = self.state.status();
        if status == StateStatus::Exception {
            let (origin, message) = match self.state.fault() {
                Some(fault) => (
                    fault.origin().unwrap_or_else(|| self.state.name()).to_string(),
                    fault.error().to_string(),
                ),
                None => (self.state.name().to_string(), "unknown fault".to_string()),
            };
            return Err(MachineError::Faulted {
                machine: self.state.name().to_string(),
                origin,
                message,
            });
        }
        Ok(status)
    }

    /// Run on a board created for this invocation; returns it together
    /// with the terminal status for inspection.
    pub async fn run_detached(&self) -> (Board, Result<StateStatus, MachineError>) {
        let board = Board::new();
        let result = self.run(&board).await;
        (board, result)
    }

    /// Interrupt the machine: the active state is stopped first, then the
    /// driving loop itself.
    pub async fn interrupt(&self, timeout: Option<Duration>) -> bool {
        self.state.interrupt(timeout).await
    }

    /// Wait until the machine's driving loop finishes.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        self.state.wait(timeout).await
    }

    /// Terminal fault, if the machine surfaced an exception.
    pub fn fault(&self) -> Option<crate::Fault> {
        self.state.fault()
    }

    /// Current status of the machine itself.
    pub fn status(&self) -> StateStatus {
        self.state.status()
    }

    /// Snapshot of the machine and its active subtree.
    pub fn snapshot(&self) -> StateSnapshot {
        self.state.snapshot()
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("name", &self.state.name())
            .field("status", &self.state.status())
            .finish_non_exhaustive()
    }
}
