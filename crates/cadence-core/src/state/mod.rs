//! State lifecycle and transition engine
//!
//! A [`State`] is one schedulable unit of behavior: it carries a status,
//! an ordered transition list, flow payload slots, and (while active)
//! exactly one spawned task plus a cancellation token. Leaves run a
//! user-supplied [`Behavior`]; composite kinds drive child states with
//! their own concurrency policies. States are shared as `Arc<State>` so
//! transition graphs may contain cycles and states can be reused across
//! activations; `start` fully resets the per-activation data.

mod behavior;
mod transition;

pub use behavior::{Behavior, StateContext};
pub use transition::TransitionCond;

pub(crate) use behavior::FlowSlots;

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cadence_board::Board;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::composites::chain::{self, Chain, ChainMode};
use crate::composites::parallel::{self, Parallel, ParallelPolicy};
use crate::composites::random_pick::{self, RandomPick};
use crate::debug::StateSnapshot;
use crate::error::Fault;
use crate::machine::{self, MachineCore};
use crate::status::StateStatus;
use transition::Transition;

/// Lock a mutex, recovering the data if a panicking task poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The closed set of state kinds. Composite-specific data lives in the
/// variant; the lifecycle surface (`start`/`wait`/`interrupt`/`tick`) is
/// shared by all of them.
pub(crate) enum Kind {
    Leaf(Arc<dyn Behavior>),
    Chain(Chain),
    Parallel(Parallel),
    RandomPick(RandomPick),
    Machine(MachineCore),
}

impl Kind {
    fn name(&self) -> &'static str {
        match self {
            Kind::Leaf(_) => "leaf",
            Kind::Chain(chain) => chain.kind_name(),
            Kind::Parallel(parallel) => parallel.kind_name(),
            Kind::RandomPick(_) => "random_pick",
            Kind::Machine(_) => "machine",
        }
    }

    /// Stop every child this kind may have running. Safety net invoked
    /// when an activation ends in `Exception`, and reused by `interrupt`.
    async fn interrupt_children(&self, timeout: Option<Duration>) -> bool {
        match self {
            Kind::Leaf(_) => true,
            Kind::Chain(chain) => chain.interrupt_current(timeout).await,
            Kind::Parallel(parallel) => parallel.interrupt_children(timeout).await,
            Kind::RandomPick(pick) => pick.interrupt_picked(timeout).await,
            Kind::Machine(core) => core.interrupt_current(timeout).await,
        }
    }
}

/// Handle to one activation of a state.
pub(crate) struct RunHandle {
    pub(crate) cancel: CancellationToken,
    finished: watch::Receiver<bool>,
}

struct Timing {
    last_start: Option<Instant>,
    last_end: Option<Instant>,
}

/// A single schedulable unit of behavior with lifecycle and transitions.
pub struct State {
    name: String,
    kind: Kind,
    status: Mutex<StateStatus>,
    transitions: Mutex<Vec<Transition>>,
    flow: Arc<Mutex<FlowSlots>>,
    fault: Mutex<Option<Fault>>,
    timing: Mutex<Timing>,
    run: Mutex<Option<RunHandle>>,
}

impl State {
    fn new(name: String, kind: Kind) -> Arc<Self> {
        Arc::new(Self {
            name,
            kind,
            status: Mutex::new(StateStatus::Unknown),
            transitions: Mutex::new(Vec::new()),
            flow: Arc::new(Mutex::new(FlowSlots::default())),
            fault: Mutex::new(None),
            timing: Mutex::new(Timing {
                last_start: None,
                last_end: None,
            }),
            run: Mutex::new(None),
        })
    }

    /// Leaf state running the given behavior.
    pub fn leaf(name: impl Into<String>, behavior: impl Behavior + 'static) -> Arc<Self> {
        Self::new(name.into(), Kind::Leaf(Arc::new(behavior)))
    }

    /// Sequential composite: children run in order, all must succeed.
    pub fn sequential(name: impl Into<String>, children: Vec<Arc<State>>) -> Arc<Self> {
        Self::new(
            name.into(),
            Kind::Chain(Chain::new(children, ChainMode::AllSucceed)),
        )
    }

    /// Selector composite: children run in order until one succeeds.
    pub fn selector(name: impl Into<String>, children: Vec<Arc<State>>) -> Arc<Self> {
        Self::new(
            name.into(),
            Kind::Chain(Chain::new(children, ChainMode::FirstSuccess)),
        )
    }

    /// Parallel composite: all children run concurrently; succeeds only
    /// if every child succeeds, completes early on any failure.
    pub fn parallel(name: impl Into<String>, children: Vec<Arc<State>>) -> Arc<Self> {
        Self::new(
            name.into(),
            Kind::Parallel(Parallel::new(children, ParallelPolicy::AllSucceed)),
        )
    }

    /// Parallel variant that completes as soon as any child succeeds.
    pub fn at_least_one(name: impl Into<String>, children: Vec<Arc<State>>) -> Arc<Self> {
        Self::new(
            name.into(),
            Kind::Parallel(Parallel::new(children, ParallelPolicy::AnySucceeds)),
        )
    }

    /// Composite that uniformly picks one child per activation.
    pub fn random_pick(name: impl Into<String>, children: Vec<Arc<State>>) -> Arc<Self> {
        Self::new(name.into(), Kind::RandomPick(RandomPick::new(children)))
    }

    pub(crate) fn new_machine(name: String, core: MachineCore) -> Arc<Self> {
        Self::new(name, Kind::Machine(core))
    }

    /// State name. Used for end-state matching and debug output; callers
    /// are responsible for keeping names unique within a graph.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind label as shown in snapshots.
    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }

    /// Check this state's name against the given one.
    pub fn check_name(&self, compare: &str) -> bool {
        self.name == compare
    }

    /// Current status.
    pub fn status(&self) -> StateStatus {
        *lock(&self.status)
    }

    /// Check the current status against the given one.
    pub fn check_status(&self, compare: StateStatus) -> bool {
        self.status() == compare
    }

    /// Whether the current activation task is still live.
    pub fn is_alive(&self) -> bool {
        lock(&self.run)
            .as_ref()
            .is_some_and(|run| !*run.finished.borrow())
    }

    /// Whether an interrupt has been requested for the current activation.
    pub fn is_interrupted(&self) -> bool {
        lock(&self.run)
            .as_ref()
            .is_some_and(|run| run.cancel.is_cancelled())
    }

    /// The captured fault, if the last activation ended in `Exception`.
    pub fn fault(&self) -> Option<Fault> {
        lock(&self.fault).clone()
    }

    /// Copy of the payload passed in at the last `start`.
    pub fn flow_in(&self) -> Value {
        lock(&self.flow).flow_in.clone()
    }

    /// Copy of the payload this state produced for its successor.
    pub fn flow_out(&self) -> Value {
        lock(&self.flow).flow_out.clone()
    }

    pub(crate) fn set_flow_out(&self, value: Value) {
        lock(&self.flow).flow_out = value;
    }

    /// Time elapsed since the last `start`, if any.
    pub fn elapsed_since_start(&self) -> Option<Duration> {
        lock(&self.timing).last_start.map(|at| at.elapsed())
    }

    /// How long the most recently finished activation ran, start to
    /// finish. `None` before the first activation completes, and again
    /// while a newer activation is still in flight.
    pub fn last_activation_duration(&self) -> Option<Duration> {
        let timing = lock(&self.timing);
        match (timing.last_start, timing.last_end) {
            (Some(start), Some(end)) if end >= start => Some(end.duration_since(start)),
            _ => None,
        }
    }

    pub(crate) fn record_fault(&self, error: anyhow::Error) {
        *lock(&self.fault) = Some(Fault::new(error));
    }

    /// Copy a child's fault into this state, extending its dotted origin
    /// path with this state's name.
    pub(crate) fn adopt_child_fault(&self, child: &State) {
        let child_fault = child.fault();
        if let Some(fault) = child_fault {
            *lock(&self.fault) = Some(fault.reparented(&self.name, &child.name));
        }
    }

    /// Request cooperative cancellation of the current activation without
    /// waiting for it to exit.
    pub(crate) fn signal_interrupt(&self) {
        if let Some(run) = lock(&self.run).as_ref() {
            run.cancel.cancel();
        }
    }

    // ---- transition builders -------------------------------------------

    /// Append a custom-predicate transition. Order is significant: the
    /// first matching transition wins on every tick.
    pub fn add_transition<F>(&self, predicate: F, target: &Arc<State>)
    where
        F: Fn(&State, &Board) -> bool + Send + Sync + 'static,
    {
        self.add_transition_when(TransitionCond::Custom(Arc::new(predicate)), target);
    }

    /// Append a transition with a built-in condition.
    pub fn add_transition_when(&self, when: TransitionCond, target: &Arc<State>) {
        lock(&self.transitions).push(Transition {
            when,
            target: Arc::clone(target),
        });
    }

    /// Transition to `target` when this state finishes successfully.
    pub fn add_transition_on_success(&self, target: &Arc<State>) {
        self.add_transition_when(TransitionCond::OnSuccess, target);
    }

    /// Transition to `target` when this state fails.
    pub fn add_transition_on_failed(&self, target: &Arc<State>) {
        self.add_transition_when(TransitionCond::OnFailed, target);
    }

    /// Transition to `target` when this state finishes with any outcome
    /// except `Exception`.
    pub fn add_transition_on_complete(&self, target: &Arc<State>) {
        self.add_transition_when(TransitionCond::OnComplete { ignore_fault: false }, target);
    }

    /// Transition to `target` once `duration` has passed since the last
    /// `start`, whether or not the state finished.
    pub fn add_transition_after_elapsed(&self, target: &Arc<State>, duration: Duration) {
        self.add_transition_when(TransitionCond::AfterElapsed(duration), target);
    }

    // ---- lifecycle ------------------------------------------------------

    /// Start one activation: status becomes `Running`, the interrupt
    /// signal and flow/fault slots are reset, and the execute wrapper is
    /// spawned on its own task.
    ///
    /// Starting a state whose previous activation is still alive is a
    /// caller error: the old task keeps running with its old token and
    /// the two activations race on the state's slots. Interrupt and wait
    /// first.
    pub fn start<'a>(self: &'a Arc<Self>, board: &'a Board, flow_in: Value) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let run_id = Uuid::new_v4();
            let cancel = CancellationToken::new();
            let (finished_tx, finished_rx) = watch::channel(false);

            *lock(&self.status) = StateStatus::Running;
            *lock(&self.fault) = None;
            {
                let mut flow = lock(&self.flow);
                flow.flow_in = flow_in;
                flow.flow_out = Value::Null;
            }
            lock(&self.timing).last_start = Some(Instant::now());
            *lock(&self.run) = Some(RunHandle {
                cancel: cancel.clone(),
                finished: finished_rx,
            });

            match &self.kind {
                // The completion gate must be fresh before the supervisor
                // task can possibly wait on it.
                Kind::Parallel(parallel) => parallel.reset(),
                // A machine enters through its root: the root starts
                // before the driving loop takes its first tick.
                Kind::Machine(core) => {
                    let root = Arc::clone(&core.root);
                    *lock(&core.current) = Arc::clone(&root);
                    root.start(board, self.flow_in()).await;
                }
                _ => {}
            }

            let state = Arc::clone(self);
            let board = board.clone();
            tokio::spawn(async move {
                tracing::trace!(state = %state.name, run_id = %run_id, "activation started");
                let status = run_activation(&state, &board, &cancel).await;
                if status == StateStatus::Exception {
                    // No child may survive its parent's fault.
                    self_interrupt_children(&state).await;
                }
                lock(&state.timing).last_end = Some(Instant::now());
                *lock(&state.status) = status;
                tracing::trace!(state = %state.name, run_id = %run_id, status = %status, "activation finished");
                let _ = finished_tx.send(true);
            });
        })
    }

    /// Block until the current activation finishes or `timeout` elapses;
    /// returns whether it finished. Immediately true when nothing is
    /// running.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        let receiver = lock(&self.run).as_ref().map(|run| run.finished.clone());
        let Some(mut receiver) = receiver else {
            return true;
        };
        let finished = async move {
            // A closed channel means the activation task is gone either way.
            let _ = receiver.wait_for(|done| *done).await;
        };
        match timeout {
            None => {
                finished.await;
                true
            }
            Some(timeout) => tokio::time::timeout(timeout, finished).await.is_ok(),
        }
    }

    /// Request cooperative cancellation and wait (bounded by `timeout`)
    /// for the activation - children first where the kind owns children -
    /// to exit. Returns whether everything stopped in time; on a false
    /// return the interrupt signal stays raised and the caller must not
    /// restart the state until a later `wait` succeeds.
    pub fn interrupt<'a>(&'a self, timeout: Option<Duration>) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            match &self.kind {
                Kind::Machine(core) => {
                    // Stop the driven state before the loop itself; the
                    // reverse order lets the loop race past a live child.
                    if !core.interrupt_current(timeout).await {
                        tracing::error!(
                            state = %self.name,
                            "active state refused to stop; zombie task likely"
                        );
                        return false;
                    }
                    self.signal_interrupt();
                    self.wait(timeout).await
                }
                Kind::Chain(chain) => {
                    self.signal_interrupt();
                    if !chain.interrupt_current(timeout).await {
                        return false;
                    }
                    self.wait(timeout).await
                }
                Kind::Parallel(parallel) => {
                    self.signal_interrupt();
                    if !parallel.interrupt_children(timeout).await {
                        return false;
                    }
                    // Unblock the supervisor, which is parked on the gate.
                    parallel.raise_gate();
                    self.wait(timeout).await
                }
                Kind::RandomPick(pick) => {
                    self.signal_interrupt();
                    if !pick.interrupt_picked(timeout).await {
                        return false;
                    }
                    self.wait(timeout).await
                }
                Kind::Leaf(_) => {
                    self.signal_interrupt();
                    self.wait(timeout).await
                }
            }
        })
    }

    /// Evaluate transitions in insertion order. On the first match the
    /// state is synchronously interrupted, the target starts with this
    /// state's `flow_out` as its `flow_in`, and the target is returned.
    /// Otherwise composite kinds pass the tick through to their active
    /// children and `self` is returned unchanged.
    pub fn tick<'a>(self: &'a Arc<Self>, board: &'a Board) -> BoxFuture<'a, Arc<State>> {
        Box::pin(async move {
            let fired = {
                let transitions = lock(&self.transitions);
                transitions
                    .iter()
                    .find(|transition| transition.when.check(self, board))
                    .map(|transition| Arc::clone(&transition.target))
            };

            if let Some(target) = fired {
                if !self.interrupt(None).await {
                    tracing::error!(
                        state = %self.name,
                        "could not stop state during transition; zombie task likely"
                    );
                }
                let flow = self.flow_out();
                target.start(board, flow).await;
                return target;
            }

            match &self.kind {
                Kind::Chain(chain) => chain.tick_current(board).await,
                Kind::Parallel(parallel) => parallel.tick_children(self, board).await,
                _ => {}
            }
            Arc::clone(self)
        })
    }

    /// Recursive status snapshot of this state and its children.
    pub fn snapshot(&self) -> StateSnapshot {
        let children = match &self.kind {
            Kind::Leaf(_) => Vec::new(),
            Kind::Chain(chain) => chain.children.iter().map(|c| c.snapshot()).collect(),
            Kind::Parallel(parallel) => {
                parallel.children.iter().map(|c| c.snapshot()).collect()
            }
            Kind::RandomPick(pick) => pick.children.iter().map(|c| c.snapshot()).collect(),
            Kind::Machine(core) => vec![core.current().snapshot()],
        };
        StateSnapshot {
            name: self.name.clone(),
            kind: self.kind.name(),
            status: self.status(),
            children,
        }
    }

    // ---- machine plumbing ----------------------------------------------

    pub(crate) fn machine_core(&self) -> &MachineCore {
        match &self.kind {
            Kind::Machine(core) => core,
            _ => unreachable!("machine handles always wrap machine-kind states"),
        }
    }

    /// Reset per-activation slots for a manually driven machine, which
    /// has no spawned task and therefore no run handle.
    pub(crate) fn begin_manual_activation(&self, flow_in: Value) {
        *lock(&self.status) = StateStatus::Running;
        *lock(&self.fault) = None;
        {
            let mut flow = lock(&self.flow);
            flow.flow_in = flow_in;
            flow.flow_out = Value::Null;
        }
        lock(&self.timing).last_start = Some(Instant::now());
        *lock(&self.run) = None;
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("name", &self.name)
            .field("kind", &self.kind.name())
            .field("status", &self.status())
            .field("alive", &self.is_alive())
            .finish_non_exhaustive()
    }
}

/// Kind dispatch for the activation task.
async fn run_activation(
    state: &Arc<State>,
    board: &Board,
    cancel: &CancellationToken,
) -> StateStatus {
    match &state.kind {
        Kind::Leaf(behavior) => {
            run_leaf(state, Arc::clone(behavior), board, cancel).await
        }
        Kind::Chain(c) => chain::run(state, c, board, cancel).await,
        Kind::Parallel(p) => parallel::run(state, p, board, cancel).await,
        Kind::RandomPick(r) => random_pick::run(state, r, board, cancel).await,
        Kind::Machine(m) => machine::run_loop(state, m, board, cancel).await,
    }
}

async fn self_interrupt_children(state: &Arc<State>) {
    if !state.kind.interrupt_children(None).await {
        tracing::error!(
            state = %state.name(),
            "children refused to stop after fault; zombie tasks likely"
        );
    }
}

/// Run a leaf behavior, converting errors and panics into `Exception`.
/// The returned status is stored verbatim: a behavior may deliberately
/// report `Running` (see `IdleBehavior`) to stay transition-driven.
async fn run_leaf(
    state: &Arc<State>,
    behavior: Arc<dyn Behavior>,
    board: &Board,
    cancel: &CancellationToken,
) -> StateStatus {
    let ctx = StateContext::new(
        state.name().to_string(),
        board.clone(),
        cancel.clone(),
        Arc::clone(&state.flow),
    );
    match AssertUnwindSafe(behavior.execute(&ctx)).catch_unwind().await {
        Ok(Ok(status)) => status,
        Ok(Err(error)) => {
            state.record_fault(error);
            StateStatus::Exception
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "opaque panic payload".to_string());
            state.record_fault(anyhow::anyhow!("behavior panicked: {message}"));
            StateStatus::Exception
        }
    }
}
