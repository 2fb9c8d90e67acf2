//! End-to-end behavior of the state lifecycle, composite operators, and
//! the machine runner. Timing-sensitive cases run on tokio's paused clock
//! so they are deterministic regardless of host load.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use cadence_core::library::{SetFlowBehavior, TraceBehavior, WaitBehavior};
use cadence_core::prelude::*;

/// Succeeds after `delay`, appending its state name to the board list
/// under `"order"` so tests can assert execution order.
struct RecordAfter {
    delay: Duration,
}

#[async_trait]
impl Behavior for RecordAfter {
    async fn execute(&self, ctx: &StateContext) -> anyhow::Result<StateStatus> {
        tokio::select! {
            () = tokio::time::sleep(self.delay) => {}
            () = ctx.interrupted() => return Ok(StateStatus::Interrupted),
        }
        let mut order = match ctx.board().get("order") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };
        order.push(json!(ctx.state_name()));
        ctx.board().set("order", Value::Array(order));
        Ok(StateStatus::Success)
    }
}

/// Completes with a fixed status after `delay`.
struct OutcomeAfter {
    delay: Duration,
    outcome: StateStatus,
}

#[async_trait]
impl Behavior for OutcomeAfter {
    async fn execute(&self, ctx: &StateContext) -> anyhow::Result<StateStatus> {
        tokio::select! {
            () = tokio::time::sleep(self.delay) => Ok(self.outcome),
            () = ctx.interrupted() => Ok(StateStatus::Interrupted),
        }
    }
}

/// Always returns an error.
struct Broken;

#[async_trait]
impl Behavior for Broken {
    async fn execute(&self, _ctx: &StateContext) -> anyhow::Result<StateStatus> {
        anyhow::bail!("sensor offline")
    }
}

/// Sleeps without ever polling the interrupt signal.
struct Stubborn {
    delay: Duration,
}

#[async_trait]
impl Behavior for Stubborn {
    async fn execute(&self, _ctx: &StateContext) -> anyhow::Result<StateStatus> {
        tokio::time::sleep(self.delay).await;
        Ok(StateStatus::Success)
    }
}

/// Appends the incoming flow value to it and emits the result, so a chain
/// of these shows exactly what each one received.
struct AppendFlow {
    tag: &'static str,
}

#[async_trait]
impl Behavior for AppendFlow {
    async fn execute(&self, ctx: &StateContext) -> anyhow::Result<StateStatus> {
        let mut items = match ctx.flow_in() {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        items.push(json!(self.tag));
        ctx.set_flow_out(Value::Array(items));
        Ok(StateStatus::Success)
    }
}

fn counting_leaf(name: &str, counter: &Arc<AtomicU32>) -> Arc<State> {
    struct Count(Arc<AtomicU32>);

    #[async_trait]
    impl Behavior for Count {
        async fn execute(&self, _ctx: &StateContext) -> anyhow::Result<StateStatus> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(StateStatus::Success)
        }
    }

    State::leaf(name, Count(Arc::clone(counter)))
}

// ---- leaf lifecycle -----------------------------------------------------

#[tokio::test]
async fn test_leaf_error_becomes_exception_with_fault() {
    let board = Board::new();
    let leaf = State::leaf("probe", Broken);
    leaf.start(&board, Value::Null).await;
    leaf.wait(None).await;
    assert!(leaf.check_status(StateStatus::Exception));
    let fault = leaf.fault().unwrap();
    assert_eq!(fault.origin(), None);
    assert_eq!(fault.error().to_string(), "sensor offline");
}

#[tokio::test]
async fn test_leaf_panic_becomes_exception() {
    struct Panics;

    #[async_trait]
    impl Behavior for Panics {
        async fn execute(&self, _ctx: &StateContext) -> anyhow::Result<StateStatus> {
            panic!("index out of range")
        }
    }

    let board = Board::new();
    let leaf = State::leaf("panics", Panics);
    leaf.start(&board, Value::Null).await;
    leaf.wait(None).await;
    assert!(leaf.check_status(StateStatus::Exception));
    let message = leaf.fault().unwrap().error().to_string();
    assert!(message.contains("index out of range"), "got: {message}");
}

#[tokio::test]
async fn test_restart_resets_fault_and_flow() {
    struct FailFirst(AtomicU32);

    #[async_trait]
    impl Behavior for FailFirst {
        async fn execute(&self, ctx: &StateContext) -> anyhow::Result<StateStatus> {
            if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("cold start")
            }
            ctx.set_flow_out(json!("warm"));
            Ok(StateStatus::Success)
        }
    }

    let board = Board::new();
    let leaf = State::leaf("flaky", FailFirst(AtomicU32::new(0)));

    leaf.start(&board, Value::Null).await;
    leaf.wait(None).await;
    assert!(leaf.check_status(StateStatus::Exception));
    assert!(leaf.fault().is_some());

    leaf.start(&board, Value::Null).await;
    leaf.wait(None).await;
    assert!(leaf.check_status(StateStatus::Success));
    assert!(leaf.fault().is_none());
    assert_eq!(leaf.flow_out(), json!("warm"));
}

#[tokio::test(start_paused = true)]
async fn test_interrupt_timeout_reports_unstopped_state() {
    let board = Board::new();
    let leaf = State::leaf(
        "stubborn",
        Stubborn {
            delay: Duration::from_secs(5),
        },
    );
    leaf.start(&board, Value::Null).await;

    // The behavior never polls the signal, so a bounded interrupt gives up.
    assert!(!leaf.interrupt(Some(Duration::from_secs(1))).await);
    assert!(leaf.is_alive());

    // It still finishes on its own schedule.
    assert!(leaf.wait(None).await);
    assert!(!leaf.is_alive());
    assert!(leaf.check_status(StateStatus::Success));
}

#[tokio::test(start_paused = true)]
async fn test_activation_duration_recorded_on_finish() {
    let board = Board::new();
    let leaf = State::leaf("timed", WaitBehavior::secs(3));
    assert_eq!(leaf.last_activation_duration(), None);

    leaf.start(&board, Value::Null).await;
    // Still in flight: no finished activation to report yet.
    assert_eq!(leaf.last_activation_duration(), None);

    leaf.wait(None).await;
    let duration = leaf.last_activation_duration().expect("finished once");
    assert!(duration >= Duration::from_secs(3), "got {duration:?}");
    assert!(duration < Duration::from_secs(4), "got {duration:?}");
}

#[tokio::test]
async fn test_wait_on_never_started_state_returns_immediately() {
    let leaf = State::leaf("unused", TraceBehavior::new("never runs"));
    assert!(leaf.wait(Some(Duration::from_millis(1))).await);
    assert!(leaf.check_status(StateStatus::Unknown));
}

// ---- transitions --------------------------------------------------------

#[tokio::test]
async fn test_transition_forwards_flow_to_target() {
    let board = Board::new();
    let produce = State::leaf("produce", SetFlowBehavior::new(json!(41)));
    let consume = State::leaf("consume", AppendFlow { tag: "consumed" });
    produce.add_transition_on_success(&consume);

    produce.start(&board, Value::Null).await;
    produce.wait(None).await;
    let next = produce.tick(&board).await;
    assert!(Arc::ptr_eq(&next, &consume));
    next.wait(None).await;
    assert_eq!(next.flow_out(), json!([41, "consumed"]));
}

#[tokio::test]
async fn test_first_matching_transition_wins() {
    let board = Board::new();
    let src = State::leaf("src", TraceBehavior::new("go"));
    let first = State::leaf("first", TraceBehavior::new("a"));
    let second = State::leaf("second", TraceBehavior::new("b"));
    src.add_transition_on_complete(&first);
    src.add_transition_on_complete(&second);

    src.start(&board, Value::Null).await;
    src.wait(None).await;
    let next = src.tick(&board).await;
    assert!(Arc::ptr_eq(&next, &first));
    assert!(second.check_status(StateStatus::Unknown));
}

#[tokio::test]
async fn test_unmatched_tick_returns_self() {
    let board = Board::new();
    let src = State::leaf("src", TraceBehavior::new("go"));
    let target = State::leaf("target", TraceBehavior::new("x"));
    src.add_transition_on_failed(&target);

    src.start(&board, Value::Null).await;
    src.wait(None).await;
    let next = src.tick(&board).await;
    assert!(Arc::ptr_eq(&next, &src));
    assert!(target.check_status(StateStatus::Unknown));
}

#[tokio::test(start_paused = true)]
async fn test_elapsed_transition_preempts_running_state() {
    let board = Board::new();
    let slow = State::leaf("slow", WaitBehavior::secs(60));
    let fallback = State::leaf("fallback", TraceBehavior::new("took over"));
    slow.add_transition_after_elapsed(&fallback, Duration::from_secs(2));

    slow.start(&board, Value::Null).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    let next = slow.tick(&board).await;
    assert!(Arc::ptr_eq(&next, &slow), "fired a full second early");

    tokio::time::sleep(Duration::from_secs(2)).await;
    let next = slow.tick(&board).await;
    assert!(Arc::ptr_eq(&next, &fallback));
    // The preempted state was stopped before the target started.
    assert!(slow.check_status(StateStatus::Interrupted));
}

#[tokio::test]
async fn test_custom_predicate_reads_board() {
    let board = Board::new();
    let idle = State::leaf("idle", cadence_core::library::IdleBehavior);
    let go = State::leaf("go", TraceBehavior::new("released"));
    idle.add_transition(|_state, board| board.exists("release"), &go);

    idle.start(&board, Value::Null).await;
    idle.wait(None).await;
    let next = idle.tick(&board).await;
    assert!(Arc::ptr_eq(&next, &idle));

    board.set("release", json!(true));
    let next = idle.tick(&board).await;
    assert!(Arc::ptr_eq(&next, &go));
}

// ---- sequential ---------------------------------------------------------

#[tokio::test]
async fn test_sequential_chains_flow_through_children() {
    let board = Board::new();
    let seq = State::sequential(
        "seq",
        vec![
            State::leaf("a", AppendFlow { tag: "a" }),
            State::leaf("b", AppendFlow { tag: "b" }),
            State::leaf("c", AppendFlow { tag: "c" }),
        ],
    );
    seq.start(&board, json!(["seed"])).await;
    seq.wait(None).await;
    assert!(seq.check_status(StateStatus::Success));
    assert_eq!(seq.flow_out(), json!(["seed", "a", "b", "c"]));
}

#[tokio::test]
async fn test_sequential_short_circuits_on_failure() {
    let board = Board::new();
    let counter = Arc::new(AtomicU32::new(0));
    let untouched = counting_leaf("untouched", &counter);
    let seq = State::sequential(
        "seq",
        vec![
            State::leaf("ok", AppendFlow { tag: "ok" }),
            State::leaf(
                "fails",
                OutcomeAfter {
                    delay: Duration::ZERO,
                    outcome: StateStatus::Failed,
                },
            ),
            untouched,
        ],
    );
    seq.start(&board, Value::Null).await;
    seq.wait(None).await;
    assert!(seq.check_status(StateStatus::Failed));
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_sequential_child_fault_bubbles_with_path() {
    let board = Board::new();
    let seq = State::sequential("mid", vec![State::leaf("leaf", Broken)]);
    seq.start(&board, Value::Null).await;
    seq.wait(None).await;
    assert!(seq.check_status(StateStatus::Exception));
    assert_eq!(seq.fault().unwrap().origin(), Some("mid.leaf"));
}

// ---- selector -----------------------------------------------------------

#[tokio::test]
async fn test_selector_stops_at_first_success() {
    let board = Board::new();
    let counter = Arc::new(AtomicU32::new(0));
    let skipped = counting_leaf("skipped", &counter);
    let sel = State::selector(
        "sel",
        vec![
            State::leaf(
                "no1",
                OutcomeAfter {
                    delay: Duration::ZERO,
                    outcome: StateStatus::Failed,
                },
            ),
            State::leaf("yes", SetFlowBehavior::new(json!("picked"))),
            skipped,
        ],
    );
    sel.start(&board, Value::Null).await;
    sel.wait(None).await;
    assert!(sel.check_status(StateStatus::Success));
    assert_eq!(sel.flow_out(), json!("picked"));
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_selector_forwards_flow_through_failures() {
    struct FailWithFlow;

    #[async_trait]
    impl Behavior for FailWithFlow {
        async fn execute(&self, ctx: &StateContext) -> anyhow::Result<StateStatus> {
            let mut items = match ctx.flow_in() {
                Value::Array(items) => items,
                _ => Vec::new(),
            };
            items.push(json!("tried"));
            ctx.set_flow_out(Value::Array(items));
            Ok(StateStatus::Failed)
        }
    }

    let board = Board::new();
    let sel = State::selector(
        "sel",
        vec![
            State::leaf("try1", FailWithFlow),
            State::leaf("try2", FailWithFlow),
            State::leaf("wins", AppendFlow { tag: "won" }),
        ],
    );
    sel.start(&board, json!([])).await;
    sel.wait(None).await;
    assert!(sel.check_status(StateStatus::Success));
    assert_eq!(sel.flow_out(), json!(["tried", "tried", "won"]));
}

#[tokio::test]
async fn test_selector_fails_when_all_children_fail() {
    let board = Board::new();
    let sel = State::selector(
        "sel",
        vec![
            State::leaf(
                "no1",
                OutcomeAfter {
                    delay: Duration::ZERO,
                    outcome: StateStatus::Failed,
                },
            ),
            State::leaf(
                "no2",
                OutcomeAfter {
                    delay: Duration::ZERO,
                    outcome: StateStatus::Failed,
                },
            ),
        ],
    );
    sel.start(&board, Value::Null).await;
    sel.wait(None).await;
    assert!(sel.check_status(StateStatus::Failed));
}

// ---- parallel / at_least_one -------------------------------------------

/// Drive a bare composite's completion detection the way a machine would.
async fn tick_until_done(state: &Arc<State>, board: &Board, step: Duration) {
    while state.is_alive() {
        tokio::time::sleep(step).await;
        state.tick(board).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_parallel_runs_children_concurrently() {
    let board = Board::new();
    let fast = State::leaf(
        "fast",
        RecordAfter {
            delay: Duration::from_secs(1),
        },
    );
    let slow = State::leaf(
        "slow",
        RecordAfter {
            delay: Duration::from_secs(2),
        },
    );
    let par = State::parallel("par", vec![Arc::clone(&fast), Arc::clone(&slow)]);
    let started = tokio::time::Instant::now();
    par.start(&board, Value::Null).await;

    // Partial progress is observable mid-flight: past the first child's
    // deadline, it is done while its sibling and the group keep running.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    par.tick(&board).await;
    assert!(fast.check_status(StateStatus::Success));
    assert!(slow.check_status(StateStatus::Running));
    assert!(par.check_status(StateStatus::Running));
    assert!(par.is_alive());

    tick_until_done(&par, &board, Duration::from_millis(100)).await;

    assert!(par.check_status(StateStatus::Success));
    let elapsed = started.elapsed();
    // Concurrent, not serial: bounded by the slowest child plus one tick.
    assert!(elapsed >= Duration::from_secs(2), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_millis(2500), "elapsed {elapsed:?}");
    assert_eq!(board.get("order"), Some(json!(["fast", "slow"])));
}

#[tokio::test(start_paused = true)]
async fn test_parallel_failure_interrupts_siblings() {
    let board = Board::new();
    let slow = State::leaf("slow", WaitBehavior::secs(60));
    let par = State::parallel(
        "par",
        vec![
            State::leaf(
                "fails",
                OutcomeAfter {
                    delay: Duration::from_secs(1),
                    outcome: StateStatus::Failed,
                },
            ),
            Arc::clone(&slow),
        ],
    );
    let started = tokio::time::Instant::now();
    par.start(&board, Value::Null).await;
    tick_until_done(&par, &board, Duration::from_millis(100)).await;

    assert!(par.check_status(StateStatus::Failed));
    assert!(slow.check_status(StateStatus::Interrupted));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_at_least_one_completes_on_first_success() {
    let board = Board::new();
    let slow = State::leaf("slow", WaitBehavior::secs(60));
    let any = State::at_least_one(
        "any",
        vec![
            State::leaf(
                "quick",
                RecordAfter {
                    delay: Duration::from_secs(1),
                },
            ),
            Arc::clone(&slow),
        ],
    );
    let started = tokio::time::Instant::now();
    any.start(&board, Value::Null).await;
    tick_until_done(&any, &board, Duration::from_millis(100)).await;

    assert!(any.check_status(StateStatus::Success));
    assert!(slow.check_status(StateStatus::Interrupted));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_parallel_child_fault_bubbles_with_path() {
    let board = Board::new();
    let par = State::parallel(
        "par",
        vec![
            State::leaf("leaf", Broken),
            State::leaf("slow", WaitBehavior::secs(60)),
        ],
    );
    par.start(&board, Value::Null).await;
    tick_until_done(&par, &board, Duration::from_millis(100)).await;

    assert!(par.check_status(StateStatus::Exception));
    assert_eq!(par.fault().unwrap().origin(), Some("par.leaf"));
}

#[tokio::test(start_paused = true)]
async fn test_parallel_fault_outranks_failure_in_mixed_batch() {
    let board = Board::new();
    let batch = State::parallel(
        "batch",
        vec![
            State::leaf(
                "gives_up",
                OutcomeAfter {
                    delay: Duration::ZERO,
                    outcome: StateStatus::Failed,
                },
            ),
            State::leaf("boom", Broken),
        ],
    );
    batch.start(&board, Value::Null).await;
    // Both children resolve before the first observation, so a single
    // tick sees the failure and the fault together.
    tokio::time::sleep(Duration::from_millis(100)).await;
    batch.tick(&board).await;
    batch.wait(None).await;

    assert!(batch.check_status(StateStatus::Exception));
    assert_eq!(batch.fault().unwrap().origin(), Some("batch.boom"));
}

// ---- random pick --------------------------------------------------------

#[tokio::test]
async fn test_random_pick_runs_exactly_one_child() {
    let board = Board::new();
    let counter = Arc::new(AtomicU32::new(0));
    let pick = State::random_pick(
        "pick",
        vec![
            counting_leaf("one", &counter),
            counting_leaf("two", &counter),
            counting_leaf("three", &counter),
        ],
    );
    pick.start(&board, Value::Null).await;
    pick.wait(None).await;
    assert!(pick.check_status(StateStatus::Success));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_random_pick_without_children_faults() {
    let board = Board::new();
    let pick = State::random_pick("empty", Vec::new());
    pick.start(&board, Value::Null).await;
    pick.wait(None).await;
    assert!(pick.check_status(StateStatus::Exception));
    assert!(pick.fault().is_some());
}

// ---- machine ------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_machine_runs_graph_to_end_state() {
    let board = Board::new();
    let work = State::leaf("work", SetFlowBehavior::new(json!("result")));
    let done = State::leaf("done", AppendFlow { tag: "finished" });
    work.add_transition_on_success(&done);

    let machine = Machine::new(
        "m",
        work,
        MachineConfig {
            rate: 10.0,
            end_states: vec!["done".to_string()],
            ..MachineConfig::default()
        },
    );
    let status = machine.run(&board).await.unwrap();
    assert_eq!(status, StateStatus::Success);
    assert_eq!(machine.current().flow_out(), json!(["result", "finished"]));
}

#[tokio::test(start_paused = true)]
async fn test_machine_surfaces_nested_fault_path() {
    let board = Board::new();
    let mid = State::sequential("mid", vec![State::leaf("leaf", Broken)]);
    let machine = Machine::new("m", mid, MachineConfig::default());

    let error = machine.run(&board).await.unwrap_err();
    match error {
        MachineError::Faulted {
            machine: name,
            origin,
            message,
        } => {
            assert_eq!(name, "m");
            assert_eq!(origin, "m.mid.leaf");
            assert_eq!(message, "sensor offline");
        }
    }
    assert_eq!(machine.fault().unwrap().origin(), Some("m.mid.leaf"));
}

#[tokio::test(start_paused = true)]
async fn test_machine_interrupt_leaves_no_live_states() {
    let board = Board::new();
    let slow = State::leaf("slow", WaitBehavior::secs(600));
    let machine = Machine::new("m", Arc::clone(&slow), MachineConfig::default());

    machine.start(&board, Value::Null).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(machine.interrupt(Some(Duration::from_secs(1))).await);

    assert!(!slow.is_alive());
    assert!(!machine.state().is_alive());
    assert_eq!(machine.status(), StateStatus::Interrupted);
}

#[tokio::test]
async fn test_manual_stepping_drives_transitions_deterministically() {
    let board = Board::new();
    let first = State::leaf("first", AppendFlow { tag: "first" });
    let second = State::leaf("second", AppendFlow { tag: "second" });
    first.add_transition_on_success(&second);

    let machine = Machine::new(
        "m",
        first,
        MachineConfig {
            end_states: vec!["second".to_string()],
            ..MachineConfig::default()
        },
    );
    machine.start_manual(&board, json!([])).await;
    assert_eq!(machine.current().name(), "first");

    machine.update_and_wait(&board).await;
    assert_eq!(machine.current().name(), "second");
    assert!(!machine.is_end(), "end requires the state to have finished");

    machine.current().wait(None).await;
    assert!(machine.is_end());
    assert_eq!(machine.current().flow_out(), json!(["first", "second"]));
}

#[tokio::test(start_paused = true)]
async fn test_machine_as_child_of_another_graph() {
    let board = Board::new();
    let inner_work = State::leaf("inner_work", AppendFlow { tag: "inner" });
    let inner = Machine::new(
        "inner",
        inner_work,
        MachineConfig {
            rate: 10.0,
            end_states: vec!["inner_work".to_string()],
            ..MachineConfig::default()
        },
    );
    let seq = State::sequential(
        "outer",
        vec![
            State::leaf("before", AppendFlow { tag: "before" }),
            inner.into_state(),
        ],
    );
    seq.start(&board, json!([])).await;
    seq.wait(None).await;
    assert!(seq.check_status(StateStatus::Success));
}

#[tokio::test(start_paused = true)]
async fn test_debug_observer_sees_snapshots() {
    struct Capture(std::sync::Mutex<Vec<StateSnapshot>>);

    impl SnapshotObserver for Capture {
        fn on_snapshot(&self, snapshot: &StateSnapshot) {
            self.0.lock().unwrap().push(snapshot.clone());
        }
    }

    let board = Board::new();
    let capture = Arc::new(Capture(std::sync::Mutex::new(Vec::new())));
    let work = State::leaf("work", TraceBehavior::new("tick"));
    let machine = Machine::new(
        "m",
        work,
        MachineConfig {
            end_states: vec!["work".to_string()],
            debug: true,
            observer: Some(Arc::clone(&capture) as Arc<dyn SnapshotObserver>),
            ..MachineConfig::default()
        },
    );
    machine.run(&board).await.unwrap();

    let seen = capture.0.lock().unwrap();
    assert!(!seen.is_empty());
    let first = &seen[0];
    assert_eq!(first.name, "m");
    assert_eq!(first.kind, "machine");
    assert_eq!(first.children.len(), 1);
    assert_eq!(first.children[0].name, "work");
}
