//! A small patrol robot graph: scan two sectors in parallel, report, and
//! retry over a fallback channel when the primary uplink fails.
//!
//! Run with `cargo run --example patrol`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use cadence_core::library::{TraceBehavior, WaitBehavior};
use cadence_core::prelude::*;

struct Scan {
    sector: &'static str,
    duration: Duration,
}

#[async_trait]
impl Behavior for Scan {
    async fn execute(&self, ctx: &StateContext) -> anyhow::Result<StateStatus> {
        tracing::info!(sector = self.sector, "scanning");
        tokio::select! {
            () = tokio::time::sleep(self.duration) => {}
            () = ctx.interrupted() => return Ok(StateStatus::Interrupted),
        }
        ctx.board().set(format!("scan.{}", self.sector), json!("clear"));
        Ok(StateStatus::Success)
    }
}

/// Primary uplink that is down in this demo.
struct FlakyUplink;

#[async_trait]
impl Behavior for FlakyUplink {
    async fn execute(&self, _ctx: &StateContext) -> anyhow::Result<StateStatus> {
        tracing::warn!("primary uplink unreachable");
        Ok(StateStatus::Failed)
    }
}

struct StdoutObserver;

impl SnapshotObserver for StdoutObserver {
    fn on_snapshot(&self, snapshot: &StateSnapshot) {
        for line in render_snapshot(snapshot) {
            println!("{line}");
        }
        println!();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let scan = State::parallel(
        "scan",
        vec![
            State::leaf(
                "north",
                Scan {
                    sector: "north",
                    duration: Duration::from_millis(400),
                },
            ),
            State::leaf(
                "south",
                Scan {
                    sector: "south",
                    duration: Duration::from_millis(700),
                },
            ),
        ],
    );
    let report = State::selector(
        "report",
        vec![
            State::leaf("uplink", FlakyUplink),
            State::sequential(
                "fallback",
                vec![
                    State::leaf("retry_delay", WaitBehavior::new(Duration::from_millis(200))),
                    State::leaf("radio", TraceBehavior::new("report sent over radio")),
                ],
            ),
        ],
    );
    let done = State::leaf("done", TraceBehavior::new("patrol complete"));

    scan.add_transition_on_success(&report);
    report.add_transition_on_complete(&done);

    let machine = Machine::new(
        "patrol",
        Arc::clone(&scan),
        MachineConfig {
            rate: 20.0,
            end_states: vec!["done".to_string()],
            debug: true,
            observer: Some(Arc::new(StdoutObserver)),
            ..MachineConfig::default()
        },
    );

    let board = Board::new();
    let status = machine.run_with(&board, Value::Null).await?;
    tracing::info!(status = %status, north = ?board.get("scan.north"), south = ?board.get("scan.south"), "machine finished");
    Ok(())
}
