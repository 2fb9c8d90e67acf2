//! Status snapshots for logging and visualization
//!
//! Every state can produce a recursive [`StateSnapshot`] of its subtree.
//! Machines emit one per tick cycle when debugging is enabled, both to the
//! `tracing` subscriber and to an optionally injected [`SnapshotObserver`].

use serde::Serialize;

use crate::status::StateStatus;

/// Point-in-time view of a state and its children.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    /// State name.
    pub name: String,
    /// Kind label ("leaf", "sequential", "machine", ...).
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Status at the time the snapshot was taken.
    pub status: StateStatus,
    /// Child snapshots; empty for leaves.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StateSnapshot>,
}

/// Sink for per-cycle machine snapshots.
///
/// Injected through `MachineConfig` instead of any process-global sink, so
/// embedders decide where structured debug output goes.
pub trait SnapshotObserver: Send + Sync {
    /// Called once per machine tick cycle with the freshly taken snapshot.
    fn on_snapshot(&self, snapshot: &StateSnapshot);
}

const RENDER_MARGIN: usize = 2;

/// Render a snapshot tree as indented `"<name>(<kind>) -- <STATUS>"` lines,
/// children prefixed with `-> ` and indented one margin per depth.
pub fn render_snapshot(snapshot: &StateSnapshot) -> Vec<String> {
    let mut lines = Vec::new();
    render_into(snapshot, 0, "", &mut lines);
    lines
}

fn render_into(snapshot: &StateSnapshot, indent: usize, prefix: &str, lines: &mut Vec<String>) {
    lines.push(format!(
        "{}{}{}({}) -- {}",
        " ".repeat(indent),
        prefix,
        snapshot.name,
        snapshot.kind,
        snapshot.status
    ));
    for child in &snapshot.children {
        render_into(child, indent + RENDER_MARGIN, "-> ", lines);
    }
}
