//! Stock behaviors for common graph plumbing
//!
//! Small, reusable [`Behavior`] implementations: placeholders that hold a
//! slot in a graph, timed waits, and payload shuttling between the flow
//! channel and the board. All of them cooperate with interruption.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::state::{Behavior, StateContext};
use crate::status::StateStatus;

/// Stays `Running` forever; leaves the state purely transition-driven.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleBehavior;

#[async_trait]
impl Behavior for IdleBehavior {
    async fn execute(&self, _ctx: &StateContext) -> anyhow::Result<StateStatus> {
        Ok(StateStatus::Running)
    }
}

/// Succeeds after a fixed duration, or reports `Interrupted` if stopped
/// while still waiting.
#[derive(Debug, Clone, Copy)]
pub struct WaitBehavior {
    duration: Duration,
}

impl WaitBehavior {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn secs(seconds: u64) -> Self {
        Self::new(Duration::from_secs(seconds))
    }
}

#[async_trait]
impl Behavior for WaitBehavior {
    async fn execute(&self, ctx: &StateContext) -> anyhow::Result<StateStatus> {
        tokio::select! {
            () = tokio::time::sleep(self.duration) => Ok(StateStatus::Success),
            () = ctx.interrupted() => Ok(StateStatus::Interrupted),
        }
    }
}

/// Logs a fixed message at info level and succeeds. Handy while sketching
/// out a graph before the real behaviors exist.
#[derive(Debug, Clone)]
pub struct TraceBehavior {
    message: String,
}

impl TraceBehavior {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl Behavior for TraceBehavior {
    async fn execute(&self, ctx: &StateContext) -> anyhow::Result<StateStatus> {
        tracing::info!(state = %ctx.state_name(), "{}", self.message);
        Ok(StateStatus::Success)
    }
}

/// Emits a fixed value as `flow_out` and succeeds.
#[derive(Debug, Clone)]
pub struct SetFlowBehavior {
    value: Value,
}

impl SetFlowBehavior {
    pub fn new(value: Value) -> Self {
        Self { value }
    }
}

#[async_trait]
impl Behavior for SetFlowBehavior {
    async fn execute(&self, ctx: &StateContext) -> anyhow::Result<StateStatus> {
        ctx.set_flow_out(self.value.clone());
        Ok(StateStatus::Success)
    }
}

/// Stores the incoming flow payload on the board under a fixed key, and
/// forwards it unchanged.
#[derive(Debug, Clone)]
pub struct FlowToBoardBehavior {
    key: String,
}

impl FlowToBoardBehavior {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl Behavior for FlowToBoardBehavior {
    async fn execute(&self, ctx: &StateContext) -> anyhow::Result<StateStatus> {
        let value = ctx.flow_in();
        ctx.board().set(&self.key, value.clone());
        ctx.set_flow_out(value);
        Ok(StateStatus::Success)
    }
}

/// Reads a board entry into `flow_out`; fails if the key is absent.
#[derive(Debug, Clone)]
pub struct BoardToFlowBehavior {
    key: String,
}

impl BoardToFlowBehavior {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl Behavior for BoardToFlowBehavior {
    async fn execute(&self, ctx: &StateContext) -> anyhow::Result<StateStatus> {
        match ctx.board().get(&self.key) {
            Some(value) => {
                ctx.set_flow_out(value);
                Ok(StateStatus::Success)
            }
            None => Ok(StateStatus::Failed),
        }
    }
}
