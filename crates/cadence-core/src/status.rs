//! State status enum

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a state.
///
/// A state is created `Unknown`, becomes `Running` when started, and ends
/// in one of the terminal variants when its activation task exits. The
/// status is readable at any time from any task; composites poll it while
/// ticking their children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateStatus {
    /// Never started.
    Unknown,
    /// Reset marker used by parents between activations of a child.
    NotRunning,
    /// An activation task is (logically) in progress.
    Running,
    /// Finished successfully.
    Success,
    /// Finished with an expected, user-level failure.
    Failed,
    /// Stopped in response to an interrupt request.
    Interrupted,
    /// The behavior returned an error or panicked; the fault is captured
    /// on the state.
    Exception,
    /// The behavior finished without reporting a meaningful outcome.
    NotSpecified,
}

impl StateStatus {
    /// True for statuses that mark a completed activation.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success
                | Self::Failed
                | Self::Interrupted
                | Self::Exception
                | Self::NotSpecified
        )
    }

    /// Uppercase label used in rendered snapshots.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::NotRunning => "NOT_RUNNING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Interrupted => "INTERRUPTED",
            Self::Exception => "EXCEPTION",
            Self::NotSpecified => "NOT_SPECIFIED",
        }
    }
}

impl fmt::Display for StateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
