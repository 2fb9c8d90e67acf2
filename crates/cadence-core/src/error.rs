//! Fault capture and machine-level errors

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// A captured behavior fault.
///
/// Created when a behavior returns an error (or panics) inside its
/// activation task. As the fault bubbles up through nested composites,
/// each level prepends its own name, producing a dotted origin path such
/// as `root.mid.leaf` that identifies the leaf state that failed.
#[derive(Clone)]
pub struct Fault {
    error: Arc<anyhow::Error>,
    origin: Option<String>,
}

impl Fault {
    pub(crate) fn new(error: anyhow::Error) -> Self {
        Self {
            error: Arc::new(error),
            origin: None,
        }
    }

    pub(crate) fn reparented(&self, parent: &str, child_name: &str) -> Self {
        let origin = match &self.origin {
            Some(path) => format!("{parent}.{path}"),
            None => format!("{parent}.{child_name}"),
        };
        Self {
            error: Arc::clone(&self.error),
            origin: Some(origin),
        }
    }

    /// The original error object, shared across every level it bubbled
    /// through.
    pub fn error(&self) -> &anyhow::Error {
        &self.error
    }

    /// Dotted path of state names identifying where the fault occurred.
    /// `None` on the faulted leaf itself; set once a parent adopts it.
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fault")
            .field("origin", &self.origin)
            .field("error", &*self.error)
            .finish()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.origin {
            Some(origin) => write!(f, "fault at {origin}: {}", self.error),
            None => write!(f, "fault: {}", self.error),
        }
    }
}

/// Error surfaced by [`Machine::run`](crate::machine::Machine::run) when
/// the machine terminates with an exception.
///
/// The full [`Fault`] (error object included) stays inspectable on the
/// machine itself via `Machine::fault`.
#[derive(Debug, Clone, Error)]
pub enum MachineError {
    /// A state in the machine's transition graph faulted and no
    /// transition handled it.
    #[error("machine '{machine}' faulted at {origin}: {message}")]
    Faulted {
        /// Name of the machine that surfaced the fault.
        machine: String,
        /// Dotted path naming the faulted leaf state.
        origin: String,
        /// Rendered message of the captured error.
        message: String,
    },
}
