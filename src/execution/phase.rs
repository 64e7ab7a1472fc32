//! Step Phases
//!
//! What a step reports back to the engine after one invocation, and what an
//! async execution reports after one poll.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryKind {
    /// Transient platform failure
    Transient,
    /// The step exceeded its timeout
    Timeout,
}

/// Why a step asked to be re-run from its start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryReason {
    pub kind: RetryKind,
    pub message: String,
    /// Retry number, starting at 1
    pub attempt: u32,
}

/// Result of one step invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepPhase {
    /// The step finished; it will not be invoked again
    Done,
    /// Remote work is in flight; invoke again later to poll it
    Poll,
    /// Re-run the step from its start later
    Retry(RetryReason),
}

impl StepPhase {
    pub fn is_done(&self) -> bool {
        matches!(self, StepPhase::Done)
    }

    pub fn label(&self) -> &'static str {
        match self {
            StepPhase::Done => "DONE",
            StepPhase::Poll => "POLL",
            StepPhase::Retry(_) => "RETRY",
        }
    }
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepPhase::Retry(reason) => write!(f, "RETRY ({})", reason.message),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// State reported by one poll of an async execution.
///
/// Variants are ordered by severity, so the aggregate of several states is
/// their maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AsyncExecutionState {
    Finished,
    Running,
    Error,
}

impl AsyncExecutionState {
    /// ERROR dominates RUNNING, which dominates FINISHED.
    pub fn aggregate<I>(states: I) -> Self
    where
        I: IntoIterator<Item = AsyncExecutionState>,
    {
        states
            .into_iter()
            .max()
            .unwrap_or(AsyncExecutionState::Finished)
    }
}
