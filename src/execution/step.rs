//! Step Execution Contract
//!
//! The engine sees every step through the [`Step`] trait. Concrete steps
//! implement either [`SyncStep`] or [`AsyncStep`] and are wrapped in the
//! [`Synchronous`] or [`Asynchronous`] adapter, which owns the phase
//! bookkeeping:
//!
//! - retry classification with a bounded attempt counter
//! - the polling flag and the index of the first unfinished async execution
//! - the timeout supervisor of asynchronous steps
//!
//! All bookkeeping lives in step-scoped context variables, so a step resumed
//! on another host continues exactly where the last tick left it.

use std::time::Duration;

use log::{debug, warn};

use crate::context::{ExecutionContext, Variable};
use crate::errors::StepError;

use super::phase::{AsyncExecutionState, RetryKind, RetryReason, StepPhase};
use super::supervisor::TimeoutSupervisor;

/// A named unit of work, as seen by the engine.
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    /// Runs one invocation of the step.
    fn execute(&self, ctx: &mut ExecutionContext) -> Result<StepPhase, StepError>;

    /// Zero means the step is not supervised.
    fn timeout(&self, _ctx: &ExecutionContext) -> Duration {
        Duration::ZERO
    }
}

/// A step that completes within a single invocation.
pub trait SyncStep: Send + Sync {
    fn name(&self) -> &str;

    fn execute_step(&self, ctx: &mut ExecutionContext) -> Result<(), StepError>;
}

/// A step that starts remote work and then polls it.
pub trait AsyncStep: Send + Sync {
    fn name(&self) -> &str;

    /// Starts the remote work. Returns [`StepPhase::Poll`] when there is
    /// something to poll, [`StepPhase::Done`] otherwise. A returned
    /// [`StepPhase::Retry`] counts as a transient failure and uses up one
    /// attempt.
    fn execute_async_step(&self, ctx: &mut ExecutionContext) -> Result<StepPhase, StepError>;

    /// Executions polled in order once the remote work has started.
    fn async_executions(&self, ctx: &ExecutionContext) -> Vec<Box<dyn AsyncExecution>>;

    fn timeout(&self, _ctx: &ExecutionContext) -> Duration {
        Duration::ZERO
    }
}

/// One pollable unit of remote work.
pub trait AsyncExecution: Send + Sync {
    fn execute(&self, ctx: &mut ExecutionContext) -> Result<AsyncExecutionState, StepError>;

    /// Message used when this execution reports [`AsyncExecutionState::Error`].
    fn polling_error_message(&self, ctx: &ExecutionContext) -> String;
}

fn attempts_var(step: &str) -> Variable<u32> {
    Variable::scoped(step, "attempts")
}

fn phase_var(step: &str) -> Variable<StoredPhase> {
    Variable::scoped(step, "phase")
}

fn async_index_var(step: &str) -> Variable<usize> {
    Variable::scoped(step, "async-index")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
enum StoredPhase {
    Polling,
}

/// Clears the per-run working variables so the step starts over.
fn reset_working_state(ctx: &mut ExecutionContext, step: &str) {
    ctx.remove(&phase_var(step));
    ctx.remove(&async_index_var(step));
    TimeoutSupervisor::new(step, Duration::ZERO).reset(ctx);
}

fn finish(ctx: &mut ExecutionContext, step: &str) -> StepPhase {
    reset_working_state(ctx, step);
    ctx.remove(&attempts_var(step));
    StepPhase::Done
}

/// Turns a step failure into a retry while the bound allows it.
///
/// Retryable failures consume one attempt and yield [`StepPhase::Retry`];
/// once `max_retries` attempts are used the failure becomes
/// [`StepError::RetriesExhausted`]. Everything else is returned as is.
pub fn handle_failure(ctx: &mut ExecutionContext, step: &str, error: StepError) -> Result<StepPhase, StepError> {
    reset_working_state(ctx, step);

    if !error.is_retryable() {
        ctx.remove(&attempts_var(step));
        return Err(error);
    }

    let retries = ctx.get_optional(&attempts_var(step))?.unwrap_or(0);
    if retries >= ctx.config().max_retries {
        ctx.remove(&attempts_var(step));
        return Err(StepError::RetriesExhausted {
            step: step.to_string(),
            attempts: retries + 1,
            source: Box::new(error),
        });
    }

    let attempt = retries + 1;
    ctx.set(&attempts_var(step), attempt)?;

    let kind = match error {
        StepError::Timeout { .. } => RetryKind::Timeout,
        _ => RetryKind::Transient,
    };
    let message = error.to_string();

    warn!(
        "Step '{}' of operation {} will be retried ({}/{}): {}",
        step,
        ctx.process_id(),
        attempt,
        ctx.config().max_retries,
        message
    );
    ctx.warn(&format!("Retrying step \"{}\": {}", step, message));

    Ok(StepPhase::Retry(RetryReason {
        kind,
        message,
        attempt,
    }))
}

/// Adapter exposing a [`SyncStep`] as a [`Step`].
pub struct Synchronous<S>(pub S);

impl<S: SyncStep> Step for Synchronous<S> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn execute(&self, ctx: &mut ExecutionContext) -> Result<StepPhase, StepError> {
        let name = self.0.name();
        match self.0.execute_step(ctx) {
            Ok(()) => Ok(finish(ctx, name)),
            Err(error) => handle_failure(ctx, name, error),
        }
    }
}

/// Adapter exposing an [`AsyncStep`] as a [`Step`].
pub struct Asynchronous<S>(pub S);

impl<S: AsyncStep> Asynchronous<S> {
    fn supervisor(&self, ctx: &ExecutionContext) -> TimeoutSupervisor {
        TimeoutSupervisor::new(self.0.name(), self.timeout(ctx))
    }

    fn is_polling(&self, ctx: &ExecutionContext) -> Result<bool, StepError> {
        Ok(ctx.get_optional(&phase_var(self.0.name()))?.is_some())
    }

    fn start(&self, ctx: &mut ExecutionContext) -> Result<StepPhase, StepError> {
        let name = self.0.name();
        self.supervisor(ctx).begin(ctx)?;

        match self.0.execute_async_step(ctx)? {
            StepPhase::Poll => {
                ctx.set(&phase_var(name), StoredPhase::Polling)?;
                ctx.set(&async_index_var(name), 0)?;
                Ok(StepPhase::Poll)
            }
            StepPhase::Retry(reason) => Err(StepError::PlatformTransient(reason.message)),
            StepPhase::Done => Ok(StepPhase::Done),
        }
    }

    /// Polls the executions in order, starting at the first unfinished one.
    ///
    /// A timed out step fails with [`StepError::Timeout`] before anything is
    /// polled. An execution reporting ERROR stops the poll and fails the
    /// step.
    pub fn poll_async_executions(&self, ctx: &mut ExecutionContext) -> Result<StepPhase, StepError> {
        let name = self.0.name();
        self.supervisor(ctx).enforce(ctx)?;

        let executions = self.0.async_executions(ctx);
        let mut index = ctx.get_optional(&async_index_var(name))?.unwrap_or(0);
        let mut observed = Vec::with_capacity(executions.len());

        while let Some(execution) = executions.get(index) {
            let state = execution.execute(ctx)?;
            observed.push(state);

            if state != AsyncExecutionState::Finished {
                break;
            }
            index += 1;
            ctx.set(&async_index_var(name), index)?;
        }

        match AsyncExecutionState::aggregate(observed) {
            AsyncExecutionState::Finished => {
                debug!("All {} executions of step '{}' finished", executions.len(), name);
                Ok(StepPhase::Done)
            }
            AsyncExecutionState::Running => Ok(StepPhase::Poll),
            AsyncExecutionState::Error => {
                let message = executions
                    .get(index)
                    .map(|execution| execution.polling_error_message(ctx))
                    .unwrap_or_else(|| format!("Error executing step \"{}\"", name));
                ctx.error(&message);
                Err(StepError::AsyncExecutionFailed {
                    step: name.to_string(),
                    message,
                })
            }
        }
    }
}

impl<S: AsyncStep> Step for Asynchronous<S> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn execute(&self, ctx: &mut ExecutionContext) -> Result<StepPhase, StepError> {
        let name = self.0.name();
        let result = match self.is_polling(ctx) {
            Ok(true) => self.poll_async_executions(ctx),
            Ok(false) => self.start(ctx),
            Err(error) => Err(error),
        };

        match result {
            Ok(StepPhase::Done) => Ok(finish(ctx, name)),
            Ok(phase) => Ok(phase),
            Err(error) => handle_failure(ctx, name, error),
        }
    }

    /// A configured per-step timeout wins over the step's own.
    fn timeout(&self, ctx: &ExecutionContext) -> Duration {
        ctx.config()
            .step_timeout_override(self.0.name())
            .unwrap_or_else(|| self.0.timeout(ctx))
    }
}
