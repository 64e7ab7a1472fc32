//! Timeout Supervisor
//!
//! Tracks how long an asynchronous step has been running. The start time
//! lives in the execution context, so the deadline survives a host restart.
//! The supervisor only compares timestamps; it never calls the platform.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;

use crate::context::{ExecutionContext, Variable};
use crate::errors::StepError;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = match self.now.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut now = match self.now.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Where a supervised step stands relative to its timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Zero timeout, nothing is supervised
    Unbounded,
    Pending { remaining: Duration },
    Expired { elapsed: Duration },
}

/// Timeout bookkeeping for one step.
#[derive(Debug, Clone)]
pub struct TimeoutSupervisor {
    step: String,
    timeout: Duration,
}

impl TimeoutSupervisor {
    pub fn new(step: &str, timeout: Duration) -> Self {
        Self {
            step: step.to_string(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn start_time_var(&self) -> Variable<DateTime<Utc>> {
        Variable::scoped(&self.step, "start-time")
    }

    /// Records the start time unless one is already recorded.
    pub fn begin(&self, ctx: &mut ExecutionContext) -> Result<(), StepError> {
        if self.timeout.is_zero() {
            return Ok(());
        }

        let var = self.start_time_var();
        if ctx.contains(&var) {
            return Ok(());
        }

        let now = ctx.now();
        debug!(
            "Supervising step '{}' of operation {} with timeout {}s",
            self.step,
            ctx.process_id(),
            self.timeout.as_secs()
        );
        ctx.set(&var, now)
    }

    /// Compares the elapsed time against the timeout. On expiry a timeout
    /// error is reported to the user.
    pub fn check(&self, ctx: &ExecutionContext) -> Result<Deadline, StepError> {
        if self.timeout.is_zero() {
            return Ok(Deadline::Unbounded);
        }

        let Some(started) = ctx.get_optional(&self.start_time_var())? else {
            return Ok(Deadline::Pending {
                remaining: self.timeout,
            });
        };

        let elapsed = (ctx.now() - started).to_std().unwrap_or(Duration::ZERO);
        if elapsed > self.timeout {
            ctx.error(&format!(
                "Step \"{}\" timed out after {} seconds (timeout {} seconds)",
                self.step,
                elapsed.as_secs(),
                self.timeout.as_secs()
            ));
            return Ok(Deadline::Expired { elapsed });
        }

        Ok(Deadline::Pending {
            remaining: self.timeout - elapsed,
        })
    }

    /// Like [`check`](Self::check), but turns expiry into a retryable error.
    pub fn enforce(&self, ctx: &ExecutionContext) -> Result<(), StepError> {
        match self.check(ctx)? {
            Deadline::Expired { elapsed } => Err(StepError::Timeout {
                step: self.step.clone(),
                elapsed,
                timeout: self.timeout,
            }),
            _ => Ok(()),
        }
    }

    pub fn reset(&self, ctx: &mut ExecutionContext) {
        ctx.remove(&self.start_time_var());
    }
}
