use std::time::Duration;

use crate::context::variables::{APP_NAME, EXPECTED_INSTANCES, FAIL_ON_CRASHED, START_TIMEOUT};
use crate::context::ExecutionContext;
use crate::errors::StepError;
use crate::execution::phase::{AsyncExecutionState, StepPhase};
use crate::execution::step::{AsyncExecution, AsyncStep};
use crate::platform::InstanceState;

pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(3600);

/// Starts the application and waits for its instances to come up.
pub struct StartAppStep;

impl AsyncStep for StartAppStep {
    fn name(&self) -> &str {
        "start-app"
    }

    fn execute_async_step(&self, ctx: &mut ExecutionContext) -> Result<StepPhase, StepError> {
        let app_name = ctx.get_required(&APP_NAME)?;
        ctx.info(&format!("Starting application \"{}\"...", app_name));

        ctx.platform()
            .start_application(&app_name)
            .map_err(|e| e.into_step_error(format!("Error starting application \"{}\"", app_name)))?;
        Ok(StepPhase::Poll)
    }

    fn async_executions(&self, _ctx: &ExecutionContext) -> Vec<Box<dyn AsyncExecution>> {
        vec![Box::new(PollStartAppStatus)]
    }

    fn timeout(&self, ctx: &ExecutionContext) -> Duration {
        match ctx.get_optional(&START_TIMEOUT) {
            Ok(Some(secs)) => Duration::from_secs(secs),
            _ => DEFAULT_START_TIMEOUT,
        }
    }
}

pub struct PollStartAppStatus;

impl AsyncExecution for PollStartAppStatus {
    fn execute(&self, ctx: &mut ExecutionContext) -> Result<AsyncExecutionState, StepError> {
        let app_name = ctx.get_required(&APP_NAME)?;
        let expected = ctx.get(&EXPECTED_INSTANCES)?;
        let fail_on_crashed = ctx.get(&FAIL_ON_CRASHED)?;

        let states = ctx
            .platform()
            .instance_states(&app_name)
            .map_err(|e| e.into_step_error(format!("Error checking state of application \"{}\"", app_name)))?;

        let count = |wanted: InstanceState| states.iter().filter(|state| **state == wanted).count();
        let running = count(InstanceState::Running);
        let crashed = count(InstanceState::Crashed);

        if count(InstanceState::Flapping) > 0 {
            ctx.error(&format!("Application \"{}\" is flapping", app_name));
            return Ok(AsyncExecutionState::Error);
        }
        if crashed > 0 && fail_on_crashed {
            ctx.error(&format!(
                "{} instances of application \"{}\" crashed",
                crashed, app_name
            ));
            return Ok(AsyncExecutionState::Error);
        }

        ctx.info(&format!(
            "{} of {} instances of application \"{}\" running",
            running, expected, app_name
        ));
        if running >= expected as usize {
            Ok(AsyncExecutionState::Finished)
        } else {
            Ok(AsyncExecutionState::Running)
        }
    }

    fn polling_error_message(&self, ctx: &ExecutionContext) -> String {
        let app_name = ctx.get_required(&APP_NAME).unwrap_or_default();
        format!("Error starting application \"{}\"", app_name)
    }
}
