//! Scripted Steps
//!
//! Steps whose behaviour is described in YAML instead of code. They drive
//! the engine through every phase (polling, retries, timeouts, fatal
//! failures) without a platform connection.
//!
//! # Example YAML Format
//!
//! ```yaml
//! target_id: mta-shop
//! space_id: dev
//! parameters:
//!   app-name: shop-web
//! steps:
//!   - name: validate
//!   - name: upload
//!     mode: async
//!     executions: 2
//!     polls: 3
//!     timeout_secs: 600
//!   - name: notify
//!     failure: transient
//!     failures: 1
//!     outputs:
//!       notified: true
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::{ExecutionContext, Variable};
use crate::errors::{ConfigError, StepError};
use crate::execution::definition::{DefinitionError, ProcessDefinition};
use crate::execution::engine::OperationRequest;
use crate::execution::phase::{AsyncExecutionState, StepPhase};
use crate::execution::step::{AsyncExecution, AsyncStep, Asynchronous, SyncStep, Synchronous};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepMode {
    #[default]
    Sync,
    Async,
}

/// Failure a scripted step raises when it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptedFailure {
    Transient,
    Fatal,
    Validation,
}

/// One scripted step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepScript {
    pub name: String,

    #[serde(default)]
    pub mode: StepMode,

    /// RUNNING polls each async execution reports before it finishes
    #[serde(default)]
    pub polls: u32,

    /// Number of async executions
    #[serde(default = "default_executions")]
    pub executions: usize,

    /// Report ERROR instead of FINISHED from the last async execution
    #[serde(default)]
    pub poll_error: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ScriptedFailure>,

    /// How many starts fail before the step succeeds; 0 fails every start
    #[serde(default)]
    pub failures: u32,

    #[serde(default)]
    pub timeout_secs: u64,

    /// Variables set once the step is done
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub outputs: HashMap<String, Value>,
}

fn default_executions() -> usize {
    1
}

fn default_process_type() -> String {
    "deploy".to_string()
}

impl StepScript {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: StepMode::Sync,
            polls: 0,
            executions: default_executions(),
            poll_error: false,
            failure: None,
            failures: 0,
            timeout_secs: 0,
            outputs: HashMap::new(),
        }
    }

    fn failures_var(&self) -> Variable<u32> {
        Variable::scoped(&self.name, "script-failures")
    }

    fn polls_var(&self) -> Variable<u32> {
        Variable::scoped(&self.name, "script-polls")
    }

    /// Raises the scripted failure while the failure budget lasts.
    fn maybe_fail(&self, ctx: &mut ExecutionContext) -> Result<(), StepError> {
        let Some(failure) = self.failure else {
            return Ok(());
        };

        let failed = ctx.get_optional(&self.failures_var())?.unwrap_or(0);
        if self.failures > 0 && failed >= self.failures {
            return Ok(());
        }
        ctx.set(&self.failures_var(), failed + 1)?;

        Err(match failure {
            ScriptedFailure::Transient => StepError::PlatformTransient(format!(
                "Scripted transient failure of step \"{}\"",
                self.name
            )),
            ScriptedFailure::Fatal => StepError::PlatformFatal {
                context: format!("Scripted failure of step \"{}\"", self.name),
                message: None,
            },
            ScriptedFailure::Validation => {
                StepError::Validation(format!("Step \"{}\" rejected its input", self.name))
            }
        })
    }

    fn publish_outputs(&self, ctx: &mut ExecutionContext) {
        for (name, value) in &self.outputs {
            ctx.set_raw(name.clone(), value.clone());
        }
    }
}

pub struct ScriptedSyncStep(StepScript);

impl ScriptedSyncStep {
    pub fn new(script: StepScript) -> Self {
        Self(script)
    }
}

impl SyncStep for ScriptedSyncStep {
    fn name(&self) -> &str {
        &self.0.name
    }

    fn execute_step(&self, ctx: &mut ExecutionContext) -> Result<(), StepError> {
        self.0.maybe_fail(ctx)?;
        ctx.info(&format!("Executing step \"{}\"", self.0.name));
        self.0.publish_outputs(ctx);
        Ok(())
    }
}

pub struct ScriptedAsyncStep(Arc<StepScript>);

impl ScriptedAsyncStep {
    pub fn new(script: StepScript) -> Self {
        Self(Arc::new(script))
    }
}

impl AsyncStep for ScriptedAsyncStep {
    fn name(&self) -> &str {
        &self.0.name
    }

    fn execute_async_step(&self, ctx: &mut ExecutionContext) -> Result<StepPhase, StepError> {
        self.0.maybe_fail(ctx)?;
        ctx.remove(&self.0.polls_var());
        ctx.info(&format!(
            "Started {} executions of step \"{}\"",
            self.0.executions, self.0.name
        ));
        if self.0.executions == 0 {
            self.0.publish_outputs(ctx);
            return Ok(StepPhase::Done);
        }
        Ok(StepPhase::Poll)
    }

    fn async_executions(&self, _ctx: &ExecutionContext) -> Vec<Box<dyn AsyncExecution>> {
        (0..self.0.executions)
            .map(|index| {
                Box::new(ScriptedExecution {
                    script: Arc::clone(&self.0),
                    index,
                }) as Box<dyn AsyncExecution>
            })
            .collect()
    }

    fn timeout(&self, _ctx: &ExecutionContext) -> Duration {
        Duration::from_secs(self.0.timeout_secs)
    }
}

struct ScriptedExecution {
    script: Arc<StepScript>,
    index: usize,
}

impl ScriptedExecution {
    fn is_last(&self) -> bool {
        self.index + 1 == self.script.executions
    }
}

impl AsyncExecution for ScriptedExecution {
    fn execute(&self, ctx: &mut ExecutionContext) -> Result<AsyncExecutionState, StepError> {
        let polls_var = self.script.polls_var();
        let seen = ctx.get_optional(&polls_var)?.unwrap_or(0);
        if seen < self.script.polls {
            ctx.set(&polls_var, seen + 1)?;
            debug!(
                "Execution {} of step '{}' still running ({}/{})",
                self.index,
                self.script.name,
                seen + 1,
                self.script.polls
            );
            return Ok(AsyncExecutionState::Running);
        }

        ctx.remove(&polls_var);
        if self.is_last() {
            if self.script.poll_error {
                return Ok(AsyncExecutionState::Error);
            }
            self.script.publish_outputs(ctx);
        }
        Ok(AsyncExecutionState::Finished)
    }

    fn polling_error_message(&self, _ctx: &ExecutionContext) -> String {
        format!(
            "Execution {} of step \"{}\" failed",
            self.index + 1,
            self.script.name
        )
    }
}

/// An operation described entirely by scripted steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationScript {
    #[serde(default = "default_process_type")]
    pub process_type: String,

    pub target_id: String,

    pub space_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Initial variables of the instance
    #[serde(default)]
    pub parameters: HashMap<String, Value>,

    pub steps: Vec<StepScript>,
}

impl OperationScript {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading operation script from: {}", path.display());

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let script: OperationScript = serde_yaml::from_str(content)?;
        info!(
            "Parsed operation '{}' with {} steps",
            script.process_type,
            script.steps.len()
        );
        Ok(script)
    }

    /// Builds the process definition, wrapping each step in the adapter
    /// matching its mode.
    pub fn definition(&self) -> Result<ProcessDefinition, DefinitionError> {
        let mut definition = ProcessDefinition::new(self.process_type.clone());
        for step in &self.steps {
            match step.mode {
                StepMode::Sync => {
                    definition.add_step(Arc::new(Synchronous(ScriptedSyncStep::new(step.clone()))))?
                }
                StepMode::Async => {
                    definition.add_step(Arc::new(Asynchronous(ScriptedAsyncStep::new(step.clone()))))?
                }
            }
        }
        definition.validate()?;
        Ok(definition)
    }

    pub fn request(&self) -> OperationRequest {
        let mut request = OperationRequest::new(
            self.process_type.clone(),
            self.target_id.clone(),
            self.space_id.clone(),
        );
        if let Some(user) = &self.user {
            request = request.with_user(user.clone());
        }
        for (name, value) in &self.parameters {
            request = request.with_parameter(name.clone(), value.clone());
        }
        request
    }
}
