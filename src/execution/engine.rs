//! Operation Engine
//!
//! Drives operation instances one tick at a time:
//! - Acquires the target lock when an operation starts
//! - Invokes the current step and records what happened
//! - Saves a snapshot after every tick for crash recovery
//! - Releases the lock and ends the instance on every terminal state

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_json::Value;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::context::variables::{SPACE_ID, TARGET_ID, USER};
use crate::context::{ContextServices, ExecutionContext, LogProgressSink, ProgressSink};
use crate::errors::{EngineError, StepError};
use crate::history::{EventType, HistoryStore, InMemoryHistoryStore};
use crate::lock::{InMemoryLockStore, LockStore, OperationLockManager};
use crate::operation::{ErrorType, InMemoryOperationStore, Operation, OperationState, OperationStore};
use crate::platform::{OfflinePlatform, PlatformClient};
use crate::substrate::{InMemoryProcessStore, ProcessStore};

use super::definition::{DefinitionError, ProcessDefinition};
use super::phase::{RetryKind, RetryReason, StepPhase};
use super::supervisor::{Clock, SystemClock};

/// Parameters of a new operation.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    pub process_type: String,
    pub target_id: String,
    pub space_id: String,
    pub user: Option<String>,
    /// Initial context variables
    pub parameters: HashMap<String, Value>,
}

impl OperationRequest {
    pub fn new(process_type: impl Into<String>, target_id: impl Into<String>, space_id: impl Into<String>) -> Self {
        Self {
            process_type: process_type.into(),
            target_id: target_id.into(),
            space_id: space_id.into(),
            user: None,
            parameters: HashMap::new(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }
}

/// What one tick did to an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A step finished and the next one is due
    Advanced { step: String },
    Poll { step: String },
    Retry { step: String, reason: RetryReason },
    Finished,
    Aborted,
    Failed {
        step: String,
        error_type: ErrorType,
        message: String,
    },
}

impl TickOutcome {
    pub fn is_terminal(&self) -> bool {
        self.state().is_some()
    }

    /// Terminal operation state, if the tick ended the operation.
    pub fn state(&self) -> Option<OperationState> {
        match self {
            TickOutcome::Finished => Some(OperationState::Finished),
            TickOutcome::Aborted => Some(OperationState::Aborted),
            TickOutcome::Failed { .. } => Some(OperationState::Error),
            _ => None,
        }
    }
}

/// Operation execution engine.
///
/// Owns the registered process definitions and the stores every instance
/// shares. Stores default to in-memory implementations; swap them with the
/// `set_*` methods before wrapping the engine in an `Arc`.
///
/// # Example
///
/// ```rust,no_run
/// use mtarunner::config::EngineConfig;
/// use mtarunner::execution::{OperationEngine, OperationRequest, ProcessDefinition, Synchronous};
/// # use mtarunner::context::ExecutionContext;
/// # use mtarunner::errors::StepError;
/// # use mtarunner::execution::SyncStep;
/// # struct Validate;
/// # impl SyncStep for Validate {
/// #     fn name(&self) -> &str { "validate" }
/// #     fn execute_step(&self, _ctx: &mut ExecutionContext) -> Result<(), StepError> { Ok(()) }
/// # }
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut engine = OperationEngine::new(EngineConfig::default());
///     engine.register(ProcessDefinition::new("deploy").with_step(Synchronous(Validate))?)?;
///
///     let mut ctx = engine.start(OperationRequest::new("deploy", "app-1", "space-x"))?;
///     while !engine.tick(&mut ctx)?.is_terminal() {}
///     Ok(())
/// }
/// ```
pub struct OperationEngine {
    config: Arc<EngineConfig>,
    definitions: HashMap<String, ProcessDefinition>,
    locks: OperationLockManager,
    history: Arc<dyn HistoryStore>,
    operations: Arc<dyn OperationStore>,
    processes: Arc<dyn ProcessStore>,
    platform: Arc<dyn PlatformClient>,
    sink: Arc<dyn ProgressSink>,
    clock: Arc<dyn Clock>,
}

impl OperationEngine {
    pub fn new(config: EngineConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            config: Arc::new(config),
            definitions: HashMap::new(),
            locks: OperationLockManager::new(Arc::new(InMemoryLockStore::new()), Arc::clone(&clock)),
            history: Arc::new(InMemoryHistoryStore::new()),
            operations: Arc::new(InMemoryOperationStore::new()),
            processes: Arc::new(InMemoryProcessStore::new()),
            platform: Arc::new(OfflinePlatform),
            sink: Arc::new(LogProgressSink),
            clock,
        }
    }

    /// Registers a process type. Replaces an earlier definition of the same type.
    pub fn register(&mut self, definition: ProcessDefinition) -> Result<(), DefinitionError> {
        definition.validate()?;
        debug!(
            "Registered process type '{}' with {} steps",
            definition.process_type(),
            definition.len()
        );
        self.definitions
            .insert(definition.process_type().to_string(), definition);
        Ok(())
    }

    pub fn set_lock_store(&mut self, store: Arc<dyn LockStore>) {
        self.locks = OperationLockManager::new(store, Arc::clone(&self.clock));
    }

    pub fn set_history(&mut self, history: Arc<dyn HistoryStore>) {
        self.history = history;
    }

    pub fn set_operations(&mut self, operations: Arc<dyn OperationStore>) {
        self.operations = operations;
    }

    pub fn set_processes(&mut self, processes: Arc<dyn ProcessStore>) {
        self.processes = processes;
    }

    pub fn set_platform(&mut self, platform: Arc<dyn PlatformClient>) {
        self.platform = platform;
    }

    pub fn set_sink(&mut self, sink: Arc<dyn ProgressSink>) {
        self.sink = sink;
    }

    /// Sets the clock used for timestamps, locks and step timeouts.
    pub fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clock = clock;
        self.locks = OperationLockManager::new(self.locks_store(), Arc::clone(&self.clock));
    }

    fn locks_store(&self) -> Arc<dyn LockStore> {
        self.locks.store()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn locks(&self) -> &OperationLockManager {
        &self.locks
    }

    pub fn history(&self) -> Arc<dyn HistoryStore> {
        Arc::clone(&self.history)
    }

    pub fn operations(&self) -> Arc<dyn OperationStore> {
        Arc::clone(&self.operations)
    }

    pub fn processes(&self) -> Arc<dyn ProcessStore> {
        Arc::clone(&self.processes)
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    fn services(&self) -> ContextServices {
        ContextServices {
            platform: Arc::clone(&self.platform),
            sink: Arc::clone(&self.sink),
            config: Arc::clone(&self.config),
            clock: Arc::clone(&self.clock),
        }
    }

    fn definition(&self, process_type: &str) -> Result<&ProcessDefinition, EngineError> {
        self.definitions
            .get(process_type)
            .ok_or_else(|| EngineError::UnknownProcessType(process_type.to_string()))
    }

    /// Starts a new operation. Locking the target is its first step; a
    /// target held by another operation fails with a conflict.
    pub fn start(&self, request: OperationRequest) -> Result<ExecutionContext, EngineError> {
        self.definition(&request.process_type)?;

        let process_id = Uuid::new_v4().to_string();
        self.locks
            .acquire(&request.target_id, &request.space_id, &process_id)?;

        match self.initialize(&request, &process_id) {
            Ok(ctx) => {
                info!(
                    "Started {} operation {} on target \"{}\" in space \"{}\"",
                    request.process_type, process_id, request.target_id, request.space_id
                );
                Ok(ctx)
            }
            Err(e) => {
                if let Err(release_error) = self.locks.release(&process_id) {
                    error!(
                        "Failed to release lock of operation {} that could not start: {}",
                        process_id, release_error
                    );
                }
                Err(e)
            }
        }
    }

    fn initialize(&self, request: &OperationRequest, process_id: &str) -> Result<ExecutionContext, EngineError> {
        let mut ctx = ExecutionContext::new(process_id, request.process_type.as_str(), self.services());
        for (name, value) in &request.parameters {
            ctx.set_raw(name.as_str(), value.clone());
        }
        ctx.set(&SPACE_ID, request.space_id.clone())?;
        ctx.set(&TARGET_ID, request.target_id.clone())?;
        if let Some(user) = &request.user {
            ctx.set(&USER, user.clone())?;
        }

        let now = self.clock.now();
        self.operations.add(Operation {
            process_id: process_id.to_string(),
            process_type: request.process_type.clone(),
            target_id: request.target_id.clone(),
            space_id: request.space_id.clone(),
            user: request.user.clone(),
            started_at: now,
        })?;
        self.history.append(process_id, EventType::Started, now)?;
        self.processes.save(&ctx.snapshot(now))?;
        Ok(ctx)
    }

    /// Rebuilds an active instance from its last saved snapshot.
    pub fn resume(&self, process_id: &str) -> Result<ExecutionContext, EngineError> {
        let snapshot = self
            .processes
            .load(process_id)?
            .ok_or_else(|| EngineError::OperationNotFound(process_id.to_string()))?;
        self.definition(&snapshot.process_type)?;

        info!(
            "Resuming operation {} at step {} (completed: {:?})",
            process_id, snapshot.current_step, snapshot.completed_steps
        );
        Ok(ExecutionContext::from_snapshot(snapshot, self.services()))
    }

    /// Asks a running operation to abort at its next tick.
    ///
    /// The ABORTED event is recorded right away. If no host ever ticks the
    /// instance again, the aborted-operations sweep ends it once the grace
    /// window has passed.
    pub fn request_abort(&self, process_id: &str) -> Result<(), EngineError> {
        let repeated = self.processes.abort_requested(process_id)?;
        if !self.processes.request_abort(process_id)? {
            return Err(EngineError::OperationNotFound(process_id.to_string()));
        }
        if !repeated {
            self.history
                .append(process_id, EventType::Aborted, self.clock.now())?;
        }
        info!("Abort requested for operation {}", process_id);
        Ok(())
    }

    /// Ends an instance whose tick panicked, as an infrastructure failure of
    /// its current step.
    pub fn fail_panicked(&self, ctx: &mut ExecutionContext, message: &str) -> Result<TickOutcome, EngineError> {
        let step = self
            .definition(ctx.process_type())?
            .step(ctx.current_step())
            .map(|step| step.name().to_string())
            .unwrap_or_default();
        let error = StepError::Panicked {
            step: step.clone(),
            message: message.to_string(),
        };
        self.fail(ctx, &step, error)
    }

    /// Runs one tick of an instance.
    pub fn tick(&self, ctx: &mut ExecutionContext) -> Result<TickOutcome, EngineError> {
        let process_id = ctx.process_id().to_string();
        if self.processes.abort_requested(&process_id)? {
            return self.abort(ctx, false);
        }
        if ctx.cancellation().is_cancelled() {
            return self.abort(ctx, true);
        }

        let definition = self.definition(ctx.process_type())?;
        let Some(step) = definition.step(ctx.current_step()).cloned() else {
            return self.finish(ctx);
        };

        if ctx.is_step_completed(step.name()) {
            warn!(
                "Step '{}' of operation {} already completed; skipping it",
                step.name(),
                process_id
            );
            ctx.skip_step();
            self.save(ctx)?;
            return Ok(TickOutcome::Advanced {
                step: step.name().to_string(),
            });
        }

        debug!("Executing step '{}' of operation {}", step.name(), process_id);
        let outcome = match step.execute(ctx) {
            Ok(StepPhase::Done) => {
                info!("Step '{}' of operation {} completed", step.name(), process_id);
                ctx.complete_step(step.name());
                if ctx.current_step() >= definition.len() {
                    return self.finish(ctx);
                }
                TickOutcome::Advanced {
                    step: step.name().to_string(),
                }
            }
            Ok(StepPhase::Poll) => TickOutcome::Poll {
                step: step.name().to_string(),
            },
            Ok(StepPhase::Retry(reason)) => {
                let event_type = match reason.kind {
                    RetryKind::Timeout => EventType::TimedOut,
                    RetryKind::Transient => EventType::Retried,
                };
                self.history
                    .append(&process_id, event_type, self.clock.now())?;
                TickOutcome::Retry {
                    step: step.name().to_string(),
                    reason,
                }
            }
            Err(e) => return self.fail(ctx, step.name(), e),
        };

        self.save(ctx)?;
        Ok(outcome)
    }

    fn save(&self, ctx: &ExecutionContext) -> Result<(), EngineError> {
        self.processes.save(&ctx.snapshot(self.clock.now()))?;
        Ok(())
    }

    fn finish(&self, ctx: &mut ExecutionContext) -> Result<TickOutcome, EngineError> {
        self.end(ctx, EventType::Finished, OperationState::Finished)?;
        ctx.info("Operation finished");
        info!("Operation {} finished", ctx.process_id());
        Ok(TickOutcome::Finished)
    }

    /// `record` is false when `request_abort` already wrote the event.
    fn abort(&self, ctx: &mut ExecutionContext, record: bool) -> Result<TickOutcome, EngineError> {
        if record {
            self.end(ctx, EventType::Aborted, OperationState::Aborted)?;
        } else {
            self.close(ctx.process_id(), OperationState::Aborted)?;
        }
        ctx.warn("Operation aborted");
        info!("Operation {} aborted", ctx.process_id());
        Ok(TickOutcome::Aborted)
    }

    fn fail(&self, ctx: &mut ExecutionContext, step: &str, error: StepError) -> Result<TickOutcome, EngineError> {
        let error_type = error.error_type();
        let message = error.to_string();

        if error.is_integrity() {
            error!(
                "INTEGRITY VIOLATION in step '{}' of operation {}: {}",
                step,
                ctx.process_id(),
                message
            );
        } else {
            error!("Step '{}' of operation {} failed: {}", step, ctx.process_id(), message);
        }

        ctx.mark_failed(step);
        ctx.error(&message);
        self.end(ctx, error_type.event_type(), OperationState::Error)?;

        Ok(TickOutcome::Failed {
            step: step.to_string(),
            error_type,
            message,
        })
    }

    /// Records the terminal event, releases the lock and ends the instance.
    /// The event is recorded first, so an end interrupted by a crash is
    /// visible to the reconciliation sweep.
    fn end(&self, ctx: &ExecutionContext, event_type: EventType, state: OperationState) -> Result<(), EngineError> {
        let process_id = ctx.process_id();
        self.history.append(process_id, event_type, self.clock.now())?;
        self.close(process_id, state)
    }

    fn close(&self, process_id: &str, state: OperationState) -> Result<(), EngineError> {
        if let Err(e) = self.locks.release(process_id) {
            error!("Failed to release lock of operation {}: {}", process_id, e);
        }

        self.processes.delete(process_id, state)?;
        Ok(())
    }
}
