//! Execution Context
//!
//! Typed variable store scoped to one operation instance, plus the handles a
//! step needs while it runs: the platform client, the progress sink, the
//! engine configuration, the clock and the cancellation token.
//!
//! # Architecture
//!
//! - [`variables`]: Declared, typed variables shared between steps
//! - [`logger`]: User-visible progress sink
//! - [`snapshot`]: Durable instance snapshot

pub mod logger;
pub mod snapshot;
pub mod variables;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::config::EngineConfig;
use crate::errors::StepError;
use crate::execution::supervisor::{Clock, SystemClock};
use crate::platform::{OfflinePlatform, PlatformClient};

pub use logger::{CapturingSink, LogProgressSink, MessageKind, ProgressMessage, ProgressSink};
pub use snapshot::ProcessSnapshot;
pub use variables::Variable;

/// In-process cancellation flag shared between the scheduler and callers.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Collaborators handed to every context the engine creates.
#[derive(Clone)]
pub struct ContextServices {
    pub platform: Arc<dyn PlatformClient>,
    pub sink: Arc<dyn ProgressSink>,
    pub config: Arc<EngineConfig>,
    pub clock: Arc<dyn Clock>,
}

impl Default for ContextServices {
    fn default() -> Self {
        Self {
            platform: Arc::new(OfflinePlatform),
            sink: Arc::new(LogProgressSink),
            config: Arc::new(EngineConfig::default()),
            clock: Arc::new(SystemClock),
        }
    }
}

/// State of one operation instance as seen by its steps.
pub struct ExecutionContext {
    process_id: String,
    process_type: String,
    variables: HashMap<String, Value>,
    completed_steps: Vec<String>,
    current_step: usize,
    failed_step: Option<String>,
    services: ContextServices,
    cancellation: CancellationToken,
}

impl ExecutionContext {
    pub fn new(process_id: impl Into<String>, process_type: impl Into<String>, services: ContextServices) -> Self {
        Self {
            process_id: process_id.into(),
            process_type: process_type.into(),
            variables: HashMap::new(),
            completed_steps: Vec::new(),
            current_step: 0,
            failed_step: None,
            services,
            cancellation: CancellationToken::new(),
        }
    }

    /// Rebuilds a context from a stored snapshot.
    pub fn from_snapshot(snapshot: ProcessSnapshot, services: ContextServices) -> Self {
        Self {
            process_id: snapshot.process_id,
            process_type: snapshot.process_type,
            variables: snapshot.variables,
            completed_steps: snapshot.completed_steps,
            current_step: snapshot.current_step,
            failed_step: snapshot.failed_step,
            services,
            cancellation: CancellationToken::new(),
        }
    }

    pub fn snapshot(&self, timestamp: DateTime<Utc>) -> ProcessSnapshot {
        ProcessSnapshot {
            process_id: self.process_id.clone(),
            process_type: self.process_type.clone(),
            variables: self.variables.clone(),
            completed_steps: self.completed_steps.clone(),
            current_step: self.current_step,
            failed_step: self.failed_step.clone(),
            abort_requested: false,
            timestamp,
        }
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn process_type(&self) -> &str {
        &self.process_type
    }

    /// Reads a variable, falling back to its declared default.
    pub fn get<T: DeserializeOwned>(&self, var: &Variable<T>) -> Result<T, StepError> {
        match self.get_optional(var)? {
            Some(value) => Ok(value),
            None => var
                .default_value()
                .ok_or_else(|| StepError::MissingVariable(var.name().to_string())),
        }
    }

    /// Reads a variable that must have been set explicitly.
    pub fn get_required<T: DeserializeOwned>(&self, var: &Variable<T>) -> Result<T, StepError> {
        self.get_optional(var)?
            .ok_or_else(|| StepError::MissingVariable(var.name().to_string()))
    }

    pub fn get_optional<T: DeserializeOwned>(&self, var: &Variable<T>) -> Result<Option<T>, StepError> {
        match self.variables.get(var.name()) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|source| StepError::VariableType {
                    name: var.name().to_string(),
                    source,
                }),
        }
    }

    pub fn set<T: Serialize>(&mut self, var: &Variable<T>, value: T) -> Result<(), StepError> {
        let value = serde_json::to_value(value).map_err(|source| StepError::VariableType {
            name: var.name().to_string(),
            source,
        })?;
        self.variables.insert(var.name().to_string(), value);
        Ok(())
    }

    /// Stores an untyped value, used for operation parameters.
    pub fn set_raw(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    pub fn remove<T>(&mut self, var: &Variable<T>) {
        self.variables.remove(var.name());
    }

    pub fn contains<T>(&self, var: &Variable<T>) -> bool {
        self.variables.contains_key(var.name())
    }

    pub fn variable_names(&self) -> impl Iterator<Item = &str> {
        self.variables.keys().map(String::as_str)
    }

    pub fn platform(&self) -> &dyn PlatformClient {
        self.services.platform.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub fn clock(&self) -> &dyn Clock {
        self.services.clock.as_ref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.services.clock.now()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn completed_steps(&self) -> &[String] {
        &self.completed_steps
    }

    pub fn is_step_completed(&self, step: &str) -> bool {
        self.completed_steps.iter().any(|completed| completed == step)
    }

    pub fn failed_step(&self) -> Option<&str> {
        self.failed_step.as_deref()
    }

    /// Records a DONE step and moves to the next one.
    pub(crate) fn complete_step(&mut self, step: &str) {
        if !self.is_step_completed(step) {
            self.completed_steps.push(step.to_string());
        }
        self.failed_step = None;
        self.current_step += 1;
    }

    pub(crate) fn skip_step(&mut self) {
        self.current_step += 1;
    }

    pub(crate) fn mark_failed(&mut self, step: &str) {
        self.failed_step = Some(step.to_string());
    }

    pub fn debug(&self, text: &str) {
        self.report(MessageKind::Debug, text);
    }

    pub fn info(&self, text: &str) {
        self.report(MessageKind::Info, text);
    }

    pub fn warn(&self, text: &str) {
        self.report(MessageKind::Warning, text);
    }

    pub fn error(&self, text: &str) {
        self.report(MessageKind::Error, text);
    }

    fn report(&self, kind: MessageKind, text: &str) {
        self.services.sink.record(&self.process_id, kind, text);
    }
}
