//! Operation Records
//!
//! An operation record says who started what against which target. Its
//! state, error type and lock ownership are never stored; they are derived
//! at read time from the substrate, the historic events and the lock table.
//!
//! # Architecture
//!
//! - [`subscription`]: Configuration subscriptions scoped to a space

pub mod subscription;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{LockError, StoreError};
use crate::history::{EventQuery, EventType, HistoryStore};
use crate::lock::OperationLockManager;
use crate::substrate::ProcessStore;

pub use subscription::{InMemorySubscriptionStore, Subscription, SubscriptionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationState {
    Running,
    Finished,
    Error,
    Aborted,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OperationState::Running)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationState::Running => "RUNNING",
            OperationState::Finished => "FINISHED",
            OperationState::Error => "ERROR",
            OperationState::Aborted => "ABORTED",
        };
        write!(f, "{}", name)
    }
}

/// Whether a failed operation was let down by its input or its environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    Content,
    Infrastructure,
}

impl ErrorType {
    pub fn event_type(self) -> EventType {
        match self {
            ErrorType::Content => EventType::FailedByContentError,
            ErrorType::Infrastructure => EventType::FailedByInfrastructureError,
        }
    }

    pub fn from_event(event_type: EventType) -> Option<Self> {
        match event_type {
            EventType::FailedByContentError => Some(ErrorType::Content),
            EventType::FailedByInfrastructureError => Some(ErrorType::Infrastructure),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorType::Content => write!(f, "CONTENT"),
            ErrorType::Infrastructure => write!(f, "INFRASTRUCTURE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub process_id: String,
    pub process_type: String,
    pub target_id: String,
    pub space_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub started_at: DateTime<Utc>,
}

pub trait OperationStore: Send + Sync {
    fn add(&self, operation: Operation) -> Result<(), StoreError>;

    fn find(&self, process_id: &str) -> Result<Option<Operation>, StoreError>;

    fn list_in_space(&self, space_id: &str) -> Result<Vec<Operation>, StoreError>;

    fn delete_in_space(&self, space_id: &str) -> Result<usize, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryOperationStore {
    operations: Mutex<Vec<Operation>>,
}

impl InMemoryOperationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn operations(&self) -> Result<MutexGuard<'_, Vec<Operation>>, StoreError> {
        self.operations
            .lock()
            .map_err(|_| StoreError::Unavailable("operation store mutex poisoned".to_string()))
    }
}

impl OperationStore for InMemoryOperationStore {
    fn add(&self, operation: Operation) -> Result<(), StoreError> {
        let mut operations = self.operations()?;
        operations.retain(|existing| existing.process_id != operation.process_id);
        operations.push(operation);
        Ok(())
    }

    fn find(&self, process_id: &str) -> Result<Option<Operation>, StoreError> {
        Ok(self
            .operations()?
            .iter()
            .find(|operation| operation.process_id == process_id)
            .cloned())
    }

    fn list_in_space(&self, space_id: &str) -> Result<Vec<Operation>, StoreError> {
        Ok(self
            .operations()?
            .iter()
            .filter(|operation| operation.space_id == space_id)
            .cloned()
            .collect())
    }

    fn delete_in_space(&self, space_id: &str) -> Result<usize, StoreError> {
        let mut operations = self.operations()?;
        let before = operations.len();
        operations.retain(|operation| operation.space_id != space_id);
        Ok(before - operations.len())
    }
}

/// An operation record with its derived attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationView {
    pub operation: Operation,
    pub state: OperationState,
    pub error_type: Option<ErrorType>,
    pub has_lock: bool,
}

/// Derives state, error type and lock ownership for operation records.
#[derive(Clone)]
pub struct OperationsHelper {
    operations: Arc<dyn OperationStore>,
    history: Arc<dyn HistoryStore>,
    processes: Arc<dyn ProcessStore>,
    locks: OperationLockManager,
}

impl OperationsHelper {
    pub fn new(
        operations: Arc<dyn OperationStore>,
        history: Arc<dyn HistoryStore>,
        processes: Arc<dyn ProcessStore>,
        locks: OperationLockManager,
    ) -> Self {
        Self {
            operations,
            history,
            processes,
            locks,
        }
    }

    /// RUNNING while the instance is active, otherwise what its latest
    /// terminal event says. An inactive instance without a terminal event
    /// vanished without finishing and counts as ABORTED.
    pub fn compute_state(&self, process_id: &str) -> Result<OperationState, StoreError> {
        if self.processes.is_active(process_id)? {
            return Ok(OperationState::Running);
        }

        let latest = self
            .history
            .query(&EventQuery::new().process_id(process_id))?
            .into_iter()
            .rev()
            .find(|event| event.event_type.is_terminal());

        Ok(match latest.map(|event| event.event_type) {
            Some(EventType::Finished) => OperationState::Finished,
            Some(kind) if kind.is_failure() => OperationState::Error,
            _ => OperationState::Aborted,
        })
    }

    /// For an ERROR operation, the type of its latest failure.
    pub fn error_type(&self, process_id: &str, state: OperationState) -> Result<Option<ErrorType>, StoreError> {
        if state != OperationState::Error {
            return Ok(None);
        }

        Ok(self
            .history
            .query(&EventQuery::new().process_id(process_id))?
            .into_iter()
            .rev()
            .find_map(|event| ErrorType::from_event(event.event_type)))
    }

    pub fn view(&self, process_id: &str) -> Result<Option<OperationView>, LockError> {
        match self.operations.find(process_id)? {
            Some(operation) => Ok(Some(self.describe(operation)?)),
            None => Ok(None),
        }
    }

    /// Operations of a space, optionally only those in one of `states`.
    pub fn list(&self, space_id: &str, states: &[OperationState]) -> Result<Vec<OperationView>, LockError> {
        let mut views = Vec::new();
        for operation in self.operations.list_in_space(space_id)? {
            let view = self.describe(operation)?;
            if states.is_empty() || states.contains(&view.state) {
                views.push(view);
            }
        }
        Ok(views)
    }

    fn describe(&self, operation: Operation) -> Result<OperationView, LockError> {
        let state = self.compute_state(&operation.process_id)?;
        let error_type = self.error_type(&operation.process_id, state)?;
        let has_lock = self.locks.holds_lock(&operation.process_id)?;
        Ok(OperationView {
            operation,
            state,
            error_type,
            has_lock,
        })
    }
}
