//! Error Types
//!
//! Typed errors shared across the engine. Retryable conditions are not
//! errors at the step boundary: steps turn them into
//! [`StepPhase::Retry`](crate::execution::StepPhase::Retry) until the retry
//! bound is exhausted, after which they surface here as fatal values.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::execution::DefinitionError;
use crate::operation::ErrorType;
use crate::platform::PlatformError;

/// Used when the platform reports a failure without any description.
pub const DEFAULT_FAILURE_DESCRIPTION: &str = "No error description was provided by the platform";

/// A second operation tried to lock a target that is already locked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Target \"{target_id}\" in space \"{space_id}\" is locked by operation \"{holder}\"")]
pub struct ConflictError {
    pub target_id: String,
    pub space_id: String,
    /// Operation currently holding the lock
    pub holder: String,
}

/// Failures of the persistence layer behind a store trait.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by the operation lock manager.
#[derive(Debug, Error)]
pub enum LockError {
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("Found {count} operations holding the lock for target \"{target_id}\" in space \"{space_id}\"")]
    Integrity {
        target_id: String,
        space_id: String,
        count: usize,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors a step can propagate to the orchestrator.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    PlatformTransient(String),

    #[error("{context}: {}", .message.as_deref().unwrap_or(DEFAULT_FAILURE_DESCRIPTION))]
    PlatformFatal {
        context: String,
        message: Option<String>,
    },

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error("Step \"{step}\" timed out after {}s (timeout {}s)", .elapsed.as_secs(), .timeout.as_secs())]
    Timeout {
        step: String,
        elapsed: Duration,
        timeout: Duration,
    },

    #[error("Internal consistency error: {0}")]
    Integrity(String),

    #[error("Required variable \"{0}\" is not set")]
    MissingVariable(String),

    #[error("Variable \"{name}\" has an unexpected type: {source}")]
    VariableType {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{message}")]
    AsyncExecutionFailed { step: String, message: String },

    #[error("Step \"{step}\" failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        step: String,
        attempts: u32,
        #[source]
        source: Box<StepError>,
    },

    #[error("Step \"{step}\" panicked: {message}")]
    Panicked { step: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl StepError {
    /// Whether the failure may go away by re-running the step.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PlatformTransient(_) | Self::Timeout { .. })
    }

    /// Whether the failure means an internal invariant is broken.
    pub fn is_integrity(&self) -> bool {
        match self {
            Self::Integrity(_) => true,
            Self::RetriesExhausted { source, .. } => source.is_integrity(),
            _ => false,
        }
    }

    /// Classifies the failure for the operation record.
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Validation(_) | Self::VariableType { .. } => ErrorType::Content,
            Self::RetriesExhausted { source, .. } => source.error_type(),
            _ => ErrorType::Infrastructure,
        }
    }
}

impl From<LockError> for StepError {
    fn from(error: LockError) -> Self {
        match error {
            LockError::Conflict(conflict) => Self::Conflict(conflict),
            LockError::Store(store) => Self::Store(store),
            integrity @ LockError::Integrity { .. } => Self::Integrity(integrity.to_string()),
        }
    }
}

impl From<PlatformError> for StepError {
    fn from(error: PlatformError) -> Self {
        error.into_step_error("Platform request failed")
    }
}

/// Errors raised by the operation engine itself.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Lock(LockError),

    #[error(transparent)]
    Step(#[from] StepError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("Unknown process type \"{0}\"")]
    UnknownProcessType(String),

    #[error("Operation \"{0}\" was not found")]
    OperationNotFound(String),
}

impl From<LockError> for EngineError {
    fn from(error: LockError) -> Self {
        match error {
            LockError::Conflict(conflict) => Self::Conflict(conflict),
            LockError::Store(store) => Self::Store(store),
            other => Self::Lock(other),
        }
    }
}

/// Errors raised by a clean-up pass.
#[derive(Debug, Error)]
pub enum CleanupError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

/// Errors raised while loading configuration or operation scripts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_fatal_uses_platform_message() {
        let error = StepError::PlatformFatal {
            context: "Error creating service \"db\"".to_string(),
            message: Some("Something happened!".to_string()),
        };
        assert_eq!(error.to_string(), "Error creating service \"db\": Something happened!");
    }

    #[test]
    fn test_platform_fatal_falls_back_to_default_description() {
        let error = StepError::PlatformFatal {
            context: "Error creating service \"db\"".to_string(),
            message: None,
        };
        assert!(error.to_string().ends_with(DEFAULT_FAILURE_DESCRIPTION));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(StepError::PlatformTransient("503".to_string()).is_retryable());
        assert!(StepError::Timeout {
            step: "upload".to_string(),
            elapsed: Duration::from_secs(10),
            timeout: Duration::from_secs(5),
        }
        .is_retryable());
        assert!(!StepError::Validation("bad".to_string()).is_retryable());
        assert!(!StepError::Integrity("broken".to_string()).is_retryable());
    }

    #[test]
    fn test_error_type_follows_exhausted_source() {
        let exhausted = StepError::RetriesExhausted {
            step: "upload".to_string(),
            attempts: 4,
            source: Box::new(StepError::PlatformTransient("503".to_string())),
        };
        assert_eq!(exhausted.error_type(), ErrorType::Infrastructure);
        assert!(!exhausted.is_retryable());
        assert_eq!(
            StepError::Validation("bad descriptor".to_string()).error_type(),
            ErrorType::Content
        );
    }

    #[test]
    fn test_lock_integrity_maps_to_step_integrity() {
        let error: StepError = LockError::Integrity {
            target_id: "app".to_string(),
            space_id: "space".to_string(),
            count: 2,
        }
        .into();
        assert!(error.is_integrity());
    }

    #[test]
    fn test_conflict_message_names_holder() {
        let conflict = ConflictError {
            target_id: "app-1".to_string(),
            space_id: "space-x".to_string(),
            holder: "A".to_string(),
        };
        assert!(conflict.to_string().contains("\"A\""));
    }
}
