//! Target Platform Interfaces
//!
//! The engine talks to the cloud application platform only through the
//! traits in this module. Concrete clients live outside the crate; tests and
//! the CLI rehearsal mode plug in fakes.

use std::fmt;

use chrono::{DateTime, Utc};
use log::info;
use thiserror::Error;

use crate::errors::StepError;
use crate::lock::OperationLock;
use crate::history::HistoricEvent;
use crate::operation::{Operation, Subscription};

/// Failure reported by a platform call, already classified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    /// Network failures, 5xx answers, throttling and request timeouts
    #[error("{message}")]
    Transient {
        status: Option<u16>,
        message: String,
    },

    /// Rejected requests that will fail the same way when repeated
    #[error("Platform rejected the request with status {status}")]
    Fatal {
        status: u16,
        description: Option<String>,
    },

    #[error("{0} was not found")]
    NotFound(String),
}

impl PlatformError {
    /// Classifies an HTTP-style status code.
    pub fn from_status(status: u16, description: Option<String>) -> Self {
        match status {
            404 => Self::NotFound(description.unwrap_or_else(|| "Resource".to_string())),
            408 | 429 | 500..=599 => Self::Transient {
                status: Some(status),
                message: description
                    .unwrap_or_else(|| format!("Platform answered with status {}", status)),
            },
            _ => Self::Fatal {
                status,
                description,
            },
        }
    }

    /// A failure below the HTTP layer (connection refused, reset, DNS).
    pub fn network(message: impl Into<String>) -> Self {
        Self::Transient {
            status: None,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Converts the failure into a step error, prefixing it with what the
    /// step was doing.
    pub fn into_step_error(self, context: impl Into<String>) -> StepError {
        let context = context.into();
        match self {
            Self::Transient { message, .. } => {
                StepError::PlatformTransient(format!("{}: {}", context, message))
            }
            Self::Fatal { description, .. } => StepError::PlatformFatal {
                context,
                message: description,
            },
            Self::NotFound(what) => StepError::PlatformFatal {
                context,
                message: Some(format!("{} was not found", what)),
            },
        }
    }
}

/// Progress of an application bits upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStatus {
    Queued,
    Running,
    Ready,
    Failed(Option<String>),
}

/// State of one application instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Starting,
    Running,
    Crashed,
    Flapping,
    Down,
}

/// Client for the target cloud application platform.
pub trait PlatformClient: Send + Sync {
    /// Starts uploading an archive and returns a token for polling.
    fn upload_application(&self, app_name: &str, archive_id: &str) -> Result<String, PlatformError>;

    fn upload_status(&self, token: &str) -> Result<UploadStatus, PlatformError>;

    fn start_application(&self, app_name: &str) -> Result<(), PlatformError>;

    fn instance_states(&self, app_name: &str) -> Result<Vec<InstanceState>, PlatformError>;
}

/// Platform audit stream.
pub trait AuditEventSource: Send + Sync {
    /// Ids of the spaces deleted at or after `since`.
    fn deleted_spaces(&self, since: DateTime<Utc>) -> Result<Vec<String>, PlatformError>;
}

/// Client used when no platform connection is configured. Every call fails
/// with a fatal error, so only steps that never touch the platform succeed.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflinePlatform;

impl OfflinePlatform {
    fn unavailable() -> PlatformError {
        PlatformError::Fatal {
            status: 503,
            description: Some("No platform connection is configured".to_string()),
        }
    }
}

impl PlatformClient for OfflinePlatform {
    fn upload_application(&self, _app_name: &str, _archive_id: &str) -> Result<String, PlatformError> {
        Err(Self::unavailable())
    }

    fn upload_status(&self, _token: &str) -> Result<UploadStatus, PlatformError> {
        Err(Self::unavailable())
    }

    fn start_application(&self, _app_name: &str) -> Result<(), PlatformError> {
        Err(Self::unavailable())
    }

    fn instance_states(&self, _app_name: &str) -> Result<Vec<InstanceState>, PlatformError> {
        Err(Self::unavailable())
    }
}

impl AuditEventSource for OfflinePlatform {
    fn deleted_spaces(&self, _since: DateTime<Utc>) -> Result<Vec<String>, PlatformError> {
        Ok(Vec::new())
    }
}

/// An entity about to be purged by the orphaned data cleaner.
#[derive(Debug, Clone, Copy)]
pub enum AuditedEntity<'a> {
    Lock(&'a OperationLock),
    Event(&'a HistoricEvent),
    Operation(&'a Operation),
    Subscription(&'a Subscription),
}

impl fmt::Display for AuditedEntity<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lock(lock) => write!(
                f,
                "operation lock on target \"{}\" in space \"{}\" held by {}",
                lock.target_id, lock.space_id, lock.operation_id
            ),
            Self::Event(event) => write!(
                f,
                "historic event {} ({}) of operation {}",
                event.id, event.event_type, event.process_id
            ),
            Self::Operation(operation) => write!(
                f,
                "operation {} ({}) in space \"{}\"",
                operation.process_id, operation.process_type, operation.space_id
            ),
            Self::Subscription(subscription) => write!(
                f,
                "subscription {} of \"{}\" to \"{}\" in space \"{}\"",
                subscription.id,
                subscription.app_name,
                subscription.resource_name,
                subscription.space_id
            ),
        }
    }
}

/// Append-only record of entities removed by the reconciliation sweep.
pub trait AuditLog: Send + Sync {
    fn log_deletion(&self, space_id: &str, entity: &AuditedEntity<'_>);
}

/// Writes audit records to the `audit` log target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditLog;

impl AuditLog for LogAuditLog {
    fn log_deletion(&self, space_id: &str, entity: &AuditedEntity<'_>) {
        info!(target: "audit", "Deleting {} (space {} was deleted)", entity, space_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(PlatformError::from_status(503, None).is_retryable());
        assert!(PlatformError::from_status(500, None).is_retryable());
        assert!(PlatformError::from_status(429, None).is_retryable());
        assert!(!PlatformError::from_status(400, None).is_retryable());
        assert!(!PlatformError::from_status(403, None).is_retryable());
        assert_eq!(
            PlatformError::from_status(404, Some("Application \"web\"".to_string())),
            PlatformError::NotFound("Application \"web\"".to_string())
        );
    }

    #[test]
    fn test_network_failure_is_transient() {
        let error = PlatformError::network("connection reset");
        assert!(error.is_retryable());
        assert!(error.into_step_error("Error uploading").is_retryable());
    }

    #[test]
    fn test_fatal_carries_description_into_step_error() {
        let error = PlatformError::from_status(422, Some("Quota exceeded".to_string()));
        let step_error = error.into_step_error("Error starting application \"web\"");
        assert!(!step_error.is_retryable());
        assert_eq!(
            step_error.to_string(),
            "Error starting application \"web\": Quota exceeded"
        );
    }

    #[test]
    fn test_offline_platform_fails_fatally() {
        let result = OfflinePlatform.start_application("web");
        assert!(matches!(result, Err(PlatformError::Fatal { status: 503, .. })));
        assert!(OfflinePlatform.deleted_spaces(Utc::now()).unwrap().is_empty());
    }
}
