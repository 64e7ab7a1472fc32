use std::time::Duration;

use log::debug;

use crate::context::variables::{APP_ARCHIVE_ID, APP_ARCHIVE_SIZE, APP_NAME, UPLOAD_TIMEOUT, UPLOAD_TOKEN};
use crate::context::ExecutionContext;
use crate::errors::StepError;
use crate::execution::phase::{AsyncExecutionState, StepPhase};
use crate::execution::step::{AsyncExecution, AsyncStep};
use crate::platform::UploadStatus;

/// Lower bound of the upload timeout.
pub const MIN_UPLOAD_TIMEOUT: Duration = Duration::from_secs(3600);

/// Assumed worst-case upload throughput, in bytes per second.
const UPLOAD_RATE: u64 = 256 * 1024;

fn upload_error_context(app_name: &str) -> String {
    format!("Error uploading application \"{}\"", app_name)
}

/// Uploads the application archive and polls until the platform has
/// processed it.
pub struct UploadAppStep;

impl AsyncStep for UploadAppStep {
    fn name(&self) -> &str {
        "upload-app"
    }

    fn execute_async_step(&self, ctx: &mut ExecutionContext) -> Result<StepPhase, StepError> {
        let app_name = ctx.get_required(&APP_NAME)?;
        let archive_id = ctx.get_required(&APP_ARCHIVE_ID)?;
        ctx.info(&format!("Uploading application \"{}\"...", app_name));

        let token = ctx
            .platform()
            .upload_application(&app_name, &archive_id)
            .map_err(|e| e.into_step_error(upload_error_context(&app_name)))?;
        debug!("Upload of '{}' started with token {}", app_name, token);

        ctx.set(&UPLOAD_TOKEN, token)?;
        Ok(StepPhase::Poll)
    }

    fn async_executions(&self, _ctx: &ExecutionContext) -> Vec<Box<dyn AsyncExecution>> {
        vec![Box::new(PollUploadStatus)]
    }

    /// An explicit timeout wins; otherwise the archive size decides, never
    /// going below [`MIN_UPLOAD_TIMEOUT`].
    fn timeout(&self, ctx: &ExecutionContext) -> Duration {
        if let Ok(Some(secs)) = ctx.get_optional(&UPLOAD_TIMEOUT) {
            return Duration::from_secs(secs);
        }
        match ctx.get_optional(&APP_ARCHIVE_SIZE) {
            Ok(Some(size)) => Duration::from_secs(size / UPLOAD_RATE).max(MIN_UPLOAD_TIMEOUT),
            _ => MIN_UPLOAD_TIMEOUT,
        }
    }
}

pub struct PollUploadStatus;

impl AsyncExecution for PollUploadStatus {
    fn execute(&self, ctx: &mut ExecutionContext) -> Result<AsyncExecutionState, StepError> {
        let app_name = ctx.get_required(&APP_NAME)?;
        let token = ctx.get_required(&UPLOAD_TOKEN)?;

        let status = ctx
            .platform()
            .upload_status(&token)
            .map_err(|e| e.into_step_error(upload_error_context(&app_name)))?;

        match status {
            UploadStatus::Ready => {
                ctx.info(&format!("Application \"{}\" uploaded", app_name));
                ctx.remove(&UPLOAD_TOKEN);
                Ok(AsyncExecutionState::Finished)
            }
            UploadStatus::Queued | UploadStatus::Running => Ok(AsyncExecutionState::Running),
            UploadStatus::Failed(description) => Err(StepError::PlatformFatal {
                context: upload_error_context(&app_name),
                message: description,
            }),
        }
    }

    fn polling_error_message(&self, ctx: &ExecutionContext) -> String {
        let app_name = ctx.get_required(&APP_NAME).unwrap_or_default();
        upload_error_context(&app_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use chrono::Utc;

    use crate::context::ContextServices;
    use crate::execution::phase::RetryKind;
    use crate::execution::step::{Asynchronous, Step};
    use crate::execution::supervisor::ManualClock;
    use crate::platform::{InstanceState, PlatformClient, PlatformError};

    /// Answers upload status polls from a queue; the last answer repeats.
    struct FakeUploads {
        upload: Result<String, PlatformError>,
        statuses: Mutex<Vec<UploadStatus>>,
    }

    impl FakeUploads {
        fn new(statuses: Vec<UploadStatus>) -> Self {
            Self {
                upload: Ok("token-1".to_string()),
                statuses: Mutex::new(statuses),
            }
        }
    }

    impl PlatformClient for FakeUploads {
        fn upload_application(&self, _app_name: &str, _archive_id: &str) -> Result<String, PlatformError> {
            self.upload.clone()
        }

        fn upload_status(&self, token: &str) -> Result<UploadStatus, PlatformError> {
            assert_eq!(token, "token-1");
            let mut statuses = self.statuses.lock().unwrap();
            if statuses.len() > 1 {
                Ok(statuses.remove(0))
            } else {
                Ok(statuses[0].clone())
            }
        }

        fn start_application(&self, _app_name: &str) -> Result<(), PlatformError> {
            unreachable!()
        }

        fn instance_states(&self, _app_name: &str) -> Result<Vec<InstanceState>, PlatformError> {
            unreachable!()
        }
    }

    fn context(platform: FakeUploads, clock: Arc<ManualClock>) -> ExecutionContext {
        let services = ContextServices {
            platform: Arc::new(platform),
            clock,
            ..ContextServices::default()
        };
        let mut ctx = ExecutionContext::new("p1", "deploy", services);
        ctx.set(&APP_NAME, "shop-web".to_string()).unwrap();
        ctx.set(&APP_ARCHIVE_ID, "archive-7".to_string()).unwrap();
        ctx
    }

    #[test]
    fn test_upload_polls_until_ready() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let step = Asynchronous(UploadAppStep);
        let mut ctx = context(
            FakeUploads::new(vec![UploadStatus::Queued, UploadStatus::Running, UploadStatus::Ready]),
            clock,
        );

        assert_eq!(step.execute(&mut ctx).unwrap(), StepPhase::Poll);
        assert!(ctx.contains(&UPLOAD_TOKEN));
        assert_eq!(step.execute(&mut ctx).unwrap(), StepPhase::Poll);
        assert_eq!(step.execute(&mut ctx).unwrap(), StepPhase::Poll);
        assert_eq!(step.execute(&mut ctx).unwrap(), StepPhase::Done);
        assert!(!ctx.contains(&UPLOAD_TOKEN));
    }

    #[test]
    fn test_failed_upload_carries_platform_message() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let step = Asynchronous(UploadAppStep);
        let mut ctx = context(
            FakeUploads::new(vec![UploadStatus::Failed(Some("archive is corrupt".to_string()))]),
            clock,
        );

        step.execute(&mut ctx).unwrap();
        let error = step.execute(&mut ctx).unwrap_err();
        assert_eq!(
            error.to_string(),
            "Error uploading application \"shop-web\": archive is corrupt"
        );
    }

    #[test]
    fn test_rejected_upload_is_fatal() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut platform = FakeUploads::new(vec![UploadStatus::Queued]);
        platform.upload = Err(PlatformError::from_status(400, None));
        let step = Asynchronous(UploadAppStep);
        let mut ctx = context(platform, clock);

        let error = step.execute(&mut ctx).unwrap_err();
        assert!(!error.is_retryable());
        assert!(error.to_string().starts_with("Error uploading application \"shop-web\""));
    }

    #[test]
    fn test_timeout_forces_retry() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let step = Asynchronous(UploadAppStep);
        let mut ctx = context(FakeUploads::new(vec![UploadStatus::Running]), clock.clone());

        assert_eq!(step.execute(&mut ctx).unwrap(), StepPhase::Poll);
        clock.advance(chrono::Duration::seconds(3601));

        match step.execute(&mut ctx).unwrap() {
            StepPhase::Retry(reason) => assert_eq!(reason.kind, RetryKind::Timeout),
            other => panic!("expected retry, got {}", other),
        }
    }

    #[test]
    fn test_timeout_from_archive_size() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut ctx = context(FakeUploads::new(vec![UploadStatus::Ready]), clock);
        assert_eq!(UploadAppStep.timeout(&ctx), MIN_UPLOAD_TIMEOUT);

        // 2 GiB at 256 KiB/s
        ctx.set(&APP_ARCHIVE_SIZE, 2 * 1024 * 1024 * 1024).unwrap();
        assert_eq!(UploadAppStep.timeout(&ctx), Duration::from_secs(8192));

        ctx.set(&APP_ARCHIVE_SIZE, 1024).unwrap();
        assert_eq!(UploadAppStep.timeout(&ctx), MIN_UPLOAD_TIMEOUT);

        ctx.set(&UPLOAD_TIMEOUT, 120).unwrap();
        assert_eq!(UploadAppStep.timeout(&ctx), Duration::from_secs(120));
    }
}
