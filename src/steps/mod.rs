//! Reference Steps
//!
//! Concrete steps built on the step contract.
//!
//! - [`scripted`]: Steps described in YAML, used by the CLI and tests
//! - [`upload`]: Uploads the application archive
//! - [`start`]: Starts the application and waits for its instances

pub mod scripted;
pub mod start;
pub mod upload;

pub use scripted::{OperationScript, ScriptedFailure, StepMode, StepScript};
pub use start::StartAppStep;
pub use upload::UploadAppStep;
