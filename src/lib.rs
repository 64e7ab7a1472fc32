//! mtarunner - Resumable Step Execution Engine
//!
//! Runs long deployment operations of multi-target applications as a fixed
//! sequence of steps. Each step is invoked once per scheduler tick, may
//! suspend while remote work is polled, and resumes from persisted state
//! after a restart.
//!
//! # Architecture
//!
//! - [`execution`]: Step contract, retry/timeout handling, engine and scheduler
//! - [`context`]: Per-instance variables, progress messages and snapshots
//! - [`lock`]: Exclusive operation locks per (target, space)
//! - [`cleanup`]: Reconciliation sweep for aborted, stale and orphaned state
//! - [`history`], [`operation`], [`substrate`]: Persisted events, operation
//!   records and instance state
//! - [`platform`]: Target platform, audit stream and audit log contracts
//! - [`steps`]: Reference steps built on the contract
//! - [`monitoring`]: Tick timeline of a scheduler run
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use mtarunner::config::EngineConfig;
//! use mtarunner::execution::{OperationEngine, Scheduler};
//! use mtarunner::steps::OperationScript;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let script = OperationScript::load("operation.yaml")?;
//!
//!     let mut engine = OperationEngine::new(EngineConfig::load("mtarunner.yaml")?);
//!     engine.register(script.definition()?)?;
//!
//!     let ctx = engine.start(script.request())?;
//!     let report = Scheduler::new(Arc::new(engine)).run(vec![ctx]);
//!     assert!(report.all_finished());
//!     Ok(())
//! }
//! ```

pub mod cleanup;
pub mod config;
pub mod context;
pub mod errors;
pub mod execution;
mod fsutil;
pub mod history;
pub mod lock;
pub mod monitoring;
pub mod operation;
pub mod platform;
pub mod steps;
pub mod substrate;

// Re-export commonly used types
pub use config::EngineConfig;
pub use context::{ExecutionContext, Variable};
pub use errors::{EngineError, StepError};
pub use execution::{OperationEngine, OperationRequest, Scheduler, Step, StepPhase};
pub use lock::OperationLockManager;
pub use steps::OperationScript;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "mtarunner";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "mtarunner");
    }

    #[test]
    fn test_module_exports_engine() {
        let engine = OperationEngine::new(EngineConfig::default());
        assert_eq!(engine.config().max_retries, 3);
        assert!(engine.locks().list_all().unwrap().is_empty());
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
