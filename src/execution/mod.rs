//! Step Execution Module
//!
//! Drives operation instances one step invocation at a time, including
//! retry handling, timeout supervision and multi-instance scheduling.
//!
//! # Architecture
//!
//! - [`step`]: Step contract and the sync/async adapters
//! - [`phase`]: Phases reported by steps and async executions
//! - [`supervisor`]: Clock and per-step timeout supervision
//! - [`definition`]: Ordered step lists per process type
//! - [`engine`]: Orchestrates lock, steps, events and persistence
//! - [`scheduler`]: Runs ticks of many instances on worker threads

pub mod definition;
pub mod engine;
pub mod phase;
pub mod scheduler;
pub mod step;
pub mod supervisor;

pub use definition::{DefinitionError, ProcessDefinition};
pub use engine::{OperationEngine, OperationRequest, TickOutcome};
pub use phase::{AsyncExecutionState, RetryKind, RetryReason, StepPhase};
pub use scheduler::{InstanceResult, RunReport, Scheduler};
pub use step::{AsyncExecution, AsyncStep, Asynchronous, Step, SyncStep, Synchronous};
pub use supervisor::{Clock, Deadline, ManualClock, SystemClock, TimeoutSupervisor};
