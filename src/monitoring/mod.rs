//! Execution Monitoring Module
//!
//! Records what happened on each scheduler tick so a run can be summarised
//! per operation.

pub mod timeline;

pub use timeline::{ExecutionTimeline, TickKind, TimelineEvent};
