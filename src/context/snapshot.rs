//! Process Snapshot
//!
//! The durable view of one operation instance. The engine saves a snapshot
//! after every tick, so a restarted host can resume the instance from the
//! last tick boundary.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Persistent state of an operation instance.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ProcessSnapshot {
    pub process_id: String,

    pub process_type: String,

    /// Context variables by name
    #[serde(default)]
    pub variables: HashMap<String, Value>,

    /// Names of the steps that reported DONE, in completion order
    #[serde(default)]
    pub completed_steps: Vec<String>,

    /// Index of the step to run on the next tick
    #[serde(default)]
    pub current_step: usize,

    /// Step that failed the operation (if any)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<String>,

    /// Filled in by the store on load; the flag itself is owned by the store
    #[serde(default)]
    pub abort_requested: bool,

    /// Last time the snapshot was updated
    pub timestamp: DateTime<Utc>,
}

impl ProcessSnapshot {
    pub fn new(process_id: &str, process_type: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            process_id: process_id.to_string(),
            process_type: process_type.to_string(),
            variables: HashMap::new(),
            completed_steps: Vec::new(),
            current_step: 0,
            failed_step: None,
            abort_requested: false,
            timestamp,
        }
    }

    pub fn is_completed(&self, step: &str) -> bool {
        self.completed_steps.iter().any(|completed| completed == step)
    }

    /// Returns true once at least one step has made progress.
    pub fn is_resume(&self) -> bool {
        !self.completed_steps.is_empty() || self.failed_step.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_snapshot_is_fresh() {
        let snapshot = ProcessSnapshot::new("p1", "deploy", Utc::now());
        assert_eq!(snapshot.current_step, 0);
        assert!(!snapshot.is_resume());
        assert!(!snapshot.abort_requested);
    }

    #[test]
    fn test_completed_lookup() {
        let mut snapshot = ProcessSnapshot::new("p1", "deploy", Utc::now());
        snapshot.completed_steps.push("upload-app".to_string());
        assert!(snapshot.is_completed("upload-app"));
        assert!(!snapshot.is_completed("start-app"));
        assert!(snapshot.is_resume());
    }

    #[test]
    fn test_missing_optional_fields_deserialize() {
        let json = r#"{"process_id":"p1","process_type":"deploy","timestamp":"2024-01-01T00:00:00Z"}"#;
        let snapshot: ProcessSnapshot = serde_json::from_str(json).unwrap();
        assert!(snapshot.variables.is_empty());
        assert!(snapshot.failed_step.is_none());
    }
}
