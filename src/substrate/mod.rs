//! Durable Workflow Substrate
//!
//! Where operation instances live between ticks. The engine saves a
//! [`ProcessSnapshot`] after every tick and deletes the instance, together
//! with its terminal state, when it ends. The abort flag is owned by the
//! store and survives snapshot saves.
//!
//! # Architecture
//!
//! - [`file`]: One state file per instance, used by the CLI

pub mod file;

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use log::debug;

use crate::context::ProcessSnapshot;
use crate::errors::StoreError;
use crate::operation::OperationState;

pub use file::FileProcessStore;

/// Persistent home of operation instances.
pub trait ProcessStore: Send + Sync {
    fn save(&self, snapshot: &ProcessSnapshot) -> Result<(), StoreError>;

    /// The active instance, with `abort_requested` filled in.
    fn load(&self, process_id: &str) -> Result<Option<ProcessSnapshot>, StoreError>;

    fn is_active(&self, process_id: &str) -> Result<bool, StoreError>;

    /// Ends an instance. Deleting an inactive instance does nothing.
    fn delete(&self, process_id: &str, terminal: OperationState) -> Result<(), StoreError>;

    /// Raises the abort flag. Returns false when the instance is not active.
    fn request_abort(&self, process_id: &str) -> Result<bool, StoreError>;

    fn abort_requested(&self, process_id: &str) -> Result<bool, StoreError>;

    fn active_ids(&self) -> Result<Vec<String>, StoreError>;

    /// State the instance was deleted with, if it was.
    fn terminal_state(&self, process_id: &str) -> Result<Option<OperationState>, StoreError>;
}

#[derive(Debug, Default)]
struct Instances {
    active: HashMap<String, ProcessSnapshot>,
    aborts: HashSet<String>,
    terminated: HashMap<String, OperationState>,
}

#[derive(Debug, Default)]
pub struct InMemoryProcessStore {
    instances: Mutex<Instances>,
}

impl InMemoryProcessStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn instances(&self) -> Result<MutexGuard<'_, Instances>, StoreError> {
        self.instances
            .lock()
            .map_err(|_| StoreError::Unavailable("process store mutex poisoned".to_string()))
    }
}

impl ProcessStore for InMemoryProcessStore {
    fn save(&self, snapshot: &ProcessSnapshot) -> Result<(), StoreError> {
        let mut instances = self.instances()?;
        instances
            .active
            .insert(snapshot.process_id.clone(), snapshot.clone());
        Ok(())
    }

    fn load(&self, process_id: &str) -> Result<Option<ProcessSnapshot>, StoreError> {
        let instances = self.instances()?;
        Ok(instances.active.get(process_id).map(|snapshot| {
            let mut snapshot = snapshot.clone();
            snapshot.abort_requested = instances.aborts.contains(process_id);
            snapshot
        }))
    }

    fn is_active(&self, process_id: &str) -> Result<bool, StoreError> {
        Ok(self.instances()?.active.contains_key(process_id))
    }

    fn delete(&self, process_id: &str, terminal: OperationState) -> Result<(), StoreError> {
        let mut instances = self.instances()?;
        if instances.active.remove(process_id).is_some() {
            debug!("Deleted instance {} as {}", process_id, terminal);
            instances.aborts.remove(process_id);
            instances.terminated.insert(process_id.to_string(), terminal);
        }
        Ok(())
    }

    fn request_abort(&self, process_id: &str) -> Result<bool, StoreError> {
        let mut instances = self.instances()?;
        if !instances.active.contains_key(process_id) {
            return Ok(false);
        }
        instances.aborts.insert(process_id.to_string());
        Ok(true)
    }

    fn abort_requested(&self, process_id: &str) -> Result<bool, StoreError> {
        Ok(self.instances()?.aborts.contains(process_id))
    }

    fn active_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.instances()?.active.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn terminal_state(&self, process_id: &str) -> Result<Option<OperationState>, StoreError> {
        Ok(self.instances()?.terminated.get(process_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snapshot(id: &str) -> ProcessSnapshot {
        ProcessSnapshot::new(id, "deploy", Utc::now())
    }

    #[test]
    fn test_save_load_delete() {
        let store = InMemoryProcessStore::new();
        store.save(&snapshot("p1")).unwrap();
        assert!(store.is_active("p1").unwrap());
        assert_eq!(store.load("p1").unwrap().unwrap().process_type, "deploy");

        store.delete("p1", OperationState::Finished).unwrap();
        assert!(!store.is_active("p1").unwrap());
        assert!(store.load("p1").unwrap().is_none());
        assert_eq!(store.terminal_state("p1").unwrap(), Some(OperationState::Finished));
    }

    #[test]
    fn test_delete_inactive_is_noop() {
        let store = InMemoryProcessStore::new();
        store.delete("ghost", OperationState::Aborted).unwrap();
        assert_eq!(store.terminal_state("ghost").unwrap(), None);
    }

    #[test]
    fn test_abort_flag_survives_save() {
        let store = InMemoryProcessStore::new();
        store.save(&snapshot("p1")).unwrap();
        assert!(store.request_abort("p1").unwrap());
        store.save(&snapshot("p1")).unwrap();

        assert!(store.abort_requested("p1").unwrap());
        assert!(store.load("p1").unwrap().unwrap().abort_requested);
    }

    #[test]
    fn test_abort_unknown_instance() {
        let store = InMemoryProcessStore::new();
        assert!(!store.request_abort("ghost").unwrap());
        assert!(!store.abort_requested("ghost").unwrap());
    }

    #[test]
    fn test_active_ids_sorted() {
        let store = InMemoryProcessStore::new();
        store.save(&snapshot("b")).unwrap();
        store.save(&snapshot("a")).unwrap();
        assert_eq!(store.active_ids().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }
}
