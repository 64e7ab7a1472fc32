use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, info, warn};

use crate::errors::CleanupError;
use crate::history::{EventQuery, EventType, HistoryStore};
use crate::lock::OperationLockManager;
use crate::operation::OperationState;
use crate::substrate::ProcessStore;

use super::Cleaner;

/// Ends operations that were aborted but whose instance is still active,
/// e.g. because the host crashed between recording the abort and deleting
/// the instance.
pub struct AbortedOperationsCleaner {
    history: Arc<dyn HistoryStore>,
    processes: Arc<dyn ProcessStore>,
    locks: OperationLockManager,
}

impl AbortedOperationsCleaner {
    pub fn new(history: Arc<dyn HistoryStore>, processes: Arc<dyn ProcessStore>, locks: OperationLockManager) -> Self {
        Self {
            history,
            processes,
            locks,
        }
    }

    /// Deletes the instance and releases its lock. Both are attempted even
    /// if one fails.
    fn terminate(&self, process_id: &str) -> bool {
        info!("Deleting aborted operation with id {}", process_id);
        let mut clean = true;

        if let Err(e) = self.processes.delete(process_id, OperationState::Aborted) {
            error!("Error deleting aborted operation with id {}: {}", process_id, e);
            clean = false;
        }
        if let Err(e) = self.locks.release(process_id) {
            error!("Error releasing lock of aborted operation {}: {}", process_id, e);
            clean = false;
        }
        clean
    }
}

impl Cleaner for AbortedOperationsCleaner {
    fn name(&self) -> &str {
        "aborted-operations"
    }

    fn execute(&self, expiration: DateTime<Utc>) -> Result<usize, CleanupError> {
        let events = self.history.query(
            &EventQuery::new()
                .event_type(EventType::Aborted)
                .older_than(expiration),
        )?;

        let mut seen = HashSet::new();
        let mut terminated = 0;
        for event in events {
            if !seen.insert(event.process_id.clone()) {
                continue;
            }
            match self.processes.is_active(&event.process_id) {
                Ok(true) => {
                    if self.terminate(&event.process_id) {
                        terminated += 1;
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(
                    "Could not check whether operation {} is active: {}",
                    event.process_id, e
                ),
            }
        }

        if terminated > 0 {
            info!("Terminated {} aborted operations", terminated);
        }
        Ok(terminated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ProcessSnapshot;
    use crate::errors::StoreError;
    use crate::execution::supervisor::SystemClock;
    use crate::history::InMemoryHistoryStore;
    use crate::lock::InMemoryLockStore;
    use crate::substrate::InMemoryProcessStore;

    fn minutes_ago(minutes: i64) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::minutes(minutes)
    }

    fn setup() -> (Arc<InMemoryHistoryStore>, Arc<InMemoryProcessStore>, OperationLockManager) {
        (
            Arc::new(InMemoryHistoryStore::new()),
            Arc::new(InMemoryProcessStore::new()),
            OperationLockManager::new(Arc::new(InMemoryLockStore::new()), Arc::new(SystemClock)),
        )
    }

    #[test]
    fn test_old_aborted_active_operation_is_terminated() {
        let (history, processes, locks) = setup();
        processes
            .save(&ProcessSnapshot::new("p1", "deploy", minutes_ago(60)))
            .unwrap();
        locks.acquire("app-1", "space-x", "p1").unwrap();
        history.append("p1", EventType::Aborted, minutes_ago(45)).unwrap();

        let cleaner = AbortedOperationsCleaner::new(history.clone(), processes.clone(), locks.clone());
        assert_eq!(cleaner.execute(minutes_ago(30)).unwrap(), 1);

        assert!(!processes.is_active("p1").unwrap());
        assert_eq!(processes.terminal_state("p1").unwrap(), Some(OperationState::Aborted));
        assert!(locks.find_holder("app-1", "space-x").unwrap().is_none());

        // a second pass has nothing left to do
        assert_eq!(cleaner.execute(minutes_ago(30)).unwrap(), 0);
    }

    #[test]
    fn test_recent_abort_is_left_alone() {
        let (history, processes, locks) = setup();
        processes
            .save(&ProcessSnapshot::new("p1", "deploy", Utc::now()))
            .unwrap();
        history.append("p1", EventType::Aborted, minutes_ago(5)).unwrap();

        let cleaner = AbortedOperationsCleaner::new(history, processes.clone(), locks);
        assert_eq!(cleaner.execute(minutes_ago(30)).unwrap(), 0);
        assert!(processes.is_active("p1").unwrap());
    }

    struct BrokenDelete(InMemoryProcessStore);

    impl ProcessStore for BrokenDelete {
        fn save(&self, snapshot: &ProcessSnapshot) -> Result<(), StoreError> {
            self.0.save(snapshot)
        }

        fn load(&self, process_id: &str) -> Result<Option<ProcessSnapshot>, StoreError> {
            self.0.load(process_id)
        }

        fn is_active(&self, process_id: &str) -> Result<bool, StoreError> {
            self.0.is_active(process_id)
        }

        fn delete(&self, process_id: &str, terminal: OperationState) -> Result<(), StoreError> {
            if process_id == "broken" {
                return Err(StoreError::Unavailable("substrate down".to_string()));
            }
            self.0.delete(process_id, terminal)
        }

        fn request_abort(&self, process_id: &str) -> Result<bool, StoreError> {
            self.0.request_abort(process_id)
        }

        fn abort_requested(&self, process_id: &str) -> Result<bool, StoreError> {
            self.0.abort_requested(process_id)
        }

        fn active_ids(&self) -> Result<Vec<String>, StoreError> {
            self.0.active_ids()
        }

        fn terminal_state(&self, process_id: &str) -> Result<Option<OperationState>, StoreError> {
            self.0.terminal_state(process_id)
        }
    }

    #[test]
    fn test_one_failure_does_not_stop_the_others() {
        let (history, _, locks) = setup();
        let processes = Arc::new(BrokenDelete(InMemoryProcessStore::new()));
        for id in ["broken", "fine"] {
            processes
                .save(&ProcessSnapshot::new(id, "deploy", minutes_ago(90)))
                .unwrap();
            history.append(id, EventType::Aborted, minutes_ago(60)).unwrap();
        }
        locks.acquire("app-1", "space-x", "broken").unwrap();

        let cleaner = AbortedOperationsCleaner::new(history, processes.clone(), locks.clone());
        assert_eq!(cleaner.execute(minutes_ago(30)).unwrap(), 1);

        assert!(!processes.is_active("fine").unwrap());
        assert!(processes.is_active("broken").unwrap());
        // the lock is released even though the delete failed
        assert!(locks.list_all().unwrap().is_empty());
    }
}
