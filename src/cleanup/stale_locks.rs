use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, info, warn};

use crate::errors::CleanupError;
use crate::lock::OperationLockManager;
use crate::substrate::ProcessStore;

use super::Cleaner;

/// Releases locks whose owning instance is gone.
pub struct StaleLockCleaner {
    processes: Arc<dyn ProcessStore>,
    locks: OperationLockManager,
}

impl StaleLockCleaner {
    pub fn new(processes: Arc<dyn ProcessStore>, locks: OperationLockManager) -> Self {
        Self { processes, locks }
    }
}

impl Cleaner for StaleLockCleaner {
    fn name(&self) -> &str {
        "stale-locks"
    }

    fn execute(&self, expiration: DateTime<Utc>) -> Result<usize, CleanupError> {
        let mut released = 0;
        for lock in self.locks.list_all()? {
            if lock.acquired_at >= expiration {
                continue;
            }

            match self.processes.is_active(&lock.operation_id) {
                Ok(true) => {}
                Ok(false) => {
                    info!(
                        "Releasing lock on target \"{}\" in space \"{}\" held by inactive operation {}",
                        lock.target_id, lock.space_id, lock.operation_id
                    );
                    match self.locks.release(&lock.operation_id) {
                        Ok(()) => released += 1,
                        Err(e) => error!("Error releasing lock of operation {}: {}", lock.operation_id, e),
                    }
                }
                Err(e) => warn!(
                    "Could not check whether operation {} is active: {}",
                    lock.operation_id, e
                ),
            }
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ProcessSnapshot;
    use crate::execution::supervisor::ManualClock;
    use crate::lock::InMemoryLockStore;
    use crate::substrate::InMemoryProcessStore;

    #[test]
    fn test_only_old_locks_of_inactive_operations_are_released() {
        let start = Utc::now() - chrono::Duration::hours(2);
        let clock = Arc::new(ManualClock::new(start));
        let locks = OperationLockManager::new(Arc::new(InMemoryLockStore::new()), clock.clone());
        let processes = Arc::new(InMemoryProcessStore::new());

        locks.acquire("app-1", "space-x", "dead").unwrap();
        locks.acquire("app-2", "space-x", "alive").unwrap();
        processes
            .save(&ProcessSnapshot::new("alive", "deploy", start))
            .unwrap();
        clock.set(Utc::now());
        locks.acquire("app-3", "space-x", "young").unwrap();

        let cleaner = StaleLockCleaner::new(processes, locks.clone());
        let expiration = Utc::now() - chrono::Duration::minutes(30);
        assert_eq!(cleaner.execute(expiration).unwrap(), 1);

        let holders: Vec<String> = locks
            .list_all()
            .unwrap()
            .into_iter()
            .map(|lock| lock.operation_id)
            .collect();
        assert_eq!(holders, vec!["alive".to_string(), "young".to_string()]);
    }
}
