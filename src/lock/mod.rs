//! Operation Locks
//!
//! At most one operation may mutate a deployment target at a time. A lock
//! row keyed by `(target_id, space_id)` names the operation allowed to do
//! so. Acquisition is a single check-and-insert in the store, so two racing
//! operations never both succeed.
//!
//! # Architecture
//!
//! - [`memory`]: Store guarded by one mutex, for tests and single-host runs
//! - [`file`]: One file per key, created with exclusive-create semantics

pub mod file;
pub mod memory;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use crate::errors::{ConflictError, LockError, StoreError};
use crate::execution::supervisor::Clock;

pub use file::FileLockStore;
pub use memory::InMemoryLockStore;

/// One lock row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationLock {
    pub target_id: String,
    pub space_id: String,
    pub operation_id: String,
    pub acquired_at: DateTime<Utc>,
}

impl OperationLock {
    pub fn matches(&self, target_id: &str, space_id: &str) -> bool {
        self.target_id == target_id && self.space_id == space_id
    }
}

/// Storage for lock rows.
pub trait LockStore: Send + Sync {
    /// Inserts `lock` unless a row with the same key exists, in one atomic
    /// step. Returns the existing row when there is one.
    fn insert_if_absent(&self, lock: OperationLock) -> Result<Option<OperationLock>, StoreError>;

    fn find(&self, target_id: &str, space_id: &str) -> Result<Vec<OperationLock>, StoreError>;

    /// Deletes every row owned by the operation and returns how many.
    fn delete_by_operation(&self, operation_id: &str) -> Result<usize, StoreError>;

    fn delete_by_space(&self, space_id: &str) -> Result<usize, StoreError>;

    fn list(&self) -> Result<Vec<OperationLock>, StoreError>;
}

/// Acquires, releases and inspects operation locks.
#[derive(Clone)]
pub struct OperationLockManager {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
}

impl OperationLockManager {
    pub fn new(store: Arc<dyn LockStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> Arc<dyn LockStore> {
        Arc::clone(&self.store)
    }

    /// Locks the target for `operation_id`.
    ///
    /// Re-acquiring a lock the operation already holds succeeds. A lock held
    /// by another operation fails with a [`ConflictError`] naming it.
    pub fn acquire(&self, target_id: &str, space_id: &str, operation_id: &str) -> Result<(), LockError> {
        let lock = OperationLock {
            target_id: target_id.to_string(),
            space_id: space_id.to_string(),
            operation_id: operation_id.to_string(),
            acquired_at: self.clock.now(),
        };

        match self.store.insert_if_absent(lock)? {
            None => {
                info!(
                    "Operation {} locked target \"{}\" in space \"{}\"",
                    operation_id, target_id, space_id
                );
                Ok(())
            }
            Some(existing) if existing.operation_id == operation_id => Ok(()),
            Some(existing) => {
                info!(
                    "Operation {} conflicts with operation {} on target \"{}\" in space \"{}\"",
                    operation_id, existing.operation_id, target_id, space_id
                );
                Err(ConflictError {
                    target_id: target_id.to_string(),
                    space_id: space_id.to_string(),
                    holder: existing.operation_id,
                }
                .into())
            }
        }
    }

    /// Releases every lock of the operation. Releasing nothing is fine.
    pub fn release(&self, operation_id: &str) -> Result<(), LockError> {
        let released = self.store.delete_by_operation(operation_id)?;
        if released > 0 {
            info!("Operation {} released its lock", operation_id);
        } else {
            debug!("Operation {} held no lock", operation_id);
        }
        Ok(())
    }

    /// The operation holding the target, if any.
    pub fn find_holder(&self, target_id: &str, space_id: &str) -> Result<Option<String>, LockError> {
        let mut rows = self.store.find(target_id, space_id)?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop().map(|lock| lock.operation_id)),
            count => {
                error!(
                    "Lock table is inconsistent: {} operations hold target \"{}\" in space \"{}\"",
                    count, target_id, space_id
                );
                Err(LockError::Integrity {
                    target_id: target_id.to_string(),
                    space_id: space_id.to_string(),
                    count,
                })
            }
        }
    }

    pub fn holds_lock(&self, operation_id: &str) -> Result<bool, LockError> {
        Ok(self
            .store
            .list()?
            .iter()
            .any(|lock| lock.operation_id == operation_id))
    }

    pub fn list_in_space(&self, space_id: &str) -> Result<Vec<OperationLock>, LockError> {
        Ok(self
            .store
            .list()?
            .into_iter()
            .filter(|lock| lock.space_id == space_id)
            .collect())
    }

    pub fn list_all(&self) -> Result<Vec<OperationLock>, LockError> {
        Ok(self.store.list()?)
    }

    /// Drops every lock of a space, returning how many.
    pub fn purge_space(&self, space_id: &str) -> Result<usize, LockError> {
        Ok(self.store.delete_by_space(space_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    use crate::execution::supervisor::SystemClock;

    fn manager() -> (OperationLockManager, Arc<InMemoryLockStore>) {
        let store = Arc::new(InMemoryLockStore::new());
        (OperationLockManager::new(store.clone(), Arc::new(SystemClock)), store)
    }

    #[test]
    fn test_conflict_names_holder_until_release() {
        let (locks, _) = manager();
        locks.acquire("app-1", "space-x", "A").unwrap();

        match locks.acquire("app-1", "space-x", "B") {
            Err(LockError::Conflict(conflict)) => assert_eq!(conflict.holder, "A"),
            other => panic!("expected conflict, got {:?}", other),
        }

        locks.release("A").unwrap();
        locks.acquire("app-1", "space-x", "B").unwrap();
        assert_eq!(locks.find_holder("app-1", "space-x").unwrap(), Some("B".to_string()));
    }

    #[test]
    fn test_reacquire_by_holder_succeeds() {
        let (locks, _) = manager();
        locks.acquire("app-1", "space-x", "A").unwrap();
        locks.acquire("app-1", "space-x", "A").unwrap();
        assert_eq!(locks.list_all().unwrap().len(), 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let (locks, _) = manager();
        locks.acquire("app-1", "space-x", "A").unwrap();
        locks.release("A").unwrap();
        locks.release("A").unwrap();
        locks.release("never-held").unwrap();
        assert_eq!(locks.find_holder("app-1", "space-x").unwrap(), None);
    }

    #[test]
    fn test_other_keys_are_independent() {
        let (locks, _) = manager();
        locks.acquire("app-1", "space-x", "A").unwrap();
        locks.acquire("app-1", "space-y", "B").unwrap();
        locks.acquire("app-2", "space-x", "C").unwrap();

        assert_eq!(locks.list_in_space("space-x").unwrap().len(), 2);
        assert!(locks.holds_lock("B").unwrap());
    }

    #[test]
    fn test_duplicate_rows_are_integrity_error() {
        let (locks, store) = manager();
        for holder in ["A", "B"] {
            store.insert_unchecked(OperationLock {
                target_id: "app-1".to_string(),
                space_id: "space-x".to_string(),
                operation_id: holder.to_string(),
                acquired_at: Utc::now(),
            });
        }

        assert!(matches!(
            locks.find_holder("app-1", "space-x"),
            Err(LockError::Integrity { count: 2, .. })
        ));
    }

    #[test]
    fn test_concurrent_acquire_has_one_winner() {
        let (locks, _) = manager();
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let locks = locks.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    locks.acquire("app-1", "space-x", &format!("op-{}", i)).is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_purge_space() {
        let (locks, _) = manager();
        locks.acquire("app-1", "space-x", "A").unwrap();
        locks.acquire("app-2", "space-x", "B").unwrap();
        locks.acquire("app-1", "space-y", "C").unwrap();

        assert_eq!(locks.purge_space("space-x").unwrap(), 2);
        assert_eq!(locks.list_all().unwrap().len(), 1);
    }
}
