use std::sync::{Mutex, MutexGuard};

use crate::errors::StoreError;

use super::{LockStore, OperationLock};

/// Lock rows kept in memory behind a single mutex.
#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    rows: Mutex<Vec<OperationLock>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> Result<MutexGuard<'_, Vec<OperationLock>>, StoreError> {
        self.rows
            .lock()
            .map_err(|_| StoreError::Unavailable("lock table mutex poisoned".to_string()))
    }

    /// Inserts a row without the uniqueness check.
    #[cfg(test)]
    pub(crate) fn insert_unchecked(&self, lock: OperationLock) {
        if let Ok(mut rows) = self.rows() {
            rows.push(lock);
        }
    }
}

impl LockStore for InMemoryLockStore {
    fn insert_if_absent(&self, lock: OperationLock) -> Result<Option<OperationLock>, StoreError> {
        let mut rows = self.rows()?;
        if let Some(existing) = rows
            .iter()
            .find(|row| row.matches(&lock.target_id, &lock.space_id))
        {
            return Ok(Some(existing.clone()));
        }
        rows.push(lock);
        Ok(None)
    }

    fn find(&self, target_id: &str, space_id: &str) -> Result<Vec<OperationLock>, StoreError> {
        Ok(self
            .rows()?
            .iter()
            .filter(|row| row.matches(target_id, space_id))
            .cloned()
            .collect())
    }

    fn delete_by_operation(&self, operation_id: &str) -> Result<usize, StoreError> {
        let mut rows = self.rows()?;
        let before = rows.len();
        rows.retain(|row| row.operation_id != operation_id);
        Ok(before - rows.len())
    }

    fn delete_by_space(&self, space_id: &str) -> Result<usize, StoreError> {
        let mut rows = self.rows()?;
        let before = rows.len();
        rows.retain(|row| row.space_id != space_id);
        Ok(before - rows.len())
    }

    fn list(&self) -> Result<Vec<OperationLock>, StoreError> {
        Ok(self.rows()?.clone())
    }
}
