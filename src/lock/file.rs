use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::warn;

use crate::errors::StoreError;
use crate::fsutil::{file_component, files_with_extension, read_json, remove_if_exists, scratch_path};

use super::{LockStore, OperationLock};

const LOCK_EXTENSION: &str = "lock";

/// One lock file per `(target_id, space_id)` key.
///
/// A lock file is written to a scratch file first and then hard-linked to
/// its final name. Linking fails when the name exists, which makes the
/// insert atomic across processes sharing the directory, and readers never
/// see a half-written lock.
#[derive(Debug, Clone)]
pub struct FileLockStore {
    dir: PathBuf,
}

impl FileLockStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, target_id: &str, space_id: &str) -> PathBuf {
        self.dir.join(format!(
            "{}@{}.{}",
            file_component(space_id),
            file_component(target_id),
            LOCK_EXTENSION
        ))
    }

    fn read_all(&self) -> Result<Vec<(PathBuf, OperationLock)>, StoreError> {
        let mut locks = Vec::new();
        for path in files_with_extension(&self.dir, LOCK_EXTENSION)? {
            match read_json::<OperationLock>(&path) {
                Ok(Some(lock)) => locks.push((path, lock)),
                // released between listing and reading
                Ok(None) => {}
                Err(StoreError::Serialization(e)) => {
                    warn!("Ignoring unreadable lock file {}: {}", path.display(), e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(locks)
    }

    fn delete_matching(&self, predicate: impl Fn(&OperationLock) -> bool) -> Result<usize, StoreError> {
        let mut deleted = 0;
        for (path, lock) in self.read_all()? {
            if predicate(&lock) && remove_if_exists(&path)? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

impl LockStore for FileLockStore {
    fn insert_if_absent(&self, lock: OperationLock) -> Result<Option<OperationLock>, StoreError> {
        fs::create_dir_all(&self.dir)?;

        let path = self.path_for(&lock.target_id, &lock.space_id);
        let scratch = scratch_path(&path);
        fs::write(&scratch, serde_json::to_vec_pretty(&lock)?)?;

        let linked = fs::hard_link(&scratch, &path);
        remove_if_exists(&scratch)?;

        match linked {
            Ok(()) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => match read_json(&path)? {
                Some(existing) => Ok(Some(existing)),
                // the holder released it in the meantime
                None => self.insert_if_absent(lock),
            },
            Err(e) => Err(e.into()),
        }
    }

    fn find(&self, target_id: &str, space_id: &str) -> Result<Vec<OperationLock>, StoreError> {
        Ok(read_json(&self.path_for(target_id, space_id))?
            .into_iter()
            .collect())
    }

    fn delete_by_operation(&self, operation_id: &str) -> Result<usize, StoreError> {
        self.delete_matching(|lock| lock.operation_id == operation_id)
    }

    fn delete_by_space(&self, space_id: &str) -> Result<usize, StoreError> {
        self.delete_matching(|lock| lock.space_id == space_id)
    }

    fn list(&self) -> Result<Vec<OperationLock>, StoreError> {
        Ok(self.read_all()?.into_iter().map(|(_, lock)| lock).collect())
    }
}
