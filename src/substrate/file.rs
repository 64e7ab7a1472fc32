use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::context::ProcessSnapshot;
use crate::errors::StoreError;
use crate::fsutil::{file_component, files_with_extension, read_json, remove_if_exists, write_atomic};
use crate::operation::OperationState;

use super::ProcessStore;

const STATE_EXTENSION: &str = "state";
const ABORT_EXTENSION: &str = "abort";
const TERMINAL_EXTENSION: &str = "terminal";

/// Instances stored under a directory:
///
/// - `{id}.state`: the latest snapshot of an active instance
/// - `{id}.abort`: present once an abort was requested
/// - `terminated/{id}.terminal`: the state a deleted instance ended in
#[derive(Debug, Clone)]
pub struct FileProcessStore {
    dir: PathBuf,
}

impl FileProcessStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, process_id: &str, extension: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", file_component(process_id), extension))
    }

    fn terminal_path(&self, process_id: &str) -> PathBuf {
        self.dir
            .join("terminated")
            .join(format!("{}.{}", file_component(process_id), TERMINAL_EXTENSION))
    }
}

impl ProcessStore for FileProcessStore {
    fn save(&self, snapshot: &ProcessSnapshot) -> Result<(), StoreError> {
        let path = self.path_for(&snapshot.process_id, STATE_EXTENSION);
        let json = serde_json::to_vec_pretty(snapshot)?;
        write_atomic(&path, &json)?;

        debug!("Saved snapshot of {} to {}", snapshot.process_id, path.display());
        Ok(())
    }

    fn load(&self, process_id: &str) -> Result<Option<ProcessSnapshot>, StoreError> {
        let snapshot: Option<ProcessSnapshot> = read_json(&self.path_for(process_id, STATE_EXTENSION))?;
        match snapshot {
            Some(mut snapshot) => {
                snapshot.abort_requested = self.abort_requested(process_id)?;
                info!(
                    "Loaded snapshot of {} (completed: {:?})",
                    process_id, snapshot.completed_steps
                );
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    fn is_active(&self, process_id: &str) -> Result<bool, StoreError> {
        Ok(self.path_for(process_id, STATE_EXTENSION).exists())
    }

    fn delete(&self, process_id: &str, terminal: OperationState) -> Result<(), StoreError> {
        if !self.is_active(process_id)? {
            return Ok(());
        }

        let json = serde_json::to_vec(&terminal)?;
        write_atomic(&self.terminal_path(process_id), &json)?;
        remove_if_exists(&self.path_for(process_id, ABORT_EXTENSION))?;
        remove_if_exists(&self.path_for(process_id, STATE_EXTENSION))?;

        info!("Deleted instance {} as {}", process_id, terminal);
        Ok(())
    }

    fn request_abort(&self, process_id: &str) -> Result<bool, StoreError> {
        if !self.is_active(process_id)? {
            return Ok(false);
        }
        write_atomic(&self.path_for(process_id, ABORT_EXTENSION), b"")?;
        Ok(true)
    }

    fn abort_requested(&self, process_id: &str) -> Result<bool, StoreError> {
        Ok(self.path_for(process_id, ABORT_EXTENSION).exists())
    }

    fn active_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        for path in files_with_extension(&self.dir, STATE_EXTENSION)? {
            if let Some(snapshot) = read_json::<ProcessSnapshot>(&path)? {
                ids.push(snapshot.process_id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn terminal_state(&self, process_id: &str) -> Result<Option<OperationState>, StoreError> {
        read_json(&self.terminal_path(process_id))
    }
}
