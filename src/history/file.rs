use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::warn;

use crate::errors::StoreError;
use crate::fsutil::write_atomic;

use super::{EventQuery, EventType, HistoricEvent, HistoryStore};

/// Events stored one JSON document per line.
///
/// Appends from one process are serialized by a mutex. Several processes
/// may append to the same file; ids are then unique per writer only.
#[derive(Debug)]
pub struct FileHistoryStore {
    path: PathBuf,
    /// Last id handed out; read from the file on the first append
    last_id: Mutex<Option<u64>>,
}

impl FileHistoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_id: Mutex::new(None),
        }
    }

    fn lock_last_id(&self) -> Result<MutexGuard<'_, Option<u64>>, StoreError> {
        self.last_id
            .lock()
            .map_err(|_| StoreError::Unavailable("history file mutex poisoned".to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_events(&self) -> Result<Vec<HistoricEvent>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(
                    "Skipping malformed history line {} in {}: {}",
                    number + 1,
                    self.path.display(),
                    e
                ),
            }
        }
        Ok(events)
    }
}

impl HistoryStore for FileHistoryStore {
    fn append(&self, process_id: &str, event_type: EventType, timestamp: DateTime<Utc>) -> Result<HistoricEvent, StoreError> {
        let mut last_id = self.lock_last_id()?;
        let previous = match *last_id {
            Some(id) => id,
            None => self.read_events()?.iter().map(|event| event.id).max().unwrap_or(0),
        };
        let event = HistoricEvent {
            id: previous + 1,
            process_id: process_id.to_string(),
            event_type,
            timestamp,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        *last_id = Some(event.id);
        Ok(event)
    }

    fn query(&self, query: &EventQuery) -> Result<Vec<HistoricEvent>, StoreError> {
        Ok(self
            .read_events()?
            .into_iter()
            .filter(|event| query.matches(event))
            .collect())
    }

    fn delete_for_processes(&self, process_ids: &[String]) -> Result<usize, StoreError> {
        let _last_id = self.lock_last_id()?;

        let events = self.read_events()?;
        let before = events.len();
        let kept: Vec<HistoricEvent> = events
            .into_iter()
            .filter(|event| !process_ids.contains(&event.process_id))
            .collect();

        let removed = before - kept.len();
        if removed > 0 {
            let mut content = String::new();
            for event in &kept {
                content.push_str(&serde_json::to_string(event)?);
                content.push('\n');
            }
            write_atomic(&self.path, content.as_bytes())?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_query_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.jsonl");

        let store = FileHistoryStore::new(&path);
        store.append("p1", EventType::Started, Utc::now()).unwrap();
        store.append("p1", EventType::Aborted, Utc::now()).unwrap();

        let reopened = FileHistoryStore::new(&path);
        let events = reopened
            .query(&EventQuery::new().event_type(EventType::Aborted))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, 2);
    }

    #[test]
    fn test_ids_continue_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        FileHistoryStore::new(&path)
            .append("p1", EventType::Started, Utc::now())
            .unwrap();

        let reopened = FileHistoryStore::new(&path);
        assert_eq!(reopened.append("p1", EventType::Finished, Utc::now()).unwrap().id, 2);
        assert_eq!(reopened.append("p2", EventType::Started, Utc::now()).unwrap().id, 3);
    }

    #[test]
    fn test_append_does_not_rescan_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let store = FileHistoryStore::new(&path);
        store.append("p1", EventType::Started, Utc::now()).unwrap();

        // ids keep counting from memory even if the file is rotated away
        fs::remove_file(&path).unwrap();
        assert_eq!(store.append("p1", EventType::Finished, Utc::now()).unwrap().id, 2);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let store = FileHistoryStore::new(dir.path().join("none.jsonl"));
        assert!(store.query(&EventQuery::new()).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let store = FileHistoryStore::new(&path);
        store.append("p1", EventType::Started, Utc::now()).unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"not json\n")
            .unwrap();

        assert_eq!(store.query(&EventQuery::new()).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_rewrites_file() {
        let dir = tempdir().unwrap();
        let store = FileHistoryStore::new(dir.path().join("history.jsonl"));
        store.append("p1", EventType::Started, Utc::now()).unwrap();
        store.append("p2", EventType::Started, Utc::now()).unwrap();
        store.append("p1", EventType::Finished, Utc::now()).unwrap();

        assert_eq!(store.delete_for_processes(&["p1".to_string()]).unwrap(), 2);
        let remaining = store.query(&EventQuery::new()).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].process_id, "p2");
    }
}
