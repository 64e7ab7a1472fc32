//! Historic Events
//!
//! Append-only record of what happened to each operation. Operation state
//! and error type are derived from these events at read time, and the
//! reconciliation sweep queries them to find aborted operations.
//!
//! # Architecture
//!
//! - [`file`]: JSON-lines store used by the CLI

pub mod file;

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;

pub use file::FileHistoryStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Started,
    Finished,
    FailedByContentError,
    FailedByInfrastructureError,
    Retried,
    TimedOut,
    Aborted,
}

impl EventType {
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            EventType::FailedByContentError | EventType::FailedByInfrastructureError
        )
    }

    /// Events after which the operation no longer runs.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventType::Finished | EventType::Aborted) || self.is_failure()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::Started => "STARTED",
            EventType::Finished => "FINISHED",
            EventType::FailedByContentError => "FAILED_BY_CONTENT_ERROR",
            EventType::FailedByInfrastructureError => "FAILED_BY_INFRASTRUCTURE_ERROR",
            EventType::Retried => "RETRIED",
            EventType::TimedOut => "TIMED_OUT",
            EventType::Aborted => "ABORTED",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricEvent {
    pub id: u64,
    pub process_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
}

/// Filter over historic events. Unset criteria match everything.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    process_id: Option<String>,
    event_type: Option<EventType>,
    older_than: Option<DateTime<Utc>>,
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_id(mut self, process_id: impl Into<String>) -> Self {
        self.process_id = Some(process_id.into());
        self
    }

    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    /// Only events strictly older than `timestamp`.
    pub fn older_than(mut self, timestamp: DateTime<Utc>) -> Self {
        self.older_than = Some(timestamp);
        self
    }

    pub fn matches(&self, event: &HistoricEvent) -> bool {
        self.process_id
            .as_ref()
            .map_or(true, |id| *id == event.process_id)
            && self.event_type.map_or(true, |kind| kind == event.event_type)
            && self.older_than.map_or(true, |limit| event.timestamp < limit)
    }
}

/// Append-only event storage.
pub trait HistoryStore: Send + Sync {
    fn append(&self, process_id: &str, event_type: EventType, timestamp: DateTime<Utc>) -> Result<HistoricEvent, StoreError>;

    /// Matching events in insertion order.
    fn query(&self, query: &EventQuery) -> Result<Vec<HistoricEvent>, StoreError>;

    /// Removes every event of the given processes, returning how many.
    fn delete_for_processes(&self, process_ids: &[String]) -> Result<usize, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    events: Mutex<Vec<HistoricEvent>>,
}

impl InMemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn events(&self) -> Result<MutexGuard<'_, Vec<HistoricEvent>>, StoreError> {
        self.events
            .lock()
            .map_err(|_| StoreError::Unavailable("history mutex poisoned".to_string()))
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn append(&self, process_id: &str, event_type: EventType, timestamp: DateTime<Utc>) -> Result<HistoricEvent, StoreError> {
        let mut events = self.events()?;
        let event = HistoricEvent {
            id: events.last().map_or(1, |last| last.id + 1),
            process_id: process_id.to_string(),
            event_type,
            timestamp,
        };
        events.push(event.clone());
        Ok(event)
    }

    fn query(&self, query: &EventQuery) -> Result<Vec<HistoricEvent>, StoreError> {
        Ok(self
            .events()?
            .iter()
            .filter(|event| query.matches(event))
            .cloned()
            .collect())
    }

    fn delete_for_processes(&self, process_ids: &[String]) -> Result<usize, StoreError> {
        let mut events = self.events()?;
        let before = events.len();
        events.retain(|event| !process_ids.contains(&event.process_id));
        Ok(before - events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(minutes_ago: i64) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::minutes(minutes_ago)
    }

    #[test]
    fn test_append_assigns_increasing_ids() {
        let store = InMemoryHistoryStore::new();
        let first = store.append("p1", EventType::Started, at(5)).unwrap();
        let second = store.append("p1", EventType::Finished, at(1)).unwrap();
        assert!(second.id > first.id);
    }

    #[test]
    fn test_query_by_type_and_age() {
        let store = InMemoryHistoryStore::new();
        store.append("old", EventType::Aborted, at(45)).unwrap();
        store.append("fresh", EventType::Aborted, at(5)).unwrap();
        store.append("old", EventType::Started, at(60)).unwrap();

        let events = store
            .query(&EventQuery::new().event_type(EventType::Aborted).older_than(at(30)))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].process_id, "old");
    }

    #[test]
    fn test_query_by_process() {
        let store = InMemoryHistoryStore::new();
        store.append("p1", EventType::Started, at(2)).unwrap();
        store.append("p2", EventType::Started, at(2)).unwrap();
        store.append("p1", EventType::Retried, at(1)).unwrap();

        let events = store.query(&EventQuery::new().process_id("p1")).unwrap();
        let types: Vec<_> = events.iter().map(|event| event.event_type).collect();
        assert_eq!(types, vec![EventType::Started, EventType::Retried]);
    }

    #[test]
    fn test_delete_for_processes() {
        let store = InMemoryHistoryStore::new();
        store.append("p1", EventType::Started, at(2)).unwrap();
        store.append("p2", EventType::Started, at(2)).unwrap();

        assert_eq!(store.delete_for_processes(&["p1".to_string()]).unwrap(), 1);
        assert_eq!(store.query(&EventQuery::new()).unwrap().len(), 1);
    }

    #[test]
    fn test_event_type_classification() {
        assert!(EventType::FailedByContentError.is_terminal());
        assert!(EventType::Aborted.is_terminal());
        assert!(!EventType::Retried.is_terminal());
        assert!(!EventType::TimedOut.is_failure());
        assert_eq!(
            serde_json::to_string(&EventType::FailedByInfrastructureError).unwrap(),
            "\"FAILED_BY_INFRASTRUCTURE_ERROR\""
        );
    }
}
