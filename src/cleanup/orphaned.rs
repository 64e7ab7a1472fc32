use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{error, info};

use crate::errors::CleanupError;
use crate::execution::supervisor::Clock;
use crate::history::{EventQuery, HistoryStore};
use crate::lock::OperationLockManager;
use crate::operation::{OperationStore, SubscriptionStore};
use crate::platform::{AuditEventSource, AuditLog, AuditedEntity};

use super::Cleaner;

/// Purges everything scoped to spaces the platform reports as deleted.
pub struct OrphanedDataCleaner {
    audit_events: Arc<dyn AuditEventSource>,
    audit_log: Arc<dyn AuditLog>,
    locks: OperationLockManager,
    history: Arc<dyn HistoryStore>,
    operations: Arc<dyn OperationStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    clock: Arc<dyn Clock>,
    lookback: chrono::Duration,
}

impl OrphanedDataCleaner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        audit_events: Arc<dyn AuditEventSource>,
        audit_log: Arc<dyn AuditLog>,
        locks: OperationLockManager,
        history: Arc<dyn HistoryStore>,
        operations: Arc<dyn OperationStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        clock: Arc<dyn Clock>,
        lookback: chrono::Duration,
    ) -> Self {
        Self {
            audit_events,
            audit_log,
            locks,
            history,
            operations,
            subscriptions,
            clock,
            lookback,
        }
    }

    /// Audit-logs every entity of the space, then deletes them all.
    fn purge_space(&self, space_id: &str) -> Result<usize, CleanupError> {
        let locks = self.locks.list_in_space(space_id)?;
        let operations = self.operations.list_in_space(space_id)?;
        let subscriptions = self.subscriptions.list_in_space(space_id)?;

        let process_ids: Vec<String> = operations
            .iter()
            .map(|operation| operation.process_id.clone())
            .collect();
        let mut events = Vec::new();
        for process_id in &process_ids {
            events.extend(self.history.query(&EventQuery::new().process_id(process_id.as_str()))?);
        }

        for lock in &locks {
            self.audit_log.log_deletion(space_id, &AuditedEntity::Lock(lock));
        }
        for event in &events {
            self.audit_log.log_deletion(space_id, &AuditedEntity::Event(event));
        }
        for operation in &operations {
            self.audit_log
                .log_deletion(space_id, &AuditedEntity::Operation(operation));
        }
        for subscription in &subscriptions {
            self.audit_log
                .log_deletion(space_id, &AuditedEntity::Subscription(subscription));
        }

        let mut deleted = self.locks.purge_space(space_id)?;
        deleted += self.history.delete_for_processes(&process_ids)?;
        deleted += self.operations.delete_in_space(space_id)?;
        deleted += self.subscriptions.delete_in_space(space_id)?;
        Ok(deleted)
    }
}

impl Cleaner for OrphanedDataCleaner {
    fn name(&self) -> &str {
        "orphaned-data"
    }

    fn execute(&self, _expiration: DateTime<Utc>) -> Result<usize, CleanupError> {
        let since = self.clock.now() - self.lookback;
        let spaces = self.audit_events.deleted_spaces(since)?;
        if spaces.is_empty() {
            return Ok(0);
        }
        info!("Found {} deleted spaces since {}", spaces.len(), since);

        let mut deleted = 0;
        for space_id in spaces {
            match self.purge_space(&space_id) {
                Ok(count) => {
                    info!("Deleted {} entries of deleted space {}", count, space_id);
                    deleted += count;
                }
                Err(e) => error!("Error deleting data of deleted space {}: {}", space_id, e),
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::execution::supervisor::ManualClock;
    use crate::history::{EventType, InMemoryHistoryStore};
    use crate::lock::InMemoryLockStore;
    use crate::operation::{InMemoryOperationStore, InMemorySubscriptionStore, Operation, Subscription};
    use crate::platform::PlatformError;

    struct DeletedSpaces {
        spaces: Vec<String>,
        asked_since: Mutex<Option<DateTime<Utc>>>,
    }

    impl AuditEventSource for DeletedSpaces {
        fn deleted_spaces(&self, since: DateTime<Utc>) -> Result<Vec<String>, PlatformError> {
            *self.asked_since.lock().unwrap() = Some(since);
            Ok(self.spaces.clone())
        }
    }

    #[derive(Default)]
    struct RecordingAuditLog {
        records: Mutex<Vec<String>>,
    }

    impl AuditLog for RecordingAuditLog {
        fn log_deletion(&self, space_id: &str, entity: &AuditedEntity<'_>) {
            self.records
                .lock()
                .unwrap()
                .push(format!("{}: {}", space_id, entity));
        }
    }

    fn operation(id: &str, space: &str) -> Operation {
        Operation {
            process_id: id.to_string(),
            process_type: "deploy".to_string(),
            target_id: "app-1".to_string(),
            space_id: space.to_string(),
            user: None,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_deleted_space_is_audited_then_purged() {
        let now = Utc::now();
        let clock = Arc::new(ManualClock::new(now));
        let source = Arc::new(DeletedSpaces {
            spaces: vec!["gone".to_string()],
            asked_since: Mutex::new(None),
        });
        let audit_log = Arc::new(RecordingAuditLog::default());
        let locks = OperationLockManager::new(Arc::new(InMemoryLockStore::new()), clock.clone());
        let history = Arc::new(InMemoryHistoryStore::new());
        let operations = Arc::new(InMemoryOperationStore::new());
        let subscriptions = Arc::new(InMemorySubscriptionStore::new());

        operations.add(operation("p-gone", "gone")).unwrap();
        operations.add(operation("p-kept", "kept")).unwrap();
        history.append("p-gone", EventType::Started, now).unwrap();
        history.append("p-kept", EventType::Started, now).unwrap();
        locks.acquire("app-1", "gone", "p-gone").unwrap();
        locks.acquire("app-1", "kept", "p-kept").unwrap();
        subscriptions
            .add(Subscription {
                id: 1,
                space_id: "gone".to_string(),
                app_name: "web".to_string(),
                resource_name: "config".to_string(),
            })
            .unwrap();

        let cleaner = OrphanedDataCleaner::new(
            source.clone(),
            audit_log.clone(),
            locks.clone(),
            history.clone(),
            operations.clone(),
            subscriptions.clone(),
            clock,
            chrono::Duration::days(1),
        );

        assert_eq!(cleaner.execute(now).unwrap(), 4);
        assert_eq!(
            *source.asked_since.lock().unwrap(),
            Some(now - chrono::Duration::days(1))
        );

        let records = audit_log.records.lock().unwrap();
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|record| record.starts_with("gone: ")));

        assert!(locks.list_in_space("gone").unwrap().is_empty());
        assert!(operations.list_in_space("gone").unwrap().is_empty());
        assert!(subscriptions.list_in_space("gone").unwrap().is_empty());
        assert!(history
            .query(&EventQuery::new().process_id("p-gone"))
            .unwrap()
            .is_empty());

        assert_eq!(locks.list_in_space("kept").unwrap().len(), 1);
        assert_eq!(operations.list_in_space("kept").unwrap().len(), 1);
    }

    #[test]
    fn test_no_deleted_spaces() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cleaner = OrphanedDataCleaner::new(
            Arc::new(DeletedSpaces {
                spaces: Vec::new(),
                asked_since: Mutex::new(None),
            }),
            Arc::new(RecordingAuditLog::default()),
            OperationLockManager::new(Arc::new(InMemoryLockStore::new()), clock.clone()),
            Arc::new(InMemoryHistoryStore::new()),
            Arc::new(InMemoryOperationStore::new()),
            Arc::new(InMemorySubscriptionStore::new()),
            clock,
            chrono::Duration::days(1),
        );
        assert_eq!(cleaner.execute(Utc::now()).unwrap(), 0);
    }
}
