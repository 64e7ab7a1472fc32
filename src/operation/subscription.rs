use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::errors::StoreError;

/// An application subscribed to a configuration resource in a space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: u64,
    pub space_id: String,
    pub app_name: String,
    pub resource_name: String,
}

pub trait SubscriptionStore: Send + Sync {
    fn add(&self, subscription: Subscription) -> Result<(), StoreError>;

    fn list_in_space(&self, space_id: &str) -> Result<Vec<Subscription>, StoreError>;

    fn delete_in_space(&self, space_id: &str) -> Result<usize, StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemorySubscriptionStore {
    subscriptions: Mutex<Vec<Subscription>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn subscriptions(&self) -> Result<MutexGuard<'_, Vec<Subscription>>, StoreError> {
        self.subscriptions
            .lock()
            .map_err(|_| StoreError::Unavailable("subscription store mutex poisoned".to_string()))
    }
}

impl SubscriptionStore for InMemorySubscriptionStore {
    fn add(&self, subscription: Subscription) -> Result<(), StoreError> {
        self.subscriptions()?.push(subscription);
        Ok(())
    }

    fn list_in_space(&self, space_id: &str) -> Result<Vec<Subscription>, StoreError> {
        Ok(self
            .subscriptions()?
            .iter()
            .filter(|subscription| subscription.space_id == space_id)
            .cloned()
            .collect())
    }

    fn delete_in_space(&self, space_id: &str) -> Result<usize, StoreError> {
        let mut subscriptions = self.subscriptions()?;
        let before = subscriptions.len();
        subscriptions.retain(|subscription| subscription.space_id != space_id);
        Ok(before - subscriptions.len())
    }
}
