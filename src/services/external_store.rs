//! External-store subscriptions.
//!
//! Each external-store trait follows one [`ExternalStore`]. The value current
//! at subscription time seeds the field, and later changes are handed to a
//! writeback that commits them as their own transaction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::models::field_path::FieldPath;
use crate::domain::ports::ExternalStore;

/// Code of the warning for a trait whose store is not registered.
pub const EXTERNAL_STORE_MISSING: &str = "state_trait::external_store_missing";

/// Stores by id.
#[derive(Clone, Default)]
pub struct StoreRegistry {
    stores: HashMap<String, Arc<dyn ExternalStore>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, store_id: impl Into<String>, store: Arc<dyn ExternalStore>) -> Self {
        self.register(store_id, store);
        self
    }

    pub fn register(&mut self, store_id: impl Into<String>, store: Arc<dyn ExternalStore>) {
        self.stores.insert(store_id.into(), store);
    }

    pub fn get(&self, store_id: &str) -> Option<Arc<dyn ExternalStore>> {
        self.stores.get(store_id).cloned()
    }

    pub fn contains(&self, store_id: &str) -> bool {
        self.stores.contains_key(store_id)
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

/// Applies a store change to the owning runtime.
pub type StoreWriteback = Arc<dyn Fn(FieldPath, Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Follow tasks of one runtime instance.
#[derive(Default)]
pub struct StoreSync {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StoreSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `field` to `store` and return the store's current value.
    ///
    /// Later changes are followed only when called within a tokio runtime.
    pub fn attach(&self, field: FieldPath, store: &dyn ExternalStore, writeback: StoreWriteback) -> Value {
        let mut receiver = store.subscribe();
        let current = receiver.borrow_and_update().clone();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let task = runtime.spawn(follow(field, receiver, writeback));
                self.tasks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(task);
            }
            Err(_) => warn!(field = %field, "no tokio runtime, external store changes are not followed"),
        }
        current
    }

    /// Number of subscriptions still following their store.
    pub fn active(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|task| !task.is_finished())
            .count()
    }

    pub fn abort_all(&self) {
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

async fn follow(field: FieldPath, mut receiver: watch::Receiver<Value>, writeback: StoreWriteback) {
    while receiver.changed().await.is_ok() {
        let value = receiver.borrow_and_update().clone();
        writeback(field.clone(), value).await;
    }
    debug!(field = %field, "external store closed");
}
