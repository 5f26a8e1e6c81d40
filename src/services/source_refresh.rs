//! Source key hashing and loader dispatch.
//!
//! The engine only writes `loading` snapshots and emits [`LoadRequest`]s.
//! After a pass commits, the runtime hands those requests to a
//! [`SourceRefresher`], which runs the registered [`ResourceLoader`] under
//! the trait's concurrency policy and writes the result back.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::models::source::{LoadRequest, SourceSnapshot};
use crate::domain::models::trait_spec::SourceConcurrency;
use crate::domain::ports::ResourceLoader;

/// Hash of a source key: blake3 over its canonical JSON text.
pub fn key_hash(key: &Value) -> String {
    let digest = blake3::hash(key.to_string().as_bytes());
    hex::encode(&digest.as_bytes()[..8])
}

/// Loaders by resource id.
#[derive(Clone, Default)]
pub struct ResourceRegistry {
    loaders: HashMap<String, Arc<dyn ResourceLoader>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, resource_id: impl Into<String>, loader: Arc<dyn ResourceLoader>) -> Self {
        self.register(resource_id, loader);
        self
    }

    pub fn register(&mut self, resource_id: impl Into<String>, loader: Arc<dyn ResourceLoader>) {
        self.loaders.insert(resource_id.into(), loader);
    }

    pub fn get(&self, resource_id: &str) -> Option<Arc<dyn ResourceLoader>> {
        self.loaders.get(resource_id).cloned()
    }

    pub fn contains(&self, resource_id: &str) -> bool {
        self.loaders.contains_key(resource_id)
    }

    pub fn len(&self) -> usize {
        self.loaders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaders.is_empty()
    }
}

/// Applies a finished load to the owning runtime.
pub type Writeback = Arc<dyn Fn(LoadRequest, SourceSnapshot) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct Slot {
    active: bool,
    generation: u64,
    handle: Option<JoinHandle<()>>,
    trailing: Option<LoadRequest>,
}

type Slots = Arc<Mutex<HashMap<String, Slot>>>;

/// Runs loads for source traits, one slot per output path.
///
/// `switch` aborts the in-flight load when a new key arrives.
/// `exhaust-trailing` lets the in-flight load finish and then runs only the
/// latest key that arrived meanwhile.
#[derive(Clone)]
pub struct SourceRefresher {
    registry: Arc<ResourceRegistry>,
    slots: Slots,
    writeback: Writeback,
}

impl SourceRefresher {
    pub fn new(registry: Arc<ResourceRegistry>, writeback: Writeback) -> Self {
        Self {
            registry,
            slots: Arc::new(Mutex::new(HashMap::new())),
            writeback,
        }
    }

    /// Start or queue a load. Must be called from within a tokio runtime.
    pub fn dispatch(&self, request: LoadRequest) {
        let field = request.field_path.to_string();
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(field.clone()).or_default();

        match request.concurrency {
            SourceConcurrency::Switch => {
                if let Some(handle) = slot.handle.take() {
                    debug!(field = %field, "aborting superseded load");
                    handle.abort();
                }
            }
            SourceConcurrency::ExhaustTrailing => {
                if slot.active {
                    debug!(field = %field, key_hash = %request.key_hash, "queued trailing load");
                    slot.trailing = Some(request);
                    return;
                }
            }
        }

        slot.active = true;
        slot.generation += 1;
        let generation = slot.generation;
        let task = LoadTask {
            field,
            generation,
            registry: Arc::clone(&self.registry),
            slots: Arc::clone(&self.slots),
            writeback: Arc::clone(&self.writeback),
        };
        slot.handle = Some(tokio::spawn(task.run(request)));
    }

    /// Number of output paths with a load in flight.
    pub fn in_flight(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| slot.active)
            .count()
    }

    /// Wait until no load is in flight.
    pub async fn wait_idle(&self) {
        while self.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Abort every in-flight load.
    pub fn abort_all(&self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        for slot in slots.values_mut() {
            if let Some(handle) = slot.handle.take() {
                handle.abort();
            }
            slot.active = false;
            slot.trailing = None;
        }
    }
}

struct LoadTask {
    field: String,
    generation: u64,
    registry: Arc<ResourceRegistry>,
    slots: Slots,
    writeback: Writeback,
}

impl LoadTask {
    async fn run(self, first: LoadRequest) {
        let mut next = Some(first);
        while let Some(request) = next {
            let snapshot = self.load(&request).await;
            (self.writeback)(request, snapshot).await;
            next = self.finish_or_take_trailing();
        }
    }

    async fn load(&self, request: &LoadRequest) -> SourceSnapshot {
        let Some(loader) = self.registry.get(&request.resource_id) else {
            warn!(resource_id = %request.resource_id, field = %self.field, "no loader registered");
            return SourceSnapshot::error(
                request.key_hash.clone(),
                format!("no loader registered for resource '{}'", request.resource_id),
            );
        };

        match AssertUnwindSafe(loader.load(&request.key)).catch_unwind().await {
            Ok(Ok(data)) => SourceSnapshot::success(request.key_hash.clone(), data),
            Ok(Err(err)) => SourceSnapshot::error(request.key_hash.clone(), format!("{err:#}")),
            Err(_) => SourceSnapshot::error(request.key_hash.clone(), "loader panicked"),
        }
    }

    /// Release the slot, or hand back the trailing request when one is queued.
    fn finish_or_take_trailing(&self) -> Option<LoadRequest> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.get_mut(&self.field)?;
        if slot.generation != self.generation {
            return None;
        }
        let trailing = slot.trailing.take();
        if trailing.is_none() {
            slot.active = false;
            slot.handle = None;
        }
        trailing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::watch;

    use crate::domain::models::field_path::FieldPath;
    use crate::domain::models::source::SourceStatus;

    #[test]
    fn test_key_hash_is_stable() {
        assert_eq!(key_hash(&json!({"id": 1})), key_hash(&json!({"id": 1})));
        assert_ne!(key_hash(&json!(1)), key_hash(&json!("1")));
        assert_eq!(key_hash(&json!(1)).len(), 16);
    }

    /// Loader that blocks until the gate opens.
    struct Gated {
        open: watch::Receiver<bool>,
    }

    #[async_trait]
    impl ResourceLoader for Gated {
        async fn load(&self, key: &Value) -> anyhow::Result<Value> {
            let mut open = self.open.clone();
            let opened = open.wait_for(|open| *open).await.is_ok();
            anyhow::ensure!(opened, "gate dropped");
            Ok(json!({ "for": key }))
        }
    }

    fn gated() -> (Arc<ResourceRegistry>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let registry = ResourceRegistry::new().with("profile", Arc::new(Gated { open: rx }));
        (Arc::new(registry), tx)
    }

    fn request(key: Value, concurrency: SourceConcurrency) -> LoadRequest {
        LoadRequest {
            resource_id: "profile".to_string(),
            field_path: FieldPath::parse("profile").unwrap(),
            key_hash: key_hash(&key),
            key,
            concurrency,
            step_id: 0,
        }
    }

    fn recording() -> (Writeback, Arc<Mutex<Vec<SourceSnapshot>>>) {
        let seen: Arc<Mutex<Vec<SourceSnapshot>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let writeback: Writeback = Arc::new(move |_request: LoadRequest, snapshot: SourceSnapshot| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(snapshot);
            }
            .boxed()
        });
        (writeback, seen)
    }

    #[tokio::test]
    async fn test_switch_aborts_superseded_load() {
        let (registry, gate) = gated();
        let (writeback, seen) = recording();
        let refresher = SourceRefresher::new(registry, writeback);

        refresher.dispatch(request(json!(1), SourceConcurrency::Switch));
        tokio::task::yield_now().await;
        refresher.dispatch(request(json!(2), SourceConcurrency::Switch));
        gate.send_replace(true);
        refresher.wait_idle().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].data, json!({"for": 2}));
    }

    #[tokio::test]
    async fn test_exhaust_trailing_runs_latest_pending_key() {
        let (registry, gate) = gated();
        let (writeback, seen) = recording();
        let refresher = SourceRefresher::new(registry, writeback);

        refresher.dispatch(request(json!(1), SourceConcurrency::ExhaustTrailing));
        tokio::task::yield_now().await;
        refresher.dispatch(request(json!(2), SourceConcurrency::ExhaustTrailing));
        refresher.dispatch(request(json!(3), SourceConcurrency::ExhaustTrailing));
        gate.send_replace(true);
        refresher.wait_idle().await;

        let data: Vec<Value> = seen.lock().unwrap().iter().map(|s| s.data.clone()).collect();
        assert_eq!(data, vec![json!({"for": 1}), json!({"for": 3})]);
    }

    #[tokio::test]
    async fn test_missing_loader_writes_error_snapshot() {
        let (writeback, seen) = recording();
        let refresher = SourceRefresher::new(Arc::new(ResourceRegistry::new()), writeback);
        refresher.dispatch(request(json!(1), SourceConcurrency::Switch));
        refresher.wait_idle().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].status, SourceStatus::Error);
    }
}
