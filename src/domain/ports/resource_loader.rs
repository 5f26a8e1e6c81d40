use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Port for loading the data behind a source trait
///
/// The engine never performs I/O itself: it derives a key, hashes it and asks
/// the loader registered under the trait's resource id to resolve it. The
/// loader future may be aborted when a newer key supersedes it under the
/// `switch` concurrency policy.
///
/// # Examples
///
/// ```no_run
/// use async_trait::async_trait;
/// use serde_json::{json, Value};
/// use statetrait::domain::ports::ResourceLoader;
///
/// struct Profiles;
///
/// #[async_trait]
/// impl ResourceLoader for Profiles {
///     async fn load(&self, key: &Value) -> anyhow::Result<Value> {
///         Ok(json!({ "id": key }))
///     }
/// }
/// ```
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    /// Resolve `key` to the data stored in the source snapshot.
    async fn load(&self, key: &Value) -> Result<Value>;
}
