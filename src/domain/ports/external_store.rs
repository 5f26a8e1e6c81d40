use serde_json::Value;
use tokio::sync::watch;

/// Port for a value owned outside the module and mirrored into one field
///
/// The runtime subscribes once per external-store trait. The receiver's
/// current value is written at startup, and every later change is written
/// back in its own transaction. Changes that arrive while a writeback is in
/// progress coalesce into the latest value.
pub trait ExternalStore: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<Value>;
}

impl ExternalStore for watch::Sender<Value> {
    fn subscribe(&self) -> watch::Receiver<Value> {
        watch::Sender::subscribe(self)
    }
}
