//! Source snapshots and load requests.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::domain::models::field_path::FieldPath;
use crate::domain::models::trait_spec::SourceConcurrency;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Idle,
    Loading,
    Success,
    Error,
}

/// Value stored at a source trait's output path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSnapshot {
    pub status: SourceStatus,
    pub key_hash: Option<String>,
    pub data: Value,
    pub error: Option<String>,
}

impl SourceSnapshot {
    pub const fn idle() -> Self {
        Self {
            status: SourceStatus::Idle,
            key_hash: None,
            data: Value::Null,
            error: None,
        }
    }

    pub fn loading(key_hash: impl Into<String>) -> Self {
        Self {
            status: SourceStatus::Loading,
            key_hash: Some(key_hash.into()),
            data: Value::Null,
            error: None,
        }
    }

    pub fn success(key_hash: impl Into<String>, data: Value) -> Self {
        Self {
            status: SourceStatus::Success,
            key_hash: Some(key_hash.into()),
            data,
            error: None,
        }
    }

    pub fn error(key_hash: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            status: SourceStatus::Error,
            key_hash: Some(key_hash.into()),
            data: Value::Null,
            error: Some(error.into()),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "status": self.status,
            "keyHash": self.key_hash,
            "data": self.data,
            "error": self.error,
        })
    }

    /// Key hash stored in a snapshot value, if the value looks like one.
    pub fn key_hash_of(value: &Value) -> Option<&str> {
        value.get("keyHash").and_then(Value::as_str)
    }
}

/// A load the engine asks the host to run after a pass commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadRequest {
    pub resource_id: String,
    pub field_path: FieldPath,
    pub key: Value,
    pub key_hash: String,
    pub concurrency: SourceConcurrency,
    pub step_id: u32,
}
