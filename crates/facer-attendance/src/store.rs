//! Document store boundary.
//!
//! Binary blobs (enrollment templates) and JSON documents (users, sessions,
//! attendance records) addressed by slash-separated keys. Writes to
//! documents are merge-upserts: named fields are overwritten, the rest are
//! kept, and a missing document is created.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use thiserror::Error;

/// Top-level fields of a stored document.
pub type Fields = Map<String, Value>;

/// Field updates for [`DocumentStore::merge_document`].
pub type Update = BTreeMap<String, FieldValue>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] tokio_rusqlite::Error),
    #[error("document {key} is not a JSON object: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("store backend error: {0}")]
    Backend(String),
}

/// A field value in an update; `ServerTimestamp` is resolved by the store's clock.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Value(Value),
    ServerTimestamp,
}

macro_rules! field_value_from {
    ($($t:ty),*) => {
        $(impl From<$t> for FieldValue {
            fn from(v: $t) -> Self {
                FieldValue::Value(Value::from(v))
            }
        })*
    };
}

field_value_from!(Value, &str, String, bool, i64, f64);

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store `bytes` at `key`, replacing any previous blob.
    async fn put_blob(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    async fn get_document(&self, key: &str) -> Result<Option<Fields>, StoreError>;

    /// Create or update the document at `key` with the given fields.
    async fn merge_document(&self, key: &str, update: Update) -> Result<(), StoreError>;

    /// All documents whose key starts with `prefix`, ordered by key.
    async fn list_documents(&self, prefix: &str) -> Result<Vec<(String, Fields)>, StoreError>;
}

/// Storage keys shared by every store implementation.
pub mod keys {
    pub fn embedding(user_id: &str) -> String {
        format!("embeddings/{user_id}/embedding.bin")
    }

    pub fn user(user_id: &str) -> String {
        format!("users/{user_id}")
    }

    pub fn session(session_id: &str) -> String {
        format!("sessions/{session_id}")
    }

    pub fn attendance_prefix(session_id: &str) -> String {
        format!("sessions/{session_id}/attendance/")
    }

    pub fn attendance(session_id: &str, user_id: &str) -> String {
        format!("{}{user_id}", attendance_prefix(session_id))
    }
}

pub(crate) fn server_timestamp(now: DateTime<Utc>) -> Value {
    Value::String(now.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Apply `update` on top of `existing`, stamping server timestamps with `now`.
pub(crate) fn apply_update(existing: &mut Fields, update: Update, now: DateTime<Utc>) {
    for (field, value) in update {
        let value = match value {
            FieldValue::Value(v) => v,
            FieldValue::ServerTimestamp => server_timestamp(now),
        };
        existing.insert(field, value);
    }
}

/// In-process store for tests and single-run tools.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    documents: Mutex<BTreeMap<String, Fields>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document_count(&self) -> Result<usize, StoreError> {
        Ok(self.documents.lock().map_err(poisoned)?.len())
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Backend("memory store lock poisoned".into())
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get_blob(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.blobs.lock().map_err(poisoned)?.get(key).cloned())
    }

    async fn put_blob(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.blobs
            .lock()
            .map_err(poisoned)?
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get_document(&self, key: &str) -> Result<Option<Fields>, StoreError> {
        Ok(self.documents.lock().map_err(poisoned)?.get(key).cloned())
    }

    async fn merge_document(&self, key: &str, update: Update) -> Result<(), StoreError> {
        let mut docs = self.documents.lock().map_err(poisoned)?;
        let doc = docs.entry(key.to_string()).or_default();
        apply_update(doc, update, Utc::now());
        Ok(())
    }

    async fn list_documents(&self, prefix: &str) -> Result<Vec<(String, Fields)>, StoreError> {
        Ok(self
            .documents
            .lock()
            .map_err(poisoned)?
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
