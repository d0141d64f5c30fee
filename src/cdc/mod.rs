//! Change-data-capture sources.
//!
//! Every concrete source is the generic capture engine in [`capture`] driven
//! by a backend-specific [`ChangeFeed`](capture::ChangeFeed): the transaction
//! log of a relational server, a logical-replication slot with a wal2json
//! plug-in, or a document change stream. The engine owns the checkpointing,
//! the adjacent duplicate suppression and the back-off policy; the feeds own
//! the wire formats.

use base64::Engine;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{SerializationError, StateBackendError};
use crate::store::SharedStore;

pub use capture::{CdcSource, ChangeEvent, ChangeFeed};
pub use docstream::{ChangeStreamClient, ChangeStreamFeed, DocumentChange};
pub use translog::{compare_lsn, LogChangeRow, Lsn, TransactionLogClient, TransactionLogFeed};
pub use wal2json::{
    LogicalReplicationFeed, ReplicaIdentity, ReplicationSlotClient, SlotMessage,
};

mod capture;
mod docstream;
mod translog;
mod wal2json;

/// Row-level operation carried by a [`CdcRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CdcOperation {
    InitialLoad,
    Insert,
    Update,
    Replace,
    Delete,
    UpdateOld,
    DeleteOld,
    Unknown,
}

/// One captured row/document change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdcRecord {
    pub operation: CdcOperation,
    /// Column (or field) name to primitive value.
    pub data: serde_json::Map<String, serde_json::Value>,
    pub change_time: DateTime<Utc>,
}

impl CdcRecord {
    pub fn new(
        operation: CdcOperation,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            operation,
            data,
            change_time: Utc::now(),
        }
    }

    /// Deserialize the payload into a user type.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<TypedCdcRecord<T>, SerializationError> {
        let data = serde_json::from_value(serde_json::Value::Object(self.data))?;
        Ok(TypedCdcRecord {
            operation: self.operation,
            data,
            change_time: self.change_time,
        })
    }
}

/// A [`CdcRecord`] whose payload has been deserialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedCdcRecord<T> {
    pub operation: CdcOperation,
    pub data: T,
    pub change_time: DateTime<Utc>,
}

/// Base64 MD5 over the key-sorted `k=v;k=v` rendering of the payload.
///
/// Strings render unquoted and nulls as the literal `null`, which keeps the
/// hash stable across serializer quirks.
pub fn record_hash(data: &serde_json::Map<String, serde_json::Value>) -> String {
    let mut pairs: Vec<(&String, &serde_json::Value)> = data.iter().collect();
    pairs.sort_by_key(|(k, _)| k.as_str());
    let canonical = pairs
        .iter()
        .map(|(k, v)| {
            let rendered = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("{k}={rendered}")
        })
        .collect::<Vec<_>>()
        .join(";");
    let digest = Md5::digest(canonical.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(digest)
}

/// Configuration of a CDC source instance.
#[derive(Debug, Clone)]
pub struct CdcSettings {
    /// `<namespace>.<name>`, the checkpoint namespace of this instance.
    pub source_id: String,
    pub do_initial_load: bool,
    pub poll_interval: Duration,
    pub max_backoff: Duration,
    /// Idempotently create the server-side capture artefacts on start.
    pub configure_on_server: bool,
}

impl CdcSettings {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            do_initial_load: true,
            poll_interval: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            configure_on_server: false,
        }
    }
}

/// Typed accessors over the three checkpoint keys of one source instance and
/// capture scope (`<schema>.<table>` or `<db>.<collection>`).
#[derive(Clone)]
pub struct Checkpoints {
    store: SharedStore<String, String>,
    prefix: String,
}

impl Checkpoints {
    pub fn new(store: SharedStore<String, String>, source_id: &str, scope: &str) -> Self {
        Self {
            store,
            prefix: format!("{source_id}.{scope}"),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}.{}", self.prefix, name)
    }

    pub fn initial_load_done(&self) -> Result<bool, StateBackendError> {
        Ok(self
            .store
            .get(&self.key("initial_load_done"))?
            .map(|v| v == "true")
            .unwrap_or(false))
    }

    pub fn set_initial_load_done(&self) -> Result<(), StateBackendError> {
        self.store
            .put(self.key("initial_load_done"), "true".to_string())
    }

    pub fn position(&self) -> Result<Option<String>, StateBackendError> {
        self.store.get(&self.key("position"))
    }

    pub fn set_position(&self, position: &str) -> Result<(), StateBackendError> {
        self.store.put(self.key("position"), position.to_string())
    }

    pub fn last_hash(&self) -> Result<Option<String>, StateBackendError> {
        self.store.get(&self.key("last_record_hash"))
    }

    pub fn set_last_hash(&self, hash: &str) -> Result<(), StateBackendError> {
        self.store.put(self.key("last_record_hash"), hash.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn hash_ignores_insertion_order() {
        let a = map(&[("b", json!(2)), ("a", json!(1))]);
        let b = map(&[("a", json!(1)), ("b", json!(2))]);
        assert_eq!(record_hash(&a), record_hash(&b));
    }

    #[test]
    fn hash_distinguishes_values() {
        let a = map(&[("a", json!(1))]);
        let b = map(&[("a", json!(2))]);
        assert_ne!(record_hash(&a), record_hash(&b));
    }

    #[test]
    fn hash_renders_nulls_and_strings_bare() {
        // "x=null;y=text" both as the null literal and the raw string
        let with_null = map(&[("x", serde_json::Value::Null), ("y", json!("text"))]);
        let spelled_out = map(&[("x", json!("null")), ("y", json!("text"))]);
        assert_eq!(record_hash(&with_null), record_hash(&spelled_out));
    }
}
