//! Document change-stream CDC.
//!
//! Positions are the server-supplied resume tokens, serialized as JSON text.
//! Inserts, updates and replaces carry the full document; deletes carry the
//! primary-key document. The position checkpoint advances only after the
//! batch has been emitted, like every other feed.

use chrono::{DateTime, Utc};

use crate::cdc::capture::{ChangeEvent, ChangeFeed};
use crate::cdc::{CdcOperation, CdcRecord};
use crate::error::{CdcError, SerializationError};

/// One event from the change cursor.
#[derive(Debug, Clone)]
pub struct DocumentChange {
    /// Token marking this change; `None` when the server did not attach one.
    pub resume_token: Option<serde_json::Value>,
    /// Server operation type (`insert`, `update`, `replace`, `delete`, ...).
    pub operation: String,
    pub full_document: Option<serde_json::Map<String, serde_json::Value>>,
    pub document_key: Option<serde_json::Map<String, serde_json::Value>>,
    pub change_time: Option<DateTime<Utc>>,
}

/// Abstract binding to the document database.
pub trait ChangeStreamClient: Send + 'static {
    /// The newest resume token of the collection, to seed the checkpoint.
    fn latest_token(
        &mut self,
        database: &str,
        collection: &str,
    ) -> Result<Option<serde_json::Value>, CdcError>;

    /// Open/advance the change cursor. `full_document_lookup` asks the
    /// server to attach the post-image on updates.
    fn poll_changes(
        &mut self,
        database: &str,
        collection: &str,
        resume_after: Option<&serde_json::Value>,
        full_document_lookup: bool,
    ) -> Result<Vec<DocumentChange>, CdcError>;

    fn scan_collection(
        &mut self,
        database: &str,
        collection: &str,
    ) -> Result<Vec<serde_json::Map<String, serde_json::Value>>, CdcError>;
}

pub struct ChangeStreamFeed<C: ChangeStreamClient> {
    client: C,
    database: String,
    collection: String,
    full_document_lookup: bool,
}

impl<C: ChangeStreamClient> ChangeStreamFeed<C> {
    pub fn new(
        client: C,
        database: impl Into<String>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            client,
            database: database.into(),
            collection: collection.into(),
            full_document_lookup: true,
        }
    }

    pub fn with_full_document_lookup(mut self, lookup: bool) -> Self {
        self.full_document_lookup = lookup;
        self
    }

    fn decode_change(change: DocumentChange) -> Result<CdcRecord, SerializationError> {
        let DocumentChange {
            operation,
            full_document,
            document_key,
            change_time,
            ..
        } = change;
        let (operation, data) = match operation.to_ascii_lowercase().as_str() {
            "insert" => (CdcOperation::Insert, full_document),
            "update" => (CdcOperation::Update, full_document),
            "replace" => (CdcOperation::Replace, full_document),
            "delete" => (CdcOperation::Delete, document_key),
            other => {
                tracing::debug!("change stream: unhandled operation type {}", other.to_uppercase());
                (CdcOperation::Unknown, full_document.or(document_key))
            }
        };
        let data = data.ok_or_else(|| {
            SerializationError::Invalid("change event without document payload".to_string())
        })?;
        let mut record = CdcRecord::new(operation, data);
        if let Some(change_time) = change_time {
            record.change_time = change_time;
        }
        Ok(record)
    }
}

impl<C: ChangeStreamClient> ChangeFeed for ChangeStreamFeed<C> {
    fn scope(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }

    fn initial_scan(
        &mut self,
        sink: &mut dyn FnMut(CdcRecord) -> Result<(), CdcError>,
    ) -> Result<(), CdcError> {
        for document in self
            .client
            .scan_collection(&self.database, &self.collection)?
        {
            sink(CdcRecord::new(CdcOperation::InitialLoad, document))?;
        }
        Ok(())
    }

    fn current_position(&mut self) -> Result<Option<String>, CdcError> {
        let token = self.client.latest_token(&self.database, &self.collection)?;
        Ok(token.map(|t| t.to_string()))
    }

    fn fetch_changes(&mut self, since: Option<&str>) -> Result<Vec<ChangeEvent>, CdcError> {
        let resume_after = match since {
            Some(raw) => Some(
                serde_json::from_str::<serde_json::Value>(raw)
                    .map_err(|e| CdcError::Malformed(SerializationError::Json(e)))?,
            ),
            None => None,
        };
        let changes = self.client.poll_changes(
            &self.database,
            &self.collection,
            resume_after.as_ref(),
            self.full_document_lookup,
        )?;
        Ok(changes
            .into_iter()
            .map(|change| ChangeEvent {
                position: change.resume_token.as_ref().map(|t| t.to_string()),
                record: Self::decode_change(change),
            })
            .collect())
    }
}
