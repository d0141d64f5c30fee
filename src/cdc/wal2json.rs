//! Logical-replication CDC over a wal2json-style slot.
//!
//! Positions are opaque text LSNs. Every slot message carries a JSON payload
//! of the form `{ "change": [{ "kind", "columnnames", "columnvalues",
//! "oldkeys"? }, ...] }`. Deletes without column arrays fall back to the old
//! key images.

use serde::Deserialize;

use crate::cdc::capture::{ChangeEvent, ChangeFeed};
use crate::cdc::{CdcOperation, CdcRecord};
use crate::error::{CdcError, SerializationError};

/// Row image kept for replicated updates/deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaIdentity {
    Default,
    Full,
}

/// One message pulled from the slot.
#[derive(Debug, Clone)]
pub struct SlotMessage {
    pub lsn: String,
    pub payload: String,
}

/// Abstract binding to the replication server.
pub trait ReplicationSlotClient: Send + 'static {
    /// Create the logical slot. Answer [`CdcError::AlreadyConfigured`] when
    /// it exists.
    fn create_slot(&mut self, slot: &str) -> Result<(), CdcError>;

    fn current_lsn(&mut self) -> Result<Option<String>, CdcError>;

    /// All slot messages after `since`, in log order.
    fn slot_changes(
        &mut self,
        slot: &str,
        since: Option<&str>,
    ) -> Result<Vec<SlotMessage>, CdcError>;

    fn set_replica_identity(
        &mut self,
        schema: &str,
        table: &str,
        identity: ReplicaIdentity,
    ) -> Result<(), CdcError>;

    fn scan_table(
        &mut self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<serde_json::Map<String, serde_json::Value>>, CdcError>;
}

#[derive(Debug, Deserialize)]
struct WalDocument {
    #[serde(default)]
    change: Vec<WalChange>,
}

#[derive(Debug, Deserialize)]
struct WalChange {
    kind: String,
    #[serde(default)]
    columnnames: Vec<String>,
    #[serde(default)]
    columnvalues: Vec<serde_json::Value>,
    #[serde(default)]
    oldkeys: Option<WalOldKeys>,
}

#[derive(Debug, Deserialize)]
struct WalOldKeys {
    #[serde(default)]
    keynames: Vec<String>,
    #[serde(default)]
    keyvalues: Vec<serde_json::Value>,
}

pub struct LogicalReplicationFeed<C: ReplicationSlotClient> {
    client: C,
    schema: String,
    table: String,
    slot: String,
    replica_identity: Option<ReplicaIdentity>,
    identity_applied: bool,
}

impl<C: ReplicationSlotClient> LogicalReplicationFeed<C> {
    pub fn new(
        client: C,
        schema: impl Into<String>,
        table: impl Into<String>,
        slot: impl Into<String>,
    ) -> Self {
        Self {
            client,
            schema: schema.into(),
            table: table.into(),
            slot: slot.into(),
            replica_identity: None,
            identity_applied: false,
        }
    }

    /// Run `ALTER TABLE .. REPLICA IDENTITY ..` before the first read.
    pub fn with_replica_identity(mut self, identity: ReplicaIdentity) -> Self {
        self.replica_identity = Some(identity);
        self
    }

    fn decode_payload(payload: &str) -> Result<Vec<CdcRecord>, SerializationError> {
        let document: WalDocument = serde_json::from_str(payload)?;
        let mut records = Vec::with_capacity(document.change.len());
        for change in document.change {
            records.push(Self::decode_change(change)?);
        }
        Ok(records)
    }

    fn decode_change(change: WalChange) -> Result<CdcRecord, SerializationError> {
        let operation = match change.kind.to_ascii_lowercase().as_str() {
            "insert" => CdcOperation::Insert,
            "update" => CdcOperation::Update,
            "delete" => CdcOperation::Delete,
            _ => CdcOperation::Unknown,
        };
        let (names, values) = if change.columnnames.is_empty()
            && operation == CdcOperation::Delete
        {
            match change.oldkeys {
                Some(old) => (old.keynames, old.keyvalues),
                None => (Vec::new(), Vec::new()),
            }
        } else {
            (change.columnnames, change.columnvalues)
        };
        if names.len() != values.len() {
            return Err(SerializationError::Invalid(format!(
                "column name/value arity mismatch: {} names, {} values",
                names.len(),
                values.len()
            )));
        }
        let data = names.into_iter().zip(values).collect();
        Ok(CdcRecord::new(operation, data))
    }
}

impl<C: ReplicationSlotClient> ChangeFeed for LogicalReplicationFeed<C> {
    fn scope(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    fn configure_server(&mut self) -> Result<(), CdcError> {
        self.client.create_slot(&self.slot)
    }

    fn initial_scan(
        &mut self,
        sink: &mut dyn FnMut(CdcRecord) -> Result<(), CdcError>,
    ) -> Result<(), CdcError> {
        for row in self.client.scan_table(&self.schema, &self.table)? {
            sink(CdcRecord::new(CdcOperation::InitialLoad, row))?;
        }
        Ok(())
    }

    fn current_position(&mut self) -> Result<Option<String>, CdcError> {
        self.client.current_lsn()
    }

    fn fetch_changes(&mut self, since: Option<&str>) -> Result<Vec<ChangeEvent>, CdcError> {
        if let (false, Some(identity)) = (self.identity_applied, self.replica_identity) {
            self.client
                .set_replica_identity(&self.schema, &self.table, identity)?;
            self.identity_applied = true;
        }
        let messages = self.client.slot_changes(&self.slot, since)?;
        let mut events = Vec::new();
        for message in messages {
            match Self::decode_payload(&message.payload) {
                Ok(records) => {
                    for record in records {
                        events.push(ChangeEvent {
                            position: Some(message.lsn.clone()),
                            record: Ok(record),
                        });
                    }
                }
                Err(e) => events.push(ChangeEvent {
                    position: Some(message.lsn.clone()),
                    record: Err(e),
                }),
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_insert_with_columns() {
        let payload = r#"{"change":[{"kind":"insert","columnnames":["id","name"],"columnvalues":[7,"ada"]}]}"#;
        let records = LogicalReplicationFeed::<NoClient>::decode_payload(payload).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation, CdcOperation::Insert);
        assert_eq!(records[0].data["id"], json!(7));
        assert_eq!(records[0].data["name"], json!("ada"));
    }

    #[test]
    fn delete_falls_back_to_old_keys() {
        let payload = r#"{"change":[{"kind":"delete","oldkeys":{"keynames":["id"],"keyvalues":[3]}}]}"#;
        let records = LogicalReplicationFeed::<NoClient>::decode_payload(payload).unwrap();
        assert_eq!(records[0].operation, CdcOperation::Delete);
        assert_eq!(records[0].data["id"], json!(3));
    }

    #[test]
    fn unknown_kind_maps_to_unknown() {
        let payload = r#"{"change":[{"kind":"truncate","columnnames":[],"columnvalues":[]}]}"#;
        let records = LogicalReplicationFeed::<NoClient>::decode_payload(payload).unwrap();
        assert_eq!(records[0].operation, CdcOperation::Unknown);
        assert!(records[0].data.is_empty());
    }

    #[test]
    fn arity_mismatch_is_an_error() {
        let payload =
            r#"{"change":[{"kind":"insert","columnnames":["id"],"columnvalues":[1,2]}]}"#;
        assert!(LogicalReplicationFeed::<NoClient>::decode_payload(payload).is_err());
    }

    struct NoClient;

    impl ReplicationSlotClient for NoClient {
        fn create_slot(&mut self, _slot: &str) -> Result<(), CdcError> {
            Ok(())
        }

        fn current_lsn(&mut self) -> Result<Option<String>, CdcError> {
            Ok(None)
        }

        fn slot_changes(
            &mut self,
            _slot: &str,
            _since: Option<&str>,
        ) -> Result<Vec<SlotMessage>, CdcError> {
            Ok(Vec::new())
        }

        fn set_replica_identity(
            &mut self,
            _schema: &str,
            _table: &str,
            _identity: ReplicaIdentity,
        ) -> Result<(), CdcError> {
            Ok(())
        }

        fn scan_table(
            &mut self,
            _schema: &str,
            _table: &str,
        ) -> Result<Vec<serde_json::Map<String, serde_json::Value>>, CdcError> {
            Ok(Vec::new())
        }
    }
}
