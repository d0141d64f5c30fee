//! Transaction-log CDC for relational servers exposing a change-table API.
//!
//! Positions are opaque 10-byte log sequence numbers ordered byte-wise
//! unsigned. Each poll asks the server for every change between the
//! checkpointed LSN and the current tip, with both update images, then drops
//! the update-old rows.

use std::cmp::Ordering;
use std::fmt::Display;

use chrono::{DateTime, Utc};

use crate::cdc::capture::{ChangeEvent, ChangeFeed};
use crate::cdc::{CdcOperation, CdcRecord};
use crate::error::{CdcError, SerializationError};

/// A 10-byte log sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub [u8; 10]);

impl Lsn {
    pub const ZERO: Lsn = Lsn([0; 10]);

    pub fn to_hex(self) -> String {
        self.0.iter().map(|b| format!("{b:02X}")).collect()
    }

    pub fn from_hex(text: &str) -> Result<Self, SerializationError> {
        let text = text.trim();
        if text.len() != 20 || !text.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(SerializationError::Invalid(format!(
                "not a 10-byte LSN: {text:?}"
            )));
        }
        let mut bytes = [0u8; 10];
        for (i, chunk) in text.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).expect("chunk of an ascii string");
            bytes[i] = u8::from_str_radix(hex, 16)
                .map_err(|_| SerializationError::Invalid(format!("not hex: {hex:?}")))?;
        }
        Ok(Lsn(bytes))
    }
}

impl Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Null-aware LSN comparison: an absent LSN sorts before every present one.
pub fn compare_lsn(a: Option<&Lsn>, b: Option<&Lsn>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.cmp(b),
    }
}

/// One row returned by the server's change-listing function.
#[derive(Debug, Clone)]
pub struct LogChangeRow {
    pub sequence: Lsn,
    /// Server operation code (1 delete-old, 2 insert, 3 update-old,
    /// 4 update-new, 5 delete-new).
    pub operation: i32,
    pub change_time: Option<DateTime<Utc>>,
    pub data: serde_json::Map<String, serde_json::Value>,
}

/// Abstract binding to the relational server.
pub trait TransactionLogClient: Send + 'static {
    /// Create the capture instance for the table. Answer
    /// [`CdcError::AlreadyConfigured`] when it exists.
    fn enable_capture(&mut self, schema: &str, table: &str) -> Result<(), CdcError>;

    /// The newest LSN in the log, `None` while the log is empty.
    fn max_lsn(&mut self) -> Result<Option<Lsn>, CdcError>;

    /// Every change of the capture instance in `[from, to]`, with both
    /// update images, in log order.
    fn changes_between(
        &mut self,
        capture_instance: &str,
        from: &Lsn,
        to: &Lsn,
    ) -> Result<Vec<LogChangeRow>, CdcError>;

    fn scan_table(
        &mut self,
        schema: &str,
        table: &str,
    ) -> Result<Vec<serde_json::Map<String, serde_json::Value>>, CdcError>;
}

pub struct TransactionLogFeed<C: TransactionLogClient> {
    client: C,
    schema: String,
    table: String,
}

impl<C: TransactionLogClient> TransactionLogFeed<C> {
    pub fn new(client: C, schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            client,
            schema: schema.into(),
            table: table.into(),
        }
    }

    fn capture_instance(&self) -> String {
        format!("{}_{}", self.schema, self.table)
    }

    fn map_operation(code: i32) -> Option<CdcOperation> {
        match code {
            1 => Some(CdcOperation::DeleteOld),
            2 => Some(CdcOperation::Insert),
            3 => None, // update-old image, filtered out
            4 => Some(CdcOperation::Update),
            5 => Some(CdcOperation::Delete),
            _ => Some(CdcOperation::Unknown),
        }
    }
}

impl<C: TransactionLogClient> ChangeFeed for TransactionLogFeed<C> {
    fn scope(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    fn configure_server(&mut self) -> Result<(), CdcError> {
        self.client.enable_capture(&self.schema, &self.table)
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
        Ok(self.client.max_lsn()?.map(Lsn::to_hex))
    }

    fn fetch_changes(&mut self, since: Option<&str>) -> Result<Vec<ChangeEvent>, CdcError> {
        let Some(to) = self.client.max_lsn()? else {
            return Ok(Vec::new());
        };
        let from = match since {
            Some(text) => Lsn::from_hex(text).map_err(CdcError::Malformed)?,
            None => Lsn::ZERO,
        };
        if compare_lsn(Some(&from), Some(&to)) == Ordering::Greater {
            return Ok(Vec::new());
        }
        let rows = self
            .client
            .changes_between(&self.capture_instance(), &from, &to)?;
        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(operation) = Self::map_operation(row.operation) else {
                continue;
            };
            let mut record = CdcRecord::new(operation, row.data);
            if let Some(change_time) = row.change_time {
                record.change_time = change_time;
            }
            events.push(ChangeEvent {
                position: Some(row.sequence.to_hex()),
                record: Ok(record),
            });
        }
        Ok(events)
    }
}
