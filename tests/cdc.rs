use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use rillflow::cdc::{
    record_hash, CdcOperation, CdcRecord, CdcSettings, CdcSource, ChangeEvent, ChangeFeed,
    Checkpoints, LogChangeRow, Lsn, TransactionLogClient, TransactionLogFeed,
};
use rillflow::error::{CdcError, SerializationError};
use rillflow::prelude::*;

type Payload = serde_json::Map<String, serde_json::Value>;

fn payload(pairs: &[(&str, serde_json::Value)]) -> Payload {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn ok_event(position: &str, data: Payload) -> ChangeEvent {
    ChangeEvent {
        position: Some(position.to_string()),
        record: Ok(CdcRecord::new(CdcOperation::Insert, data)),
    }
}

struct ScriptedFeed {
    rows: Vec<Payload>,
    batches: Arc<Mutex<VecDeque<Vec<ChangeEvent>>>>,
    tip: Option<String>,
}

impl ScriptedFeed {
    fn new(rows: Vec<Payload>, batches: Vec<Vec<ChangeEvent>>, tip: Option<&str>) -> Self {
        Self {
            rows,
            batches: Arc::new(Mutex::new(batches.into())),
            tip: tip.map(str::to_string),
        }
    }
}

impl ChangeFeed for ScriptedFeed {
    fn scope(&self) -> String {
        "db.tbl".to_string()
    }

    fn initial_scan(
        &mut self,
        sink: &mut dyn FnMut(CdcRecord) -> Result<(), CdcError>,
    ) -> Result<(), CdcError> {
        for row in &self.rows {
            sink(CdcRecord::new(CdcOperation::InitialLoad, row.clone()))?;
        }
        Ok(())
    }

    fn current_position(&mut self) -> Result<Option<String>, CdcError> {
        Ok(self.tip.clone())
    }

    fn fetch_changes(&mut self, _since: Option<&str>) -> Result<Vec<ChangeEvent>, CdcError> {
        Ok(self.batches.lock().pop_front().unwrap_or_default())
    }
}

fn run_source(
    feed: ScriptedFeed,
    settings: CdcSettings,
    checkpoint_store: SharedStore<String, String>,
) -> Vec<CdcRecord> {
    let (sink, collected) = CollectVecSink::new();
    let mut stream = StreamBuilder::create("cdc")
        .source(CdcSource::new(settings, feed, checkpoint_store))
        .sink_op(sink)
        .build();
    stream.start().unwrap();
    std::thread::sleep(Duration::from_millis(150));
    stream.stop().unwrap();
    collected.snapshot()
}

fn fast_settings() -> CdcSettings {
    let mut settings = CdcSettings::new("src-1");
    settings.do_initial_load = false;
    settings.poll_interval = Duration::from_millis(10);
    settings
}

#[test]
fn adjacent_duplicates_collapse_to_one_emission() {
    let row = payload(&[("id", json!(1)), ("name", json!("ada"))]);
    let feed = ScriptedFeed::new(
        Vec::new(),
        vec![vec![
            ok_event("01", row.clone()),
            ok_event("02", row.clone()),
            ok_event("03", row.clone()),
        ]],
        Some("00"),
    );
    let store: SharedStore<String, String> = Arc::new(InMemoryStore::new("checkpoints"));

    let emitted = run_source(feed, fast_settings(), store.clone());
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].data["name"], json!("ada"));

    let checkpoints = Checkpoints::new(store.clone(), "src-1", "db.tbl");
    assert_eq!(checkpoints.position().unwrap().as_deref(), Some("03"));
    assert_eq!(
        checkpoints.last_hash().unwrap().as_deref(),
        Some(record_hash(&row).as_str())
    );

    // restart with the checkpoints preserved and no new changes
    let feed = ScriptedFeed::new(Vec::new(), Vec::new(), Some("03"));
    let emitted = run_source(feed, fast_settings(), store);
    assert!(emitted.is_empty());
}

#[test]
fn distinct_consecutive_changes_all_flow_through() {
    let feed = ScriptedFeed::new(
        Vec::new(),
        vec![vec![
            ok_event("01", payload(&[("id", json!(1))])),
            ok_event("02", payload(&[("id", json!(2))])),
            ok_event("03", payload(&[("id", json!(1))])),
        ]],
        Some("00"),
    );
    let store: SharedStore<String, String> = Arc::new(InMemoryStore::new("checkpoints"));
    let emitted = run_source(feed, fast_settings(), store);

    // non-adjacent duplicates are deliberately both emitted
    assert_eq!(emitted.len(), 3);
    for pair in emitted.windows(2) {
        assert_ne!(record_hash(&pair[0].data), record_hash(&pair[1].data));
    }
}

#[test]
fn initial_load_runs_at_most_once_across_restarts() {
    let rows = vec![
        payload(&[("id", json!(1))]),
        payload(&[("id", json!(2))]),
    ];
    let store: SharedStore<String, String> = Arc::new(InMemoryStore::new("checkpoints"));
    let mut settings = fast_settings();
    settings.do_initial_load = true;

    let emitted = run_source(
        ScriptedFeed::new(rows.clone(), Vec::new(), Some("0A")),
        settings.clone(),
        store.clone(),
    );
    assert_eq!(emitted.len(), 2);
    assert!(emitted
        .iter()
        .all(|r| r.operation == CdcOperation::InitialLoad));

    let checkpoints = Checkpoints::new(store.clone(), "src-1", "db.tbl");
    assert!(checkpoints.initial_load_done().unwrap());
    // position was seeded at the server tip so only future changes flow
    assert_eq!(checkpoints.position().unwrap().as_deref(), Some("0A"));

    let emitted = run_source(
        ScriptedFeed::new(rows, Vec::new(), Some("0A")),
        settings,
        store,
    );
    assert!(emitted.is_empty());
}

#[test]
fn malformed_events_are_skipped_but_their_position_advances() {
    let row = payload(&[("id", json!(7))]);
    let feed = ScriptedFeed::new(
        Vec::new(),
        vec![vec![
            ok_event("01", row.clone()),
            ChangeEvent {
                position: Some("02".to_string()),
                record: Err(SerializationError::Invalid("torn page".to_string())),
            },
            // same payload as the first event: still adjacent, still suppressed
            ok_event("03", row.clone()),
        ]],
        Some("00"),
    );
    let store: SharedStore<String, String> = Arc::new(InMemoryStore::new("checkpoints"));
    let emitted = run_source(feed, fast_settings(), store.clone());

    assert_eq!(emitted.len(), 1);
    let checkpoints = Checkpoints::new(store, "src-1", "db.tbl");
    assert_eq!(checkpoints.position().unwrap().as_deref(), Some("03"));
    assert_eq!(
        checkpoints.last_hash().unwrap().as_deref(),
        Some(record_hash(&row).as_str())
    );
}

#[test]
fn failing_feed_backs_off_and_stops_promptly() {
    struct BrokenFeed;

    impl ChangeFeed for BrokenFeed {
        fn scope(&self) -> String {
            "db.broken".to_string()
        }

        fn initial_scan(
            &mut self,
            _sink: &mut dyn FnMut(CdcRecord) -> Result<(), CdcError>,
        ) -> Result<(), CdcError> {
            Ok(())
        }

        fn current_position(&mut self) -> Result<Option<String>, CdcError> {
            Ok(None)
        }

        fn fetch_changes(&mut self, _since: Option<&str>) -> Result<Vec<ChangeEvent>, CdcError> {
            Err(CdcError::Transient("connection refused".to_string()))
        }
    }

    let store: SharedStore<String, String> = Arc::new(InMemoryStore::new("checkpoints"));
    let (sink, collected) = CollectVecSink::new();
    let mut stream = StreamBuilder::create("broken")
        .source(CdcSource::new(fast_settings(), BrokenFeed, store))
        .sink_op(sink)
        .build();
    stream.start().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    // the worker is mid back-off sleep; stop must interrupt it
    stream.stop().unwrap();
    assert!(collected.is_empty());
}

// ---------------------------------------------------------------------------
// Transaction-log feed against a scripted client
// ---------------------------------------------------------------------------

struct ScriptedLog {
    tip: Option<Lsn>,
    rows: Vec<LogChangeRow>,
    capture_exists: bool,
}

impl TransactionLogClient for ScriptedLog {
    fn enable_capture(&mut self, _schema: &str, _table: &str) -> Result<(), CdcError> {
        if self.capture_exists {
            return Err(CdcError::AlreadyConfigured);
        }
        self.capture_exists = true;
        Ok(())
    }

    fn max_lsn(&mut self) -> Result<Option<Lsn>, CdcError> {
        Ok(self.tip)
    }

    fn changes_between(
        &mut self,
        _capture_instance: &str,
        from: &Lsn,
        to: &Lsn,
    ) -> Result<Vec<LogChangeRow>, CdcError> {
        Ok(self
            .rows
            .iter()
            .filter(|r| r.sequence > *from && r.sequence <= *to)
            .cloned()
            .collect())
    }

    fn scan_table(&mut self, _schema: &str, _table: &str) -> Result<Vec<Payload>, CdcError> {
        Ok(Vec::new())
    }
}

fn log_row(seq: u8, operation: i32, id: i64) -> LogChangeRow {
    let mut sequence = [0u8; 10];
    sequence[9] = seq;
    LogChangeRow {
        sequence: Lsn(sequence),
        operation,
        change_time: None,
        data: payload(&[("id", json!(id))]),
    }
}

#[test]
fn translog_feed_maps_operation_codes_and_drops_update_old() {
    let client = ScriptedLog {
        tip: Some(Lsn([0, 0, 0, 0, 0, 0, 0, 0, 0, 9])),
        rows: vec![
            log_row(1, 2, 1),  // insert
            log_row(2, 3, 1),  // update-old image, filtered
            log_row(3, 4, 2),  // update-new
            log_row(4, 5, 3),  // delete
            log_row(5, 1, 4),  // delete-old
        ],
        capture_exists: true,
    };
    let feed = TransactionLogFeed::new(client, "dbo", "orders");
    let store: SharedStore<String, String> = Arc::new(InMemoryStore::new("checkpoints"));
    // an earlier run left a position behind; capture resumes from there
    Checkpoints::new(store.clone(), "sql-1", "dbo.orders")
        .set_position(&Lsn::ZERO.to_hex())
        .unwrap();

    let mut settings = CdcSettings::new("sql-1");
    settings.do_initial_load = false;
    settings.poll_interval = Duration::from_millis(10);
    settings.configure_on_server = true; // AlreadyConfigured must be swallowed

    let (sink, collected) = CollectVecSink::new();
    let mut stream = StreamBuilder::create("translog")
        .source(CdcSource::new(settings, feed, store.clone()))
        .sink_op(sink)
        .build();
    stream.start().unwrap();
    std::thread::sleep(Duration::from_millis(150));
    stream.stop().unwrap();

    let operations: Vec<CdcOperation> =
        collected.snapshot().iter().map(|r| r.operation).collect();
    assert_eq!(
        operations,
        vec![
            CdcOperation::Insert,
            CdcOperation::Update,
            CdcOperation::Delete,
            CdcOperation::DeleteOld,
        ]
    );

    let checkpoints = Checkpoints::new(store, "sql-1", "dbo.orders");
    assert_eq!(
        checkpoints.position().unwrap().as_deref(),
        Some("00000000000000000005")
    );
}

#[test]
fn typed_records_deserialize_their_payload() {
    #[derive(Debug, PartialEq, serde::Deserialize)]
    struct User {
        id: i64,
        name: String,
    }

    let record = CdcRecord::new(
        CdcOperation::Insert,
        payload(&[("id", json!(3)), ("name", json!("grace"))]),
    );
    let typed = record.into_typed::<User>().unwrap();
    assert_eq!(typed.operation, CdcOperation::Insert);
    assert_eq!(
        typed.data,
        User {
            id: 3,
            name: "grace".to_string()
        }
    );
}
