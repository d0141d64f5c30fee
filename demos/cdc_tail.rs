//! Tail an (in-memory, scripted) change feed and print every distinct change.
//!
//! Real deployments plug a database binding into one of the feed client
//! traits; the source logic is identical either way.
//!
//! ```text
//! cargo run --example cdc_tail
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rillflow::cdc::{ChangeEvent, ChangeFeed};
use rillflow::error::CdcError;
use rillflow::prelude::*;
use serde_json::json;

struct ScriptedFeed {
    batches: VecDeque<Vec<ChangeEvent>>,
}

impl ChangeFeed for ScriptedFeed {
    fn scope(&self) -> String {
        "shop.orders".to_string()
    }

    fn initial_scan(
        &mut self,
        sink: &mut dyn FnMut(CdcRecord) -> Result<(), CdcError>,
    ) -> Result<(), CdcError> {
        for id in 1..=2 {
            let mut row = serde_json::Map::new();
            row.insert("id".to_string(), json!(id));
            sink(CdcRecord::new(CdcOperation::InitialLoad, row))?;
        }
        Ok(())
    }

    fn current_position(&mut self) -> Result<Option<String>, CdcError> {
        Ok(Some("0".to_string()))
    }

    fn fetch_changes(&mut self, _since: Option<&str>) -> Result<Vec<ChangeEvent>, CdcError> {
        Ok(self.batches.pop_front().unwrap_or_default())
    }
}

fn change(position: &str, id: i64, status: &str) -> ChangeEvent {
    let mut row = serde_json::Map::new();
    row.insert("id".to_string(), json!(id));
    row.insert("status".to_string(), json!(status));
    ChangeEvent {
        position: Some(position.to_string()),
        record: Ok(CdcRecord::new(CdcOperation::Update, row)),
    }
}

fn main() {
    env_logger::init();

    let feed = ScriptedFeed {
        batches: VecDeque::from([vec![
            change("1", 1, "paid"),
            change("2", 1, "paid"), // adjacent duplicate, suppressed
            change("3", 2, "shipped"),
        ]]),
    };

    let checkpoints: SharedStore<String, String> = Arc::new(InMemoryStore::new("checkpoints"));
    let mut settings = CdcSettings::new("demo.orders");
    settings.poll_interval = Duration::from_millis(50);

    let mut stream = StreamBuilder::create("orders-cdc")
        .source(CdcSource::new(settings, feed, checkpoints))
        .sink(|record: CdcRecord| println!("{:?} {}", record.operation, json!(record.data)))
        .build();

    stream.start().unwrap();
    std::thread::sleep(Duration::from_millis(300));
    stream.stop().unwrap();
}
