//! Running totals per user, split into a live branch and an audit branch.
//!
//! ```text
//! cargo run --example running_totals
//! ```

use std::sync::Arc;
use std::time::Duration;

use rillflow::prelude::*;

#[derive(Debug, Clone)]
struct Purchase {
    user: &'static str,
    amount: i64,
}

fn main() {
    env_logger::init();

    let totals: SharedStore<&'static str, i64> = Arc::new(InMemoryStore::new("totals"));
    let (tx, source) = ChannelSource::new();

    let mut stream = StreamBuilder::create("purchases")
        .source(source)
        .filter(|p: &Purchase| p.amount > 0)
        .aggregate_in(|p: &Purchase| p.user, |acc, p| acc + p.amount, totals.clone())
        .add_branch("live", |b| {
            b.sink(|(user, total)| println!("{user} is now at {total}"))
        })
        .add_branch("big-spenders", |b| {
            b.filter(|(_, total): &(&'static str, i64)| *total >= 100)
                .sink(|(user, total)| println!("ALERT {user} crossed 100 ({total})"))
        })
        .build();

    stream.start().unwrap();

    for purchase in [
        Purchase { user: "ada", amount: 30 },
        Purchase { user: "grace", amount: 80 },
        Purchase { user: "ada", amount: 90 },
        Purchase { user: "grace", amount: 15 },
    ] {
        tx.send(purchase).unwrap();
    }
    drop(tx);

    std::thread::sleep(Duration::from_millis(300));
    stream.stop().unwrap();

    println!("final state: {:?}", totals.keys().unwrap());
}
