use std::sync::Arc;

use parking_lot::Mutex;
use rillflow::prelude::*;

#[test]
fn join_emits_on_table_hits_and_drops_misses() {
    let table: SharedStore<&'static str, i64> = Arc::new(InMemoryStore::new("rates"));
    table.put("eur", 110).unwrap();

    let (sink, collected) = CollectVecSink::new();
    let mut stream = StreamBuilder::create("join")
        .join(table, |c: &(&'static str, i64)| c.0, |left, rate| left.1 * rate)
        .sink_op(sink)
        .build();
    stream.start().unwrap();
    stream.emit(("eur", 2)).unwrap();
    stream.emit(("gbp", 5)).unwrap(); // no table entry, dropped silently
    stream.emit(("eur", 3)).unwrap();
    stream.stop().unwrap();

    assert_eq!(collected.snapshot(), vec![220, 330]);
}

#[test]
fn join_observes_concurrent_table_writes() {
    let table: SharedStore<&'static str, i64> = Arc::new(InMemoryStore::new("rates"));
    let (sink, collected) = CollectVecSink::new();
    let mut stream = StreamBuilder::create("live-join")
        .join(table.clone(), |c: &(&'static str, i64)| c.0, |left, rate| {
            left.1 + rate
        })
        .sink_op(sink)
        .build();
    stream.start().unwrap();
    stream.emit(("k", 1)).unwrap();
    table.put("k", 100).unwrap();
    stream.emit(("k", 2)).unwrap();
    stream.stop().unwrap();

    assert_eq!(collected.snapshot(), vec![102]);
}

#[test]
fn fork_dispatches_to_every_branch_in_insertion_order() {
    let log: Arc<Mutex<Vec<(&'static str, i32)>>> = Arc::new(Mutex::new(Vec::new()));
    let first = log.clone();
    let second = log.clone();

    let mut stream = StreamBuilder::create("forked")
        .map(|x: i32| x * 2)
        .add_branch("first", move |b| {
            let first = first.clone();
            b.sink(move |x| first.lock().push(("first", x)))
        })
        .add_branch("second", move |b| {
            let second = second.clone();
            b.sink(move |x| second.lock().push(("second", x)))
        })
        .build();
    assert_eq!(
        stream.branches(),
        &["first".to_string(), "second".to_string()][..]
    );

    stream.start().unwrap();
    stream.emit(1).unwrap();
    stream.emit(2).unwrap();
    stream.stop().unwrap();

    assert_eq!(
        log.lock().clone(),
        vec![("first", 2), ("second", 2), ("first", 4), ("second", 4)]
    );
}

#[test]
fn branches_can_filter_and_transform_independently() {
    let (evens_sink, evens) = CollectVecSink::new();
    let (odds_sink, odds) = CollectVecSink::new();

    let mut stream = StreamBuilder::create("split")
        .add_branch("evens", move |b| {
            b.filter(|x: &i32| x % 2 == 0).sink_op(evens_sink)
        })
        .add_branch("odds", move |b| {
            b.filter(|x: &i32| x % 2 == 1)
                .map(|x| x * 10)
                .sink_op(odds_sink)
        })
        .build();
    stream.start().unwrap();
    for x in 1..=4 {
        stream.emit(x).unwrap();
    }
    stream.stop().unwrap();

    assert_eq!(evens.snapshot(), vec![2, 4]);
    assert_eq!(odds.snapshot(), vec![10, 30]);
}

#[test]
#[should_panic(expected = "already exists")]
fn duplicate_branch_names_are_rejected() {
    let _ = StreamBuilder::create("dup")
        .map(|x: i32| x)
        .add_branch("b", |b| b.sink(|_x| {}))
        .add_branch("b", |b| b.sink(|_x| {}));
}

#[test]
#[should_panic(expected = "already has a source")]
fn double_source_is_rejected() {
    let _ = StreamBuilder::create("twice")
        .source(IteratorSource::new(std::iter::empty::<i32>()))
        .source(IteratorSource::new(std::iter::empty::<i32>()));
}
