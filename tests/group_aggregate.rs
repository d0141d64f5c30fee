use std::sync::Arc;

use rillflow::prelude::*;

#[derive(Debug, Clone, PartialEq)]
struct Measure {
    k: &'static str,
    n: i64,
}

fn m(k: &'static str, n: i64) -> Measure {
    Measure { k, n }
}

#[test]
fn aggregate_emits_running_totals_and_folds_the_store() {
    let store: SharedStore<&'static str, i64> = Arc::new(InMemoryStore::new("totals"));
    let (sink, collected) = CollectVecSink::new();
    let mut stream = StreamBuilder::create("s2")
        .aggregate_in(|v: &Measure| v.k, |acc, v| acc + v.n, store.clone())
        .sink_op(sink)
        .build();
    stream.start().unwrap();
    for v in [m("a", 1), m("b", 2), m("a", 3), m("a", 4)] {
        stream.emit(v).unwrap();
    }
    stream.stop().unwrap();

    assert_eq!(
        collected.snapshot(),
        vec![("a", 1), ("b", 2), ("a", 4), ("a", 8)]
    );
    assert_eq!(store.get(&"a").unwrap(), Some(8));
    assert_eq!(store.get(&"b").unwrap(), Some(2));
    // no entry for a key that was never seen
    assert_eq!(store.get(&"c").unwrap(), None);
}

#[test]
fn aggregate_silently_forwards_the_input_unchanged() {
    let store: SharedStore<&'static str, i64> = Arc::new(InMemoryStore::new("totals"));
    let (sink, collected) = CollectVecSink::new();
    let mut stream = StreamBuilder::create("silent")
        .aggregate_silently_in(|v: &Measure| v.k, |acc, v| acc + v.n, store.clone())
        .sink_op(sink)
        .build();
    stream.start().unwrap();
    stream.emit(m("a", 5)).unwrap();
    stream.emit(m("a", 6)).unwrap();
    stream.stop().unwrap();

    assert_eq!(collected.snapshot(), vec![m("a", 5), m("a", 6)]);
    assert_eq!(store.get(&"a").unwrap(), Some(11));
}

#[test]
fn group_by_appends_and_forwards_the_current_list() {
    let store: SharedStore<&'static str, Vec<Measure>> = Arc::new(InMemoryStore::new("groups"));
    let (sink, collected) = CollectVecSink::new();
    let mut stream = StreamBuilder::create("grouped")
        .group_by_in(|v: &Measure| v.k, store.clone())
        .sink_op(sink)
        .build();
    stream.start().unwrap();
    stream.emit(m("a", 1)).unwrap();
    stream.emit(m("b", 2)).unwrap();
    stream.emit(m("a", 3)).unwrap();
    stream.stop().unwrap();

    assert_eq!(
        collected.snapshot(),
        vec![
            ("a", vec![m("a", 1)]),
            ("b", vec![m("b", 2)]),
            ("a", vec![m("a", 1), m("a", 3)]),
        ]
    );
    assert_eq!(store.get(&"a").unwrap(), Some(vec![m("a", 1), m("a", 3)]));
    // the stored state is the fold of the inputs under append
    assert_eq!(store.keys().unwrap().len(), 2);
}

#[test]
fn group_by_silently_mutates_state_only() {
    let store: SharedStore<&'static str, Vec<Measure>> = Arc::new(InMemoryStore::new("groups"));
    let (sink, collected) = CollectVecSink::new();
    let mut stream = StreamBuilder::create("silent-group")
        .group_by_silently_in(|v: &Measure| v.k, store.clone())
        .sink_op(sink)
        .build();
    stream.start().unwrap();
    stream.emit(m("a", 1)).unwrap();
    stream.emit(m("a", 2)).unwrap();
    stream.stop().unwrap();

    assert_eq!(collected.snapshot(), vec![m("a", 1), m("a", 2)]);
    assert_eq!(store.get(&"a").unwrap(), Some(vec![m("a", 1), m("a", 2)]));
}

#[test]
fn stateful_operators_expose_their_stores() {
    let store: SharedStore<&'static str, i64> = Arc::new(InMemoryStore::new("visible-store"));
    let stream = StreamBuilder::create("introspect")
        .aggregate_in(|v: &Measure| v.k, |acc, v| acc + v.n, store)
        .build();
    let names: Vec<String> = stream
        .state_stores()
        .into_iter()
        .map(|d| d.name)
        .collect();
    assert_eq!(names, vec!["visible-store".to_string()]);
}
