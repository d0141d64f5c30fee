use std::time::Duration;

use rillflow::prelude::*;

#[test]
fn filter_map_sink_in_order() {
    let (sink, collected) = CollectVecSink::new();
    let mut stream = StreamBuilder::create("s1")
        .source(IteratorSource::new(1..=5))
        .filter(|x| x % 2 == 0)
        .map(|x| x * 10)
        .sink_op(sink)
        .build();
    stream.start().unwrap();
    // the iterator source runs on its own worker; give it room to finish
    std::thread::sleep(Duration::from_millis(200));
    stream.stop().unwrap();
    assert_eq!(collected.snapshot(), vec![20, 40]);
}

#[test]
fn flat_map_preserves_order_and_skips_empty() {
    let (sink, collected) = CollectVecSink::new();
    let mut stream = StreamBuilder::create("flat")
        .source(IteratorSource::new(vec![1, 2, 3].into_iter()))
        .flat_map(|x: i32| {
            if x == 2 {
                Vec::new()
            } else {
                vec![x, x * 100]
            }
        })
        .sink_op(sink)
        .build();
    stream.start().unwrap();
    std::thread::sleep(Duration::from_millis(200));
    stream.stop().unwrap();
    assert_eq!(collected.snapshot(), vec![1, 100, 3, 300]);
}

#[test]
fn emit_feeds_a_sourceless_stream() {
    let (sink, collected) = CollectVecSink::new();
    let mut stream = StreamBuilder::create("manual")
        .map(|x: i32| x + 1)
        .sink_op(sink)
        .build();
    stream.start().unwrap();
    for x in 0..3 {
        stream.emit(x).unwrap();
    }
    stream.stop().unwrap();
    assert_eq!(collected.snapshot(), vec![1, 2, 3]);
}

#[test]
fn emit_requires_a_running_stream() {
    let stream = StreamBuilder::create("stopped")
        .map(|x: i32| x)
        .build();
    assert!(stream.emit(1).is_err());
}

#[test]
fn emit_rejected_when_a_source_is_attached() {
    let mut stream = StreamBuilder::create("sourced")
        .source(IteratorSource::new(std::iter::empty::<i32>()))
        .map(|x: i32| x)
        .build();
    stream.start().unwrap();
    assert!(stream.emit(7).is_err());
    stream.stop().unwrap();
}

#[test]
fn status_reports_running_and_stopped() {
    let mut stream = StreamBuilder::create("status")
        .map(|x: i32| x)
        .build();
    assert_eq!(stream.status(), StreamStatus::Stopped);
    assert_eq!(stream.status().to_string(), "Stopped");
    stream.start().unwrap();
    assert_eq!(stream.status(), StreamStatus::Running);
    assert_eq!(stream.status().to_string(), "Running");
    stream.stop().unwrap();
    assert_eq!(stream.status(), StreamStatus::Stopped);
}

#[test]
fn channel_source_forwards_until_disconnect() {
    let (tx, source) = ChannelSource::new();
    let (sink, collected) = CollectVecSink::new();
    let mut stream = StreamBuilder::create("chan")
        .source(source)
        .map(|x: i32| x * 2)
        .sink_op(sink)
        .build();
    stream.start().unwrap();
    tx.send(1).unwrap();
    tx.send(2).unwrap();
    drop(tx);
    std::thread::sleep(Duration::from_millis(200));
    stream.stop().unwrap();
    assert_eq!(collected.snapshot(), vec![2, 4]);
}
