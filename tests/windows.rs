use std::sync::Arc;
use std::time::Duration;

use rillflow::operator::window::{GlobalWindowCheckpoint, WindowKey, WINDOW_CHECKPOINT_KEY};
use rillflow::prelude::*;

type Event = (&'static str, i64);

fn times(events: Vec<Event>) -> Vec<i64> {
    events.into_iter().map(|e| e.1).collect()
}

/// Wait until the window timer had a chance to sweep at least once.
fn settle(period: Duration) {
    std::thread::sleep(period + Duration::from_millis(500));
}

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn tumbling_window_splits_on_the_duration_boundary() {
    init_logs();
    let clock = ManualClock::at(0);
    let (sink, collected) = CollectVecSink::new();
    let mut stream = StreamBuilder::create("s3")
        .with_clock(clock.clone())
        .tumbling_window(|e: &Event| e.0, Duration::from_secs(1), times)
        .sink_op(sink)
        .build();
    stream.start().unwrap();

    stream.emit(("x", 0)).unwrap();
    clock.set(400);
    stream.emit(("x", 400)).unwrap();
    clock.set(1200);
    // rolls the expired window over and emits the first batch inline
    stream.emit(("x", 1200)).unwrap();
    assert_eq!(
        collected.snapshot(),
        vec![(WindowKey { key: "x", start: 0 }, vec![0, 400])]
    );

    clock.set(2100);
    settle(Duration::from_secs(1));
    stream.stop().unwrap();
    assert_eq!(
        collected.snapshot(),
        vec![
            (WindowKey { key: "x", start: 0 }, vec![0, 400]),
            (WindowKey { key: "x", start: 1000 }, vec![1200]),
        ]
    );
}

#[test]
fn tumbling_window_results_store_matches_emissions() {
    init_logs();
    let clock = ManualClock::at(0);
    let window_store = Arc::new(InMemoryStore::new("windows"));
    let results_store: SharedStore<WindowKey<&'static str>, Vec<i64>> =
        Arc::new(InMemoryStore::new("results"));
    let (sink, collected) = CollectVecSink::new();
    let mut stream = StreamBuilder::create("audited")
        .with_clock(clock.clone())
        .tumbling_window_in(
            |e: &Event| e.0,
            Duration::from_secs(1),
            times,
            window_store,
            Some(results_store.clone()),
        )
        .sink_op(sink)
        .build();
    stream.start().unwrap();

    stream.emit(("k", 10)).unwrap();
    clock.set(1500);
    stream.emit(("k", 1500)).unwrap();
    stream.stop().unwrap();

    let emitted = collected.snapshot();
    assert_eq!(emitted.len(), 1);
    let (key, batch) = &emitted[0];
    assert_eq!(results_store.get(key).unwrap().as_ref(), Some(batch));
}

#[test]
fn sliding_window_closes_overlapping_windows() {
    init_logs();
    let clock = ManualClock::at(0);
    let (sink, collected) = CollectVecSink::new();
    let mut stream = StreamBuilder::create("s4")
        .with_clock(clock.clone())
        .sliding_window(
            |e: &Event| e.0,
            Duration::from_secs(2),
            Duration::from_secs(1),
            times,
        )
        .sink_op(sink)
        .build();
    stream.start().unwrap();

    stream.emit(("k", 0)).unwrap();
    clock.set(500);
    stream.emit(("k", 500)).unwrap();
    clock.set(1500);
    stream.emit(("k", 1500)).unwrap();
    clock.set(2500);
    // the [0, 2000) window expired; closing happens inline with this event
    stream.emit(("k", 2500)).unwrap();
    assert_eq!(
        collected.snapshot(),
        vec![(WindowKey { key: "k", start: 0 }, vec![0, 500, 1500])]
    );

    clock.set(3100);
    settle(Duration::from_secs(1));
    stream.stop().unwrap();
    assert_eq!(
        collected.snapshot(),
        vec![
            (WindowKey { key: "k", start: 0 }, vec![0, 500, 1500]),
            (WindowKey { key: "k", start: 1000 }, vec![1500, 2500]),
        ]
    );
}

#[test]
fn session_window_closes_after_the_inactivity_gap() {
    init_logs();
    let clock = ManualClock::at(0);
    let (sink, collected) = CollectVecSink::new();
    let mut stream = StreamBuilder::create("s5")
        .with_clock(clock.clone())
        .session_window(|e: &Event| e.0, Duration::from_secs(1), times)
        .sink_op(sink)
        .build();
    stream.start().unwrap();

    stream.emit(("u", 0)).unwrap();
    clock.set(300);
    stream.emit(("u", 300)).unwrap();
    clock.set(600);
    stream.emit(("u", 600)).unwrap();
    clock.set(1700);
    settle(Duration::from_secs(1));
    stream.stop().unwrap();

    assert_eq!(
        collected.snapshot(),
        vec![(WindowKey { key: "u", start: 0 }, vec![0, 300, 600])]
    );
}

#[test]
fn windows_never_emit_empty_batches() {
    init_logs();
    let clock = ManualClock::at(0);
    let (sink, collected) = CollectVecSink::<(WindowKey<&'static str>, Vec<i64>)>::new();
    let mut stream = StreamBuilder::create("quiet")
        .with_clock(clock.clone())
        .tumbling_window(|e: &Event| e.0, Duration::from_millis(100), times)
        .sink_op(sink)
        .build();
    stream.start().unwrap();
    clock.set(5000);
    settle(Duration::from_millis(100));
    stream.stop().unwrap();
    assert!(collected.is_empty());
}

#[test]
fn global_window_checkpoint_resumes_boundaries() {
    init_logs();
    let checkpoint_store: SharedStore<String, GlobalWindowCheckpoint> =
        Arc::new(InMemoryStore::new("window-checkpoints"));
    let clock = ManualClock::at(0);

    let build = |clock: ManualClock, store: SharedStore<String, GlobalWindowCheckpoint>| {
        let (sink, collected) = CollectVecSink::new();
        let stream = StreamBuilder::create("resumable")
            .with_clock(clock)
            .tumbling_window_all_in(
                Duration::from_secs(1),
                TimeMode::event_time(|e: &Event| e.1, Duration::ZERO),
                times,
                Some(store),
                None,
            )
            .sink_op(sink)
            .build();
        (stream, collected)
    };

    let (mut stream, collected) = build(clock.clone(), checkpoint_store.clone());
    stream.start().unwrap();
    stream.emit(("g", 100)).unwrap();
    stream.stop().unwrap();
    assert!(collected.is_empty());

    let saved = checkpoint_store
        .get(&WINDOW_CHECKPOINT_KEY.to_string())
        .unwrap()
        .expect("boundaries must be checkpointed");
    assert_eq!(saved.current_start, 0);
    assert_eq!(saved.current_end, 1000);
    assert_eq!(saved.max_event_time, 100);
    assert!(saved.use_event_time);

    // restart: the boundaries resume, the buffered events do not, so the
    // resumed window closes without emitting
    let (mut stream, collected) = build(clock.clone(), checkpoint_store.clone());
    stream.start().unwrap();
    stream.emit(("g", 1200)).unwrap();
    stream.stop().unwrap();
    assert!(collected.is_empty());

    let saved = checkpoint_store
        .get(&WINDOW_CHECKPOINT_KEY.to_string())
        .unwrap()
        .unwrap();
    assert_eq!(saved.current_start, 1000);
    assert_eq!(saved.current_end, 2000);
    assert_eq!(saved.max_event_time, 1200);
}

#[test]
fn global_window_event_time_rollover_emits_the_old_window() {
    init_logs();
    let (sink, collected) = CollectVecSink::new();
    let mut stream = StreamBuilder::create("global")
        .tumbling_window_all(
            Duration::from_secs(1),
            TimeMode::event_time(|e: &Event| e.1, Duration::ZERO),
            times,
        )
        .sink_op(sink)
        .build();
    stream.start().unwrap();
    stream.emit(("g", 100)).unwrap();
    stream.emit(("g", 900)).unwrap();
    stream.emit(("g", 2100)).unwrap();
    stream.stop().unwrap();

    assert_eq!(collected.snapshot().len(), 1);
    let (key, batch) = &collected.snapshot()[0];
    assert_eq!((key.start, key.end), (0, 1000));
    assert_eq!(batch, &vec![100, 900]);
}

#[test]
fn processing_time_backward_jump_keeps_the_window_open() {
    init_logs();
    let clock = ManualClock::at(10_000);
    let (sink, collected) = CollectVecSink::new();
    let mut stream = StreamBuilder::create("jumpy")
        .with_clock(clock.clone())
        .tumbling_window(|e: &Event| e.0, Duration::from_secs(1), times)
        .sink_op(sink)
        .build();
    stream.start().unwrap();

    stream.emit(("x", 10_000)).unwrap();
    clock.set(9_000); // the wall clock stepped backward
    stream.emit(("x", 9_000)).unwrap();
    assert!(collected.is_empty());

    clock.set(11_500);
    settle(Duration::from_secs(1));
    stream.stop().unwrap();
    assert_eq!(
        collected.snapshot(),
        vec![(WindowKey { key: "x", start: 10_000 }, vec![10_000, 9_000])]
    );
}
