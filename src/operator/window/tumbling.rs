//! Keyed tumbling window.
//!
//! Each key owns at most one open window `[floor(t, D), start + D)`. An input
//! past the end of the open window closes it and opens a fresh one; the timer
//! sweeps keys that stopped receiving traffic.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::{floor_to, Clock};
use crate::error::StreamError;
use crate::operator::window::{WindowCombine, WindowKey, WindowKeyer, WindowState};
use crate::operator::{BoxedOperator, Data, DataKey, NextEdge, Operator};
use crate::store::{SharedStore, StoreDescriptor};
use crate::telemetry::{OperatorTelemetry, TelemetryRef};
use crate::timer::PeriodicTimer;

pub struct TumblingWindow<In, Key, Out, FK, FC>
where
    FK: WindowKeyer<Key, In>,
    FC: WindowCombine<In, Out>,
{
    name: String,
    shared: Arc<Shared<In, Key, Out, FK, FC>>,
    timer: Option<PeriodicTimer>,
    telemetry: OperatorTelemetry,
}

struct Shared<In, Key, Out, FK, FC> {
    keyer: FK,
    combine: FC,
    duration_ms: i64,
    clock: Arc<dyn Clock>,
    window_store: SharedStore<Key, WindowState<In>>,
    results_store: Option<SharedStore<WindowKey<Key>, Out>>,
    /// Guards window mutation and the close check, per operator.
    sweep: Mutex<()>,
    next: Mutex<NextEdge<(WindowKey<Key>, Out)>>,
}

impl<In, Key, Out, FK, FC> TumblingWindow<In, Key, Out, FK, FC>
where
    In: Data,
    Key: DataKey,
    Out: Data,
    FK: WindowKeyer<Key, In>,
    FC: WindowCombine<In, Out>,
{
    pub fn new(
        name: impl Into<String>,
        keyer: FK,
        duration: Duration,
        combine: FC,
        clock: Arc<dyn Clock>,
        window_store: SharedStore<Key, WindowState<In>>,
        results_store: Option<SharedStore<WindowKey<Key>, Out>>,
    ) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                keyer,
                combine,
                duration_ms: duration.as_millis() as i64,
                clock,
                window_store,
                results_store,
                sweep: Mutex::new(()),
                next: Mutex::new(NextEdge::unset()),
            }),
            timer: None,
            telemetry: OperatorTelemetry::unset(),
        }
    }

    pub fn set_next(
        &mut self,
        next: BoxedOperator<(WindowKey<Key>, Out)>,
    ) -> Result<(), StreamError> {
        self.shared.next.lock().set(next)
    }
}

impl<In, Key, Out, FK, FC> Shared<In, Key, Out, FK, FC>
where
    In: Data,
    Key: DataKey,
    Out: Data,
    FK: WindowKeyer<Key, In>,
    FC: WindowCombine<In, Out>,
{
    /// Fold the window and persist the result; the window store is untouched,
    /// so a failure leaves the window open.
    fn prepare_close(
        &self,
        key: &Key,
        state: &WindowState<In>,
    ) -> Result<(WindowKey<Key>, Out), StreamError> {
        let out = (self.combine)(state.events.clone());
        let window_key = WindowKey {
            key: key.clone(),
            start: state.start,
        };
        if let Some(results) = &self.results_store {
            results.put(window_key.clone(), out.clone())?;
        }
        Ok((window_key, out))
    }

    fn sweep_expired(&self) {
        let now = self.clock.now();
        let mut closed = Vec::new();
        {
            let _guard = self.sweep.lock();
            let candidates: Result<Vec<(Key, WindowState<In>)>, _> =
                self.window_store.iter().and_then(|it| it.collect());
            let candidates = match candidates {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("window sweep: cannot enumerate window store: {e}");
                    return;
                }
            };
            for (key, state) in candidates {
                if now >= state.start + self.duration_ms {
                    if let Err(e) = self.window_store.remove(&key) {
                        tracing::warn!("window sweep: cannot remove window: {e}");
                        continue;
                    }
                    closed.push((key, state));
                }
            }
        }
        // emit with the sweep lock released
        for (key, state) in closed {
            self.close_and_emit(key, state);
        }
    }

    fn close_and_emit(&self, key: Key, state: WindowState<In>) {
        match self.prepare_close(&key, &state) {
            Ok(closed) => {
                if let Err(e) = self.next.lock().forward(closed) {
                    tracing::warn!("window emission failed downstream: {e}");
                }
            }
            Err(e) => {
                tracing::warn!("window close failed, keeping state for the next tick: {e}");
                let _guard = self.sweep.lock();
                // put the state back unless the key already reopened
                if let Ok(false) = self.window_store.contains_key(&key) {
                    if let Err(e) = self.window_store.put(key, state) {
                        tracing::error!("window state lost while restoring: {e}");
                    }
                }
            }
        }
    }
}

impl<In, Key, Out, FK, FC> Display for TumblingWindow<In, Key, Out, FK, FC>
where
    FK: WindowKeyer<Key, In>,
    FC: WindowCombine<In, Out>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TumblingWindow<{} by {}>",
            std::any::type_name::<In>(),
            std::any::type_name::<Key>(),
        )
    }
}

impl<In, Key, Out, FK, FC> Operator for TumblingWindow<In, Key, Out, FK, FC>
where
    In: Data,
    Key: DataKey,
    Out: Data,
    FK: WindowKeyer<Key, In>,
    FC: WindowCombine<In, Out>,
{
    type In = In;

    fn start(&mut self) -> Result<(), StreamError> {
        if self.timer.is_none() {
            let shared = self.shared.clone();
            self.timer = Some(PeriodicTimer::spawn(
                &self.name,
                Duration::from_millis(self.shared.duration_ms as u64),
                move || shared.sweep_expired(),
            ));
        }
        self.shared.next.lock().start()
    }

    fn process(&mut self, item: In) -> Result<(), StreamError> {
        let shared = &self.shared;
        self.telemetry.observe(|| {
            let now = shared.clock.now();
            let key = (shared.keyer)(&item);
            let _guard = shared.sweep.lock();
            match shared.window_store.get(&key)? {
                None => {
                    let start = floor_to(now, shared.duration_ms);
                    shared.window_store.put(key, WindowState::open(start, item))?;
                }
                Some(mut state) if now < state.start + shared.duration_ms => {
                    state.events.push(item);
                    shared.window_store.put(key, state)?;
                }
                Some(state) => {
                    // the open window expired: fold it first so a failure
                    // keeps it intact, then roll over
                    let closed = shared.prepare_close(&key, &state)?;
                    let start = floor_to(now, shared.duration_ms);
                    shared
                        .window_store
                        .put(key, WindowState::open(start, item))?;
                    shared.next.lock().forward(closed)?;
                }
            }
            Ok(())
        })
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        if let Some(mut timer) = self.timer.take() {
            timer.stop();
        }
        self.shared.next.lock().stop()
    }

    fn set_telemetry_provider(&mut self, provider: &TelemetryRef) {
        self.telemetry.wire::<In>("tumbling_window", provider);
        self.shared.next.lock().set_telemetry_provider(provider);
    }

    fn state_stores(&self) -> Vec<StoreDescriptor> {
        let mut stores = vec![StoreDescriptor::of(&*self.shared.window_store)];
        if let Some(results) = &self.shared.results_store {
            stores.push(StoreDescriptor::of(&**results));
        }
        stores.extend(self.shared.next.lock().state_stores());
        stores
    }
}
