//! Keyed sliding window.
//!
//! Windows of length `D` advance by `S ≤ D`; an event joins every window
//! `[s, s + D)` whose start lies on the key's grid `anchor + k * S`. The
//! anchor is the key's first observed event time and is kept in the stored
//! state so the grid stays stable across window closes.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::error::StreamError;
use crate::operator::window::{SlidingState, WindowCombine, WindowKey, WindowKeyer, WindowState};
use crate::operator::{BoxedOperator, Data, DataKey, NextEdge, Operator};
use crate::store::{SharedStore, StoreDescriptor};
use crate::telemetry::{OperatorTelemetry, TelemetryRef};
use crate::timer::PeriodicTimer;

pub struct SlidingWindow<In, Key, Out, FK, FC>
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
    slide_ms: i64,
    clock: Arc<dyn Clock>,
    window_store: SharedStore<Key, SlidingState<In>>,
    results_store: Option<SharedStore<WindowKey<Key>, Out>>,
    sweep: Mutex<()>,
    next: Mutex<NextEdge<(WindowKey<Key>, Out)>>,
}

impl<In, Key, Out, FK, FC> SlidingWindow<In, Key, Out, FK, FC>
where
    In: Data,
    Key: DataKey,
    Out: Data,
    FK: WindowKeyer<Key, In>,
    FC: WindowCombine<In, Out>,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        keyer: FK,
        duration: Duration,
        slide: Duration,
        combine: FC,
        clock: Arc<dyn Clock>,
        window_store: SharedStore<Key, SlidingState<In>>,
        results_store: Option<SharedStore<WindowKey<Key>, Out>>,
    ) -> Self {
        let duration_ms = duration.as_millis() as i64;
        let slide_ms = (slide.as_millis() as i64).max(1);
        assert!(
            slide_ms <= duration_ms,
            "the slide of a sliding window cannot exceed its duration"
        );
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                keyer,
                combine,
                duration_ms,
                slide_ms,
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
    fn prepare_close(
        &self,
        key: &Key,
        window: &WindowState<In>,
    ) -> Result<(WindowKey<Key>, Out), StreamError> {
        let out = (self.combine)(window.events.clone());
        let window_key = WindowKey {
            key: key.clone(),
            start: window.start,
        };
        if let Some(results) = &self.results_store {
            results.put(window_key.clone(), out.clone())?;
        }
        Ok((window_key, out))
    }

    /// The window starts an event at `t` belongs to.
    fn active_starts(&self, anchor: i64, t: i64) -> impl Iterator<Item = i64> {
        let i_min = ((t - self.duration_ms - anchor).div_euclid(self.slide_ms) + 1).max(0);
        let i_max = (t - anchor).div_euclid(self.slide_ms);
        let slide = self.slide_ms;
        (i_min..=i_max).map(move |i| anchor + i * slide)
    }

    fn sweep_expired(&self) {
        let now = self.clock.now();
        let mut closed = Vec::new();
        {
            let _guard = self.sweep.lock();
            let candidates: Result<Vec<(Key, SlidingState<In>)>, _> =
                self.window_store.iter().and_then(|it| it.collect());
            let candidates = match candidates {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("sliding sweep: cannot enumerate window store: {e}");
                    return;
                }
            };
            for (key, mut state) in candidates {
                let expired: Vec<_> = {
                    let (expired, live): (Vec<_>, Vec<_>) = state
                        .windows
                        .drain(..)
                        .partition(|w| now >= w.start + self.duration_ms);
                    state.windows = live;
                    expired
                };
                if expired.is_empty() {
                    continue;
                }
                // the entry stays, even with no live windows, to keep the grid anchor
                if let Err(e) = self.window_store.put(key.clone(), state) {
                    tracing::warn!("sliding sweep: cannot write back window state: {e}");
                    continue;
                }
                for window in expired {
                    closed.push((key.clone(), window));
                }
            }
        }
        for (key, window) in closed {
            match self.prepare_close(&key, &window) {
                Ok(out) => {
                    if let Err(e) = self.next.lock().forward(out) {
                        tracing::warn!("sliding window emission failed downstream: {e}");
                    }
                }
                Err(e) => {
                    tracing::warn!("sliding window close failed, re-buffering for retry: {e}");
                    let _guard = self.sweep.lock();
                    if let Ok(Some(mut state)) = self.window_store.get(&key) {
                        state.windows.push(window);
                        state.windows.sort_by_key(|w| w.start);
                        let _ = self.window_store.put(key, state);
                    }
                }
            }
        }
    }
}

impl<In, Key, Out, FK, FC> Display for SlidingWindow<In, Key, Out, FK, FC>
where
    FK: WindowKeyer<Key, In>,
    FC: WindowCombine<In, Out>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SlidingWindow<{} by {}>",
            std::any::type_name::<In>(),
            std::any::type_name::<Key>(),
        )
    }
}

impl<In, Key, Out, FK, FC> Operator for SlidingWindow<In, Key, Out, FK, FC>
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
                Duration::from_millis(self.shared.slide_ms as u64),
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
            let mut state = shared
                .window_store
                .get(&key)?
                .unwrap_or_else(|| SlidingState {
                    anchor: now,
                    windows: Vec::new(),
                });
            // clocks stepped backward never un-anchor the grid
            let t = now.max(state.anchor);

            let (expired, live): (Vec<_>, Vec<_>) = state
                .windows
                .drain(..)
                .partition(|w| now >= w.start + self.shared.duration_ms);
            state.windows = live;
            // fold expired windows before any mutation is persisted, so a
            // failure aborts the whole step with the store unchanged
            let mut emissions = Vec::with_capacity(expired.len());
            for window in &expired {
                emissions.push(shared.prepare_close(&key, window)?);
            }

            for start in shared.active_starts(state.anchor, t) {
                match state.windows.iter_mut().find(|w| w.start == start) {
                    Some(window) => window.events.push(item.clone()),
                    None => state.windows.push(WindowState::open(start, item.clone())),
                }
            }
            state.windows.sort_by_key(|w| w.start);
            shared.window_store.put(key, state)?;

            let mut next = shared.next.lock();
            for emission in emissions {
                next.forward(emission)?;
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
        self.telemetry.wire::<In>("sliding_window", provider);
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
