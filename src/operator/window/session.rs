//! Keyed session window.
//!
//! A session stays open while events keep arriving within the inactivity
//! gap; the timer closes every session whose last event is older than the
//! gap. Results are keyed by `(key, session_start)`.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::Clock;
use crate::error::StreamError;
use crate::operator::window::{SessionState, WindowCombine, WindowKey, WindowKeyer};
use crate::operator::{BoxedOperator, Data, DataKey, NextEdge, Operator};
use crate::store::{SharedStore, StoreDescriptor};
use crate::telemetry::{OperatorTelemetry, TelemetryRef};
use crate::timer::PeriodicTimer;

pub struct SessionWindow<In, Key, Out, FK, FC>
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
    gap_ms: i64,
    clock: Arc<dyn Clock>,
    session_store: SharedStore<Key, SessionState<In>>,
    results_store: Option<SharedStore<WindowKey<Key>, Out>>,
    sweep: Mutex<()>,
    next: Mutex<NextEdge<(WindowKey<Key>, Out)>>,
}

impl<In, Key, Out, FK, FC> SessionWindow<In, Key, Out, FK, FC>
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
        inactivity_gap: Duration,
        combine: FC,
        clock: Arc<dyn Clock>,
        session_store: SharedStore<Key, SessionState<In>>,
        results_store: Option<SharedStore<WindowKey<Key>, Out>>,
    ) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                keyer,
                combine,
                gap_ms: inactivity_gap.as_millis() as i64,
                clock,
                session_store,
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
        session: &SessionState<In>,
    ) -> Result<(WindowKey<Key>, Out), StreamError> {
        let out = (self.combine)(session.events.clone());
        let window_key = WindowKey {
            key: key.clone(),
            start: session.start,
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
            let candidates: Result<Vec<(Key, SessionState<In>)>, _> =
                self.session_store.iter().and_then(|it| it.collect());
            let candidates = match candidates {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("session sweep: cannot enumerate session store: {e}");
                    return;
                }
            };
            for (key, session) in candidates {
                if now - session.last_event >= self.gap_ms {
                    if let Err(e) = self.session_store.remove(&key) {
                        tracing::warn!("session sweep: cannot remove session: {e}");
                        continue;
                    }
                    closed.push((key, session));
                }
            }
        }
        for (key, session) in closed {
            match self.prepare_close(&key, &session) {
                Ok(out) => {
                    if let Err(e) = self.next.lock().forward(out) {
                        tracing::warn!("session emission failed downstream: {e}");
                    }
                }
                Err(e) => {
                    tracing::warn!("session close failed, keeping state for the next tick: {e}");
                    let _guard = self.sweep.lock();
                    if let Ok(false) = self.session_store.contains_key(&key) {
                        let _ = self.session_store.put(key, session);
                    }
                }
            }
        }
    }
}

impl<In, Key, Out, FK, FC> Display for SessionWindow<In, Key, Out, FK, FC>
where
    FK: WindowKeyer<Key, In>,
    FC: WindowCombine<In, Out>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SessionWindow<{} by {}>",
            std::any::type_name::<In>(),
            std::any::type_name::<Key>(),
        )
    }
}

impl<In, Key, Out, FK, FC> Operator for SessionWindow<In, Key, Out, FK, FC>
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
                Duration::from_millis(self.shared.gap_ms as u64),
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
            match shared.session_store.get(&key)? {
                None => {
                    shared.session_store.put(
                        key,
                        SessionState {
                            start: now,
                            last_event: now,
                            events: vec![item],
                        },
                    )?;
                }
                Some(mut session) => {
                    session.events.push(item);
                    session.last_event = now.max(session.last_event);
                    shared.session_store.put(key, session)?;
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
        self.telemetry.wire::<In>("session_window", provider);
        self.shared.next.lock().set_telemetry_provider(provider);
    }

    fn state_stores(&self) -> Vec<StoreDescriptor> {
        let mut stores = vec![StoreDescriptor::of(&*self.shared.session_store)];
        if let Some(results) = &self.shared.results_store {
            stores.push(StoreDescriptor::of(&**results));
        }
        stores.extend(self.shared.next.lock().state_stores());
        stores
    }
}
