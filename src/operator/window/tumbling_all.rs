//! Global (keyless) tumbling window.
//!
//! A single implicit key with one open window at a time. Time is either the
//! wall clock (processing time) or extracted from the record (event time,
//! with a watermark at `max_event_time - allowed_lateness`). The ticker
//! closes expired windows even when no events arrive; the optional
//! checkpoint store lets a restarted pipeline resume the window boundaries.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::clock::{floor_to, Clock, Timestamp};
use crate::error::StreamError;
use crate::operator::window::{GlobalWindowKey, WindowCombine, WindowState};
use crate::operator::{BoxedOperator, Data, NextEdge, Operator};
use crate::store::{SharedStore, StoreDescriptor};
use crate::telemetry::{OperatorTelemetry, TelemetryRef};
use crate::timer::PeriodicTimer;

/// Fixed key the boundary checkpoint is stored under.
pub const WINDOW_CHECKPOINT_KEY: &str = "window_checkpoint";

/// How the global window reads time.
pub enum TimeMode<In> {
    /// Compare the wall clock against the window boundaries.
    Processing,
    /// Read the timestamp out of the record; windows close once the
    /// watermark passes their end.
    EventTime {
        extract: Arc<dyn Fn(&In) -> Timestamp + Send + Sync>,
        allowed_lateness: Duration,
    },
}

impl<In> Clone for TimeMode<In> {
    fn clone(&self) -> Self {
        match self {
            TimeMode::Processing => TimeMode::Processing,
            TimeMode::EventTime {
                extract,
                allowed_lateness,
            } => TimeMode::EventTime {
                extract: extract.clone(),
                allowed_lateness: *allowed_lateness,
            },
        }
    }
}

impl<In> TimeMode<In> {
    pub fn event_time(
        extract: impl Fn(&In) -> Timestamp + Send + Sync + 'static,
        allowed_lateness: Duration,
    ) -> Self {
        TimeMode::EventTime {
            extract: Arc::new(extract),
            allowed_lateness,
        }
    }

    fn is_event_time(&self) -> bool {
        matches!(self, TimeMode::EventTime { .. })
    }
}

/// Persisted window boundaries; `current_start == current_end` marks no open
/// window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalWindowCheckpoint {
    pub use_event_time: bool,
    pub max_event_time: Timestamp,
    pub current_start: Timestamp,
    pub current_end: Timestamp,
}

struct GlobalState<In> {
    current: Option<WindowState<In>>,
    max_event_time: Timestamp,
}

pub struct GlobalTumblingWindow<In, Out, FC>
where
    FC: WindowCombine<In, Out>,
{
    name: String,
    shared: Arc<Shared<In, Out, FC>>,
    timer: Option<PeriodicTimer>,
    telemetry: OperatorTelemetry,
}

struct Shared<In, Out, FC> {
    duration_ms: i64,
    mode: TimeMode<In>,
    combine: FC,
    clock: Arc<dyn Clock>,
    state: Mutex<GlobalState<In>>,
    checkpoint_store: Option<SharedStore<String, GlobalWindowCheckpoint>>,
    audit_store: Option<SharedStore<GlobalWindowKey, Out>>,
    next: Mutex<NextEdge<(GlobalWindowKey, Out)>>,
}

impl<In, Out, FC> GlobalTumblingWindow<In, Out, FC>
where
    In: Data,
    Out: Data,
    FC: WindowCombine<In, Out>,
{
    pub fn new(
        name: impl Into<String>,
        duration: Duration,
        mode: TimeMode<In>,
        combine: FC,
        clock: Arc<dyn Clock>,
        checkpoint_store: Option<SharedStore<String, GlobalWindowCheckpoint>>,
        audit_store: Option<SharedStore<GlobalWindowKey, Out>>,
    ) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                duration_ms: duration.as_millis() as i64,
                mode,
                combine,
                clock,
                state: Mutex::new(GlobalState {
                    current: None,
                    max_event_time: i64::MIN,
                }),
                checkpoint_store,
                audit_store,
                next: Mutex::new(NextEdge::unset()),
            }),
            timer: None,
            telemetry: OperatorTelemetry::unset(),
        }
    }

    pub fn set_next(
        &mut self,
        next: BoxedOperator<(GlobalWindowKey, Out)>,
    ) -> Result<(), StreamError> {
        self.shared.next.lock().set(next)
    }
}

impl<In, Out, FC> Shared<In, Out, FC>
where
    In: Data,
    Out: Data,
    FC: WindowCombine<In, Out>,
{
    fn save_checkpoint(&self, state: &GlobalState<In>) -> Result<(), StreamError> {
        let Some(store) = &self.checkpoint_store else {
            return Ok(());
        };
        let (start, end) = match &state.current {
            Some(w) => (w.start, w.start + self.duration_ms),
            None => (0, 0),
        };
        store.put(
            WINDOW_CHECKPOINT_KEY.to_string(),
            GlobalWindowCheckpoint {
                use_event_time: self.mode.is_event_time(),
                max_event_time: state.max_event_time,
                current_start: start,
                current_end: end,
            },
        )?;
        Ok(())
    }

    fn restore_checkpoint(&self) -> Result<(), StreamError> {
        let Some(store) = &self.checkpoint_store else {
            return Ok(());
        };
        let Some(cp) = store.get(&WINDOW_CHECKPOINT_KEY.to_string())? else {
            return Ok(());
        };
        if cp.use_event_time != self.mode.is_event_time() {
            tracing::warn!("window checkpoint was written in a different time mode, boundaries resumed anyway");
        }
        let mut state = self.state.lock();
        state.max_event_time = cp.max_event_time;
        if cp.current_end > cp.current_start {
            state.current = Some(WindowState {
                start: cp.current_start,
                events: Vec::new(),
            });
        }
        Ok(())
    }

    /// Emit a closed window: downstream first, then the audit entry.
    fn emit_value(&self, key: GlobalWindowKey, out: Out) -> Result<(), StreamError> {
        self.next.lock().forward((key, out.clone()))?;
        if let Some(audit) = &self.audit_store {
            audit.put(key, out)?;
        }
        Ok(())
    }

    fn sweep_expired(&self) {
        let now = self.clock.now();
        let (window, end) = {
            let mut state = self.state.lock();
            let Some(window) = &state.current else {
                return;
            };
            let end = window.start + self.duration_ms;
            let expired = match &self.mode {
                TimeMode::Processing => now >= end,
                TimeMode::EventTime {
                    allowed_lateness, ..
                } => {
                    state
                        .max_event_time
                        .saturating_sub(allowed_lateness.as_millis() as i64)
                        >= end
                }
            };
            if !expired {
                return;
            }
            let window = state.current.take().unwrap();
            if let Err(e) = self.save_checkpoint(&state) {
                tracing::warn!(
                    "global window: checkpoint write failed, keeping the window for the next tick: {e}"
                );
                state.current = Some(window);
                return;
            }
            (window, end)
        };
        if window.events.is_empty() {
            return;
        }
        let key = GlobalWindowKey {
            start: window.start,
            end,
        };
        // emit with the state lock released; the window is restored if the
        // batch never made it downstream
        let out = (self.combine)(window.events.clone());
        if let Err(e) = self.next.lock().forward((key, out.clone())) {
            tracing::warn!(
                "global window emission failed downstream, restoring the window for the next tick: {e}"
            );
            self.restore(window);
            return;
        }
        if let Some(audit) = &self.audit_store {
            if let Err(e) = audit.put(key, out) {
                tracing::warn!("global window audit write failed: {e}");
            }
        }
    }

    /// Put a closed-but-undelivered window back, unless a new one opened.
    fn restore(&self, window: WindowState<In>) {
        let mut state = self.state.lock();
        if state.current.is_some() {
            tracing::error!("global window state lost while restoring: a new window is open");
            return;
        }
        state.current = Some(window);
        if let Err(e) = self.save_checkpoint(&state) {
            tracing::warn!("global window: checkpoint write failed while restoring: {e}");
        }
    }
}

impl<In, Out, FC> Display for GlobalTumblingWindow<In, Out, FC>
where
    FC: WindowCombine<In, Out>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "GlobalTumblingWindow<{}>",
            std::any::type_name::<In>(),
        )
    }
}

impl<In, Out, FC> Operator for GlobalTumblingWindow<In, Out, FC>
where
    In: Data,
    Out: Data,
    FC: WindowCombine<In, Out>,
{
    type In = In;

    fn start(&mut self) -> Result<(), StreamError> {
        self.shared.restore_checkpoint()?;
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
            let t = match &shared.mode {
                TimeMode::Processing => shared.clock.now(),
                TimeMode::EventTime { extract, .. } => extract(&item),
            };
            let (emission, checkpoint) = {
                let mut state = shared.state.lock();
                if shared.mode.is_event_time() {
                    state.max_event_time = state.max_event_time.max(t);
                }
                let duration = shared.duration_ms;
                let emission = match &mut state.current {
                    None => {
                        state.current = Some(WindowState::open(floor_to(t, duration), item));
                        None
                    }
                    Some(window) if t < window.start + duration => {
                        if t >= window.start || !shared.mode.is_event_time() {
                            window.events.push(item);
                        } else {
                            tracing::warn!("dropping event older than the open window");
                        }
                        None
                    }
                    Some(window) => {
                        // fold before rolling over so a combine failure
                        // leaves the window open
                        let key = GlobalWindowKey {
                            start: window.start,
                            end: window.start + duration,
                        };
                        let out = if window.events.is_empty() {
                            None
                        } else {
                            Some((shared.combine)(window.events.clone()))
                        };
                        *window = WindowState::open(floor_to(t, duration), item);
                        out.map(|out| (key, out))
                    }
                };
                // the closed batch is forwarded even when this write fails,
                // so a checkpoint error never swallows a window
                (emission, shared.save_checkpoint(&state))
            };
            let emitted = match emission {
                Some((key, out)) => shared.emit_value(key, out),
                None => Ok(()),
            };
            checkpoint?;
            emitted
        })
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        if let Some(mut timer) = self.timer.take() {
            timer.stop();
        }
        self.shared.next.lock().stop()
    }

    fn set_telemetry_provider(&mut self, provider: &TelemetryRef) {
        self.telemetry.wire::<In>("tumbling_window_all", provider);
        self.shared.next.lock().set_telemetry_provider(provider);
    }

    fn state_stores(&self) -> Vec<StoreDescriptor> {
        let mut stores = Vec::new();
        if let Some(cp) = &self.shared.checkpoint_store {
            stores.push(StoreDescriptor::of(&**cp));
        }
        if let Some(audit) = &self.shared.audit_store {
            stores.push(StoreDescriptor::of(&**audit));
        }
        stores.extend(self.shared.next.lock().state_stores());
        stores
    }
}
