//! Sink adapters terminating a chain.
//!
//! A sink never has a downstream operator; `set_next` on any sink fails with
//! an illegal-configuration error.

use std::fmt::Display;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::StreamError;
use crate::operator::{BoxedOperator, Data, Operator};
use crate::telemetry::{OperatorTelemetry, TelemetryRef};

/// Runs a closure for every value.
pub struct ForEachSink<In, F>
where
    F: FnMut(In) + Send,
{
    f: F,
    telemetry: OperatorTelemetry,
    _in: PhantomData<In>,
}

impl<In: Data, F: FnMut(In) + Send> ForEachSink<In, F> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            telemetry: OperatorTelemetry::unset(),
            _in: PhantomData,
        }
    }

    pub fn set_next(&mut self, _next: BoxedOperator<In>) -> Result<(), StreamError> {
        Err(StreamError::illegal("a sink terminates the chain"))
    }
}

impl<In: Data, F: FnMut(In) + Send> Display for ForEachSink<In, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ForEachSink<{}>", std::any::type_name::<In>())
    }
}

impl<In: Data, F: FnMut(In) + Send> Operator for ForEachSink<In, F> {
    type In = In;

    fn start(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    fn process(&mut self, item: In) -> Result<(), StreamError> {
        let f = &mut self.f;
        self.telemetry.observe(|| f(item));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    fn set_telemetry_provider(&mut self, provider: &TelemetryRef) {
        self.telemetry.wire::<In>("sink", provider);
    }
}

/// Shared handle to the values collected by a [`CollectVecSink`].
pub struct SinkHandle<In> {
    items: Arc<Mutex<Vec<In>>>,
}

impl<In> Clone for SinkHandle<In> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

impl<In: Clone> SinkHandle<In> {
    /// Copy of everything collected so far, in arrival order.
    pub fn snapshot(&self) -> Vec<In> {
        self.items.lock().clone()
    }

    pub fn take(&self) -> Vec<In> {
        std::mem::take(&mut *self.items.lock())
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

/// Collects every value into a shared vector, mostly for tests and demos.
pub struct CollectVecSink<In> {
    items: Arc<Mutex<Vec<In>>>,
    telemetry: OperatorTelemetry,
}

impl<In: Data> CollectVecSink<In> {
    pub fn new() -> (Self, SinkHandle<In>) {
        let items = Arc::new(Mutex::new(Vec::new()));
        let handle = SinkHandle {
            items: items.clone(),
        };
        (
            Self {
                items,
                telemetry: OperatorTelemetry::unset(),
            },
            handle,
        )
    }

    pub fn set_next(&mut self, _next: BoxedOperator<In>) -> Result<(), StreamError> {
        Err(StreamError::illegal("a sink terminates the chain"))
    }
}

impl<In> Display for CollectVecSink<In> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CollectVecSink<{}>", std::any::type_name::<In>())
    }
}

impl<In: Data> Operator for CollectVecSink<In> {
    type In = In;

    fn start(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    fn process(&mut self, item: In) -> Result<(), StreamError> {
        self.telemetry.observe(|| self.items.lock().push(item));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    fn set_telemetry_provider(&mut self, provider: &TelemetryRef) {
        self.telemetry.wire::<In>("sink", provider);
    }
}

/// Pushes every value into a channel; the receiving side drains it at its own
/// pace.
pub struct CollectChannelSink<In> {
    tx: flume::Sender<In>,
    telemetry: OperatorTelemetry,
}

impl<In: Data> CollectChannelSink<In> {
    pub fn new() -> (Self, flume::Receiver<In>) {
        let (tx, rx) = flume::unbounded();
        (
            Self {
                tx,
                telemetry: OperatorTelemetry::unset(),
            },
            rx,
        )
    }

    pub fn set_next(&mut self, _next: BoxedOperator<In>) -> Result<(), StreamError> {
        Err(StreamError::illegal("a sink terminates the chain"))
    }
}

impl<In> Display for CollectChannelSink<In> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CollectChannelSink<{}>", std::any::type_name::<In>())
    }
}

impl<In: Data> Operator for CollectChannelSink<In> {
    type In = In;

    fn start(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    fn process(&mut self, item: In) -> Result<(), StreamError> {
        let tx = &self.tx;
        self.telemetry.observe(|| {
            if tx.send(item).is_err() {
                log::warn!("channel sink receiver dropped, discarding element");
            }
        });
        Ok(())
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    fn set_telemetry_provider(&mut self, provider: &TelemetryRef) {
        self.telemetry.wire::<In>("sink", provider);
    }
}

/// Swallows everything. Used when a chain is built without an explicit sink.
pub struct Discard<In> {
    _in: PhantomData<In>,
}

impl<In: Data> Discard<In> {
    pub fn new() -> Self {
        Self { _in: PhantomData }
    }
}

impl<In: Data> Default for Discard<In> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In> Display for Discard<In> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Discard")
    }
}

impl<In: Data> Operator for Discard<In> {
    type In = In;

    fn start(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    fn process(&mut self, _item: In) -> Result<(), StreamError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        Ok(())
    }

    fn set_telemetry_provider(&mut self, _provider: &TelemetryRef) {}
}
