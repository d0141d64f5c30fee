use std::fmt::Display;
use std::marker::PhantomData;

use crate::error::StreamError;
use crate::operator::{BoxedOperator, Data, NextEdge, Operator};
use crate::telemetry::{OperatorTelemetry, TelemetryRef};

/// Forwards `f(v)` exactly once per input.
pub struct Map<In, Out, F>
where
    F: FnMut(In) -> Out + Send,
{
    f: F,
    next: NextEdge<Out>,
    telemetry: OperatorTelemetry,
    _in: PhantomData<In>,
}

impl<In: Data, Out: Data, F: FnMut(In) -> Out + Send> Map<In, Out, F> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            next: NextEdge::unset(),
            telemetry: OperatorTelemetry::unset(),
            _in: PhantomData,
        }
    }

    pub fn set_next(&mut self, next: BoxedOperator<Out>) -> Result<(), StreamError> {
        self.next.set(next)
    }
}

impl<In: Data, Out: Data, F: FnMut(In) -> Out + Send> Display for Map<In, Out, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Map<{} -> {}>{}",
            std::any::type_name::<In>(),
            std::any::type_name::<Out>(),
            self.next
        )
    }
}

impl<In: Data, Out: Data, F: FnMut(In) -> Out + Send> Operator for Map<In, Out, F> {
    type In = In;

    fn start(&mut self) -> Result<(), StreamError> {
        self.next.start()
    }

    #[inline]
    fn process(&mut self, item: In) -> Result<(), StreamError> {
        let f = &mut self.f;
        let out = self.telemetry.observe(|| f(item));
        self.next.forward(out)
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        self.next.stop()
    }

    fn set_telemetry_provider(&mut self, provider: &TelemetryRef) {
        self.telemetry.wire::<In>("map", provider);
        self.next.set_telemetry_provider(provider);
    }

    fn state_stores(&self) -> Vec<crate::store::StoreDescriptor> {
        self.next.state_stores()
    }
}
