use std::fmt::Display;
use std::marker::PhantomData;

use crate::error::StreamError;
use crate::operator::{BoxedOperator, Data, NextEdge, Operator};
use crate::telemetry::{OperatorTelemetry, TelemetryRef};

/// Forwards `v` iff the predicate holds.
pub struct Filter<In, P>
where
    P: FnMut(&In) -> bool + Send,
{
    predicate: P,
    next: NextEdge<In>,
    telemetry: OperatorTelemetry,
    _in: PhantomData<In>,
}

impl<In: Data, P: FnMut(&In) -> bool + Send> Filter<In, P> {
    pub fn new(predicate: P) -> Self {
        Self {
            predicate,
            next: NextEdge::unset(),
            telemetry: OperatorTelemetry::unset(),
            _in: PhantomData,
        }
    }

    pub fn set_next(&mut self, next: BoxedOperator<In>) -> Result<(), StreamError> {
        self.next.set(next)
    }
}

impl<In: Data, P: FnMut(&In) -> bool + Send> Display for Filter<In, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Filter<{}>{}", std::any::type_name::<In>(), self.next)
    }
}

impl<In: Data, P: FnMut(&In) -> bool + Send> Operator for Filter<In, P> {
    type In = In;

    fn start(&mut self) -> Result<(), StreamError> {
        self.next.start()
    }

    #[inline]
    fn process(&mut self, item: In) -> Result<(), StreamError> {
        let predicate = &mut self.predicate;
        let keep = self.telemetry.observe(|| predicate(&item));
        if keep {
            self.next.forward(item)
        } else {
            Ok(())
        }
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        self.next.stop()
    }

    fn set_telemetry_provider(&mut self, provider: &TelemetryRef) {
        self.telemetry.wire::<In>("filter", provider);
        self.next.set_telemetry_provider(provider);
    }

    fn state_stores(&self) -> Vec<crate::store::StoreDescriptor> {
        self.next.state_stores()
    }
}
