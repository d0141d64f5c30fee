//! Operators that can be chained into a pipeline.
//!
//! The actual operator list can be found from the builder methods of
//! [`StreamBuilder`](crate::StreamBuilder). Values are pushed forward: a
//! source (or [`Stream::emit`](crate::Stream::emit)) calls `process` on the
//! head of the chain and each operator forwards to the operator after it.

use std::fmt::Display;
use std::hash::Hash;

use crate::error::StreamError;
use crate::store::StoreDescriptor;
use crate::telemetry::TelemetryRef;

pub use aggregate::{AggregateByKey, AggregateSilently};
pub use filter::Filter;
pub use flat_map::FlatMap;
pub use fork::Fork;
pub use group_by::{GroupByKey, GroupBySilently};
pub use join::Join;
pub use map::Map;
pub use sink::{CollectChannelSink, CollectVecSink, Discard, ForEachSink, SinkHandle};
pub use source::{ChannelSource, Emitter, IteratorSource, SourceOperator};

mod aggregate;
mod filter;
mod flat_map;
mod fork;
mod group_by;
mod join;
mod map;
pub mod sink;
pub mod source;
pub mod window;

/// Marker trait that all the types inside a stream should implement.
pub trait Data: Clone + Send + Sync + 'static {}
impl<T: Clone + Send + Sync + 'static> Data for T {}

/// Marker trait that all the keys should implement.
pub trait DataKey: Data + Hash + Eq {}
impl<T: Data + Hash + Eq> DataKey for T {}

/// Marker trait for the function that extracts the key out of a type.
pub trait KeyerFn<Key, Out>: Fn(&Out) -> Key + Send + 'static {}
impl<Key, Out, T: Fn(&Out) -> Key + Send + 'static> KeyerFn<Key, Out> for T {}

/// A unit of computation inside a chain.
///
/// `process` is the only public mutator; it must complete synchronously and
/// either forward to the downstream operator or buffer. `start` and `stop`
/// are called by the stream runtime; every operator forwards them down the
/// chain, the same way each operator forwards `set_telemetry_provider`.
pub trait Operator: Send + Display {
    type In: Data;

    /// Activate the operator (arm window timers). Forwarded down the chain.
    fn start(&mut self) -> Result<(), StreamError>;

    /// Receive one value from upstream.
    fn process(&mut self, item: Self::In) -> Result<(), StreamError>;

    /// Release timers and drain background work. Forwarded down the chain.
    fn stop(&mut self) -> Result<(), StreamError>;

    /// Wire the telemetry hooks. Forwarded down the chain.
    fn set_telemetry_provider(&mut self, provider: &TelemetryRef);

    /// The state stores this operator owns, for runtime enumeration.
    fn state_stores(&self) -> Vec<StoreDescriptor> {
        Vec::new()
    }
}

/// The type-erased forward edge between two operators.
pub type BoxedOperator<T> = Box<dyn Operator<In = T>>;

impl<O: Operator + ?Sized> Operator for Box<O> {
    type In = O::In;

    fn start(&mut self) -> Result<(), StreamError> {
        (**self).start()
    }

    fn process(&mut self, item: Self::In) -> Result<(), StreamError> {
        (**self).process(item)
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        (**self).stop()
    }

    fn set_telemetry_provider(&mut self, provider: &TelemetryRef) {
        (**self).set_telemetry_provider(provider)
    }

    fn state_stores(&self) -> Vec<StoreDescriptor> {
        (**self).state_stores()
    }
}

/// The set-once downstream slot most operators carry.
pub(crate) struct NextEdge<T> {
    next: Option<BoxedOperator<T>>,
}

impl<T: Data> NextEdge<T> {
    pub(crate) fn unset() -> Self {
        Self { next: None }
    }

    pub(crate) fn set(&mut self, next: BoxedOperator<T>) -> Result<(), StreamError> {
        if self.next.is_some() {
            return Err(StreamError::illegal("downstream operator already set"));
        }
        self.next = Some(next);
        Ok(())
    }

    pub(crate) fn forward(&mut self, item: T) -> Result<(), StreamError> {
        match &mut self.next {
            Some(next) => next.process(item),
            None => Ok(()),
        }
    }

    pub(crate) fn start(&mut self) -> Result<(), StreamError> {
        match &mut self.next {
            Some(next) => next.start(),
            None => Ok(()),
        }
    }

    pub(crate) fn stop(&mut self) -> Result<(), StreamError> {
        match &mut self.next {
            Some(next) => next.stop(),
            None => Ok(()),
        }
    }

    pub(crate) fn set_telemetry_provider(&mut self, provider: &TelemetryRef) {
        if let Some(next) = &mut self.next {
            next.set_telemetry_provider(provider);
        }
    }

    pub(crate) fn state_stores(&self) -> Vec<StoreDescriptor> {
        self.next
            .as_ref()
            .map(|n| n.state_stores())
            .unwrap_or_default()
    }
}

impl<T> Display for NextEdge<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.next {
            Some(next) => write!(f, " -> {next}"),
            None => Ok(()),
        }
    }
}
