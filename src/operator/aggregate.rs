//! Keyed aggregation operators.
//!
//! `agg` folds each input into the accumulator stored under its key; the
//! absent-key accumulator is the type's default. The read-fold-write sequence
//! runs under the per-store lock. A panicking `agg` leaves the stored state
//! unchanged.

use std::fmt::Display;

use parking_lot::Mutex;

use crate::error::StreamError;
use crate::operator::{BoxedOperator, Data, DataKey, KeyerFn, NextEdge, Operator};
use crate::store::{SharedStore, StoreDescriptor};
use crate::telemetry::{OperatorTelemetry, TelemetryRef};

/// Forwards `(key, new accumulator)` for every input.
pub struct AggregateByKey<In, Key, Acc, FK, FA>
where
    FK: KeyerFn<Key, In>,
    FA: Fn(Acc, &In) -> Acc + Send,
{
    keyer: FK,
    agg: FA,
    store: SharedStore<Key, Acc>,
    lock: Mutex<()>,
    next: NextEdge<(Key, Acc)>,
    telemetry: OperatorTelemetry,
    _marker: std::marker::PhantomData<In>,
}

impl<In, Key, Acc, FK, FA> AggregateByKey<In, Key, Acc, FK, FA>
where
    In: Data,
    Key: DataKey,
    Acc: Data + Default,
    FK: KeyerFn<Key, In>,
    FA: Fn(Acc, &In) -> Acc + Send,
{
    pub fn new(keyer: FK, agg: FA, store: SharedStore<Key, Acc>) -> Self {
        Self {
            keyer,
            agg,
            store,
            lock: Mutex::new(()),
            next: NextEdge::unset(),
            telemetry: OperatorTelemetry::unset(),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn set_next(&mut self, next: BoxedOperator<(Key, Acc)>) -> Result<(), StreamError> {
        self.next.set(next)
    }

    fn fold(&self, item: &In) -> Result<(Key, Acc), StreamError> {
        let _guard = self.lock.lock();
        let key = (self.keyer)(item);
        let prev = self.store.get(&key)?.unwrap_or_default();
        let acc = (self.agg)(prev, item);
        self.store.put(key.clone(), acc.clone())?;
        Ok((key, acc))
    }
}

impl<In, Key, Acc, FK, FA> Display for AggregateByKey<In, Key, Acc, FK, FA>
where
    FK: KeyerFn<Key, In>,
    FA: Fn(Acc, &In) -> Acc + Send,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "AggregateByKey<{} by {} -> {}>",
            std::any::type_name::<In>(),
            std::any::type_name::<Key>(),
            std::any::type_name::<Acc>(),
        )
    }
}

impl<In, Key, Acc, FK, FA> Operator for AggregateByKey<In, Key, Acc, FK, FA>
where
    In: Data,
    Key: DataKey,
    Acc: Data + Default,
    FK: KeyerFn<Key, In>,
    FA: Fn(Acc, &In) -> Acc + Send,
{
    type In = In;

    fn start(&mut self) -> Result<(), StreamError> {
        self.next.start()
    }

    fn process(&mut self, item: In) -> Result<(), StreamError> {
        let folded = self.telemetry.observe(|| self.fold(&item))?;
        self.next.forward(folded)
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        self.next.stop()
    }

    fn set_telemetry_provider(&mut self, provider: &TelemetryRef) {
        self.telemetry.wire::<In>("aggregate", provider);
        self.next.set_telemetry_provider(provider);
    }

    fn state_stores(&self) -> Vec<StoreDescriptor> {
        let mut stores = vec![StoreDescriptor::of(&*self.store)];
        stores.extend(self.next.state_stores());
        stores
    }
}

/// Same state mutation as [`AggregateByKey`] but forwards the original input
/// unchanged.
pub struct AggregateSilently<In, Key, Acc, FK, FA>
where
    FK: KeyerFn<Key, In>,
    FA: Fn(Acc, &In) -> Acc + Send,
{
    inner: AggregateByKey<In, Key, Acc, FK, FA>,
    next: NextEdge<In>,
}

impl<In, Key, Acc, FK, FA> AggregateSilently<In, Key, Acc, FK, FA>
where
    In: Data,
    Key: DataKey,
    Acc: Data + Default,
    FK: KeyerFn<Key, In>,
    FA: Fn(Acc, &In) -> Acc + Send,
{
    pub fn new(keyer: FK, agg: FA, store: SharedStore<Key, Acc>) -> Self {
        Self {
            inner: AggregateByKey::new(keyer, agg, store),
            next: NextEdge::unset(),
        }
    }

    pub fn set_next(&mut self, next: BoxedOperator<In>) -> Result<(), StreamError> {
        self.next.set(next)
    }
}

impl<In, Key, Acc, FK, FA> Display for AggregateSilently<In, Key, Acc, FK, FA>
where
    FK: KeyerFn<Key, In>,
    FA: Fn(Acc, &In) -> Acc + Send,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "AggregateSilently<{} by {}>{}",
            std::any::type_name::<In>(),
            std::any::type_name::<Key>(),
            self.next
        )
    }
}

impl<In, Key, Acc, FK, FA> Operator for AggregateSilently<In, Key, Acc, FK, FA>
where
    In: Data,
    Key: DataKey,
    Acc: Data + Default,
    FK: KeyerFn<Key, In>,
    FA: Fn(Acc, &In) -> Acc + Send,
{
    type In = In;

    fn start(&mut self) -> Result<(), StreamError> {
        self.next.start()
    }

    fn process(&mut self, item: In) -> Result<(), StreamError> {
        self.inner.telemetry.observe(|| self.inner.fold(&item))?;
        self.next.forward(item)
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        self.next.stop()
    }

    fn set_telemetry_provider(&mut self, provider: &TelemetryRef) {
        self.inner
            .telemetry
            .wire::<In>("aggregate_silently", provider);
        self.next.set_telemetry_provider(provider);
    }

    fn state_stores(&self) -> Vec<StoreDescriptor> {
        let mut stores = vec![StoreDescriptor::of(&*self.inner.store)];
        stores.extend(self.next.state_stores());
        stores
    }
}
