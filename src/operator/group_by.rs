//! Keyed grouping operators.
//!
//! Both variants append every input to the list stored under its key; the
//! get-append-put sequence runs under the per-store lock so exactly one
//! `process` is in flight per operator-store pair.

use std::fmt::Display;

use parking_lot::Mutex;

use crate::error::StreamError;
use crate::operator::{BoxedOperator, Data, DataKey, KeyerFn, NextEdge, Operator};
use crate::store::{SharedStore, StoreDescriptor};
use crate::telemetry::{OperatorTelemetry, TelemetryRef};

/// Forwards `(key, current list)` after appending the input.
pub struct GroupByKey<In, Key, F>
where
    F: KeyerFn<Key, In>,
{
    keyer: F,
    store: SharedStore<Key, Vec<In>>,
    lock: Mutex<()>,
    next: NextEdge<(Key, Vec<In>)>,
    telemetry: OperatorTelemetry,
}

impl<In: Data, Key: DataKey, F: KeyerFn<Key, In>> GroupByKey<In, Key, F> {
    pub fn new(keyer: F, store: SharedStore<Key, Vec<In>>) -> Self {
        Self {
            keyer,
            store,
            lock: Mutex::new(()),
            next: NextEdge::unset(),
            telemetry: OperatorTelemetry::unset(),
        }
    }

    pub fn set_next(&mut self, next: BoxedOperator<(Key, Vec<In>)>) -> Result<(), StreamError> {
        self.next.set(next)
    }

    fn append(&self, item: In) -> Result<(Key, Vec<In>), StreamError> {
        let _guard = self.lock.lock();
        let key = (self.keyer)(&item);
        let mut list = self.store.get(&key)?.unwrap_or_default();
        list.push(item);
        self.store.put(key.clone(), list.clone())?;
        Ok((key, list))
    }
}

impl<In: Data, Key: DataKey, F: KeyerFn<Key, In>> Display for GroupByKey<In, Key, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "GroupByKey<{} by {}>{}",
            std::any::type_name::<In>(),
            std::any::type_name::<Key>(),
            self.next
        )
    }
}

impl<In: Data, Key: DataKey, F: KeyerFn<Key, In>> Operator for GroupByKey<In, Key, F> {
    type In = In;

    fn start(&mut self) -> Result<(), StreamError> {
        self.next.start()
    }

    fn process(&mut self, item: In) -> Result<(), StreamError> {
        let grouped = self.telemetry.observe(|| self.append(item))?;
        self.next.forward(grouped)
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        self.next.stop()
    }

    fn set_telemetry_provider(&mut self, provider: &TelemetryRef) {
        self.telemetry.wire::<In>("group_by", provider);
        self.next.set_telemetry_provider(provider);
    }

    fn state_stores(&self) -> Vec<StoreDescriptor> {
        let mut stores = vec![StoreDescriptor::of(&*self.store)];
        stores.extend(self.next.state_stores());
        stores
    }
}

/// Same state mutation as [`GroupByKey`] but forwards the original input
/// unchanged.
pub struct GroupBySilently<In, Key, F>
where
    F: KeyerFn<Key, In>,
{
    keyer: F,
    store: SharedStore<Key, Vec<In>>,
    lock: Mutex<()>,
    next: NextEdge<In>,
    telemetry: OperatorTelemetry,
}

impl<In: Data, Key: DataKey, F: KeyerFn<Key, In>> GroupBySilently<In, Key, F> {
    pub fn new(keyer: F, store: SharedStore<Key, Vec<In>>) -> Self {
        Self {
            keyer,
            store,
            lock: Mutex::new(()),
            next: NextEdge::unset(),
            telemetry: OperatorTelemetry::unset(),
        }
    }

    pub fn set_next(&mut self, next: BoxedOperator<In>) -> Result<(), StreamError> {
        self.next.set(next)
    }
}

impl<In: Data, Key: DataKey, F: KeyerFn<Key, In>> Display for GroupBySilently<In, Key, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "GroupBySilently<{} by {}>{}",
            std::any::type_name::<In>(),
            std::any::type_name::<Key>(),
            self.next
        )
    }
}

impl<In: Data, Key: DataKey, F: KeyerFn<Key, In>> Operator for GroupBySilently<In, Key, F> {
    type In = In;

    fn start(&mut self) -> Result<(), StreamError> {
        self.next.start()
    }

    fn process(&mut self, item: In) -> Result<(), StreamError> {
        self.telemetry.observe(|| {
            let _guard = self.lock.lock();
            let key = (self.keyer)(&item);
            let mut list = self.store.get(&key)?.unwrap_or_default();
            list.push(item.clone());
            self.store.put(key, list)
        })?;
        self.next.forward(item)
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        self.next.stop()
    }

    fn set_telemetry_provider(&mut self, provider: &TelemetryRef) {
        self.telemetry.wire::<In>("group_by_silently", provider);
        self.next.set_telemetry_provider(provider);
    }

    fn state_stores(&self) -> Vec<StoreDescriptor> {
        let mut stores = vec![StoreDescriptor::of(&*self.store)];
        stores.extend(self.next.state_stores());
        stores
    }
}
