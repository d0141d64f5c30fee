//! Stream-table join.
//!
//! The left side is the live stream; the right side is a shared state store
//! populated by an external writer (often a CDC-fed pipeline). Misses are
//! dropped silently; per-key results are linearizable with respect to
//! concurrent store writers.

use std::fmt::Display;
use std::marker::PhantomData;

use parking_lot::Mutex;

use crate::error::StreamError;
use crate::operator::{BoxedOperator, Data, DataKey, KeyerFn, NextEdge, Operator};
use crate::store::{SharedStore, StoreDescriptor};
use crate::telemetry::{OperatorTelemetry, TelemetryRef};

pub struct Join<Left, Key, Right, Out, FK, FJ>
where
    FK: KeyerFn<Key, Left>,
    FJ: FnMut(Left, Right) -> Out + Send,
{
    keyer: FK,
    join_fn: FJ,
    store: SharedStore<Key, Right>,
    lock: Mutex<()>,
    next: NextEdge<Out>,
    telemetry: OperatorTelemetry,
    _left: PhantomData<Left>,
}

impl<Left, Key, Right, Out, FK, FJ> Join<Left, Key, Right, Out, FK, FJ>
where
    Left: Data,
    Key: DataKey,
    Right: Data,
    Out: Data,
    FK: KeyerFn<Key, Left>,
    FJ: FnMut(Left, Right) -> Out + Send,
{
    pub fn new(store: SharedStore<Key, Right>, keyer: FK, join_fn: FJ) -> Self {
        Self {
            keyer,
            join_fn,
            store,
            lock: Mutex::new(()),
            next: NextEdge::unset(),
            telemetry: OperatorTelemetry::unset(),
            _left: PhantomData,
        }
    }

    pub fn set_next(&mut self, next: BoxedOperator<Out>) -> Result<(), StreamError> {
        self.next.set(next)
    }
}

impl<Left, Key, Right, Out, FK, FJ> Display for Join<Left, Key, Right, Out, FK, FJ>
where
    FK: KeyerFn<Key, Left>,
    FJ: FnMut(Left, Right) -> Out + Send,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Join<{} x {} -> {}>{}",
            std::any::type_name::<Left>(),
            std::any::type_name::<Right>(),
            std::any::type_name::<Out>(),
            self.next
        )
    }
}

impl<Left, Key, Right, Out, FK, FJ> Operator for Join<Left, Key, Right, Out, FK, FJ>
where
    Left: Data,
    Key: DataKey,
    Right: Data,
    Out: Data,
    FK: KeyerFn<Key, Left>,
    FJ: FnMut(Left, Right) -> Out + Send,
{
    type In = Left;

    fn start(&mut self) -> Result<(), StreamError> {
        self.next.start()
    }

    fn process(&mut self, item: Left) -> Result<(), StreamError> {
        let key = (self.keyer)(&item);
        // lookup under the store lock, join outside of it
        let right = {
            let _guard = self.lock.lock();
            self.store.get(&key)?
        };
        match right {
            Some(right) => {
                let join_fn = &mut self.join_fn;
                let out = self.telemetry.observe(|| join_fn(item, right));
                self.next.forward(out)
            }
            None => {
                tracing::trace!("join: no table entry, dropping stream element");
                Ok(())
            }
        }
    }

    fn stop(&mut self) -> Result<(), StreamError> {
        self.next.stop()
    }

    fn set_telemetry_provider(&mut self, provider: &TelemetryRef) {
        self.telemetry.wire::<Left>("join", provider);
        self.next.set_telemetry_provider(provider);
    }

    fn state_stores(&self) -> Vec<StoreDescriptor> {
        let mut stores = vec![StoreDescriptor::of(&*self.store)];
        stores.extend(self.next.state_stores());
        stores
    }
}
