//! State stores backing the stateful operators and the CDC checkpoints.
//!
//! A store is a named mapping from `K` to `V`. Stores are shared: the owning
//! operator mutates them under its per-store lock, external readers may look
//! at them concurrently. `iter` and `keys` observe a consistent snapshot per
//! call but not across calls.

use std::sync::Arc;

use crate::error::StateBackendError;

pub use memory::InMemoryStore;

pub mod memory;
pub mod sql;

pub type StoreIter<'a, K, V> =
    Box<dyn Iterator<Item = Result<(K, V), StateBackendError>> + Send + 'a>;

pub trait StateStore<K, V>: Send + Sync {
    /// Stable name of this store, used for diagnostics and telemetry.
    fn name(&self) -> &str;

    fn get(&self, key: &K) -> Result<Option<V>, StateBackendError>;

    fn put(&self, key: K, value: V) -> Result<(), StateBackendError>;

    /// Remove the entry, returning the previous value when one was present.
    fn remove(&self, key: &K) -> Result<Option<V>, StateBackendError>;

    fn contains_key(&self, key: &K) -> Result<bool, StateBackendError>;

    /// Lazily enumerate the entries. Unordered unless the backend documents
    /// otherwise.
    fn iter(&self) -> Result<StoreIter<'_, K, V>, StateBackendError>;

    fn keys(&self) -> Result<Vec<K>, StateBackendError>;
}

pub type SharedStore<K, V> = Arc<dyn StateStore<K, V>>;

/// What the runtime sees when it enumerates an operator's stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDescriptor {
    pub name: String,
}

impl StoreDescriptor {
    pub fn of<K, V>(store: &dyn StateStore<K, V>) -> Self {
        Self {
            name: store.name().to_string(),
        }
    }
}
