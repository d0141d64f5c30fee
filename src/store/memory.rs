//! In-memory state store over a concurrent map. No persistence.

use std::hash::Hash;

use dashmap::DashMap;

use crate::error::StateBackendError;
use crate::operator::{Data, DataKey};
use crate::store::{StateStore, StoreIter};

pub struct InMemoryStore<K, V> {
    name: String,
    map: DashMap<K, V>,
}

impl<K: Eq + Hash, V> InMemoryStore<K, V> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            map: DashMap::new(),
        }
    }
}

impl<K: DataKey, V: Data> StateStore<K, V> for InMemoryStore<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &K) -> Result<Option<V>, StateBackendError> {
        Ok(self.map.get(key).map(|e| e.value().clone()))
    }

    fn put(&self, key: K, value: V) -> Result<(), StateBackendError> {
        self.map.insert(key, value);
        Ok(())
    }

    fn remove(&self, key: &K) -> Result<Option<V>, StateBackendError> {
        Ok(self.map.remove(key).map(|(_, v)| v))
    }

    fn contains_key(&self, key: &K) -> Result<bool, StateBackendError> {
        Ok(self.map.contains_key(key))
    }

    fn iter(&self) -> Result<StoreIter<'_, K, V>, StateBackendError> {
        // Snapshot the keys, then fetch lazily. Entries removed between the
        // snapshot and the fetch are skipped.
        let keys: Vec<K> = self.map.iter().map(|e| e.key().clone()).collect();
        Ok(Box::new(keys.into_iter().filter_map(move |k| {
            self.map.get(&k).map(|e| Ok((k.clone(), e.value().clone())))
        })))
    }

    fn keys(&self) -> Result<Vec<K>, StateBackendError> {
        Ok(self.map.iter().map(|e| e.key().clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_remove() {
        let store = InMemoryStore::new("test");
        store.put("a".to_string(), 1).unwrap();
        store.put("b".to_string(), 2).unwrap();
        assert_eq!(store.get(&"a".to_string()).unwrap(), Some(1));
        assert!(store.contains_key(&"b".to_string()).unwrap());
        assert_eq!(store.remove(&"a".to_string()).unwrap(), Some(1));
        assert_eq!(store.get(&"a".to_string()).unwrap(), None);
        assert_eq!(store.keys().unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn iter_snapshots_keys() {
        let store = InMemoryStore::new("test");
        for i in 0..4 {
            store.put(i, i * 10).unwrap();
        }
        let mut entries: Vec<_> = store
            .iter()
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        entries.sort_unstable();
        assert_eq!(entries, vec![(0, 0), (1, 10), (2, 20), (3, 30)]);
    }
}
