//! Typed stores built on [`Store`]: an ordered list and a last-wins dictionary.

use std::collections::HashMap;
use std::hash::Hash;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::IndexResult;
use crate::store::{Store, StoreCollection};

/// Values in append order.
#[derive(Debug)]
pub struct ListCollection<T>(Vec<T>);

impl<T> Default for ListCollection<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> StoreCollection for ListCollection<T>
where
    T: Serialize + DeserializeOwned + Clone + Send,
{
    type Item = T;

    fn add_loaded(&mut self, item: T) {
        self.0.push(item);
    }

    fn clear(&mut self) {
        self.0.clear();
    }
}

/// An append-only list persisted to a single file.
pub struct ListStore<T>
where
    T: Serialize + DeserializeOwned + Clone + Send,
{
    store: Store<ListCollection<T>>,
}

impl<T> ListStore<T>
where
    T: Serialize + DeserializeOwned + Clone + Send,
{
    pub fn open(path: &Path) -> IndexResult<Self> {
        Ok(Self {
            store: Store::open(path)?,
        })
    }

    pub fn add_value(&self, value: T) -> IndexResult<()> {
        self.store.add_value(value)
    }

    /// Saved values in order, followed by pending ones.
    pub fn values(&self) -> Vec<T> {
        self.store.read(|loaded, pending| {
            loaded.0.iter().chain(pending.iter()).cloned().collect()
        })
    }

    pub fn len(&self) -> usize {
        self.store.read(|loaded, pending| loaded.0.len() + pending.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The underlying store, for transactions and refreshes.
    pub fn store(&self) -> &Store<ListCollection<T>> {
        &self.store
    }
}

/// Key/value pairs where a later value replaces an earlier one.
#[derive(Debug)]
pub struct DictionaryCollection<K, V>(HashMap<K, V>);

impl<K, V> Default for DictionaryCollection<K, V> {
    fn default() -> Self {
        Self(HashMap::new())
    }
}

impl<K, V> StoreCollection for DictionaryCollection<K, V>
where
    K: Serialize + DeserializeOwned + Clone + Send + Eq + Hash,
    V: Serialize + DeserializeOwned + Clone + Send,
{
    type Item = (K, V);

    fn add_loaded(&mut self, (key, value): (K, V)) {
        self.0.insert(key, value);
    }

    fn clear(&mut self) {
        self.0.clear();
    }
}

/// A persisted dictionary. Every `set` appends a pair; loading replays
/// the pairs so the last write for a key wins.
pub struct DictionaryStore<K, V>
where
    K: Serialize + DeserializeOwned + Clone + Send + Eq + Hash,
    V: Serialize + DeserializeOwned + Clone + Send,
{
    store: Store<DictionaryCollection<K, V>>,
}

impl<K, V> DictionaryStore<K, V>
where
    K: Serialize + DeserializeOwned + Clone + Send + Eq + Hash,
    V: Serialize + DeserializeOwned + Clone + Send,
{
    pub fn open(path: &Path) -> IndexResult<Self> {
        Ok(Self {
            store: Store::open(path)?,
        })
    }

    /// Pending values shadow saved ones.
    pub fn try_get(&self, key: &K) -> Option<V> {
        self.store.read(|loaded, pending| {
            pending
                .iter()
                .rev()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .or_else(|| loaded.0.get(key).cloned())
        })
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.try_get(key).is_some()
    }

    pub fn set(&self, key: K, value: V) -> IndexResult<()> {
        self.store.add_value((key, value))
    }

    pub fn set_many(&self, values: impl IntoIterator<Item = (K, V)>) -> IndexResult<()> {
        self.store.add_values(values)
    }

    /// Every key with its effective value.
    pub fn values(&self) -> Vec<(K, V)> {
        self.store.read(|loaded, pending| {
            let mut merged = loaded.0.clone();
            for (k, v) in pending {
                merged.insert(k.clone(), v.clone());
            }
            merged.into_iter().collect()
        })
    }

    pub fn store(&self) -> &Store<DictionaryCollection<K, V>> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_store_keeps_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list");
        let list = ListStore::<u32>::open(&path).unwrap();
        for i in [3, 1, 2] {
            list.add_value(i).unwrap();
        }
        drop(list);

        let list = ListStore::<u32>::open(&path).unwrap();
        assert_eq!(list.values(), vec![3, 1, 2]);
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn dictionary_last_write_wins_after_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dict");
        let dict = DictionaryStore::<String, u32>::open(&path).unwrap();
        dict.set("a".into(), 1).unwrap();
        dict.set("b".into(), 2).unwrap();
        dict.set("a".into(), 3).unwrap();
        drop(dict);

        let dict = DictionaryStore::<String, u32>::open(&path).unwrap();
        assert_eq!(dict.try_get(&"a".into()), Some(3));
        assert_eq!(dict.try_get(&"b".into()), Some(2));
        assert_eq!(dict.try_get(&"c".into()), None);
        assert_eq!(dict.values().len(), 2);
    }

    #[test]
    fn dictionary_pending_values_are_visible() {
        let dir = tempfile::tempdir().unwrap();
        let dict = DictionaryStore::<String, u32>::open(&dir.path().join("dict")).unwrap();
        dict.set("a".into(), 1).unwrap();

        dict.store().set_use_transaction(true);
        dict.set("a".into(), 2).unwrap();
        assert_eq!(dict.try_get(&"a".into()), Some(2));

        let values = dict.values();
        assert_eq!(values, vec![("a".to_string(), 2)]);

        dict.store().save().unwrap();
        assert_eq!(dict.try_get(&"a".into()), Some(2));
    }
}
