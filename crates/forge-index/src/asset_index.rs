//! Url to [`ObjectId`] maps.
//!
//! [`FileAssetIndexMap`] is a persisted map backed by a [`DictionaryStore`].
//! [`ObjectDatabaseAssetIndexMap`] is the composite read view the object
//! database exposes: the union of every merged source plus an optional
//! writable layer that receives all writes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use forge_types::ObjectId;
use tracing::debug;

use crate::collections::DictionaryStore;
use crate::error::{IndexError, IndexResult};

/// A mapping from url strings to object ids.
pub trait AssetIndexMap: Send + Sync {
    fn try_get(&self, url: &str) -> Option<ObjectId>;

    /// Like `try_get`, but a missing url is [`IndexError::KeyNotFound`].
    fn get(&self, url: &str) -> IndexResult<ObjectId> {
        self.try_get(url)
            .ok_or_else(|| IndexError::KeyNotFound(url.to_string()))
    }

    fn contains(&self, url: &str) -> bool {
        self.try_get(url).is_some()
    }

    fn set(&self, url: &str, id: ObjectId) -> IndexResult<()>;

    fn set_many(&self, values: Vec<(String, ObjectId)>) -> IndexResult<()> {
        for (url, id) in values {
            self.set(&url, id)?;
        }
        Ok(())
    }

    /// Every (url, id) pair.
    fn values(&self) -> Vec<(String, ObjectId)>;

    /// Pick up changes made by other writers.
    fn load_new_values(&self) -> IndexResult<()> {
        Ok(())
    }

    /// Flush pending writes.
    fn save(&self) -> IndexResult<()> {
        Ok(())
    }

    /// Erase every entry.
    fn clear(&self) -> IndexResult<()> {
        Err(IndexError::ReadOnly)
    }
}

// ---------------------------------------------------------------------------
// File-backed map
// ---------------------------------------------------------------------------

/// An asset index persisted as an append-only dictionary file.
pub struct FileAssetIndexMap {
    store: DictionaryStore<String, ObjectId>,
}

impl FileAssetIndexMap {
    pub fn open(path: &Path) -> IndexResult<Self> {
        Ok(Self {
            store: DictionaryStore::open(path)?,
        })
    }

    pub fn path(&self) -> &Path {
        self.store.store().path()
    }

    /// Defer writes until [`AssetIndexMap::save`].
    pub fn set_use_transaction(&self, enabled: bool) {
        self.store.store().set_use_transaction(enabled);
    }
}

impl AssetIndexMap for FileAssetIndexMap {
    fn try_get(&self, url: &str) -> Option<ObjectId> {
        self.store.try_get(&url.to_string())
    }

    fn set(&self, url: &str, id: ObjectId) -> IndexResult<()> {
        self.store.set(url.to_string(), id)
    }

    fn set_many(&self, values: Vec<(String, ObjectId)>) -> IndexResult<()> {
        self.store.set_many(values)
    }

    fn values(&self) -> Vec<(String, ObjectId)> {
        self.store.values()
    }

    fn load_new_values(&self) -> IndexResult<()> {
        self.store.store().load_new_values().map(|_| ())
    }

    fn save(&self) -> IndexResult<()> {
        self.store.store().save()
    }

    /// Erase every entry, on disk and in memory.
    fn clear(&self) -> IndexResult<()> {
        self.store.store().reset()
    }
}

// ---------------------------------------------------------------------------
// Merged view
// ---------------------------------------------------------------------------

/// The merged url index of an object database.
///
/// Reads see the union of every merged map. Writes go to the writable map,
/// when one is configured, and are reflected in the merged view.
pub struct ObjectDatabaseAssetIndexMap {
    merged: Mutex<HashMap<String, ObjectId>>,
    writable: Option<Arc<dyn AssetIndexMap>>,
}

impl ObjectDatabaseAssetIndexMap {
    /// A view with no writable layer.
    pub fn new() -> Self {
        Self {
            merged: Mutex::new(HashMap::new()),
            writable: None,
        }
    }

    /// A view whose writes go to `writable`. Its current values are merged.
    pub fn with_writable(writable: Arc<dyn AssetIndexMap>) -> Self {
        let map = Self {
            merged: Mutex::new(HashMap::new()),
            writable: Some(writable),
        };
        if let Some(w) = &map.writable {
            map.merge_values(w.values());
        }
        map
    }

    pub fn writable(&self) -> Option<&Arc<dyn AssetIndexMap>> {
        self.writable.as_ref()
    }

    /// Copy every pair of `other` into the view. Later merges win.
    pub fn merge(&self, other: &dyn AssetIndexMap) {
        self.merge_values(other.values());
    }

    pub fn merge_values(&self, values: impl IntoIterator<Item = (String, ObjectId)>) {
        let mut merged = self.merged.lock().expect("asset index lock poisoned");
        for (url, id) in values {
            merged.insert(url, id);
        }
    }

    /// Remove every key of `values`, whatever id it currently maps to.
    pub fn unmerge(&self, values: impl IntoIterator<Item = (String, ObjectId)>) {
        let mut merged = self.merged.lock().expect("asset index lock poisoned");
        for (url, _) in values {
            merged.remove(&url);
        }
    }

    /// Remove only the keys that still map to the given id.
    ///
    /// Returns the number of keys removed.
    pub fn unmerge_matching(&self, values: impl IntoIterator<Item = (String, ObjectId)>) -> usize {
        let mut merged = self.merged.lock().expect("asset index lock poisoned");
        let mut removed = 0;
        for (url, id) in values {
            if merged.get(&url) == Some(&id) {
                merged.remove(&url);
                removed += 1;
            } else {
                debug!(%url, "kept asset index entry re-pointed by a later merge");
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.merged.lock().expect("asset index lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ObjectDatabaseAssetIndexMap {
    fn default() -> Self {
        Self::new()
    }
}

impl AssetIndexMap for ObjectDatabaseAssetIndexMap {
    fn try_get(&self, url: &str) -> Option<ObjectId> {
        self.merged
            .lock()
            .expect("asset index lock poisoned")
            .get(url)
            .copied()
    }

    fn set(&self, url: &str, id: ObjectId) -> IndexResult<()> {
        if let Some(w) = &self.writable {
            w.set(url, id)?;
        }
        self.merged
            .lock()
            .expect("asset index lock poisoned")
            .insert(url.to_string(), id);
        Ok(())
    }

    fn set_many(&self, values: Vec<(String, ObjectId)>) -> IndexResult<()> {
        if let Some(w) = &self.writable {
            w.set_many(values.clone())?;
        }
        self.merge_values(values);
        Ok(())
    }

    fn values(&self) -> Vec<(String, ObjectId)> {
        self.merged
            .lock()
            .expect("asset index lock poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    fn load_new_values(&self) -> IndexResult<()> {
        if let Some(w) = &self.writable {
            w.load_new_values()?;
            self.merge_values(w.values());
        }
        Ok(())
    }

    fn save(&self) -> IndexResult<()> {
        match &self.writable {
            Some(w) => w.save(),
            None => Ok(()),
        }
    }

    /// Clears the writable layer and the whole merged view.
    fn clear(&self) -> IndexResult<()> {
        if let Some(w) = &self.writable {
            w.clear()?;
        }
        self.merged.lock().expect("asset index lock poisoned").clear();
        Ok(())
    }
}
