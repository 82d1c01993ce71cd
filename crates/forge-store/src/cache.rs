//! Shared in-memory blobs keyed by object id.
//!
//! A blob stays cached while any [`Blob`] handle to it is alive. Handle
//! counts change only under the cache lock, so a lookup never hands out a
//! blob whose last handle is being released.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use forge_types::ObjectId;
use tracing::{trace, warn};

use crate::error::{StoreError, StoreResult};

struct BlobData {
    id: ObjectId,
    data: Vec<u8>,
    refs: Mutex<usize>,
}

struct CacheInner {
    blobs: Mutex<HashMap<ObjectId, Arc<BlobData>>>,
}

impl CacheInner {
    fn destroy(&self, blob: &Arc<BlobData>) -> StoreResult<()> {
        let mut blobs = self.blobs.lock().expect("blob cache lock poisoned");
        self.destroy_locked(&mut blobs, blob)
    }

    fn destroy_locked(
        &self,
        blobs: &mut HashMap<ObjectId, Arc<BlobData>>,
        blob: &Arc<BlobData>,
    ) -> StoreResult<()> {
        match blobs.get(&blob.id) {
            Some(cached) if Arc::ptr_eq(cached, blob) => {
                blobs.remove(&blob.id);
                trace!(id = %blob.id.short_hex(), "blob evicted");
                Ok(())
            }
            _ => Err(StoreError::invalid(format!(
                "blob {} is not the cached instance",
                blob.id.short_hex()
            ))),
        }
    }
}

/// Cache of immutable in-memory blobs.
#[derive(Clone)]
pub struct ObjectCache {
    inner: Arc<CacheInner>,
}

impl ObjectCache {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                blobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Return the cached blob for `id`, adding a handle.
    pub fn lookup(&self, id: &ObjectId) -> Option<Blob> {
        let blobs = self.inner.blobs.lock().expect("blob cache lock poisoned");
        let data = blobs.get(id)?;
        Some(self.handle(data))
    }

    /// Return the cached blob for `id`, or insert the one built by `create`.
    ///
    /// The cache lock is held while `create` runs, so concurrent callers for
    /// the same id observe exactly one creation.
    pub fn get_or_insert_with<F>(&self, id: ObjectId, create: F) -> StoreResult<Blob>
    where
        F: FnOnce() -> StoreResult<Vec<u8>>,
    {
        let mut blobs = self.inner.blobs.lock().expect("blob cache lock poisoned");
        if let Some(existing) = blobs.get(&id) {
            return Ok(self.handle(existing));
        }
        let data = Arc::new(BlobData {
            id,
            data: create()?,
            refs: Mutex::new(0),
        });
        let blob = self.handle(&data);
        blobs.insert(id, data);
        trace!(id = %id.short_hex(), "blob cached");
        Ok(blob)
    }

    /// Remove `blob` from the cache. Fails if a different instance is
    /// cached under its id.
    pub fn destroy(&self, blob: &Blob) -> StoreResult<()> {
        self.inner.destroy(&blob.data)
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.inner
            .blobs
            .lock()
            .expect("blob cache lock poisoned")
            .contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.blobs.lock().expect("blob cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn handle(&self, data: &Arc<BlobData>) -> Blob {
        *data.refs.lock().expect("blob lock poisoned") += 1;
        Blob {
            data: Arc::clone(data),
            cache: Arc::clone(&self.inner),
        }
    }
}

impl Default for ObjectCache {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle to an immutable cached object.
pub struct Blob {
    data: Arc<BlobData>,
    cache: Arc<CacheInner>,
}

impl Blob {
    pub fn id(&self) -> ObjectId {
        self.data.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data.data
    }

    pub fn len(&self) -> usize {
        self.data.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.data.is_empty()
    }

    /// Number of live handles.
    pub fn ref_count(&self) -> usize {
        *self.data.refs.lock().expect("blob lock poisoned")
    }
}

impl Clone for Blob {
    fn clone(&self) -> Self {
        let _blobs = self.cache.blobs.lock().expect("blob cache lock poisoned");
        *self.data.refs.lock().expect("blob lock poisoned") += 1;
        Self {
            data: Arc::clone(&self.data),
            cache: Arc::clone(&self.cache),
        }
    }
}

impl Drop for Blob {
    fn drop(&mut self) {
        let Ok(mut blobs) = self.cache.blobs.lock() else {
            return;
        };
        let remaining = {
            let Ok(mut refs) = self.data.refs.lock() else {
                return;
            };
            *refs -= 1;
            *refs
        };
        if remaining == 0 {
            if let Err(e) = self.cache.destroy_locked(&mut blobs, &self.data) {
                warn!(error = %e, "releasing blob");
            }
        }
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("id", &self.data.id)
            .field("len", &self.data.data.len())
            .finish()
    }
}
