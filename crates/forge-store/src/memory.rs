use std::collections::HashMap;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use forge_index::{AssetIndexMap, ObjectDatabaseAssetIndexMap};
use forge_types::{ObjectId, ObjectIdBuilder};

use crate::error::{StoreError, StoreResult};
use crate::traits::{BackendKind, FileAccess, ObjectStream, OdbBackend, OpenMode};

type ObjectMap = Arc<RwLock<HashMap<ObjectId, Arc<Vec<u8>>>>>;

/// In-memory, HashMap-based object backend.
///
/// Intended for tests and embedding. Objects are held behind a `RwLock` and
/// shared by `Arc`, so reads do not copy until a stream is opened.
pub struct MemoryOdbBackend {
    objects: ObjectMap,
    writes: AtomicUsize,
    read_only: bool,
    asset_index: Arc<ObjectDatabaseAssetIndexMap>,
}

impl MemoryOdbBackend {
    pub fn new() -> Self {
        Self {
            objects: Arc::new(RwLock::new(HashMap::new())),
            writes: AtomicUsize::new(0),
            read_only: false,
            asset_index: Arc::new(ObjectDatabaseAssetIndexMap::new()),
        }
    }

    /// A read-only backend pre-populated with `objects`.
    pub fn read_only_with(objects: impl IntoIterator<Item = Vec<u8>>) -> Self {
        let map = objects
            .into_iter()
            .map(|data| (ObjectId::from_bytes(&data), Arc::new(data)))
            .collect();
        Self {
            objects: Arc::new(RwLock::new(map)),
            writes: AtomicUsize::new(0),
            read_only: true,
            asset_index: Arc::new(ObjectDatabaseAssetIndexMap::new()),
        }
    }

    /// Number of objects currently stored.
    pub fn len(&self) -> usize {
        self.objects.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().expect("lock poisoned").is_empty()
    }

    /// Number of writes that actually stored data. Deduplicated writes
    /// are not counted.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Total bytes across all stored objects.
    pub fn total_bytes(&self) -> u64 {
        self.objects
            .read()
            .expect("lock poisoned")
            .values()
            .map(|data| data.len() as u64)
            .sum()
    }

    fn ensure_writable(&self) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreError::invalid("in-memory object backend is read-only"));
        }
        Ok(())
    }
}

impl Default for MemoryOdbBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// A stream over an in-memory object. Writable streams store their
/// buffer under the opened id on flush and on drop.
struct MemoryStream {
    cursor: Cursor<Vec<u8>>,
    commit: Option<(ObjectId, ObjectMap)>,
    dirty: bool,
}

impl MemoryStream {
    fn commit(&mut self) {
        if !self.dirty {
            return;
        }
        if let Some((id, objects)) = &self.commit {
            objects
                .write()
                .expect("lock poisoned")
                .insert(*id, Arc::new(self.cursor.get_ref().clone()));
            self.dirty = false;
        }
    }
}

impl Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.commit.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "stream opened for reading",
            ));
        }
        self.dirty = true;
        self.cursor.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.commit();
        Ok(())
    }
}

impl Seek for MemoryStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        self.commit();
    }
}

impl OdbBackend for MemoryOdbBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn open_stream(
        &self,
        id: &ObjectId,
        mode: OpenMode,
        access: FileAccess,
    ) -> StoreResult<Box<dyn ObjectStream>> {
        let writable = access.can_write() || mode != OpenMode::Open;
        if writable {
            self.ensure_writable()?;
        }
        let existing = self.objects.read().expect("lock poisoned").get(id).cloned();
        let initial = match (mode, existing) {
            (OpenMode::Create, _) => Vec::new(),
            (_, Some(data)) => data.as_ref().clone(),
            (OpenMode::OpenOrCreate, None) => Vec::new(),
            (OpenMode::Open, None) => return Err(StoreError::NotFound(*id)),
        };
        let dirty = mode == OpenMode::Create;
        Ok(Box::new(MemoryStream {
            cursor: Cursor::new(initial),
            commit: writable.then(|| (*id, Arc::clone(&self.objects))),
            dirty,
        }))
    }

    fn write(
        &self,
        id: ObjectId,
        data: &mut dyn Read,
        size: u64,
        force_write: bool,
    ) -> StoreResult<ObjectId> {
        self.ensure_writable()?;
        if !id.is_empty() && !force_write && self.exists(&id) {
            return Ok(id);
        }

        let mut buf = Vec::with_capacity(size as usize);
        data.take(size).read_to_end(&mut buf)?;
        let mut builder = ObjectIdBuilder::new();
        builder.write(&buf);
        let computed = builder.compute_hash();
        if !id.is_empty() && id != computed {
            return Err(StoreError::HashMismatch {
                expected: id,
                computed,
            });
        }

        let mut map = self.objects.write().expect("lock poisoned");
        if !force_write && map.contains_key(&computed) {
            return Ok(computed);
        }
        map.insert(computed, Arc::new(buf));
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(computed)
    }

    fn exists(&self, id: &ObjectId) -> bool {
        self.objects.read().expect("lock poisoned").contains_key(id)
    }

    fn get_size(&self, id: &ObjectId) -> StoreResult<u64> {
        self.objects
            .read()
            .expect("lock poisoned")
            .get(id)
            .map(|data| data.len() as u64)
            .ok_or(StoreError::NotFound(*id))
    }

    fn get_file_path(&self, id: &ObjectId) -> StoreResult<PathBuf> {
        Err(StoreError::invalid(format!(
            "object {} is held in memory and has no file path",
            id.short_hex()
        )))
    }

    fn enumerate_objects(&self) -> StoreResult<Vec<ObjectId>> {
        let map = self.objects.read().expect("lock poisoned");
        let mut ids: Vec<ObjectId> = map.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    fn delete(&self, id: &ObjectId) -> StoreResult<()> {
        self.ensure_writable()?;
        self.objects
            .write()
            .expect("lock poisoned")
            .remove(id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(*id))
    }

    fn asset_index_map(&self) -> Option<Arc<dyn AssetIndexMap>> {
        Some(Arc::clone(&self.asset_index) as Arc<dyn AssetIndexMap>)
    }

    fn read(&self, id: &ObjectId) -> StoreResult<Vec<u8>> {
        self.objects
            .read()
            .expect("lock poisoned")
            .get(id)
            .map(|data| data.as_ref().clone())
            .ok_or(StoreError::NotFound(*id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read_roundtrip() {
        let odb = MemoryOdbBackend::new();
        let id = odb.write_bytes(ObjectId::EMPTY, b"payload", false).unwrap();
        assert_eq!(id, ObjectId::from_bytes(b"payload"));
        assert_eq!(odb.read(&id).unwrap(), b"payload");
        assert_eq!(odb.get_size(&id).unwrap(), 7);
        assert_eq!(odb.total_bytes(), 7);
    }

    #[test]
    fn dedup_does_not_count_as_write() {
        let odb = MemoryOdbBackend::new();
        odb.write_bytes(ObjectId::EMPTY, b"x", false).unwrap();
        odb.write_bytes(ObjectId::EMPTY, b"x", false).unwrap();
        assert_eq!(odb.write_count(), 1);
        assert_eq!(odb.len(), 1);

        odb.write_bytes(ObjectId::EMPTY, b"x", true).unwrap();
        assert_eq!(odb.write_count(), 2);
        assert_eq!(odb.len(), 1);
    }

    #[test]
    fn writable_stream_commits_on_drop() {
        let odb = MemoryOdbBackend::new();
        let id = ObjectId::from_bytes(b"slot");
        {
            let mut s = odb.open_stream(&id, OpenMode::Create, FileAccess::Write).unwrap();
            s.write_all(b"abc").unwrap();
        }
        assert_eq!(odb.read(&id).unwrap(), b"abc");
    }

    #[test]
    fn read_stream_rejects_writes() {
        let odb = MemoryOdbBackend::new();
        let id = odb.write_bytes(ObjectId::EMPTY, b"ro", false).unwrap();
        let mut s = odb.open_stream(&id, OpenMode::Open, FileAccess::Read).unwrap();
        assert!(s.write_all(b"no").is_err());
        drop(s);
        assert_eq!(odb.read(&id).unwrap(), b"ro");
    }

    #[test]
    fn read_only_backend_rejects_writes_and_deletes() {
        let odb = MemoryOdbBackend::read_only_with(vec![b"seed".to_vec()]);
        let id = ObjectId::from_bytes(b"seed");
        assert!(odb.exists(&id));
        assert!(matches!(
            odb.write_bytes(ObjectId::EMPTY, b"new", false),
            Err(StoreError::InvalidOperation(_))
        ));
        assert!(matches!(odb.delete(&id), Err(StoreError::InvalidOperation(_))));
        assert!(odb
            .open_stream(&id, OpenMode::Open, FileAccess::ReadWrite)
            .is_err());
    }

    #[test]
    fn missing_object_is_not_found() {
        let odb = MemoryOdbBackend::new();
        let id = ObjectId::from_bytes(b"nope");
        assert!(matches!(odb.read(&id), Err(StoreError::NotFound(_))));
        assert!(matches!(odb.get_size(&id), Err(StoreError::NotFound(_))));
        assert!(matches!(odb.delete(&id), Err(StoreError::NotFound(_))));
    }
}
