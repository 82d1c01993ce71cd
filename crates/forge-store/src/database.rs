//! The object database: backends composed into one read/write surface.
//!
//! Reads resolve bundle → primary → secondary. Writes go to the write
//! backend, which is the primary when it is writable and the secondary
//! otherwise. Without a writable backend every mutation is
//! `StoreError::InvalidOperation`.

use std::collections::BTreeSet;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use forge_index::{AssetIndexMap, ObjectDatabaseAssetIndexMap};
use forge_pack::{PackError, PackOutcome, PackRequest};
use forge_types::ObjectId;
use tracing::{debug, info};

use crate::bundle::BundleBackend;
use crate::cache::{Blob, ObjectCache};
use crate::error::{StoreError, StoreResult};
use crate::loose::LooseFileBackend;
use crate::traits::{FileAccess, ObjectStream, OdbBackend, OpenMode};

/// Bundle loaded automatically when a database is opened.
pub const DEFAULT_BUNDLE: &str = "default";

/// Subdirectory of the database root holding bundle files.
pub const BUNDLE_DIRECTORY: &str = "bundles";

#[derive(Clone, Debug)]
pub struct DatabaseOptions {
    /// File name of the asset index inside each loose root.
    pub index_name: String,
    /// Open the primary root read-only.
    pub read_only: bool,
    /// Writable root used when the primary is read-only.
    pub additional_root: Option<PathBuf>,
    pub load_default_bundle: bool,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            index_name: "index".to_string(),
            read_only: false,
            additional_root: None,
            load_default_bundle: true,
        }
    }
}

pub struct ObjectDatabase {
    read1: Arc<dyn OdbBackend>,
    read2: Option<Arc<dyn OdbBackend>>,
    write: Option<Arc<dyn OdbBackend>>,
    write_is_primary: bool,
    bundles: BundleBackend,
    asset_index: Arc<ObjectDatabaseAssetIndexMap>,
    cache: ObjectCache,
}

impl ObjectDatabase {
    /// Open the loose-file database rooted at `root`.
    pub fn open(root: &Path, options: DatabaseOptions) -> StoreResult<Self> {
        let primary: Arc<dyn OdbBackend> = Arc::new(LooseFileBackend::open(
            root,
            options.read_only,
            &options.index_name,
        )?);
        let secondary: Option<Arc<dyn OdbBackend>> = match &options.additional_root {
            Some(extra) if primary.is_read_only() => Some(Arc::new(LooseFileBackend::open(
                extra,
                false,
                &options.index_name,
            )?)),
            _ => None,
        };

        let bundles = BundleBackend::new(&root.join(BUNDLE_DIRECTORY));
        let db = Self::from_backends(primary, secondary, bundles);
        info!(root = %root.display(), read_only = db.is_read_only(), "object database opened");

        if options.load_default_bundle {
            match db.load_bundle(DEFAULT_BUNDLE) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => debug!("no default bundle"),
                Err(e) => return Err(e),
            }
        }
        Ok(db)
    }

    /// Compose a database from explicit backends.
    pub fn from_backends(
        primary: Arc<dyn OdbBackend>,
        secondary: Option<Arc<dyn OdbBackend>>,
        bundles: BundleBackend,
    ) -> Self {
        let (write, write_is_primary) = if !primary.is_read_only() {
            (Some(Arc::clone(&primary)), true)
        } else {
            match &secondary {
                Some(s) if !s.is_read_only() => (Some(Arc::clone(s)), false),
                _ => (None, false),
            }
        };

        let asset_index = match write.as_ref().and_then(|w| w.asset_index_map()) {
            Some(writable) => ObjectDatabaseAssetIndexMap::with_writable(writable),
            None => ObjectDatabaseAssetIndexMap::new(),
        };
        if !write_is_primary {
            if let Some(map) = primary.asset_index_map() {
                asset_index.merge(map.as_ref());
            }
        }

        Self {
            read1: primary,
            read2: secondary,
            write,
            write_is_primary,
            bundles,
            asset_index: Arc::new(asset_index),
            cache: ObjectCache::new(),
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.write.is_none()
    }

    pub fn asset_index(&self) -> &Arc<ObjectDatabaseAssetIndexMap> {
        &self.asset_index
    }

    pub fn bundle_backend(&self) -> &BundleBackend {
        &self.bundles
    }

    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    fn write_backend(&self) -> StoreResult<&Arc<dyn OdbBackend>> {
        self.write
            .as_ref()
            .ok_or_else(|| StoreError::invalid("read-only object database"))
    }

    /// The backend that serves `id` for reading, if any.
    fn read_source(&self, id: &ObjectId) -> Option<&dyn OdbBackend> {
        if self.bundles.exists(id) {
            return Some(&self.bundles);
        }
        if self.read1.exists(id) {
            return Some(self.read1.as_ref());
        }
        match &self.read2 {
            Some(r) if r.exists(id) => Some(r.as_ref()),
            _ => None,
        }
    }

    pub fn exists(&self, id: &ObjectId) -> bool {
        self.read_source(id).is_some()
    }

    pub fn get_size(&self, id: &ObjectId) -> StoreResult<u64> {
        self.read_source(id)
            .ok_or(StoreError::NotFound(*id))?
            .get_size(id)
    }

    pub fn get_file_path(&self, id: &ObjectId) -> StoreResult<PathBuf> {
        if self.bundles.exists(id) {
            return self.bundles.get_file_path(id);
        }
        if self.read1.exists(id) {
            return self.read1.get_file_path(id);
        }
        if let Some(r) = &self.read2 {
            if r.exists(id) {
                return r.get_file_path(id);
            }
        }
        self.write_backend()?.get_file_path(id)
    }

    /// Open a stream on `id`.
    ///
    /// A writable stream on a database whose write backend is not the
    /// primary starts as a copy of the current content, if any.
    pub fn open_stream(
        &self,
        id: &ObjectId,
        mode: OpenMode,
        access: FileAccess,
    ) -> StoreResult<Box<dyn ObjectStream>> {
        if access == FileAccess::Read {
            return self
                .read_source(id)
                .ok_or(StoreError::NotFound(*id))?
                .open_stream(id, mode, access);
        }

        let write = self.write_backend()?;
        if self.write_is_primary {
            return write.open_stream(id, mode, access);
        }

        let existing = match self.read_source(id) {
            Some(source) => Some(source.read(id)?),
            None => None,
        };
        let write_mode = match (mode, &existing) {
            (OpenMode::Open, Some(_)) => OpenMode::Create,
            _ => mode,
        };
        let mut stream = write.open_stream(id, write_mode, access)?;
        if let Some(existing) = existing {
            stream.write_all(&existing)?;
        }
        stream.seek(SeekFrom::Start(0))?;
        Ok(stream)
    }

    /// Read an object, serving a cached blob when one is live.
    pub fn read(&self, id: &ObjectId) -> StoreResult<Vec<u8>> {
        if let Some(blob) = self.cache.lookup(id) {
            return Ok(blob.data().to_vec());
        }
        self.read_source(id)
            .ok_or(StoreError::NotFound(*id))?
            .read(id)
    }

    /// Store `data`, returning its content id.
    pub fn write(&self, data: &[u8], force_write: bool) -> StoreResult<ObjectId> {
        self.write_backend()?
            .write_bytes(ObjectId::EMPTY, data, force_write)
    }

    /// Store `size` bytes from a reader under a precomputed id, or under
    /// the computed id when `id` is empty.
    pub fn write_stream(
        &self,
        id: ObjectId,
        data: &mut dyn Read,
        size: u64,
        force_write: bool,
    ) -> StoreResult<ObjectId> {
        self.write_backend()?.write(id, data, size, force_write)
    }

    pub fn delete(&self, id: &ObjectId) -> StoreResult<()> {
        self.write_backend()?.delete(id)
    }

    /// Ids of every object in every backend.
    pub fn enumerate_objects(&self) -> StoreResult<Vec<ObjectId>> {
        let mut ids: BTreeSet<ObjectId> = self.read1.enumerate_objects()?.into_iter().collect();
        ids.extend(self.bundles.enumerate_objects()?);
        if let Some(r) = &self.read2 {
            ids.extend(r.enumerate_objects()?);
        }
        Ok(ids.into_iter().collect())
    }

    /// Ids of the objects stored loose in the primary backend.
    pub fn enumerate_loose_objects(&self) -> StoreResult<Vec<ObjectId>> {
        self.read1.enumerate_objects()
    }

    /// Create a shared in-memory blob of `data`, storing it if new.
    ///
    /// Concurrent callers with identical data get the same blob and the
    /// content is written once.
    pub fn create_blob(&self, data: &[u8]) -> StoreResult<Blob> {
        let write = self.write_backend()?;
        let id = ObjectId::from_bytes(data);
        self.cache.get_or_insert_with(id, || {
            write.write_bytes(id, data, false)?;
            Ok(data.to_vec())
        })
    }

    /// The blob for `id`, loading it into the cache if stored.
    pub fn lookup(&self, id: &ObjectId) -> StoreResult<Option<Blob>> {
        if let Some(blob) = self.cache.lookup(id) {
            return Ok(Some(blob));
        }
        let Some(source) = self.read_source(id) else {
            return Ok(None);
        };
        self.cache
            .get_or_insert_with(*id, || source.read(id))
            .map(Some)
    }

    /// Pack objects into `<root>/bundles/<name>.bundle`.
    ///
    /// Returns `None` without touching the disk when no ids are given.
    pub fn create_bundle(&self, request: &PackRequest) -> StoreResult<Option<PackOutcome>> {
        if request.object_ids.is_empty() {
            debug!(bundle = %request.name, "no objects to pack");
            return Ok(None);
        }
        let outcome = forge_pack::create_bundle(self.bundles.dir(), request, |id| {
            self.read(id).map_err(|e| PackError::ObjectSource {
                id: *id,
                reason: e.to_string(),
            })
        })?;
        Ok(Some(outcome))
    }

    pub fn load_bundle(&self, name: &str) -> StoreResult<()> {
        self.bundles.load_bundle(name, &self.asset_index)
    }

    pub fn unload_bundle(&self, name: &str) -> StoreResult<()> {
        self.bundles.unload_bundle(name, &self.asset_index)
    }

    /// Flush the writable asset index.
    pub fn save_index(&self) -> StoreResult<()> {
        self.asset_index.save()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryOdbBackend;

    fn open(dir: &Path) -> ObjectDatabase {
        ObjectDatabase::open(dir, DatabaseOptions::default()).unwrap()
    }

    fn memory_db(backend: Arc<MemoryOdbBackend>, bundle_dir: &Path) -> ObjectDatabase {
        ObjectDatabase::from_backends(backend, None, BundleBackend::new(bundle_dir))
    }

    #[test]
    fn identical_content_is_stored_once() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        let a = db.write(b"payload", false).unwrap();
        let b = db.write(b"payload", false).unwrap();
        assert_eq!(a, b);
        assert_eq!(db.enumerate_loose_objects().unwrap(), vec![a]);
        assert_eq!(db.read(&a).unwrap(), b"payload");
    }

    #[test]
    fn bundle_roundtrip_into_fresh_database() {
        let src = tempfile::tempdir().unwrap();
        let db = open(src.path());
        let objects: [&[u8]; 3] = [b"mesh", b"texture", b"sound"];
        let mut request = PackRequest {
            name: DEFAULT_BUNDLE.to_string(),
            ..Default::default()
        };
        for (i, data) in objects.iter().enumerate() {
            let id = db.write(data, false).unwrap();
            let url = format!("assets/{i}");
            db.asset_index().set(&url, id).unwrap();
            request.object_ids.push(id);
            request.assets.push((url, id));
        }
        request
            .disable_compression
            .insert(ObjectId::from_bytes(b"sound"));
        let outcome = db.create_bundle(&request).unwrap().unwrap();

        let dst = tempfile::tempdir().unwrap();
        let bundle_dir = dst.path().join(BUNDLE_DIRECTORY);
        std::fs::create_dir_all(&bundle_dir).unwrap();
        std::fs::copy(&outcome.path, bundle_dir.join("default.bundle")).unwrap();

        let fresh = open(dst.path());
        for (i, data) in objects.iter().enumerate() {
            let id = fresh.asset_index().get(&format!("assets/{i}")).unwrap();
            assert_eq!(id, ObjectId::from_bytes(data));
            assert_eq!(fresh.read(&id).unwrap(), *data);
            assert!(matches!(
                fresh.get_file_path(&id),
                Err(StoreError::InvalidOperation(_))
            ));
        }
        assert!(fresh.enumerate_loose_objects().unwrap().is_empty());
        assert_eq!(fresh.enumerate_objects().unwrap().len(), 3);
    }

    #[test]
    fn empty_bundle_request_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        let request = PackRequest {
            name: "empty".to_string(),
            ..Default::default()
        };
        assert!(db.create_bundle(&request).unwrap().is_none());
        assert!(!dir.path().join(BUNDLE_DIRECTORY).join("empty.bundle").exists());
    }

    #[test]
    fn missing_default_bundle_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        assert!(db.bundle_backend().loaded_bundles().is_empty());
    }

    #[test]
    fn read_only_database_rejects_mutation() {
        let dir = tempfile::tempdir().unwrap();
        let id = open(dir.path()).write(b"kept", false).unwrap();

        let options = DatabaseOptions {
            read_only: true,
            ..Default::default()
        };
        let db = ObjectDatabase::open(dir.path(), options).unwrap();
        assert!(db.is_read_only());
        assert_eq!(db.read(&id).unwrap(), b"kept");
        assert!(matches!(db.write(b"new", false), Err(StoreError::InvalidOperation(_))));
        assert!(matches!(db.delete(&id), Err(StoreError::InvalidOperation(_))));
        assert!(matches!(db.create_blob(b"x"), Err(StoreError::InvalidOperation(_))));
    }

    #[test]
    fn secondary_root_takes_writes_when_primary_is_read_only() {
        let primary = tempfile::tempdir().unwrap();
        let secondary = tempfile::tempdir().unwrap();
        let base = open(primary.path()).write(b"base", false).unwrap();

        let options = DatabaseOptions {
            read_only: true,
            additional_root: Some(secondary.path().to_path_buf()),
            ..Default::default()
        };
        let db = ObjectDatabase::open(primary.path(), options).unwrap();
        let id = db.write(b"overlay", false).unwrap();
        assert!(db.exists(&base));
        assert!(db.get_file_path(&id).unwrap().starts_with(secondary.path()));

        // Writing over a primary object copies it into the secondary first.
        let mut stream = db.open_stream(&base, OpenMode::Open, FileAccess::ReadWrite).unwrap();
        let mut content = Vec::new();
        stream.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"base");
        stream.write_all(b"+").unwrap();
        drop(stream);

        let copied = LooseFileBackend::open(secondary.path(), true, "index")
            .unwrap()
            .read(&base)
            .unwrap();
        assert_eq!(copied, b"base+");
    }

    #[test]
    fn concurrent_create_blob_writes_once() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryOdbBackend::new());
        let db = memory_db(Arc::clone(&backend), dir.path());

        let blobs: Vec<Blob> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..16)
                .map(|_| s.spawn(|| db.create_blob(b"shared blob").unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(backend.write_count(), 1);
        assert_eq!(blobs[0].ref_count(), 16);
        let id = blobs[0].id();
        assert!(blobs.iter().all(|b| b.id() == id));

        drop(blobs);
        assert!(!db.cache().contains(&id));
        assert!(db.exists(&id));
    }

    #[test]
    fn lookup_loads_stored_objects() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryOdbBackend::new());
        let db = memory_db(Arc::clone(&backend), dir.path());

        let id = db.write(b"stored", false).unwrap();
        let blob = db.lookup(&id).unwrap().unwrap();
        assert_eq!(blob.data(), b"stored");
        assert!(db.lookup(&ObjectId::from_bytes(b"absent")).unwrap().is_none());
    }

    #[test]
    fn enumerate_objects_unions_backends() {
        let dir = tempfile::tempdir().unwrap();
        let db = open(dir.path());
        let loose = db.write(b"loose", false).unwrap();
        let packed = db.write(b"packed", false).unwrap();
        db.create_bundle(&PackRequest {
            name: "extra".to_string(),
            object_ids: vec![packed],
            ..Default::default()
        })
        .unwrap();
        db.delete(&packed).unwrap();
        db.load_bundle("extra").unwrap();

        let all = db.enumerate_objects().unwrap();
        assert!(all.contains(&loose) && all.contains(&packed));
        assert_eq!(db.enumerate_loose_objects().unwrap(), vec![loose]);
        db.unload_bundle("extra").unwrap();
        assert!(!db.exists(&packed));
    }
}
