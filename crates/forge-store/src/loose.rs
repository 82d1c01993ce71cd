//! Loose-file backend: one file per object under a two-level fan-out.
//!
//! ```text
//! <root>/<hex[0..2]>/<hex[2..64]>
//! <root>/<index_name>              asset index
//! ```

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use forge_index::{AssetIndexMap, FileAssetIndexMap};
use forge_types::{ObjectId, ObjectIdBuilder};
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::error::{StoreError, StoreResult};
use crate::traits::{BackendKind, FileAccess, ObjectStream, OdbBackend, OpenMode};

/// Copy buffer size used while hashing incoming streams.
const CHUNK_SIZE: usize = 64 * 1024;

pub struct LooseFileBackend {
    root: PathBuf,
    read_only: bool,
    asset_index: Option<Arc<FileAssetIndexMap>>,
}

impl LooseFileBackend {
    /// Open a backend rooted at `root`. The asset index file is created
    /// unless the backend is read-only and the file is absent.
    pub fn open(root: &Path, read_only: bool, index_name: &str) -> StoreResult<Self> {
        if !read_only {
            fs::create_dir_all(root)?;
        }
        let index_path = root.join(index_name);
        let asset_index = if !read_only || index_path.exists() {
            Some(Arc::new(FileAssetIndexMap::open(&index_path)?))
        } else {
            None
        };
        debug!(root = %root.display(), read_only, "loose object backend opened");
        Ok(Self {
            root: root.to_path_buf(),
            read_only,
            asset_index,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, id: &ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    fn ensure_writable(&self) -> StoreResult<()> {
        if self.read_only {
            return Err(StoreError::invalid(format!(
                "object backend at {} is read-only",
                self.root.display()
            )));
        }
        Ok(())
    }

    fn parse_object_path(&self, path: &Path) -> Option<ObjectId> {
        let file = path.file_name()?.to_str()?;
        let dir = path.parent()?.file_name()?.to_str()?;
        if dir.len() != 2 || file.len() != 62 {
            return None;
        }
        ObjectId::from_hex(&format!("{dir}{file}")).ok()
    }
}

impl OdbBackend for LooseFileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LooseFile
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
        if access.can_write() || mode != OpenMode::Open {
            self.ensure_writable()?;
        }
        let path = self.object_path(id);
        if mode != OpenMode::Open {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut options = OpenOptions::new();
        options.read(true);
        match mode {
            OpenMode::Open => {}
            OpenMode::OpenOrCreate => {
                options.create(true);
            }
            OpenMode::Create => {
                options.create(true).truncate(true);
            }
        }
        if access.can_write() || mode != OpenMode::Open {
            options.write(true);
        }

        match options.open(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound(*id)),
            Err(e) => Err(e.into()),
        }
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
            trace!(id = %id.short_hex(), "object already stored");
            return Ok(id);
        }

        // Stream into a temp file while hashing, then move into place.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        let mut builder = ObjectIdBuilder::new();
        let mut limited = data.take(size);
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = limited.read(&mut buf)?;
            if n == 0 {
                break;
            }
            builder.write(&buf[..n]);
            tmp.write_all(&buf[..n])?;
        }

        let computed = builder.compute_hash();
        if !id.is_empty() && id != computed {
            return Err(StoreError::HashMismatch {
                expected: id,
                computed,
            });
        }

        if !force_write && self.exists(&computed) {
            return Ok(computed);
        }

        let path = self.object_path(&computed);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        tmp.persist(&path).map_err(|e| StoreError::Io(e.error))?;
        debug!(id = %computed.short_hex(), size = builder.bytes_written(), "loose object written");
        Ok(computed)
    }

    fn exists(&self, id: &ObjectId) -> bool {
        self.object_path(id).is_file()
    }

    fn get_size(&self, id: &ObjectId) -> StoreResult<u64> {
        match fs::metadata(self.object_path(id)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound(*id)),
            Err(e) => Err(e.into()),
        }
    }

    fn get_file_path(&self, id: &ObjectId) -> StoreResult<PathBuf> {
        Ok(self.object_path(id))
    }

    fn enumerate_objects(&self) -> StoreResult<Vec<ObjectId>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(id) = self.parse_object_path(entry.path()) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn delete(&self, id: &ObjectId) -> StoreResult<()> {
        self.ensure_writable()?;
        match fs::remove_file(self.object_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound(*id)),
            Err(e) => Err(e.into()),
        }
    }

    fn asset_index_map(&self) -> Option<Arc<dyn AssetIndexMap>> {
        self.asset_index
            .clone()
            .map(|m| m as Arc<dyn AssetIndexMap>)
    }
}
