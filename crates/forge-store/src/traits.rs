use std::io::{Read, Seek, Write};
use std::path::PathBuf;
use std::sync::Arc;

use forge_index::AssetIndexMap;
use forge_types::ObjectId;

use crate::error::StoreResult;

/// Which concrete storage a backend is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    LooseFile,
    Bundle,
    Memory,
}

/// How `open_stream` treats an existing or missing object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// The object must exist.
    Open,
    OpenOrCreate,
    /// Create or truncate.
    Create,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileAccess {
    Read,
    Write,
    ReadWrite,
}

impl FileAccess {
    pub fn can_write(self) -> bool {
        !matches!(self, Self::Read)
    }
}

/// A seekable byte stream over one stored object.
pub trait ObjectStream: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> ObjectStream for T {}

/// A storage backend of the object database.
///
/// Implementations must satisfy these invariants:
/// - Writing content that is already stored is a no-op unless forced.
/// - A read-only backend rejects writes and deletes with
///   `StoreError::InvalidOperation`.
/// - Concurrent calls are safe.
pub trait OdbBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn is_read_only(&self) -> bool;

    /// Open a stream on an object. A missing object opened with
    /// [`OpenMode::Open`] is `StoreError::NotFound`.
    fn open_stream(
        &self,
        id: &ObjectId,
        mode: OpenMode,
        access: FileAccess,
    ) -> StoreResult<Box<dyn ObjectStream>>;

    /// Store `size` bytes from `data`. An empty `id` is computed from the
    /// content. Returns the id of the stored object.
    fn write(
        &self,
        id: ObjectId,
        data: &mut dyn Read,
        size: u64,
        force_write: bool,
    ) -> StoreResult<ObjectId>;

    fn exists(&self, id: &ObjectId) -> bool;

    fn get_size(&self, id: &ObjectId) -> StoreResult<u64>;

    /// Path of the file holding the object, for backends that have one.
    fn get_file_path(&self, id: &ObjectId) -> StoreResult<PathBuf>;

    fn enumerate_objects(&self) -> StoreResult<Vec<ObjectId>>;

    fn delete(&self, id: &ObjectId) -> StoreResult<()>;

    /// The url index this backend persists, if any.
    fn asset_index_map(&self) -> Option<Arc<dyn AssetIndexMap>> {
        None
    }

    /// Convenience wrapper over [`OdbBackend::write`].
    fn write_bytes(&self, id: ObjectId, data: &[u8], force_write: bool) -> StoreResult<ObjectId> {
        let mut reader = data;
        self.write(id, &mut reader, data.len() as u64, force_write)
    }

    /// Read a whole object into memory.
    fn read(&self, id: &ObjectId) -> StoreResult<Vec<u8>> {
        let mut stream = self.open_stream(id, OpenMode::Open, FileAccess::Read)?;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf)?;
        Ok(buf)
    }
}
