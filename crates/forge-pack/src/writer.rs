use std::collections::HashSet;
use std::io::Write;
use std::path::Path;

use forge_types::ObjectId;
use tracing::debug;

use crate::error::{PackError, PackResult};
use crate::format::{BundleDescription, ObjectRecord, FLAG_COMPRESSED};

/// zstd level used for compressed objects.
const COMPRESSION_LEVEL: i32 = 3;

struct PendingObject {
    id: ObjectId,
    data: Vec<u8>,
    compress: bool,
}

/// Builds a bundle file from objects and asset records.
#[derive(Default)]
pub struct BundleWriter {
    dependencies: Vec<String>,
    incremental_bundles: Vec<ObjectId>,
    objects: Vec<PendingObject>,
    seen: HashSet<ObjectId>,
    assets: Vec<(String, ObjectId)>,
}

impl BundleWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_dependency(&mut self, name: impl Into<String>) {
        self.dependencies.push(name.into());
    }

    pub fn add_incremental(&mut self, id: ObjectId) {
        self.incremental_bundles.push(id);
    }

    /// Queue an object. Adding the same id twice keeps the first copy.
    pub fn add_object(&mut self, id: ObjectId, data: Vec<u8>, compress: bool) {
        if self.seen.insert(id) {
            self.objects.push(PendingObject { id, data, compress });
        }
    }

    pub fn add_asset(&mut self, url: impl Into<String>, id: ObjectId) {
        self.assets.push((url.into(), id));
    }

    /// Number of objects queued.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Serialize the bundle. Returns the bytes and their checksum.
    pub fn finish_to_bytes(self) -> PackResult<(Vec<u8>, ObjectId)> {
        let mut data = Vec::new();
        let mut records = Vec::with_capacity(self.objects.len());

        for obj in &self.objects {
            let (stored, flags) = if obj.compress {
                let compressed = zstd::encode_all(obj.data.as_slice(), COMPRESSION_LEVEL)
                    .map_err(|e| PackError::CompressionFailed(e.to_string()))?;
                (compressed, FLAG_COMPRESSED)
            } else {
                (obj.data.clone(), 0)
            };

            records.push(ObjectRecord {
                id: obj.id,
                offset: data.len() as u64,
                raw_size: obj.data.len() as u64,
                stored_size: stored.len() as u64,
                flags,
                crc32: crc32fast::hash(&stored),
            });
            data.extend_from_slice(&stored);
        }

        let description = BundleDescription {
            dependencies: self.dependencies,
            incremental_bundles: self.incremental_bundles,
            objects: records,
            assets: self.assets,
        };
        Ok(assemble(&description, &data))
    }

    /// Write the bundle to `path` atomically. Returns its checksum.
    pub fn write_to(self, path: &Path) -> PackResult<ObjectId> {
        let (bytes, checksum) = self.finish_to_bytes()?;
        write_atomic(path, &bytes)?;
        debug!(path = %path.display(), size = bytes.len(), "bundle written");
        Ok(checksum)
    }
}

/// Header + data section + checksum trailer.
pub(crate) fn assemble(description: &BundleDescription, data: &[u8]) -> (Vec<u8>, ObjectId) {
    let mut bytes = description.encode();
    bytes.extend_from_slice(data);
    let checksum = *blake3::hash(&bytes).as_bytes();
    bytes.extend_from_slice(&checksum);
    (bytes, ObjectId::from_hash(checksum))
}

/// Write through a temp file in the target directory, then rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> PackResult<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| PackError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::CHECKSUM_LEN;

    #[test]
    fn duplicate_objects_are_written_once() {
        let id = ObjectId::from_bytes(b"x");
        let mut writer = BundleWriter::new();
        writer.add_object(id, b"x".to_vec(), true);
        writer.add_object(id, b"x".to_vec(), true);
        assert_eq!(writer.len(), 1);
    }

    #[test]
    fn checksum_covers_content() {
        let mut a = BundleWriter::new();
        a.add_object(ObjectId::from_bytes(b"a"), b"a".to_vec(), false);
        let mut b = BundleWriter::new();
        b.add_object(ObjectId::from_bytes(b"b"), b"b".to_vec(), false);

        let (bytes_a, sum_a) = a.finish_to_bytes().unwrap();
        let (_, sum_b) = b.finish_to_bytes().unwrap();
        assert_ne!(sum_a, sum_b);
        assert_eq!(&bytes_a[bytes_a.len() - CHECKSUM_LEN..], sum_a.as_bytes());
    }

    #[test]
    fn uncompressed_objects_are_stored_raw() {
        let payload = b"raw payload raw payload raw payload".to_vec();
        let mut writer = BundleWriter::new();
        writer.add_object(ObjectId::from_bytes(&payload), payload.clone(), false);
        let (bytes, _) = writer.finish_to_bytes().unwrap();

        let (desc, header_len) = BundleDescription::decode(&bytes).unwrap();
        let rec = desc.objects[0];
        assert!(!rec.is_compressed());
        assert_eq!(rec.raw_size, rec.stored_size);
        let start = header_len + rec.offset as usize;
        assert_eq!(&bytes[start..start + payload.len()], payload.as_slice());
    }
}
