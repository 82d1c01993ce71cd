use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use forge_types::ObjectId;
use memmap2::Mmap;

use crate::error::{PackError, PackResult};
use crate::format::{BundleDescription, ObjectRecord, CHECKSUM_LEN};
use crate::writer::{assemble, write_atomic};

/// Random-access reader over one memory-mapped bundle file.
pub struct BundleReader {
    path: PathBuf,
    mmap: Mmap,
    description: BundleDescription,
    /// Start of the data section.
    data_start: usize,
    /// End of the data section (start of the checksum trailer).
    data_end: usize,
    checksum: ObjectId,
    lookup: HashMap<ObjectId, usize>,
}

impl std::fmt::Debug for BundleReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleReader")
            .field("path", &self.path)
            .field("objects", &self.description.objects.len())
            .field("assets", &self.description.assets.len())
            .finish()
    }
}

impl BundleReader {
    /// Map a bundle file, verify its checksum and parse its header.
    pub fn open(path: &Path) -> PackResult<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len < 8 + CHECKSUM_LEN {
            return Err(PackError::CorruptEntry {
                offset: 0,
                reason: "bundle file too short".into(),
            });
        }

        // SAFETY: bundles are immutable once written; updates replace the
        // file by rename, so the mapped inode is never modified in place.
        let mmap = unsafe { Mmap::map(&file)? };

        let data_end = mmap.len() - CHECKSUM_LEN;
        let expected = &mmap[data_end..];
        if blake3::hash(&mmap[..data_end]).as_bytes() != expected {
            return Err(PackError::ChecksumMismatch);
        }
        let mut checksum = [0u8; 32];
        checksum.copy_from_slice(expected);

        let (description, data_start) = BundleDescription::decode(&mmap[..data_end])?;
        let lookup = description
            .objects
            .iter()
            .enumerate()
            .map(|(i, rec)| (rec.id, i))
            .collect();

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            description,
            data_start,
            data_end,
            checksum: ObjectId::from_hash(checksum),
            lookup,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn description(&self) -> &BundleDescription {
        &self.description
    }

    /// BLAKE3 of the file body. Also the id of an incremental bundle.
    pub fn checksum(&self) -> ObjectId {
        self.checksum
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.lookup.contains_key(id)
    }

    pub fn record(&self, id: &ObjectId) -> Option<&ObjectRecord> {
        self.lookup.get(id).map(|&i| &self.description.objects[i])
    }

    /// Uncompressed size of an object.
    pub fn object_size(&self, id: &ObjectId) -> Option<u64> {
        self.record(id).map(|r| r.raw_size)
    }

    pub fn object_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.description.objects.iter().map(|r| r.id)
    }

    pub fn object_count(&self) -> usize {
        self.description.objects.len()
    }

    /// Read and decode an object. `Ok(None)` if the bundle doesn't hold it.
    pub fn read_object(&self, id: &ObjectId) -> PackResult<Option<Vec<u8>>> {
        let rec = match self.record(id) {
            Some(r) => *r,
            None => return Ok(None),
        };
        let stored = self.stored_bytes(&rec)?;

        if crc32fast::hash(stored) != rec.crc32 {
            return Err(PackError::CrcMismatch { id: rec.id });
        }

        let data = if rec.is_compressed() {
            zstd::decode_all(stored).map_err(|e| PackError::DecompressionFailed(e.to_string()))?
        } else {
            stored.to_vec()
        };

        if data.len() as u64 != rec.raw_size {
            return Err(PackError::CorruptEntry {
                offset: rec.offset,
                reason: format!("size mismatch: expected {}, got {}", rec.raw_size, data.len()),
            });
        }
        Ok(Some(data))
    }

    fn stored_bytes(&self, rec: &ObjectRecord) -> PackResult<&[u8]> {
        let start = self.data_start as u64 + rec.offset;
        let end = start + rec.stored_size;
        if end > self.data_end as u64 {
            return Err(PackError::CorruptEntry {
                offset: rec.offset,
                reason: "object extends beyond data section".into(),
            });
        }
        Ok(&self.mmap[start as usize..end as usize])
    }

    /// Rewrite this bundle in place with `incremental` appended to its chain.
    /// The data section is copied verbatim.
    pub fn rewrite_with_incremental(self, incremental: ObjectId) -> PackResult<ObjectId> {
        let mut description = self.description.clone();
        description.incremental_bundles.push(incremental);
        let (bytes, checksum) = assemble(&description, &self.mmap[self.data_start..self.data_end]);
        let path = self.path.clone();
        drop(self);
        write_atomic(&path, &bytes)?;
        Ok(checksum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::BundleWriter;

    fn write_sample(dir: &Path) -> (PathBuf, Vec<(ObjectId, Vec<u8>)>) {
        let objects: Vec<(ObjectId, Vec<u8>)> = (0..5)
            .map(|i| {
                let data = format!("object-{i} ").repeat(20).into_bytes();
                (ObjectId::from_bytes(&data), data)
            })
            .collect();

        let mut writer = BundleWriter::new();
        writer.add_dependency("base");
        for (i, (id, data)) in objects.iter().enumerate() {
            writer.add_object(*id, data.clone(), i % 2 == 0);
            writer.add_asset(format!("asset/{i}"), *id);
        }
        let path = dir.join("sample.bundle");
        writer.write_to(&path).unwrap();
        (path, objects)
    }

    #[test]
    fn read_back_every_object() {
        let dir = tempfile::tempdir().unwrap();
        let (path, objects) = write_sample(dir.path());

        let reader = BundleReader::open(&path).unwrap();
        assert_eq!(reader.object_count(), objects.len());
        assert_eq!(reader.description().dependencies, vec!["base".to_string()]);
        assert_eq!(reader.description().assets.len(), objects.len());

        for (id, data) in &objects {
            assert_eq!(reader.read_object(id).unwrap().as_deref(), Some(data.as_slice()));
            assert_eq!(reader.object_size(id), Some(data.len() as u64));
        }
        assert!(reader.read_object(&ObjectId::from_bytes(b"absent")).unwrap().is_none());
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let (path, _) = write_sample(dir.path());

        let mut bytes = std::fs::read(&path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let err = BundleReader::open(&path).unwrap_err();
        assert!(matches!(err, PackError::ChecksumMismatch));
    }

    #[test]
    fn short_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.bundle");
        std::fs::write(&path, b"FBDL").unwrap();
        assert!(matches!(
            BundleReader::open(&path).unwrap_err(),
            PackError::CorruptEntry { .. }
        ));
    }

    #[test]
    fn rewrite_keeps_objects_and_appends_incremental() {
        let dir = tempfile::tempdir().unwrap();
        let (path, objects) = write_sample(dir.path());

        let inc = ObjectId::from_bytes(b"incremental");
        let reader = BundleReader::open(&path).unwrap();
        reader.rewrite_with_incremental(inc).unwrap();

        let reader = BundleReader::open(&path).unwrap();
        assert_eq!(reader.description().incremental_bundles, vec![inc]);
        for (id, data) in &objects {
            assert_eq!(reader.read_object(id).unwrap().unwrap(), *data);
        }
    }
}
