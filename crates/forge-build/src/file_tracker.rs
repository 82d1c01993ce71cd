use std::fs::File;
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

use forge_index::DictionaryStore;
use forge_types::{ObjectId, ObjectIdBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BuildResult;

/// File name of the tracker store inside the database directory.
pub const FILE_VERSIONS_NAME: &str = "file_versions";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct FileVersionKey {
    path: String,
    size: u64,
    modified_secs: u64,
    modified_nanos: u32,
}

/// Content hashes of input files, cached by path, size and modification
/// time so unchanged files are not re-read on every build.
pub struct FileVersionTracker {
    versions: DictionaryStore<FileVersionKey, ObjectId>,
}

impl FileVersionTracker {
    pub fn open(path: &Path) -> BuildResult<Self> {
        Ok(Self {
            versions: DictionaryStore::open(path)?,
        })
    }

    /// Content hash of the file at `path`, or `ObjectId::EMPTY` when it does
    /// not exist.
    pub fn compute_file_hash(&self, path: &Path) -> BuildResult<ObjectId> {
        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "input file missing");
                return Ok(ObjectId::EMPTY);
            }
            Err(e) => return Err(e.into()),
        };
        let modified = metadata
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let key = FileVersionKey {
            path: path.to_string_lossy().into_owned(),
            size: metadata.len(),
            modified_secs: modified.as_secs(),
            modified_nanos: modified.subsec_nanos(),
        };
        if let Some(id) = self.versions.try_get(&key) {
            return Ok(id);
        }

        let mut hasher = ObjectIdBuilder::new();
        io::copy(&mut File::open(path)?, &mut hasher)?;
        let id = hasher.compute_hash();
        self.versions.set(key, id)?;
        debug!(path = %path.display(), id = %id.short_hex(), "hashed input file");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_matches_content_and_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = FileVersionTracker::open(&dir.path().join(FILE_VERSIONS_NAME)).unwrap();
        let file = dir.path().join("input.txt");
        std::fs::write(&file, b"hello").unwrap();

        assert_eq!(tracker.compute_file_hash(&file).unwrap(), ObjectId::from_bytes(b"hello"));
        assert_eq!(
            tracker.compute_file_hash(&dir.path().join("missing")).unwrap(),
            ObjectId::EMPTY
        );
    }

    #[test]
    fn versions_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join(FILE_VERSIONS_NAME);
        let file = dir.path().join("input.txt");
        std::fs::write(&file, b"cached").unwrap();

        let first = FileVersionTracker::open(&store).unwrap();
        let id = first.compute_file_hash(&file).unwrap();
        drop(first);

        let second = FileVersionTracker::open(&store).unwrap();
        assert_eq!(second.versions.values().len(), 1);
        assert_eq!(second.compute_file_hash(&file).unwrap(), id);
    }

    #[test]
    fn changed_content_is_rehashed() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = FileVersionTracker::open(&dir.path().join(FILE_VERSIONS_NAME)).unwrap();
        let file = dir.path().join("input.txt");
        std::fs::write(&file, b"one").unwrap();
        tracker.compute_file_hash(&file).unwrap();

        std::fs::write(&file, b"three").unwrap();
        assert_eq!(tracker.compute_file_hash(&file).unwrap(), ObjectId::from_bytes(b"three"));
    }
}
