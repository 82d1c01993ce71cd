//! Append-only, multi-process safe value store.
//!
//! On-disk format, one frame per value:
//! ```text
//! [4 bytes: payload length (little-endian u32)]
//! [4 bytes: CRC32 of payload (little-endian u32)]
//! [N bytes: payload (bincode)]
//! ```
//!
//! Writers hold an exclusive range lock from their read position to EOF
//! while appending; readers hold a shared lock over the same range while
//! catching up, so a partially appended frame is never observed.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{IndexError, IndexResult};
use crate::lock::lock_range;

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

/// In-memory view a [`Store`] maintains over the values read from disk.
pub trait StoreCollection: Default + Send {
    type Item: Serialize + DeserializeOwned + Clone + Send;

    /// Record a value that is now persisted.
    fn add_loaded(&mut self, item: Self::Item);

    /// Drop every loaded value.
    fn clear(&mut self);
}

struct StoreState<C: StoreCollection> {
    file: File,
    /// Offset up to which the file has been consumed.
    position: u64,
    loaded: C,
    /// Values added inside a transaction and not saved yet.
    pending: Vec<C::Item>,
    use_transaction: bool,
    auto_load_new_values: bool,
}

/// A store that is incrementally persisted to a single file.
pub struct Store<C: StoreCollection> {
    path: PathBuf,
    state: Mutex<StoreState<C>>,
}

impl<C: StoreCollection> Store<C> {
    /// Open (or create) the store file and load every existing value.
    pub fn open(path: &Path) -> IndexResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        let store = Self {
            path: path.to_path_buf(),
            state: Mutex::new(StoreState {
                file,
                position: 0,
                loaded: C::default(),
                pending: Vec::new(),
                use_transaction: false,
                auto_load_new_values: true,
            }),
        };
        store.load_new_values()?;
        Ok(store)
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep added values pending until [`Store::save`] is called.
    pub fn set_use_transaction(&self, enabled: bool) {
        self.state.lock().expect("store lock poisoned").use_transaction = enabled;
    }

    pub fn use_transaction(&self) -> bool {
        self.state.lock().expect("store lock poisoned").use_transaction
    }

    /// Read values appended by other writers before appending our own.
    pub fn set_auto_load_new_values(&self, enabled: bool) {
        self.state.lock().expect("store lock poisoned").auto_load_new_values = enabled;
    }

    /// Add a single value.
    pub fn add_value(&self, item: C::Item) -> IndexResult<()> {
        self.add_values(std::iter::once(item))
    }

    /// Add several values. Persisted immediately unless a transaction is active.
    pub fn add_values(&self, items: impl IntoIterator<Item = C::Item>) -> IndexResult<()> {
        let mut state = self.state.lock().expect("store lock poisoned");
        if state.use_transaction {
            state.pending.extend(items);
            return Ok(());
        }
        let items: Vec<C::Item> = items.into_iter().collect();
        Self::append(&mut state, items)
    }

    /// Persist every pending value of the current transaction.
    pub fn save(&self) -> IndexResult<()> {
        let mut state = self.state.lock().expect("store lock poisoned");
        if state.pending.is_empty() {
            return Ok(());
        }
        let items = std::mem::take(&mut state.pending);
        if let Err(e) = Self::append(&mut state, items.clone()) {
            state.pending = items;
            return Err(e);
        }
        Ok(())
    }

    /// Read values appended since the last read. Returns how many were loaded.
    pub fn load_new_values(&self) -> IndexResult<usize> {
        let mut state = self.state.lock().expect("store lock poisoned");
        let state = &mut *state;
        let file_len = state.file.metadata()?.len();
        if state.position == file_len {
            return Ok(0);
        }

        let file = state.file.try_clone()?;
        let _guard = loop {
            let guard = lock_range(&file, state.position, false)?;
            if !Self::discard_if_truncated(state)? {
                break guard;
            }
        };
        Self::refresh(state)
    }

    /// Truncate the file and drop all loaded and pending values.
    pub fn reset(&self) -> IndexResult<()> {
        let mut state = self.state.lock().expect("store lock poisoned");
        let file = state.file.try_clone()?;
        let _guard = lock_range(&file, 0, true)?;
        state.file.set_len(0)?;
        state.file.seek(SeekFrom::Start(0))?;
        state.position = 0;
        state.pending.clear();
        state.loaded.clear();
        debug!(path = %self.path.display(), "store reset");
        Ok(())
    }

    /// Run `f` over the loaded collection and the pending values.
    pub fn read<R>(&self, f: impl FnOnce(&C, &[C::Item]) -> R) -> R {
        let state = self.state.lock().expect("store lock poisoned");
        f(&state.loaded, &state.pending)
    }

    fn append(state: &mut StoreState<C>, items: Vec<C::Item>) -> IndexResult<()> {
        let mut frames = Vec::new();
        for item in &items {
            encode_frame(item, &mut frames)?;
        }

        let file = state.file.try_clone()?;
        let _guard = loop {
            let guard = lock_range(&file, state.position, true)?;
            if !Self::discard_if_truncated(state)? {
                break guard;
            }
        };

        if state.auto_load_new_values {
            Self::refresh(state)?;
        } else {
            state.position = state.file.metadata()?.len();
        }

        state.file.seek(SeekFrom::Start(state.position))?;
        state.file.write_all(&frames)?;
        state.file.flush()?;
        state.position += frames.len() as u64;

        for item in items {
            state.loaded.add_loaded(item);
        }
        debug!(offset = state.position, len = frames.len(), "store append");
        Ok(())
    }

    /// Another handle reset the file under us: forget what was loaded and
    /// read again from the start. Pending values are kept.
    fn discard_if_truncated(state: &mut StoreState<C>) -> IndexResult<bool> {
        let file_len = state.file.metadata()?.len();
        if file_len >= state.position {
            return Ok(false);
        }
        debug!(position = state.position, file_len, "store truncated elsewhere, reloading");
        state.loaded.clear();
        state.position = 0;
        Ok(true)
    }

    /// Consume every complete frame between `position` and EOF.
    fn refresh(state: &mut StoreState<C>) -> IndexResult<usize> {
        let file_len = state.file.metadata()?.len();
        if file_len <= state.position {
            return Ok(0);
        }

        let mut buffer = vec![0u8; (file_len - state.position) as usize];
        state.file.seek(SeekFrom::Start(state.position))?;
        state.file.read_exact(&mut buffer)?;

        let (items, consumed) = decode_frames::<C::Item>(&buffer, state.position)?;
        let count = items.len();
        for item in items {
            state.loaded.add_loaded(item);
        }
        state.position += consumed as u64;
        Ok(count)
    }
}

fn encode_frame<T: Serialize>(item: &T, out: &mut Vec<u8>) -> IndexResult<()> {
    let payload = bincode::serialize(item).map_err(|e| IndexError::Serialization(e.to_string()))?;
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(())
}

/// Decode complete frames from `buffer`. A truncated trailing frame is left
/// unconsumed. `base` is the file offset of `buffer[0]`, used for errors.
fn decode_frames<T: DeserializeOwned>(buffer: &[u8], base: u64) -> IndexResult<(Vec<T>, usize)> {
    let mut items = Vec::new();
    let mut offset = 0usize;

    while offset + HEADER_SIZE <= buffer.len() {
        let length = u32::from_le_bytes([
            buffer[offset],
            buffer[offset + 1],
            buffer[offset + 2],
            buffer[offset + 3],
        ]) as usize;
        let expected_crc = u32::from_le_bytes([
            buffer[offset + 4],
            buffer[offset + 5],
            buffer[offset + 6],
            buffer[offset + 7],
        ]);

        let start = offset + HEADER_SIZE;
        if start + length > buffer.len() {
            break;
        }
        let payload = &buffer[start..start + length];

        if crc32fast::hash(payload) != expected_crc {
            return Err(IndexError::CorruptEntry {
                offset: base + offset as u64,
                reason: "CRC mismatch".into(),
            });
        }
        let item = bincode::deserialize(payload).map_err(|e| IndexError::CorruptEntry {
            offset: base + offset as u64,
            reason: e.to_string(),
        })?;
        items.push(item);
        offset = start + length;
    }

    Ok((items, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collected(Vec<String>);

    impl StoreCollection for Collected {
        type Item = String;

        fn add_loaded(&mut self, item: String) {
            self.0.push(item);
        }

        fn clear(&mut self) {
            self.0.clear();
        }
    }

    fn loaded(store: &Store<Collected>) -> Vec<String> {
        store.read(|c, _| c.0.clone())
    }

    #[test]
    fn append_and_reopen_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("values.store");

        let store = Store::<Collected>::open(&path).unwrap();
        store.add_value("one".into()).unwrap();
        store.add_values(vec!["two".into(), "three".into()]).unwrap();
        drop(store);

        let reopened = Store::<Collected>::open(&path).unwrap();
        assert_eq!(loaded(&reopened), vec!["one", "two", "three"]);
    }

    #[test]
    fn transaction_defers_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tx.store");

        let store = Store::<Collected>::open(&path).unwrap();
        store.set_use_transaction(true);
        store.add_value("pending".into()).unwrap();

        assert!(loaded(&store).is_empty());
        assert_eq!(store.read(|_, p| p.len()), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);

        store.save().unwrap();
        assert_eq!(loaded(&store), vec!["pending"]);
        assert_eq!(store.read(|_, p| p.len()), 0);
    }

    #[test]
    fn second_handle_sees_new_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.store");

        let a = Store::<Collected>::open(&path).unwrap();
        let b = Store::<Collected>::open(&path).unwrap();

        a.add_value("from a".into()).unwrap();
        assert_eq!(b.load_new_values().unwrap(), 1);
        assert_eq!(loaded(&b), vec!["from a"]);

        // b appends after auto-loading, so nothing is read twice.
        b.add_value("from b".into()).unwrap();
        a.load_new_values().unwrap();
        assert_eq!(loaded(&a), vec!["from a", "from b"]);
        assert_eq!(loaded(&b), vec!["from a", "from b"]);
    }

    #[test]
    fn truncated_tail_is_not_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tail.store");

        let store = Store::<Collected>::open(&path).unwrap();
        store.add_value("complete".into()).unwrap();
        store.add_value("torn".into()).unwrap();
        drop(store);

        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 2)
            .unwrap();

        let reopened = Store::<Collected>::open(&path).unwrap();
        assert_eq!(loaded(&reopened), vec!["complete"]);
    }

    #[test]
    fn crc_mismatch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.store");

        let store = Store::<Collected>::open(&path).unwrap();
        store.add_value("payload".into()).unwrap();
        drop(store);

        let mut bytes = fs::read(&path).unwrap();
        bytes[HEADER_SIZE] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let err = Store::<Collected>::open(&path).err().unwrap();
        assert!(matches!(err, IndexError::CorruptEntry { offset: 0, .. }));
    }

    #[test]
    fn reset_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reset.store");

        let store = Store::<Collected>::open(&path).unwrap();
        store.add_value("gone".into()).unwrap();
        store.reset().unwrap();
        assert!(loaded(&store).is_empty());
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);

        store.add_value("fresh".into()).unwrap();
        let reopened = Store::<Collected>::open(&path).unwrap();
        assert_eq!(loaded(&reopened), vec!["fresh"]);
    }

    #[test]
    fn other_handle_appends_after_reset_from_the_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared-reset.store");

        let a = Store::<Collected>::open(&path).unwrap();
        let b = Store::<Collected>::open(&path).unwrap();
        a.add_values(vec!["one".into(), "two".into()]).unwrap();
        b.load_new_values().unwrap();
        assert_eq!(loaded(&b), vec!["one", "two"]);

        a.reset().unwrap();
        b.add_value("three".into()).unwrap();
        assert_eq!(loaded(&b), vec!["three"]);

        a.load_new_values().unwrap();
        assert_eq!(loaded(&a), vec!["three"]);
        let reopened = Store::<Collected>::open(&path).unwrap();
        assert_eq!(loaded(&reopened), vec!["three"]);
    }

    #[test]
    fn reader_reloads_after_reset_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reader-reset.store");

        let a = Store::<Collected>::open(&path).unwrap();
        a.add_values(vec!["x".into(), "y".into()]).unwrap();
        let b = Store::<Collected>::open(&path).unwrap();
        assert_eq!(loaded(&b), vec!["x", "y"]);

        a.reset().unwrap();
        a.add_value("z".into()).unwrap();

        assert_eq!(b.load_new_values().unwrap(), 1);
        assert_eq!(loaded(&b), vec!["z"]);
    }

    #[test]
    fn concurrent_appends_from_threads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("threads.store");

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = Store::<Collected>::open(&path).unwrap();
                    for i in 0..25 {
                        store.add_value(format!("{t}-{i}")).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let reopened = Store::<Collected>::open(&path).unwrap();
        assert_eq!(loaded(&reopened).len(), 100);
    }
}
