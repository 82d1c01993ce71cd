//! Read-only backend over loaded bundle files.
//!
//! Bundles are loaded by name and reference-counted. Loading a bundle first
//! loads its dependencies, registers its objects, and merges its asset
//! records into the database's url view. The last unload reverses that.

use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use forge_index::ObjectDatabaseAssetIndexMap;
use forge_pack::BundleChain;
use forge_types::ObjectId;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::traits::{BackendKind, FileAccess, ObjectStream, OdbBackend, OpenMode};

struct LoadedBundle {
    chain: Arc<BundleChain>,
    refs: usize,
    assets: Vec<(String, ObjectId)>,
}

#[derive(Default)]
struct BundleState {
    loaded: HashMap<String, LoadedBundle>,
    /// Which loaded bundles hold each object, in load order.
    objects: HashMap<ObjectId, Vec<String>>,
}

impl BundleState {
    fn chain_for(&self, id: &ObjectId) -> Option<Arc<BundleChain>> {
        let names = self.objects.get(id)?;
        let name = names.last()?;
        self.loaded.get(name).map(|b| Arc::clone(&b.chain))
    }
}

pub struct BundleBackend {
    dir: PathBuf,
    state: Mutex<BundleState>,
}

impl BundleBackend {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            state: Mutex::new(BundleState::default()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.state.lock().expect("bundle lock poisoned").loaded.contains_key(name)
    }

    /// Current load count of a bundle.
    pub fn ref_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .expect("bundle lock poisoned")
            .loaded
            .get(name)
            .map_or(0, |b| b.refs)
    }

    pub fn loaded_bundles(&self) -> Vec<String> {
        let state = self.state.lock().expect("bundle lock poisoned");
        let mut names: Vec<String> = state.loaded.keys().cloned().collect();
        names.sort();
        names
    }

    /// Load `name` and its dependencies, merging their assets into `index`.
    pub fn load_bundle(&self, name: &str, index: &ObjectDatabaseAssetIndexMap) -> StoreResult<()> {
        let mut state = self.state.lock().expect("bundle lock poisoned");
        let mut visiting = HashSet::new();
        self.load_locked(&mut state, name, index, &mut visiting)
    }

    fn load_locked(
        &self,
        state: &mut BundleState,
        name: &str,
        index: &ObjectDatabaseAssetIndexMap,
        visiting: &mut HashSet<String>,
    ) -> StoreResult<()> {
        if let Some(bundle) = state.loaded.get_mut(name) {
            bundle.refs += 1;
            debug!(bundle = name, refs = bundle.refs, "bundle reference added");
            return Ok(());
        }
        if !visiting.insert(name.to_string()) {
            return Err(StoreError::invalid(format!(
                "bundle `{name}` depends on itself"
            )));
        }

        let chain = BundleChain::open(&self.dir, name)?;
        let mut loaded_deps: Vec<&str> = Vec::new();
        for dep in chain.dependencies() {
            if let Err(err) = self.load_locked(state, dep, index, visiting) {
                for done in loaded_deps.iter().rev() {
                    if let Err(rollback) = Self::unload_locked(state, done, index) {
                        warn!(bundle = name, dependency = *done, error = %rollback, "rollback failed");
                    }
                }
                visiting.remove(name);
                return Err(err);
            }
            loaded_deps.push(dep);
        }

        let assets = chain.assets();
        for id in chain.object_ids() {
            state.objects.entry(id).or_default().push(name.to_string());
        }
        index.merge_values(assets.iter().cloned());
        info!(
            bundle = name,
            parts = chain.readers().len(),
            assets = assets.len(),
            "bundle loaded"
        );
        state.loaded.insert(
            name.to_string(),
            LoadedBundle {
                chain: Arc::new(chain),
                refs: 1,
                assets,
            },
        );
        visiting.remove(name);
        Ok(())
    }

    /// Drop one reference to `name`. The last reference removes its objects
    /// and asset records, then unloads each dependency once.
    pub fn unload_bundle(&self, name: &str, index: &ObjectDatabaseAssetIndexMap) -> StoreResult<()> {
        let mut state = self.state.lock().expect("bundle lock poisoned");
        Self::unload_locked(&mut state, name, index)
    }

    fn unload_locked(
        state: &mut BundleState,
        name: &str,
        index: &ObjectDatabaseAssetIndexMap,
    ) -> StoreResult<()> {
        let bundle = state
            .loaded
            .get_mut(name)
            .ok_or_else(|| StoreError::invalid(format!("bundle `{name}` is not loaded")))?;
        bundle.refs -= 1;
        if bundle.refs > 0 {
            debug!(bundle = name, refs = bundle.refs, "bundle reference released");
            return Ok(());
        }

        let Some(bundle) = state.loaded.remove(name) else {
            return Ok(());
        };
        for id in bundle.chain.object_ids() {
            if let Some(names) = state.objects.get_mut(&id) {
                names.retain(|n| n != name);
                if names.is_empty() {
                    state.objects.remove(&id);
                }
            }
        }
        index.unmerge_matching(bundle.assets);
        info!(bundle = name, "bundle unloaded");

        for dep in bundle.chain.dependencies() {
            Self::unload_locked(state, dep, index)?;
        }
        Ok(())
    }

    fn read_object(&self, id: &ObjectId) -> StoreResult<Vec<u8>> {
        let chain = self
            .state
            .lock()
            .expect("bundle lock poisoned")
            .chain_for(id)
            .ok_or(StoreError::NotFound(*id))?;
        chain.read_object(id)?.ok_or(StoreError::NotFound(*id))
    }

    fn read_only_error(&self, op: &str) -> StoreError {
        StoreError::invalid(format!("cannot {op}: bundled objects are read-only"))
    }
}

impl OdbBackend for BundleBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Bundle
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn open_stream(
        &self,
        id: &ObjectId,
        mode: OpenMode,
        access: FileAccess,
    ) -> StoreResult<Box<dyn ObjectStream>> {
        if mode != OpenMode::Open || access.can_write() {
            return Err(self.read_only_error("open a bundled object for writing"));
        }
        Ok(Box::new(Cursor::new(self.read_object(id)?)))
    }

    fn write(
        &self,
        _id: ObjectId,
        _data: &mut dyn Read,
        _size: u64,
        _force_write: bool,
    ) -> StoreResult<ObjectId> {
        Err(self.read_only_error("write"))
    }

    fn exists(&self, id: &ObjectId) -> bool {
        self.state
            .lock()
            .expect("bundle lock poisoned")
            .objects
            .contains_key(id)
    }

    fn get_size(&self, id: &ObjectId) -> StoreResult<u64> {
        let chain = self
            .state
            .lock()
            .expect("bundle lock poisoned")
            .chain_for(id)
            .ok_or(StoreError::NotFound(*id))?;
        chain.object_size(id).ok_or(StoreError::NotFound(*id))
    }

    fn get_file_path(&self, id: &ObjectId) -> StoreResult<PathBuf> {
        Err(StoreError::invalid(format!(
            "object {} is stored in a bundle and has no file path",
            id.short_hex()
        )))
    }

    fn enumerate_objects(&self) -> StoreResult<Vec<ObjectId>> {
        let state = self.state.lock().expect("bundle lock poisoned");
        let mut ids: Vec<ObjectId> = state.objects.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    fn delete(&self, _id: &ObjectId) -> StoreResult<()> {
        Err(self.read_only_error("delete"))
    }

    fn read(&self, id: &ObjectId) -> StoreResult<Vec<u8>> {
        self.read_object(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_index::AssetIndexMap;
    use forge_pack::BundleWriter;

    fn write_bundle(dir: &Path, name: &str, deps: &[&str], objects: &[&str], assets: &[(&str, &str)]) {
        let mut writer = BundleWriter::new();
        for dep in deps {
            writer.add_dependency(dep.to_string());
        }
        for data in objects {
            writer.add_object(ObjectId::from_bytes(data.as_bytes()), data.as_bytes().to_vec(), true);
        }
        for (url, data) in assets {
            writer.add_asset(url.to_string(), ObjectId::from_bytes(data.as_bytes()));
        }
        writer.write_to(&forge_pack::bundle_path(dir, name)).unwrap();
    }

    #[test]
    fn load_serves_objects_and_assets() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "base", &[], &["one", "two"], &[("a.txt", "one")]);

        let backend = BundleBackend::new(dir.path());
        let index = ObjectDatabaseAssetIndexMap::new();
        backend.load_bundle("base", &index).unwrap();

        let id = ObjectId::from_bytes(b"two");
        assert!(backend.exists(&id));
        assert_eq!(backend.read(&id).unwrap(), b"two");
        assert_eq!(backend.get_size(&id).unwrap(), 3);
        assert_eq!(index.try_get("a.txt"), Some(ObjectId::from_bytes(b"one")));
        assert!(matches!(backend.get_file_path(&id), Err(StoreError::InvalidOperation(_))));
    }

    #[test]
    fn refcounted_unload() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "b", &[], &["obj"], &[("x", "obj")]);

        let backend = BundleBackend::new(dir.path());
        let index = ObjectDatabaseAssetIndexMap::new();
        backend.load_bundle("b", &index).unwrap();
        backend.load_bundle("b", &index).unwrap();
        assert_eq!(backend.ref_count("b"), 2);

        backend.unload_bundle("b", &index).unwrap();
        assert!(backend.exists(&ObjectId::from_bytes(b"obj")));

        backend.unload_bundle("b", &index).unwrap();
        assert!(!backend.exists(&ObjectId::from_bytes(b"obj")));
        assert!(index.is_empty());

        let err = backend.unload_bundle("b", &index).unwrap_err();
        assert!(matches!(err, StoreError::InvalidOperation(_)));
    }

    #[test]
    fn dependencies_load_first_and_unload_with_dependent() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "core", &[], &["core-obj"], &[]);
        write_bundle(dir.path(), "level", &["core"], &["level-obj"], &[]);

        let backend = BundleBackend::new(dir.path());
        let index = ObjectDatabaseAssetIndexMap::new();
        backend.load_bundle("level", &index).unwrap();
        assert_eq!(backend.loaded_bundles(), vec!["core".to_string(), "level".to_string()]);
        assert!(backend.exists(&ObjectId::from_bytes(b"core-obj")));

        backend.unload_bundle("level", &index).unwrap();
        assert!(backend.loaded_bundles().is_empty());
    }

    #[test]
    fn unload_keeps_assets_repointed_by_later_bundle() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "first", &[], &["v1"], &[("shared", "v1")]);
        write_bundle(dir.path(), "second", &[], &["v2"], &[("shared", "v2")]);

        let backend = BundleBackend::new(dir.path());
        let index = ObjectDatabaseAssetIndexMap::new();
        backend.load_bundle("first", &index).unwrap();
        backend.load_bundle("second", &index).unwrap();
        backend.unload_bundle("first", &index).unwrap();

        assert_eq!(index.try_get("shared"), Some(ObjectId::from_bytes(b"v2")));
    }

    #[test]
    fn dependency_cycle_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "a", &["b"], &["a"], &[]);
        write_bundle(dir.path(), "b", &["a"], &["b"], &[]);

        let backend = BundleBackend::new(dir.path());
        let index = ObjectDatabaseAssetIndexMap::new();
        assert!(backend.load_bundle("a", &index).is_err());
    }

    #[test]
    fn writes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = BundleBackend::new(dir.path());
        assert!(backend.is_read_only());
        assert!(matches!(
            backend.write_bytes(ObjectId::EMPTY, b"x", false),
            Err(StoreError::InvalidOperation(_))
        ));
        assert!(matches!(
            backend.delete(&ObjectId::from_bytes(b"x")),
            Err(StoreError::InvalidOperation(_))
        ));
    }

    #[test]
    fn failed_dependency_rolls_back_earlier_ones() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "d1", &[], &["d1-obj"], &[("d1.txt", "d1-obj")]);
        write_bundle(dir.path(), "x", &["d1", "missing"], &["x-obj"], &[("x.txt", "x-obj")]);

        let backend = BundleBackend::new(dir.path());
        let index = ObjectDatabaseAssetIndexMap::new();
        assert!(backend.load_bundle("x", &index).is_err());

        assert!(backend.loaded_bundles().is_empty());
        assert!(!backend.exists(&ObjectId::from_bytes(b"d1-obj")));
        assert!(!backend.exists(&ObjectId::from_bytes(b"x-obj")));
        assert!(index.is_empty());
    }

    #[test]
    fn failed_load_keeps_dependency_held_by_another_bundle() {
        let dir = tempfile::tempdir().unwrap();
        write_bundle(dir.path(), "core", &[], &["core-obj"], &[("core.txt", "core-obj")]);
        write_bundle(dir.path(), "broken", &["core", "missing"], &["broken-obj"], &[]);

        let backend = BundleBackend::new(dir.path());
        let index = ObjectDatabaseAssetIndexMap::new();
        backend.load_bundle("core", &index).unwrap();
        assert!(backend.load_bundle("broken", &index).is_err());

        assert_eq!(backend.ref_count("core"), 1);
        assert!(backend.exists(&ObjectId::from_bytes(b"core-obj")));
        assert_eq!(index.try_get("core.txt"), Some(ObjectId::from_bytes(b"core-obj")));
    }

    #[test]
    fn missing_bundle_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = BundleBackend::new(dir.path());
        let index = ObjectDatabaseAssetIndexMap::new();
        let err = backend.load_bundle("default", &index).unwrap_err();
        assert!(err.is_not_found());
    }
}
