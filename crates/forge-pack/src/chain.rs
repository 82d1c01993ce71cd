//! Bundle naming on disk and incremental chains.
//!
//! A bundle `name` lives in `<dir>/<name>.bundle`. Each incremental bundle
//! chained onto it lives in `<dir>/<name>.<checksum hex>.bundle` and is
//! listed, in application order, in the base bundle's header.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use forge_types::ObjectId;
use tracing::debug;

use crate::error::{PackError, PackResult};
use crate::reader::BundleReader;

pub const BUNDLE_EXTENSION: &str = "bundle";

pub fn bundle_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.{BUNDLE_EXTENSION}"))
}

pub fn incremental_path(dir: &Path, name: &str, id: &ObjectId) -> PathBuf {
    dir.join(format!("{name}.{}.{BUNDLE_EXTENSION}", id.to_hex()))
}

/// A base bundle followed by its incremental bundles, in order.
#[derive(Debug)]
pub struct BundleChain {
    name: String,
    readers: Vec<BundleReader>,
}

impl BundleChain {
    pub fn open(dir: &Path, name: &str) -> PackResult<Self> {
        let base_path = bundle_path(dir, name);
        if !base_path.exists() {
            return Err(PackError::BundleNotFound(name.to_string()));
        }
        let base = BundleReader::open(&base_path)?;

        let mut readers = Vec::with_capacity(1 + base.description().incremental_bundles.len());
        let incrementals = base.description().incremental_bundles.clone();
        readers.push(base);

        for id in incrementals {
            let path = incremental_path(dir, name, &id);
            if !path.exists() {
                return Err(PackError::MissingIncremental {
                    name: name.to_string(),
                    id,
                });
            }
            let reader = BundleReader::open(&path)?;
            if reader.checksum() != id {
                return Err(PackError::ChecksumMismatch);
            }
            readers.push(reader);
        }

        debug!(bundle = name, parts = readers.len(), "bundle chain opened");
        Ok(Self {
            name: name.to_string(),
            readers,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bundles that must be loaded before this one.
    pub fn dependencies(&self) -> &[String] {
        &self.readers[0].description().dependencies
    }

    pub fn readers(&self) -> &[BundleReader] {
        &self.readers
    }

    /// Effective asset records: a later part overrides an earlier one.
    pub fn assets(&self) -> Vec<(String, ObjectId)> {
        let mut merged: HashMap<&str, ObjectId> = HashMap::new();
        let mut order = Vec::new();
        for reader in &self.readers {
            for (url, id) in &reader.description().assets {
                if merged.insert(url.as_str(), *id).is_none() {
                    order.push(url.as_str());
                }
            }
        }
        order
            .into_iter()
            .map(|url| (url.to_string(), merged[url]))
            .collect()
    }

    pub fn object_ids(&self) -> HashSet<ObjectId> {
        self.readers.iter().flat_map(|r| r.object_ids()).collect()
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.readers.iter().any(|r| r.contains(id))
    }

    /// The last part holding `id`.
    fn locate(&self, id: &ObjectId) -> Option<&BundleReader> {
        self.readers.iter().rev().find(|r| r.contains(id))
    }

    pub fn object_size(&self, id: &ObjectId) -> Option<u64> {
        self.locate(id).and_then(|r| r.object_size(id))
    }

    pub fn read_object(&self, id: &ObjectId) -> PackResult<Option<Vec<u8>>> {
        match self.locate(id) {
            Some(reader) => reader.read_object(id),
            None => Ok(None),
        }
    }

    /// Paths of every file in the chain.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.readers.iter().map(|r| r.path().to_path_buf()).collect()
    }
}
