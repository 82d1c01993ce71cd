//! Packing a set of objects and asset records into a named bundle.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use forge_types::ObjectId;
use tracing::{debug, info};

use crate::chain::{bundle_path, incremental_path, BundleChain};
use crate::error::PackResult;
use crate::reader::BundleReader;
use crate::writer::BundleWriter;

/// What to pack.
#[derive(Clone, Debug, Default)]
pub struct PackRequest {
    pub name: String,
    pub object_ids: Vec<ObjectId>,
    /// Objects stored without compression.
    pub disable_compression: HashSet<ObjectId>,
    pub assets: Vec<(String, ObjectId)>,
    pub dependencies: Vec<String>,
    /// Chain onto an existing bundle of the same name instead of replacing it.
    pub incremental: bool,
}

/// Result of [`create_bundle`].
#[derive(Clone, Debug)]
pub struct PackOutcome {
    /// The file that was written: the base bundle or the new incremental.
    pub path: PathBuf,
    pub checksum: ObjectId,
    pub objects_written: usize,
    pub incremental: bool,
}

/// Write a bundle into `dir`, pulling object bytes through `fetch`.
///
/// An incremental request over an existing bundle only stores objects the
/// chain does not already hold, writes every asset record, and appends the
/// new part to the base bundle's chain.
pub fn create_bundle<F>(dir: &Path, request: &PackRequest, mut fetch: F) -> PackResult<PackOutcome>
where
    F: FnMut(&ObjectId) -> PackResult<Vec<u8>>,
{
    std::fs::create_dir_all(dir)?;
    let base_path = bundle_path(dir, &request.name);

    let existing = if request.incremental && base_path.exists() {
        Some(BundleChain::open(dir, &request.name)?.object_ids())
    } else {
        None
    };

    let mut writer = BundleWriter::new();
    if existing.is_none() {
        for dep in &request.dependencies {
            writer.add_dependency(dep.clone());
        }
    }
    for id in &request.object_ids {
        if existing.as_ref().is_some_and(|ids| ids.contains(id)) {
            continue;
        }
        let data = fetch(id)?;
        writer.add_object(*id, data, !request.disable_compression.contains(id));
    }
    for (url, id) in &request.assets {
        writer.add_asset(url.clone(), *id);
    }
    let objects_written = writer.len();

    match existing {
        Some(_) => {
            let (bytes, checksum) = writer.finish_to_bytes()?;
            let path = incremental_path(dir, &request.name, &checksum);
            crate::writer::write_atomic(&path, &bytes)?;

            BundleReader::open(&base_path)?.rewrite_with_incremental(checksum)?;
            info!(
                bundle = %request.name,
                id = %checksum.short_hex(),
                objects = objects_written,
                "incremental bundle created"
            );
            Ok(PackOutcome {
                path,
                checksum,
                objects_written,
                incremental: true,
            })
        }
        None => {
            let stale = stale_incrementals(dir, &request.name, &base_path);
            let checksum = writer.write_to(&base_path)?;
            for path in stale {
                if let Err(e) = std::fs::remove_file(&path) {
                    debug!(path = %path.display(), error = %e, "could not remove stale incremental bundle");
                }
            }
            info!(bundle = %request.name, objects = objects_written, "bundle created");
            Ok(PackOutcome {
                path: base_path,
                checksum,
                objects_written,
                incremental: false,
            })
        }
    }
}

/// Incremental parts of a bundle that is about to be replaced.
fn stale_incrementals(dir: &Path, name: &str, base_path: &Path) -> Vec<PathBuf> {
    match BundleReader::open(base_path) {
        Ok(reader) => reader
            .description()
            .incremental_bundles
            .iter()
            .map(|id| incremental_path(dir, name, id))
            .collect(),
        Err(_) => Vec::new(),
    }
}
