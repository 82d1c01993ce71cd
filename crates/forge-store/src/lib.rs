//! Content-addressed object database for the forge build engine.
//!
//! Every build output is stored as an immutable object identified by the
//! BLAKE3 hash of its bytes. Logical urls map to objects through the asset
//! index, which is persisted next to the loose objects and extended by
//! loaded bundles.
//!
//! # Storage Backends
//!
//! All backends implement the [`OdbBackend`] trait:
//!
//! - [`LooseFileBackend`] -- one file per object under `<root>/<xx>/<rest>`
//! - [`BundleBackend`] -- read-only objects served from loaded bundles
//! - [`MemoryOdbBackend`] -- `HashMap`-based backend for tests and embedding
//!
//! [`ObjectDatabase`] composes them: bundle first, then the primary and
//! secondary loose roots. [`ObjectCache`] shares in-memory [`Blob`]s.
//!
//! # Design Rules
//!
//! 1. Objects are immutable once written.
//! 2. Writing content that is already stored does nothing unless forced.
//! 3. Concurrent reads are always safe.
//! 4. All I/O errors are propagated, never silently ignored.

pub mod bundle;
pub mod cache;
pub mod database;
pub mod error;
pub mod loose;
pub mod memory;
pub mod traits;

pub use bundle::BundleBackend;
pub use cache::{Blob, ObjectCache};
pub use database::{DatabaseOptions, ObjectDatabase, BUNDLE_DIRECTORY, DEFAULT_BUNDLE};
pub use error::{StoreError, StoreResult};
pub use loose::LooseFileBackend;
pub use memory::MemoryOdbBackend;
pub use traits::{BackendKind, FileAccess, ObjectStream, OdbBackend, OpenMode};
