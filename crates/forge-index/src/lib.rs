//! Persistent indexes for the forge build engine.
//!
//! An append-only [`Store`] file format shared safely between processes by
//! byte-range locks, the [`ListStore`] and [`DictionaryStore`] collections
//! built on it, and the url to [`forge_types::ObjectId`] asset index maps.
//!
//! # Key Types
//!
//! - [`Store`] -- Framed append-only value file with transactions
//! - [`ListStore`] -- Ordered persisted list (used for command results)
//! - [`DictionaryStore`] -- Last-write-wins persisted dictionary
//! - [`AssetIndexMap`] -- Url to object id lookup
//! - [`ObjectDatabaseAssetIndexMap`] -- Merged view with a writable layer

pub mod asset_index;
pub mod collections;
pub mod error;
mod lock;
pub mod store;

pub use asset_index::{AssetIndexMap, FileAssetIndexMap, ObjectDatabaseAssetIndexMap};
pub use collections::{DictionaryStore, ListStore};
pub use error::{IndexError, IndexResult};
pub use store::{Store, StoreCollection};
