//! Bundle file format for the forge build engine.
//!
//! A bundle packs many objects plus a url asset index into one archive,
//! with optional per-object zstd compression, per-object CRC32 checks and a
//! BLAKE3 checksum over the whole file.
//!
//! # Architecture
//!
//! - **Bundle file** (`.bundle`): header, data section, checksum trailer
//! - **BundleWriter**: builds a bundle from objects and asset records
//! - **BundleReader**: memory-mapped random access to one bundle file
//! - **BundleChain**: a base bundle plus its incremental parts, in order
//! - **create_bundle**: packs objects into a full or incremental bundle

pub mod chain;
pub mod error;
pub mod format;
pub mod packer;
pub mod reader;
pub mod writer;

pub use chain::{bundle_path, incremental_path, BundleChain, BUNDLE_EXTENSION};
pub use error::{PackError, PackResult};
pub use format::{BundleDescription, ObjectRecord};
pub use packer::{create_bundle, PackOutcome, PackRequest};
pub use reader::BundleReader;
pub use writer::BundleWriter;
