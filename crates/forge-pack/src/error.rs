use forge_types::ObjectId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PackError {
    #[error("invalid bundle magic: expected {expected}, got {actual}")]
    InvalidMagic { expected: String, actual: String },

    #[error("unsupported bundle version: {0}")]
    UnsupportedVersion(u32),

    #[error("bundle checksum mismatch")]
    ChecksumMismatch,

    #[error("object not found in bundle: {0}")]
    ObjectNotFound(ObjectId),

    #[error("corrupt bundle entry at offset {offset}: {reason}")]
    CorruptEntry { offset: u64, reason: String },

    #[error("CRC32 mismatch for object {id}")]
    CrcMismatch { id: ObjectId },

    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("compression failed: {0}")]
    CompressionFailed(String),

    #[error("bundle not found: {0}")]
    BundleNotFound(String),

    #[error("incremental bundle {id} of `{name}` is missing")]
    MissingIncremental { name: String, id: ObjectId },

    #[error("could not read object {id} for packing: {reason}")]
    ObjectSource { id: ObjectId, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PackResult<T> = Result<T, PackError>;
