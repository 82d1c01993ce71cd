//! Error types for the index crate.

/// Errors that can occur during index store operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// The requested url has no entry in the map.
    #[error("key not found in asset index: {0}")]
    KeyNotFound(String),

    /// An entry failed its CRC check or could not be decoded.
    #[error("corrupt index entry at offset {offset}: {reason}")]
    CorruptEntry { offset: u64, reason: String },

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The map does not accept writes.
    #[error("asset index map is read-only")]
    ReadOnly,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias for index results.
pub type IndexResult<T> = Result<T, IndexError>;
