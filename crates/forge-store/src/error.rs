use forge_types::ObjectId;

/// Errors from object database operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested object was not found in any backend.
    #[error("object not found: {0}")]
    NotFound(ObjectId),

    /// The operation is not valid in the current configuration, e.g. a
    /// write to a read-only backend or a file path for a bundled object.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Content hash mismatch on write (data does not match the given id).
    #[error("hash mismatch: expected {expected}, computed {computed}")]
    HashMismatch {
        expected: ObjectId,
        computed: ObjectId,
    },

    #[error("index error: {0}")]
    Index(#[from] forge_index::IndexError),

    #[error("bundle error: {0}")]
    Pack(#[from] forge_pack::PackError),

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// True for a missing object or a missing bundle file.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Pack(forge_pack::PackError::BundleNotFound(_)) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
