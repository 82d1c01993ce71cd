//! Error types for the build engine.

use forge_index::IndexError;
use forge_protocol::ProtocolError;
use forge_store::StoreError;
use forge_types::TypeError;

/// Errors raised by the builder, its steps and the slave runner.
///
/// Failures of an individual command are not errors: they become a
/// [`forge_types::ResultStatus`] on the step so independent steps keep
/// running.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// A step or command produced a value the engine cannot accept.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// The operation is not valid in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A serialized command names a type nobody registered.
    #[error("unknown command type `{0}`")]
    UnknownCommand(String),

    /// A command reported a failure of its own.
    #[error("command failed: {0}")]
    Command(String),

    /// A micro-thread body panicked or returned an error.
    #[error("micro-thread `{name}` faulted: {message}")]
    MicroThreadFault {
        /// Name of the faulting micro-thread.
        name: String,
        /// Panic payload or error text.
        message: String,
    },

    /// The builder configuration could not be read.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("metadata database error: {0}")]
    Metadata(#[from] rusqlite::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Type(#[from] TypeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }
}

impl From<bincode::Error> for BuildError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Convenience alias for build results.
pub type BuildResult<T> = Result<T, BuildError>;
