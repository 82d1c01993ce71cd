//! Foundation types for the forge build engine.
//!
//! Every other forge crate depends on `forge-types`.
//!
//! # Key Types
//!
//! - [`ObjectId`] — Content-addressed identifier (BLAKE3 hash)
//! - [`ObjectIdBuilder`] — Incremental hashing over streamed chunks
//! - [`ObjectUrl`] — Typed location of a command input or output
//! - [`ResultStatus`] — Terminal status of a build step
//! - [`CommandResultEntry`] — Cached outcome of a command run

pub mod error;
pub mod object;
pub mod result;
pub mod url;

pub use error::TypeError;
pub use object::{ObjectId, ObjectIdBuilder};
pub use result::{
    BuildParameters, CommandResultEntry, LogMessage, LogMessageType, ResultStatus,
    SerializedCommand,
};
pub use url::{ObjectUrl, UrlType};
