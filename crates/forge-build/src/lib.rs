//! Build engine for the forge asset pipeline.
//!
//! A build is a tree of [`BuildStep`]s: lists of children separated by wait
//! barriers, and commands that read and write content objects. The
//! [`Builder`] links consumers of content to its producers, runs every step
//! in its own micro-thread, skips commands whose cached result is still
//! valid, and hands commands that ask for it to slave processes over the
//! wire protocol.
//!
//! # Key Types
//!
//! - [`Builder`] — Owns the step tree and databases, runs a build or clean
//! - [`BuildStep`] — A node of the step tree
//! - [`Command`] — A unit of build work, hashed for the result cache
//! - [`CommandContext`] — What a running command sees of the build
//! - [`Scheduler`] — Runs micro-threads and collects their faults
//! - [`QueryMetadataProvider`] — Typed per-url metadata in SQLite

mod builder;
mod command;
mod command_step;
mod config;
mod context;
mod error;
mod file_tracker;
mod list;
mod logger;
mod metadata;
mod remote;
mod scheduler;
mod session;
mod slave;
mod step;

#[cfg(test)]
mod testing;

pub use builder::{
    BuildMode, BuildResultCode, Builder, StepCounter, DO_NOT_COMPRESS_TAG, DO_NOT_PACK_TAG,
    EXPECTED_VERSION, RESULTS_DIRECTORY, VERSION_FILE,
};
pub use command::{
    compute_command_hash, decode_command, encode_command, Command, CommandFactory,
    CommandRegistry, COMMAND_CACHE_VERSION,
};
pub use config::BuilderConfig;
pub use context::{CancelFlag, CommandContext, ContextHost};
pub use error::{BuildError, BuildResult};
pub use file_tracker::{FileVersionTracker, FILE_VERSIONS_NAME};
pub use list::ListStep;
pub use logger::{mirror, StepLogger};
pub use metadata::{
    MetadataKey, MetadataType, MetadataValue, ObjectMetadata, QueryMetadataProvider,
    DEFAULT_DATABASE_FILENAME,
};
pub use remote::{ProcessLauncher, SlaveArgs, SlaveLauncher};
pub use scheduler::{MicroThreadFault, Scheduler};
pub use slave::{run_slave, slave_exit_code, SlaveOptions};
pub use step::{BuildStep, CommandStep, OutputObject, StepKind, StepProcessed};
