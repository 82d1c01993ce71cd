use async_trait::async_trait;
use forge_types::{
    BuildParameters, CommandResultEntry, LogMessage, ObjectId, ObjectUrl, ResultStatus,
    SerializedCommand, UrlType,
};

use crate::error::{ForwardError, ProtocolResult};

/// What a slave can ask of the master that spawned it.
///
/// The master implements this over its own state. The slave reaches it
/// through [`RemoteClient`](crate::RemoteClient).
#[async_trait]
pub trait ProcessBuilderRemote: Send + Sync {
    /// The command this slave was started to run.
    async fn get_command_to_execute(&self) -> ProtocolResult<SerializedCommand>;

    async fn get_build_parameters(&self) -> ProtocolResult<BuildParameters>;

    /// Outputs visible to the command, flattened over its output groups.
    async fn get_output_objects(&self) -> ProtocolResult<Vec<(ObjectUrl, ObjectId)>>;

    /// Schedule a sub-command on the master and wait for its status.
    async fn spawn_command(&self, command: SerializedCommand) -> ProtocolResult<ResultStatus>;

    async fn compute_input_hash(&self, url_type: UrlType, path: &str) -> ProtocolResult<ObjectId>;

    /// Hand the finished command's result to the master.
    async fn register_result(&self, entry: CommandResultEntry) -> ProtocolResult<()>;

    /// Best-effort. Callers drop the error.
    async fn forward_log(&self, message: LogMessage) -> Result<(), ForwardError>;
}
