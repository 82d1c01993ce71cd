//! The [`Command`] trait and the registry that revives serialized commands.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use forge_types::{ObjectIdBuilder, ObjectUrl, ResultStatus, SerializedCommand, UrlType};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::CommandContext;
use crate::error::{BuildError, BuildResult};

/// Bumped whenever the command hash layout changes, invalidating every
/// cached result.
pub const COMMAND_CACHE_VERSION: u8 = 1;

/// A unit of build work.
///
/// A command declares its inputs and parameters so the engine can hash it,
/// skip it when a previous run with the same hash is still valid, and run
/// it in a slave process when asked to.
#[async_trait]
pub trait Command: Send + Sync + fmt::Debug {
    /// Name this command is registered under in a [`CommandRegistry`].
    fn type_name(&self) -> &'static str;

    fn title(&self) -> String;

    /// Feed every parameter that affects the output into `hasher`.
    fn compute_parameters_hash(&self, hasher: &mut ObjectIdBuilder) -> BuildResult<()>;

    fn input_files(&self) -> Vec<ObjectUrl> {
        Vec::new()
    }

    /// Content location this command produces, used to link consumers to it.
    fn output_location(&self) -> Option<String> {
        None
    }

    fn should_spawn_new_process(&self) -> bool {
        false
    }

    /// Ignore cached results and always run.
    fn should_force_execution(&self) -> bool {
        false
    }

    async fn pre_command(&self, _context: &CommandContext) -> BuildResult<()> {
        Ok(())
    }

    async fn do_command(&self, context: &CommandContext) -> BuildResult<ResultStatus>;

    async fn post_command(
        &self,
        _context: &CommandContext,
        _status: ResultStatus,
    ) -> BuildResult<()> {
        Ok(())
    }

    fn serialize(&self) -> BuildResult<SerializedCommand>;
}

/// Serialize a command's parameters with bincode under `type_name`.
pub fn encode_command<T: Serialize>(type_name: &str, params: &T) -> BuildResult<SerializedCommand> {
    Ok(SerializedCommand::new(type_name, bincode::serialize(params)?))
}

pub fn decode_command<T: DeserializeOwned>(command: &SerializedCommand) -> BuildResult<T> {
    Ok(bincode::deserialize(&command.payload)?)
}

/// Hash identifying one invocation of `command` with its current inputs.
///
/// `input_hash` resolves each declared input. An input that cannot be
/// resolved contributes a single zero byte instead of its id.
pub async fn compute_command_hash<F, Fut>(
    command: &dyn Command,
    mut input_hash: F,
) -> BuildResult<forge_types::ObjectId>
where
    F: FnMut(UrlType, String) -> Fut,
    Fut: std::future::Future<Output = BuildResult<forge_types::ObjectId>>,
{
    let mut hasher = ObjectIdBuilder::new();
    hasher.write_byte(COMMAND_CACHE_VERSION);
    hasher.write_str(command.type_name());
    command.compute_parameters_hash(&mut hasher)?;

    for input in command.input_files() {
        let id = input_hash(input.url_type, input.path).await?;
        if id.is_empty() {
            hasher.write_byte(0);
        } else {
            hasher.write(id.as_bytes());
        }
    }
    Ok(hasher.compute_hash())
}

/// Revives a command from its serialized form.
pub type CommandFactory = fn(&SerializedCommand) -> BuildResult<Arc<dyn Command>>;

/// Maps command type names to factories.
///
/// The master and its slaves must register the same commands: a slave
/// receives only the serialized form of the command it runs.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    factories: HashMap<String, CommandFactory>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, type_name: impl Into<String>, factory: CommandFactory) {
        self.factories.insert(type_name.into(), factory);
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    pub fn deserialize(&self, command: &SerializedCommand) -> BuildResult<Arc<dyn Command>> {
        let factory = self
            .factories
            .get(&command.type_name)
            .ok_or_else(|| BuildError::UnknownCommand(command.type_name.clone()))?;
        factory(command)
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("CommandRegistry").field("commands", &names).finish()
    }
}
