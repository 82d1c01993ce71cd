//! Commands and helpers shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use forge_types::{ObjectIdBuilder, ObjectUrl, ResultStatus, SerializedCommand};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::command::{decode_command, encode_command, Command, CommandRegistry};
use crate::config::BuilderConfig;
use crate::context::CommandContext;
use crate::error::BuildResult;
use crate::remote::{SlaveArgs, SlaveLauncher};
use crate::slave::{run_slave, slave_exit_code, SlaveOptions};

/// Writes `text` followed by the content of its inputs to `url`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Produce {
    pub url: String,
    pub text: String,
    pub inputs: Vec<String>,
    pub fail: bool,
    pub panic: bool,
    pub remote: bool,
    #[serde(skip)]
    runs: Arc<AtomicUsize>,
}

impl Produce {
    pub fn new(url: &str, text: &str) -> Self {
        Self {
            url: url.to_string(),
            text: text.to_string(),
            ..Self::default()
        }
    }

    pub fn reading(mut self, url: &str) -> Self {
        self.inputs.push(url.to_string());
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panic = true;
        self
    }

    pub fn remote(mut self) -> Self {
        self.remote = true;
        self
    }

    /// Shared by every clone of this command.
    pub fn runs(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.runs)
    }
}

#[async_trait]
impl Command for Produce {
    fn type_name(&self) -> &'static str {
        "produce"
    }

    fn title(&self) -> String {
        format!("Produce {}", self.url)
    }

    fn compute_parameters_hash(&self, hasher: &mut ObjectIdBuilder) -> BuildResult<()> {
        hasher.write_str(&self.url);
        hasher.write_str(&self.text);
        hasher.write_byte(u8::from(self.fail) | u8::from(self.panic) << 1);
        Ok(())
    }

    fn input_files(&self) -> Vec<ObjectUrl> {
        self.inputs.iter().map(|p| ObjectUrl::content(p.as_str())).collect()
    }

    fn output_location(&self) -> Option<String> {
        Some(self.url.clone())
    }

    fn should_spawn_new_process(&self) -> bool {
        self.remote
    }

    async fn do_command(&self, context: &CommandContext) -> BuildResult<ResultStatus> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.panic {
            panic!("command panicked");
        }
        if self.fail {
            context.logger().error(format!("{} failed on purpose", self.url));
            return Ok(ResultStatus::Failed);
        }
        let mut data = self.text.clone().into_bytes();
        for input in &self.inputs {
            data.extend(context.read_content(input).await?);
        }
        context.write_content(&self.url, &data)?;
        Ok(ResultStatus::Successful)
    }

    fn serialize(&self) -> BuildResult<SerializedCommand> {
        encode_command(self.type_name(), self)
    }
}

/// Spawns each of its children and waits for them.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Spawn {
    pub name: String,
    pub children: Vec<Produce>,
}

#[async_trait]
impl Command for Spawn {
    fn type_name(&self) -> &'static str {
        "spawn"
    }

    fn title(&self) -> String {
        format!("Spawn {}", self.name)
    }

    fn compute_parameters_hash(&self, hasher: &mut ObjectIdBuilder) -> BuildResult<()> {
        hasher.write_str(&self.name);
        for child in &self.children {
            child.compute_parameters_hash(hasher)?;
        }
        Ok(())
    }

    async fn do_command(&self, context: &CommandContext) -> BuildResult<ResultStatus> {
        let mut status = ResultStatus::Successful;
        for child in &self.children {
            let child: Arc<dyn Command> = Arc::new(child.clone());
            if context.spawn_command(child).await?.blocks_dependents() {
                status = ResultStatus::Failed;
            }
        }
        Ok(status)
    }

    fn serialize(&self) -> BuildResult<SerializedCommand> {
        encode_command(self.type_name(), self)
    }
}

/// Signals `started`, then blocks until `release` is notified.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Gate {
    pub url: String,
    #[serde(skip)]
    pub started: Arc<Notify>,
    #[serde(skip)]
    pub release: Arc<Notify>,
}

impl Gate {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl Command for Gate {
    fn type_name(&self) -> &'static str {
        "gate"
    }

    fn title(&self) -> String {
        format!("Gate {}", self.url)
    }

    fn compute_parameters_hash(&self, hasher: &mut ObjectIdBuilder) -> BuildResult<()> {
        hasher.write_str(&self.url);
        Ok(())
    }

    fn output_location(&self) -> Option<String> {
        Some(self.url.clone())
    }

    fn should_force_execution(&self) -> bool {
        true
    }

    async fn do_command(&self, context: &CommandContext) -> BuildResult<ResultStatus> {
        self.started.notify_one();
        self.release.notified().await;
        context.write_content(&self.url, b"gate")?;
        Ok(ResultStatus::Successful)
    }

    fn serialize(&self) -> BuildResult<SerializedCommand> {
        encode_command(self.type_name(), self)
    }
}

/// Panics while its hash is computed, outside the guarded command body.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Fault {
    pub url: String,
    #[serde(skip)]
    pub reached: Arc<Notify>,
}

#[async_trait]
impl Command for Fault {
    fn type_name(&self) -> &'static str {
        "fault"
    }

    fn title(&self) -> String {
        format!("Fault {}", self.url)
    }

    fn compute_parameters_hash(&self, _hasher: &mut ObjectIdBuilder) -> BuildResult<()> {
        self.reached.notify_one();
        panic!("hash panicked");
    }

    fn output_location(&self) -> Option<String> {
        Some(self.url.clone())
    }

    async fn do_command(&self, _context: &CommandContext) -> BuildResult<ResultStatus> {
        Ok(ResultStatus::Successful)
    }

    fn serialize(&self) -> BuildResult<SerializedCommand> {
        encode_command(self.type_name(), self)
    }
}

fn revive_produce(command: &SerializedCommand) -> BuildResult<Arc<dyn Command>> {
    Ok(Arc::new(decode_command::<Produce>(command)?))
}

fn revive_spawn(command: &SerializedCommand) -> BuildResult<Arc<dyn Command>> {
    Ok(Arc::new(decode_command::<Spawn>(command)?))
}

fn revive_gate(command: &SerializedCommand) -> BuildResult<Arc<dyn Command>> {
    Ok(Arc::new(decode_command::<Gate>(command)?))
}

pub fn registry() -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    registry.register("produce", revive_produce);
    registry.register("spawn", revive_spawn);
    registry.register("gate", revive_gate);
    registry
}

/// Runs slaves as tasks of the current process.
pub struct InProcessLauncher {
    registry: CommandRegistry,
    config: BuilderConfig,
}

impl InProcessLauncher {
    pub fn new(registry: CommandRegistry, config: BuilderConfig) -> Self {
        Self { registry, config }
    }
}

#[async_trait]
impl SlaveLauncher for InProcessLauncher {
    async fn run_slave(&self, args: SlaveArgs) -> BuildResult<i32> {
        let options = SlaveOptions {
            address: args.address,
            build_path: args.build_path,
            profile: args.profile,
            config: self.config.clone(),
        };
        Ok(match run_slave(&options, &self.registry).await {
            Ok(status) => slave_exit_code(status),
            Err(_) => 1,
        })
    }
}
